use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use concord_consensus::{LocalPartition, Partition};
use concord_types::{CommitResponse, ConcordError, NodeId, Transaction, TransactionId, TransactionState};

use crate::cluster::{ClusterEvent, ClusterEventKind, ClusterMembership};
use crate::codec::BincodeCodec;
use crate::database::PartitionedDatabase;
use crate::events::ListenerHandle;
use crate::map::{AsyncConsistentMap, DefaultAsyncConsistentMap};
use crate::transaction::TransactionContext;

/// System map holding every in-flight transaction, keyed by id.
pub const TRANSACTIONS_MAP: &str = "concord-transactions";

/// Drives transactions through two-phase commit.
///
/// Every state change is persisted before it is acted on, so any node can
/// resume a transaction whose coordinator died by executing it again.
pub struct TransactionManager<T = LocalPartition> {
    local: NodeId,
    database: Arc<PartitionedDatabase<T>>,
    transactions: DefaultAsyncConsistentMap<TransactionId, Transaction, T>,
}

impl<T: Partition> TransactionManager<T> {
    pub fn new(local: NodeId, database: Arc<PartitionedDatabase<T>>) -> Self {
        let transactions = DefaultAsyncConsistentMap::new(
            TRANSACTIONS_MAP,
            database.clone(),
            Arc::new(BincodeCodec::new()),
            Arc::new(BincodeCodec::new()),
        );
        TransactionManager { local, database, transactions }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn database(&self) -> &Arc<PartitionedDatabase<T>> {
        &self.database
    }

    /// A fresh, not yet begun transaction context.
    pub fn new_context(self: &Arc<Self>) -> TransactionContext<T> {
        TransactionContext::new(TransactionId::new(), self.clone())
    }

    async fn persist(&self, transaction: &Transaction) -> Result<(), ConcordError> {
        self.transactions.put(transaction.id, transaction.clone()).await?;
        Ok(())
    }

    /// Drop a finished transaction's record. A failure leaves the terminal
    /// record behind for the next resume to clean up.
    async fn forget(&self, transaction: &Transaction) {
        if let Err(e) = self.transactions.remove(transaction.id).await {
            tracing::warn!(tx = %transaction.id, error = %e, "failed to remove finished transaction");
        }
    }

    /// Run `transaction` from its current state to completion.
    ///
    /// Re-executing a transaction in any state is safe: prepare, commit and
    /// rollback are idempotent at the partitions.
    pub async fn execute(&self, transaction: Transaction) -> Result<CommitResponse, ConcordError> {
        let mut tx = transaction;
        loop {
            match tx.state {
                TransactionState::Preparing => {
                    self.persist(&tx).await?;
                    let prepared = match self.database.prepare(&tx).await {
                        Ok(prepared) => prepared,
                        Err(e) => {
                            tracing::warn!(tx = %tx.id, error = %e, "prepare failed, rolling back");
                            false
                        }
                    };
                    let next = if prepared {
                        TransactionState::Committing
                    } else {
                        TransactionState::RollingBack
                    };
                    tracing::debug!(tx = %tx.id, state = ?next, "transaction prepared");
                    tx = tx.transition(next);
                    self.persist(&tx).await?;
                }
                TransactionState::Committing => {
                    let updates = self.database.commit(&tx).await?;
                    tx = tx.transition(TransactionState::Committed);
                    self.persist(&tx).await?;
                    tracing::debug!(tx = %tx.id, updates = updates.len(), "transaction committed");
                    self.forget(&tx).await;
                    return Ok(CommitResponse::success(updates));
                }
                TransactionState::RollingBack => {
                    self.database.rollback(&tx).await?;
                    tx = tx.transition(TransactionState::RolledBack);
                    self.persist(&tx).await?;
                    tracing::debug!(tx = %tx.id, "transaction rolled back");
                    self.forget(&tx).await;
                    return Ok(CommitResponse::failure());
                }
                TransactionState::Committed | TransactionState::RolledBack => {
                    self.transactions.remove(tx.id).await?;
                    return Ok(CommitResponse::success(Vec::new()));
                }
            }
        }
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, ConcordError> {
        Ok(self.transactions.get(&id).await?.map(|v| v.value))
    }

    /// Transactions that have not reached a terminal state.
    pub async fn get_pending_transactions(&self) -> Result<Vec<Transaction>, ConcordError> {
        Ok(self
            .transactions
            .values()
            .await?
            .into_iter()
            .map(|v| v.value)
            .filter(|tx| !tx.state.is_terminal())
            .collect())
    }

    /// Finish every recorded transaction; returns how many were pending.
    pub async fn resume_pending(&self) -> Result<usize, ConcordError> {
        self.resume_where(|_| true).await
    }

    /// Finish the transactions coordinated by `node`.
    pub async fn resume_coordinated_by(&self, node: &NodeId) -> Result<usize, ConcordError> {
        self.resume_where(|tx| tx.coordinator == *node).await
    }

    async fn resume_where(&self, filter: impl Fn(&Transaction) -> bool) -> Result<usize, ConcordError> {
        let records = self.transactions.values().await?;
        let mut resumed = 0;
        for tx in records.into_iter().map(|v| v.value).filter(|tx| filter(tx)) {
            if !tx.state.is_terminal() {
                resumed += 1;
                tracing::info!(tx = %tx.id, coordinator = %tx.coordinator, state = ?tx.state, "resuming transaction");
            }
            let id = tx.id;
            if let Err(e) = self.execute(tx).await {
                tracing::warn!(tx = %id, error = %e, "resumed transaction did not complete");
            }
        }
        Ok(resumed)
    }

    /// Take over transactions whose coordinator leaves or fails. Must be
    /// called from within a tokio runtime.
    pub fn watch_membership(self: &Arc<Self>, membership: &dyn ClusterMembership) -> ListenerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let mut events = membership.subscribe();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(ClusterEvent { kind: ClusterEventKind::Deactivated | ClusterEventKind::Removed, node }) => {
                            if let Err(e) = manager.resume_coordinated_by(&node).await {
                                tracing::warn!(node = %node, error = %e, "failed to resume transactions");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(lagged = n, "membership events lagged, resuming all transactions");
                            if let Err(e) = manager.resume_pending().await {
                                tracing::warn!(error = %e, "failed to resume transactions");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        ListenerHandle::new(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{LocalMembership, NodeState};
    use crate::database::tests::local_db;
    use crate::partitioner::PartitionerKind;
    use concord_types::{Match, UpdateOperation};
    use std::time::Duration;

    async fn manager(node: &str) -> Arc<TransactionManager> {
        Arc::new(TransactionManager::new(NodeId::from(node), local_db(3, PartitionerKind::Key).await))
    }

    fn put_tx(coordinator: &str, key: &str) -> Transaction {
        Transaction::new(
            TransactionId::new(),
            NodeId::from(coordinator),
            vec![UpdateOperation::put_if_absent("t", key.to_string(), b"v".to_vec())],
        )
    }

    #[tokio::test]
    async fn test_execute_commits_and_forgets() {
        let m = manager("a").await;
        let tx = put_tx("a", "k");
        let response = m.execute(tx.clone()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.updates.len(), 1);
        assert_eq!(m.database().get("t", "k").await.unwrap().unwrap().value, b"v");
        assert!(m.get_transaction(tx.id).await.unwrap().is_none());

        // Re-executing a finished transaction is a trivial success.
        let again = m.execute(tx.transition(TransactionState::Committed)).await.unwrap();
        assert_eq!(again, CommitResponse::success(vec![]));
    }

    #[tokio::test]
    async fn test_failed_prepare_rolls_back() {
        let m = manager("a").await;
        m.database().update("t", "k", Some(b"taken".to_vec()), Match::Any, Match::Any).await.unwrap();

        let response = m.execute(put_tx("a", "k")).await.unwrap();
        assert_eq!(response, CommitResponse::failure());
        assert_eq!(m.database().get("t", "k").await.unwrap().unwrap().value, b"taken");
        assert!(m.get_pending_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cross_partition_transaction_rolls_back() {
        let m = manager("a").await;
        let (k1, k2) = crate::database::tests::split_keys(m.database(), "t");
        let tx = Transaction::new(
            TransactionId::new(),
            NodeId::from("a"),
            vec![
                UpdateOperation::put("t", k1.clone(), b"1".to_vec()),
                UpdateOperation::put("t", k2, b"2".to_vec()),
            ],
        );
        assert_eq!(m.execute(tx).await.unwrap(), CommitResponse::failure());
        assert!(m.database().get("t", &k1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_commits_orphaned_transaction() {
        let m = manager("b").await;
        // "a" prepared and decided to commit, then died.
        let tx = put_tx("a", "k");
        assert!(m.database().prepare(&tx).await.unwrap());
        let committing = tx.transition(TransactionState::Committing);
        m.persist(&committing).await.unwrap();

        let pending = m.get_pending_transactions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, TransactionState::Committing);

        assert_eq!(m.resume_coordinated_by(&NodeId::from("other")).await.unwrap(), 0);
        assert_eq!(m.resume_coordinated_by(&NodeId::from("a")).await.unwrap(), 1);
        assert!(m.get_pending_transactions().await.unwrap().is_empty());
        assert_eq!(m.database().get("t", "k").await.unwrap().unwrap().value, b"v");
    }

    #[tokio::test]
    async fn test_membership_change_triggers_resume() {
        let m = manager("b").await;
        let membership = LocalMembership::new(NodeId::from("b"), vec![NodeId::from("a")]);
        let _watch = m.watch_membership(&membership);

        let tx = put_tx("a", "k");
        assert!(m.database().prepare(&tx).await.unwrap());
        m.persist(&tx.transition(TransactionState::Committing)).await.unwrap();

        membership.set_state(&NodeId::from("a"), NodeState::Inactive);
        tokio::time::timeout(Duration::from_secs(2), async {
            while m.database().get("t", "k").await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
