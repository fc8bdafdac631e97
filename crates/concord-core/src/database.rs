use std::sync::Arc;

use futures::future::try_join_all;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use concord_consensus::{LocalPartition, Partition};
use concord_types::{
    ConcordError, MapCommand, MapEntryUpdate, MapResponse, Match, RawUpdateOperation,
    Transaction, UpdateResult, Versioned,
};

use crate::assignment::PartitionAssignment;
use crate::partitioner::{PartitionId, Partitioner, PartitionerKind};

fn unexpected(resp: MapResponse) -> ConcordError {
    ConcordError::Partition(format!("unexpected response variant: {resp:?}"))
}

/// Routes map commands to partitions.
///
/// Single-key commands go to the partition chosen by the partitioner.
/// Whole-table queries fan out to every partition and complete only when all
/// of them answer. Batches and transactions must resolve to one partition.
pub struct PartitionedDatabase<T = LocalPartition> {
    partitions: Vec<Arc<T>>,
    partitioner: Arc<dyn Partitioner>,
}

impl PartitionedDatabase<LocalPartition> {
    /// One in-process partition per assignment entry, in natural name order.
    pub fn local(assignment: &PartitionAssignment, kind: PartitionerKind) -> Result<Self, ConcordError> {
        let partitions = assignment
            .partition_names()
            .into_iter()
            .map(|name| Arc::new(LocalPartition::new(name)))
            .collect::<Vec<_>>();
        let partitioner = kind.build(partitions.len());
        Self::new(partitions, partitioner)
    }
}

impl<T: Partition> PartitionedDatabase<T> {
    pub fn new(partitions: Vec<Arc<T>>, partitioner: Arc<dyn Partitioner>) -> Result<Self, ConcordError> {
        if partitions.is_empty() {
            return Err(ConcordError::Config("at least one partition is required".into()));
        }
        Ok(PartitionedDatabase { partitions, partitioner })
    }

    pub fn partitions(&self) -> &[Arc<T>] {
        &self.partitions
    }

    pub fn partition_id(&self, table: &str, key: &str) -> PartitionId {
        self.partitioner.partition(table, key) % self.partitions.len()
    }

    fn route(&self, table: &str, key: &str) -> &Arc<T> {
        &self.partitions[self.partition_id(table, key)]
    }

    /// The one partition every update targets, or `CrossPartition`.
    fn single_partition(&self, updates: &[RawUpdateOperation]) -> Result<Option<&Arc<T>>, ConcordError> {
        let mut target = None;
        for op in updates {
            let id = self.partition_id(&op.table, &op.key);
            match target {
                None => target = Some(id),
                Some(t) if t != id => return Err(ConcordError::CrossPartition),
                Some(_) => {}
            }
        }
        Ok(target.map(|id| &self.partitions[id]))
    }

    pub async fn open(&self) -> Result<(), ConcordError> {
        try_join_all(self.partitions.iter().map(|p| p.open())).await?;
        tracing::info!(partitions = self.partitions.len(), "partitions opened");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ConcordError> {
        try_join_all(self.partitions.iter().map(|p| p.close())).await?;
        tracing::info!(partitions = self.partitions.len(), "partitions closed");
        Ok(())
    }

    async fn fan_out(&self, cmd: MapCommand) -> Result<Vec<MapResponse>, ConcordError> {
        try_join_all(self.partitions.iter().map(|p| p.execute(cmd.clone()))).await
    }

    /// Merged change stream of every partition. Lagging receivers drop
    /// changes with a warning rather than failing the stream.
    pub fn changes(&self) -> BoxStream<'static, MapEntryUpdate> {
        let streams = self.partitions.iter().map(|p| BroadcastStream::new(p.subscribe()));
        stream::select_all(streams)
            .filter_map(|change| async move {
                match change {
                    Ok(change) => Some(change),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "change stream lagged");
                        None
                    }
                }
            })
            .boxed()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn size(&self, table: &str) -> Result<usize, ConcordError> {
        let mut total = 0;
        for resp in self.fan_out(MapCommand::Size { table: table.to_string() }).await? {
            match resp {
                MapResponse::Size(n) => total += n,
                other => return Err(unexpected(other)),
            }
        }
        Ok(total)
    }

    pub async fn is_empty(&self, table: &str) -> Result<bool, ConcordError> {
        let mut empty = true;
        for resp in self.fan_out(MapCommand::IsEmpty { table: table.to_string() }).await? {
            match resp {
                MapResponse::Bool(b) => empty &= b,
                other => return Err(unexpected(other)),
            }
        }
        Ok(empty)
    }

    pub async fn contains_key(&self, table: &str, key: &str) -> Result<bool, ConcordError> {
        let cmd = MapCommand::ContainsKey { table: table.to_string(), key: key.to_string() };
        match self.route(table, key).execute(cmd).await? {
            MapResponse::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn contains_value(&self, table: &str, value: &[u8]) -> Result<bool, ConcordError> {
        let cmd = MapCommand::ContainsValue { table: table.to_string(), value: value.to_vec() };
        let mut found = false;
        for resp in self.fan_out(cmd).await? {
            match resp {
                MapResponse::Bool(b) => found |= b,
                other => return Err(unexpected(other)),
            }
        }
        Ok(found)
    }

    pub async fn get(&self, table: &str, key: &str) -> Result<Option<Versioned<Vec<u8>>>, ConcordError> {
        let cmd = MapCommand::Get { table: table.to_string(), key: key.to_string() };
        match self.route(table, key).execute(cmd).await? {
            MapResponse::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    pub async fn key_set(&self, table: &str) -> Result<Vec<String>, ConcordError> {
        let mut keys = Vec::new();
        for resp in self.fan_out(MapCommand::KeySet { table: table.to_string() }).await? {
            match resp {
                MapResponse::Keys(k) => keys.extend(k),
                other => return Err(unexpected(other)),
            }
        }
        Ok(keys)
    }

    pub async fn values(&self, table: &str) -> Result<Vec<Versioned<Vec<u8>>>, ConcordError> {
        let mut values = Vec::new();
        for resp in self.fan_out(MapCommand::Values { table: table.to_string() }).await? {
            match resp {
                MapResponse::Values(v) => values.extend(v),
                other => return Err(unexpected(other)),
            }
        }
        Ok(values)
    }

    pub async fn entry_set(&self, table: &str) -> Result<Vec<(String, Versioned<Vec<u8>>)>, ConcordError> {
        let mut entries = Vec::new();
        for resp in self.fan_out(MapCommand::EntrySet { table: table.to_string() }).await? {
            match resp {
                MapResponse::Entries(e) => entries.extend(e),
                other => return Err(unexpected(other)),
            }
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    pub async fn update(
        &self,
        table: &str,
        key: &str,
        value: Option<Vec<u8>>,
        value_match: Match<Vec<u8>>,
        version_match: Match<u64>,
    ) -> Result<UpdateResult<MapEntryUpdate>, ConcordError> {
        let cmd = MapCommand::Update {
            table: table.to_string(),
            key: key.to_string(),
            value,
            value_match,
            version_match,
        };
        match self.route(table, key).execute(cmd).await? {
            MapResponse::Update(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn clear(&self, table: &str) -> Result<(), ConcordError> {
        self.fan_out(MapCommand::Clear { table: table.to_string() }).await?;
        Ok(())
    }

    /// Apply every update or none. Rejects batches spanning partitions
    /// before contacting any of them.
    pub async fn batch_update(&self, updates: Vec<RawUpdateOperation>) -> Result<bool, ConcordError> {
        for op in &updates {
            op.validate()?;
        }
        let Some(partition) = self.single_partition(&updates)? else {
            return Ok(true);
        };
        match partition.execute(MapCommand::AtomicBatchUpdate { updates }).await? {
            MapResponse::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    // -----------------------------------------------------------------------
    // Two-phase commit
    // -----------------------------------------------------------------------

    pub async fn prepare(&self, transaction: &Transaction) -> Result<bool, ConcordError> {
        let Some(partition) = self.single_partition(&transaction.updates)? else {
            return Ok(true);
        };
        let cmd = MapCommand::Prepare { transaction: transaction.clone() };
        match partition.execute(cmd).await? {
            MapResponse::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn commit(&self, transaction: &Transaction) -> Result<Vec<MapEntryUpdate>, ConcordError> {
        let Some(partition) = self.single_partition(&transaction.updates)? else {
            return Ok(Vec::new());
        };
        let cmd = MapCommand::Commit { transaction_id: transaction.id };
        match partition.execute(cmd).await? {
            MapResponse::Committed(updates) => Ok(updates),
            other => Err(unexpected(other)),
        }
    }

    /// Release the transaction on every partition its updates touch. Safe
    /// for transactions that never prepared, including cross-partition ones.
    pub async fn rollback(&self, transaction: &Transaction) -> Result<(), ConcordError> {
        let mut targets: Vec<PartitionId> = transaction
            .updates
            .iter()
            .map(|op| self.partition_id(&op.table, &op.key))
            .collect();
        targets.sort_unstable();
        targets.dedup();

        let cmd = MapCommand::Rollback { transaction_id: transaction.id };
        let responses =
            try_join_all(targets.iter().map(|id| self.partitions[*id].execute(cmd.clone()))).await?;
        match responses.into_iter().find(|r| *r != MapResponse::Unit) {
            Some(other) => Err(unexpected(other)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use concord_types::{NodeId, TransactionId, UpdateOperation};

    /// Opened in-process database with `n` partitions.
    pub(crate) async fn local_db(n: usize, kind: PartitionerKind) -> Arc<PartitionedDatabase> {
        let nodes: Vec<NodeId> = (0..n).map(|i| NodeId::new(format!("n{i}"))).collect();
        let db = PartitionedDatabase::local(&PartitionAssignment::generate(&nodes), kind).unwrap();
        db.open().await.unwrap();
        Arc::new(db)
    }

    /// Two keys of `table` that route to different partitions.
    pub(crate) fn split_keys(db: &PartitionedDatabase, table: &str) -> (String, String) {
        let first = "k0".to_string();
        let home = db.partition_id(table, &first);
        let other = (1..)
            .map(|i| format!("k{i}"))
            .find(|k| db.partition_id(table, k) != home)
            .unwrap();
        (first, other)
    }

    #[tokio::test]
    async fn test_fan_out_queries() {
        let db = local_db(3, PartitionerKind::Key).await;
        for i in 0..20 {
            let key = format!("k{i}");
            let result = db.update("t", &key, Some(vec![i]), Match::Any, Match::Any).await.unwrap();
            assert!(result.value.unwrap().updated);
        }
        assert_eq!(db.size("t").await.unwrap(), 20);
        assert!(!db.is_empty("t").await.unwrap());
        assert!(db.is_empty("other").await.unwrap());
        assert!(db.contains_value("t", &[7]).await.unwrap());
        assert!(!db.contains_value("t", &[42]).await.unwrap());

        let mut keys = db.key_set("t").await.unwrap();
        keys.sort();
        assert_eq!(keys.len(), 20);
        assert_eq!(db.entry_set("t").await.unwrap().len(), 20);

        db.clear("t").await.unwrap();
        assert_eq!(db.size("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cross_partition_batch_rejected() {
        let db = local_db(3, PartitionerKind::Key).await;
        let (a, b) = split_keys(&db, "t");
        let batch = vec![
            UpdateOperation::put("t", a.clone(), b"1".to_vec()),
            UpdateOperation::put("t", b.clone(), b"2".to_vec()),
        ];
        assert_eq!(db.batch_update(batch).await, Err(ConcordError::CrossPartition));
        assert!(db.get("t", &a).await.unwrap().is_none());
        assert!(db.get("t", &b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_table_partitioner_allows_table_batches() {
        let db = local_db(3, PartitionerKind::Table).await;
        let batch = (0..10)
            .map(|i| UpdateOperation::put("links", format!("k{i}"), vec![i]))
            .collect();
        assert!(db.batch_update(batch).await.unwrap());
        assert_eq!(db.size("links").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_batch_validates_operations() {
        let db = local_db(1, PartitionerKind::Key).await;
        let mut op = UpdateOperation::put("t", "k".to_string(), b"v".to_vec());
        op.value = None;
        assert!(matches!(db.batch_update(vec![op]).await, Err(ConcordError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_two_phase_commit_routes_to_owner() {
        let db = local_db(3, PartitionerKind::Key).await;
        let tx = Transaction::new(
            TransactionId::new(),
            NodeId::from("n0"),
            vec![UpdateOperation::put_if_absent("t", "k".to_string(), b"v".to_vec())],
        );
        assert!(db.prepare(&tx).await.unwrap());
        let locked = db.update("t", "k", Some(b"w".to_vec()), Match::Any, Match::Any).await.unwrap();
        assert!(locked.is_locked());

        let updates = db.commit(&tx).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(db.get("t", "k").await.unwrap().unwrap().value, b"v");
        // Repeating is harmless.
        assert!(db.commit(&tx).await.unwrap().is_empty());
        db.rollback(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_changes_stream_merges_partitions() {
        let db = local_db(3, PartitionerKind::Key).await;
        let mut changes = db.changes();
        let (a, b) = split_keys(&db, "t");
        db.update("t", &a, Some(b"1".to_vec()), Match::Any, Match::Any).await.unwrap();
        db.update("t", &b, Some(b"2".to_vec()), Match::Any, Match::Any).await.unwrap();

        let mut keys = vec![changes.next().await.unwrap().key, changes.next().await.unwrap().key];
        keys.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_empty_database_rejected() {
        let partitions: Vec<Arc<LocalPartition>> = Vec::new();
        let result = PartitionedDatabase::new(partitions, PartitionerKind::Key.build(0));
        assert!(matches!(result, Err(ConcordError::Config(_))));
    }
}
