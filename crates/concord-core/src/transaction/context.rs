use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use concord_consensus::{LocalPartition, Partition};
use concord_types::{CommitResponse, ConcordError, Transaction, TransactionId};

use crate::codec::Codec;
use crate::map::DefaultAsyncConsistentMap;
use crate::transaction::{TransactionManager, TransactionalMap, TxParticipant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextState {
    Created,
    Active,
    Finished,
}

struct Enlisted {
    participant: Arc<dyn TxParticipant>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// A single-use transaction: `begin`, work through transactional maps, then
/// either `commit` or `abort`.
pub struct TransactionContext<T = LocalPartition> {
    id: TransactionId,
    manager: Arc<TransactionManager<T>>,
    state: Mutex<ContextState>,
    active: Arc<AtomicBool>,
    maps: Mutex<HashMap<String, Enlisted>>,
}

impl<T: Partition> TransactionContext<T> {
    pub(crate) fn new(id: TransactionId, manager: Arc<TransactionManager<T>>) -> Self {
        TransactionContext {
            id,
            manager,
            state: Mutex::new(ContextState::Created),
            active: Arc::new(AtomicBool::new(false)),
            maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn begin(&self) -> Result<(), ConcordError> {
        let mut state = self.state.lock();
        if *state != ContextState::Created {
            return Err(ConcordError::InvalidState(format!("transaction {} already started", self.id)));
        }
        *state = ContextState::Active;
        self.active.store(true, Ordering::Release);
        tracing::debug!(tx = %self.id, "transaction started");
        Ok(())
    }

    /// The transaction's view of map `name`. Repeated calls return the same
    /// view; asking for it with different key or value types is an error.
    pub fn get_transactional_map<K, V>(
        &self,
        name: &str,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Result<Arc<TransactionalMap<K, V, T>>, ConcordError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        if !self.is_open() {
            return Err(ConcordError::InvalidState(format!("transaction {} is not open", self.id)));
        }
        let mut maps = self.maps.lock();
        if let Some(enlisted) = maps.get(name) {
            return enlisted.typed.clone().downcast::<TransactionalMap<K, V, T>>().map_err(|_| {
                ConcordError::InvalidArgument(format!("map {name} already opened with different types"))
            });
        }
        let backing = Arc::new(DefaultAsyncConsistentMap::new(
            name,
            self.manager.database().clone(),
            key_codec,
            value_codec,
        ));
        let map = Arc::new(TransactionalMap::new(backing, self.active.clone()));
        maps.insert(name.to_string(), Enlisted { participant: map.clone(), typed: map.clone() });
        Ok(map)
    }

    fn finish(&self) -> Result<(), ConcordError> {
        let mut state = self.state.lock();
        if *state != ContextState::Active {
            return Err(ConcordError::InvalidState(format!("transaction {} is not open", self.id)));
        }
        *state = ContextState::Finished;
        self.active.store(false, Ordering::Release);
        Ok(())
    }

    /// Commit every buffered update atomically. A failed precondition or a
    /// lock held by another transaction yields an unsuccessful response.
    pub async fn commit(&self) -> Result<CommitResponse, ConcordError> {
        self.finish()?;
        let participants: Vec<Arc<dyn TxParticipant>> =
            self.maps.lock().values().map(|e| e.participant.clone()).collect();
        let mut updates = Vec::new();
        for participant in &participants {
            updates.extend(participant.prepared_updates()?);
        }
        if updates.is_empty() {
            return Ok(CommitResponse::success(Vec::new()));
        }
        let transaction = Transaction::new(self.id, self.manager.local_node().clone(), updates);
        let response = self.manager.execute(transaction).await;
        for participant in &participants {
            participant.discard();
        }
        response
    }

    /// Discard buffered updates without touching the store.
    pub fn abort(&self) -> Result<(), ConcordError> {
        self.finish()?;
        for enlisted in self.maps.lock().values() {
            tracing::debug!(tx = %self.id, map = enlisted.participant.name(), "discarding buffered updates");
            enlisted.participant.discard();
        }
        Ok(())
    }
}
