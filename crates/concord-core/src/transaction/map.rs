use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use concord_consensus::{LocalPartition, Partition};
use concord_types::{ConcordError, RawUpdateOperation, UpdateOperation, Versioned};

use crate::map::{AsyncConsistentMap, DefaultAsyncConsistentMap};

/// A map taking part in a transaction's commit.
pub trait TxParticipant: Send + Sync {
    fn name(&self) -> &str;

    /// Fenced updates reproducing this map's buffered writes.
    fn prepared_updates(&self) -> Result<Vec<RawUpdateOperation>, ConcordError>;

    /// Drop all buffered state.
    fn discard(&self);
}

struct Buffers<K, V> {
    /// Snapshot of every key read through, memoized for repeatable reads.
    reads: HashMap<K, Option<Versioned<V>>>,
    writes: HashMap<K, V>,
    deletes: HashSet<K>,
}

/// Repeatable-read view of a consistent map within one transaction.
///
/// Reads go through to the backing map once per key and are then served
/// from the snapshot. Writes and deletes are buffered until commit, when
/// each becomes an update fenced on the version the transaction read.
pub struct TransactionalMap<K, V, T = LocalPartition> {
    backing: Arc<DefaultAsyncConsistentMap<K, V, T>>,
    active: Arc<AtomicBool>,
    buffers: Mutex<Buffers<K, V>>,
}

impl<K, V, T> TransactionalMap<K, V, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
    T: Partition,
{
    pub(crate) fn new(backing: Arc<DefaultAsyncConsistentMap<K, V, T>>, active: Arc<AtomicBool>) -> Self {
        TransactionalMap {
            backing,
            active,
            buffers: Mutex::new(Buffers {
                reads: HashMap::new(),
                writes: HashMap::new(),
                deletes: HashSet::new(),
            }),
        }
    }

    fn ensure_active(&self) -> Result<(), ConcordError> {
        if self.active.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ConcordError::InvalidState("transaction is not open".into()))
        }
    }

    /// Snapshot of `key`, reading through on first access.
    async fn read(&self, key: &K) -> Result<Option<Versioned<V>>, ConcordError> {
        let cached = self.buffers.lock().reads.get(key).cloned();
        if let Some(snapshot) = cached {
            return Ok(snapshot);
        }
        let value = self.backing.get(key).await?;
        // A concurrent first read of the same key may have won; keep the first.
        Ok(self.buffers.lock().reads.entry(key.clone()).or_insert(value).clone())
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>, ConcordError> {
        self.ensure_active()?;
        {
            let buffers = self.buffers.lock();
            if buffers.deletes.contains(key) {
                return Ok(None);
            }
            if let Some(value) = buffers.writes.get(key) {
                return Ok(Some(value.clone()));
            }
        }
        Ok(self.read(key).await?.map(|v| v.value))
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool, ConcordError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Buffer a write; returns the value visible before it.
    pub async fn put(&self, key: K, value: V) -> Result<Option<V>, ConcordError> {
        let previous = self.get(&key).await?;
        let mut buffers = self.buffers.lock();
        buffers.deletes.remove(&key);
        buffers.writes.insert(key, value);
        Ok(previous)
    }

    pub async fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>, ConcordError> {
        match self.get(&key).await? {
            Some(existing) => Ok(Some(existing)),
            None => self.put(key, value).await,
        }
    }

    /// Buffer a delete; returns the value visible before it. Always reads
    /// through first, so the commit can fence the delete on that version.
    pub async fn remove(&self, key: &K) -> Result<Option<V>, ConcordError> {
        let previous = self.get(key).await?;
        if previous.is_some() {
            let mut buffers = self.buffers.lock();
            buffers.writes.remove(key);
            buffers.deletes.insert(key.clone());
        }
        Ok(previous)
    }

    /// Remove only if the visible value equals `value`.
    pub async fn remove_value(&self, key: &K, value: &V) -> Result<bool, ConcordError> {
        if self.get(key).await?.as_ref() == Some(value) {
            self.remove(key).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Write only if a value is visible; returns it.
    pub async fn replace(&self, key: K, value: V) -> Result<Option<V>, ConcordError> {
        match self.get(&key).await? {
            Some(_) => self.put(key, value).await,
            None => Ok(None),
        }
    }

    pub async fn replace_value(&self, key: K, old_value: &V, new_value: V) -> Result<bool, ConcordError> {
        if self.get(&key).await?.as_ref() == Some(old_value) {
            self.put(key, new_value).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn size(&self) -> Result<usize, ConcordError> {
        Err(ConcordError::Unsupported("size within a transaction"))
    }

    pub async fn is_empty(&self) -> Result<bool, ConcordError> {
        Err(ConcordError::Unsupported("is_empty within a transaction"))
    }

    pub async fn key_set(&self) -> Result<Vec<K>, ConcordError> {
        Err(ConcordError::Unsupported("key_set within a transaction"))
    }

    pub async fn values(&self) -> Result<Vec<V>, ConcordError> {
        Err(ConcordError::Unsupported("values within a transaction"))
    }

    pub async fn entry_set(&self) -> Result<Vec<(K, V)>, ConcordError> {
        Err(ConcordError::Unsupported("entry_set within a transaction"))
    }

    pub async fn clear(&self) -> Result<(), ConcordError> {
        Err(ConcordError::Unsupported("clear within a transaction"))
    }

    fn logical_updates(&self) -> Vec<UpdateOperation<K, V>> {
        let name = self.backing.name();
        let buffers = self.buffers.lock();
        let mut updates = Vec::with_capacity(buffers.writes.len() + buffers.deletes.len());

        for (key, value) in &buffers.writes {
            let op = match buffers.reads.get(key) {
                Some(Some(seen)) => {
                    UpdateOperation::put_if_version_match(name, key.clone(), value.clone(), seen.version)
                }
                Some(None) | None => UpdateOperation::put_if_absent(name, key.clone(), value.clone()),
            };
            updates.push(op);
        }
        for key in &buffers.deletes {
            match buffers.reads.get(key) {
                Some(Some(seen)) => {
                    updates.push(UpdateOperation::remove_if_version_match(name, key.clone(), seen.version))
                }
                // Read as absent: the delete changes nothing.
                Some(None) => {}
                None => updates.push(UpdateOperation::remove(name, key.clone())),
            }
        }
        updates
    }
}

impl<K, V, T> TxParticipant for TransactionalMap<K, V, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
    T: Partition,
{
    fn name(&self) -> &str {
        self.backing.name()
    }

    fn prepared_updates(&self) -> Result<Vec<RawUpdateOperation>, ConcordError> {
        self.logical_updates()
            .into_iter()
            .map(|op| self.backing.encode_update(op))
            .collect()
    }

    fn discard(&self) {
        let mut buffers = self.buffers.lock();
        buffers.reads.clear();
        buffers.writes.clear();
        buffers.deletes.clear();
    }
}
