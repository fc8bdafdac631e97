use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};

use concord_consensus::{LocalPartition, Partition};
use concord_types::{
    ConcordError, MapEntryUpdate, Match, RawUpdateOperation, UpdateOperation, Versioned,
};

use crate::codec::Codec;
use crate::database::PartitionedDatabase;
use crate::events::{spawn_listener, ListenerHandle, MapEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Decoded keys kept before the cache is reset.
const KEY_CACHE_CAPACITY: usize = 4096;

/// Typed effect of a conditional update. `updated == false` means the
/// precondition did not hold and the map is unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryUpdate<V> {
    pub updated: bool,
    pub old_value: Option<Versioned<V>>,
    pub new_value: Option<Versioned<V>>,
}

// ---------------------------------------------------------------------------
// AsyncConsistentMap trait
// Every write is expressed through `update`; the convenience operations are
// provided methods on top of it, so decorators only intercept one write path.
// ---------------------------------------------------------------------------

/// A linearizable, versioned map.
///
/// Conditional operations report a failed precondition as `false`/`None`,
/// never as an error. A write that meets a key held by a prepared
/// transaction fails with `ConcordError::Locked`.
pub trait AsyncConsistentMap<K, V>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn name(&self) -> &str;

    fn size(&self) -> impl Future<Output = Result<usize, ConcordError>> + Send;

    fn is_empty(&self) -> impl Future<Output = Result<bool, ConcordError>> + Send;

    fn contains_key(&self, key: &K) -> impl Future<Output = Result<bool, ConcordError>> + Send;

    fn contains_value(&self, value: &V) -> impl Future<Output = Result<bool, ConcordError>> + Send;

    fn get(&self, key: &K) -> impl Future<Output = Result<Option<Versioned<V>>, ConcordError>> + Send;

    /// Write `value` (or remove when `None`) if both matches hold.
    fn update(
        &self,
        key: K,
        value: Option<V>,
        value_match: Match<V>,
        version_match: Match<u64>,
    ) -> impl Future<Output = Result<EntryUpdate<V>, ConcordError>> + Send;

    fn key_set(&self) -> impl Future<Output = Result<Vec<K>, ConcordError>> + Send;

    fn values(&self) -> impl Future<Output = Result<Vec<Versioned<V>>, ConcordError>> + Send;

    fn entry_set(&self) -> impl Future<Output = Result<Vec<(K, Versioned<V>)>, ConcordError>> + Send;

    fn clear(&self) -> impl Future<Output = Result<(), ConcordError>> + Send;

    /// Apply every operation or none; all must live on one partition.
    fn batch_update(
        &self,
        updates: Vec<UpdateOperation<K, V>>,
    ) -> impl Future<Output = Result<bool, ConcordError>> + Send;

    /// Change events for this map. Requires a tokio runtime.
    fn subscribe(&self) -> Result<broadcast::Receiver<MapEvent<K, V>>, ConcordError>;

    /// Unconditional write; returns the previous value.
    fn put(&self, key: K, value: V) -> impl Future<Output = Result<Option<Versioned<V>>, ConcordError>> + Send {
        async move { Ok(self.update(key, Some(value), Match::Any, Match::Any).await?.old_value) }
    }

    /// Unconditional write; returns the new versioned value.
    fn put_and_get(&self, key: K, value: V) -> impl Future<Output = Result<Versioned<V>, ConcordError>> + Send {
        async move {
            self.update(key, Some(value), Match::Any, Match::Any)
                .await?
                .new_value
                .ok_or_else(|| ConcordError::Partition("put produced no value".into()))
        }
    }

    /// Insert only when absent; returns the existing value otherwise.
    fn put_if_absent(
        &self,
        key: K,
        value: V,
    ) -> impl Future<Output = Result<Option<Versioned<V>>, ConcordError>> + Send {
        async move {
            let result = self.update(key, Some(value), Match::IsAbsent, Match::Any).await?;
            Ok(if result.updated { None } else { result.old_value })
        }
    }

    fn remove(&self, key: K) -> impl Future<Output = Result<Option<Versioned<V>>, ConcordError>> + Send {
        async move { Ok(self.update(key, None, Match::Any, Match::Any).await?.old_value) }
    }

    fn remove_if(&self, key: K, value_match: Match<V>) -> impl Future<Output = Result<bool, ConcordError>> + Send {
        async move { Ok(self.update(key, None, value_match, Match::Any).await?.updated) }
    }

    fn remove_version(&self, key: K, version: u64) -> impl Future<Output = Result<bool, ConcordError>> + Send {
        async move { Ok(self.update(key, None, Match::Any, Match::Equals(version)).await?.updated) }
    }

    fn replace(&self, key: K, old_value: V, new_value: V) -> impl Future<Output = Result<bool, ConcordError>> + Send {
        async move {
            Ok(self
                .update(key, Some(new_value), Match::Equals(old_value), Match::Any)
                .await?
                .updated)
        }
    }

    fn replace_version(
        &self,
        key: K,
        old_version: u64,
        new_value: V,
    ) -> impl Future<Output = Result<bool, ConcordError>> + Send {
        async move {
            Ok(self
                .update(key, Some(new_value), Match::Any, Match::Equals(old_version))
                .await?
                .updated)
        }
    }

    /// Read, test `condition`, and write `f`'s result fenced on the version
    /// read. Fails with `ConcurrentModification` if another writer got there
    /// first. `f` returning `None` removes the key.
    fn compute_if(
        &self,
        key: K,
        condition: impl FnOnce(Option<&V>) -> bool + Send,
        f: impl FnOnce(&K, Option<&V>) -> Option<V> + Send,
    ) -> impl Future<Output = Result<Option<Versioned<V>>, ConcordError>> + Send {
        async move {
            let existing = self.get(&key).await?;
            let current = existing.as_ref().map(|v| &v.value);
            if !condition(current) {
                return Ok(existing);
            }
            let computed = f(&key, current);
            if computed.is_none() && existing.is_none() {
                return Ok(None);
            }
            let version_match = match &existing {
                Some(v) => Match::Equals(v.version),
                None => Match::IsAbsent,
            };
            let result = self.update(key, computed, Match::Any, version_match).await?;
            if !result.updated {
                return Err(ConcordError::ConcurrentModification);
            }
            Ok(result.new_value)
        }
    }

    fn compute(
        &self,
        key: K,
        f: impl FnOnce(&K, Option<&V>) -> Option<V> + Send,
    ) -> impl Future<Output = Result<Option<Versioned<V>>, ConcordError>> + Send {
        self.compute_if(key, |_| true, f)
    }

    fn compute_if_absent(
        &self,
        key: K,
        f: impl FnOnce(&K) -> V + Send,
    ) -> impl Future<Output = Result<Option<Versioned<V>>, ConcordError>> + Send {
        self.compute_if(key, |current| current.is_none(), |k, _| Some(f(k)))
    }

    fn compute_if_present(
        &self,
        key: K,
        f: impl FnOnce(&K, &V) -> Option<V> + Send,
    ) -> impl Future<Output = Result<Option<Versioned<V>>, ConcordError>> + Send {
        self.compute_if(key, |current| current.is_some(), |k, current| current.and_then(|v| f(k, v)))
    }

    /// Run `listener` for every change until the handle is dropped.
    fn add_listener(
        &self,
        listener: impl FnMut(MapEvent<K, V>) + Send + 'static,
    ) -> Result<ListenerHandle, ConcordError> {
        Ok(spawn_listener(self.subscribe()?, listener))
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Key and value codecs of one map, plus a cache of decoded keys indexed by
/// their hex encoding.
struct MapCodec<K, V> {
    keys: Arc<dyn Codec<K>>,
    values: Arc<dyn Codec<V>>,
    decoded_keys: DashMap<String, K>,
}

impl<K: Clone + 'static, V: 'static> MapCodec<K, V> {
    fn encode_key(&self, key: &K) -> Result<String, ConcordError> {
        Ok(hex::encode(self.keys.encode(key)?))
    }

    fn decode_key(&self, encoded: &str) -> Result<K, ConcordError> {
        if let Some(key) = self.decoded_keys.get(encoded) {
            return Ok(key.value().clone());
        }
        let bytes = hex::decode(encoded).map_err(|e| ConcordError::Codec(e.to_string()))?;
        let key = self.keys.decode(&bytes)?;
        if self.decoded_keys.len() >= KEY_CACHE_CAPACITY {
            self.decoded_keys.clear();
        }
        self.decoded_keys.insert(encoded.to_string(), key.clone());
        Ok(key)
    }

    fn encode_value(&self, value: &V) -> Result<Vec<u8>, ConcordError> {
        self.values.encode(value)
    }

    fn decode_value(&self, value: Versioned<Vec<u8>>) -> Result<Versioned<V>, ConcordError> {
        value.try_map(|bytes| self.values.decode(&bytes))
    }

    fn decode_opt(&self, value: Option<Versioned<Vec<u8>>>) -> Result<Option<Versioned<V>>, ConcordError> {
        value.map(|v| self.decode_value(v)).transpose()
    }

    fn decode_event(&self, change: MapEntryUpdate) -> Result<Option<MapEvent<K, V>>, ConcordError> {
        if !change.updated {
            return Ok(None);
        }
        let key = self.decode_key(&change.key)?;
        Ok(MapEvent::from_change(
            key,
            self.decode_opt(change.old_value)?,
            self.decode_opt(change.new_value)?,
        ))
    }
}

// ---------------------------------------------------------------------------
// DefaultAsyncConsistentMap
// ---------------------------------------------------------------------------

/// `AsyncConsistentMap` stored as one table of a partitioned database.
pub struct DefaultAsyncConsistentMap<K, V, T = LocalPartition> {
    name: String,
    database: Arc<PartitionedDatabase<T>>,
    codec: Arc<MapCodec<K, V>>,
    events: broadcast::Sender<MapEvent<K, V>>,
    /// Started on first subscription; stops when the map is dropped.
    event_pump: parking_lot::Mutex<Option<DropGuard>>,
}

impl<K, V, T> DefaultAsyncConsistentMap<K, V, T>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
    T: Partition,
{
    pub fn new(
        name: impl Into<String>,
        database: Arc<PartitionedDatabase<T>>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        DefaultAsyncConsistentMap {
            name: name.into(),
            database,
            codec: Arc::new(MapCodec { keys: key_codec, values: value_codec, decoded_keys: DashMap::new() }),
            events,
            event_pump: parking_lot::Mutex::new(None),
        }
    }

    pub fn database(&self) -> &Arc<PartitionedDatabase<T>> {
        &self.database
    }

    /// Convert a logical operation on this map into the stored form.
    pub fn encode_update(&self, op: UpdateOperation<K, V>) -> Result<RawUpdateOperation, ConcordError> {
        if op.table != self.name {
            return Err(ConcordError::InvalidArgument(format!(
                "operation on {} submitted to map {}",
                op.table, self.name
            )));
        }
        op.try_map(|k| self.codec.encode_key(&k), |v| self.codec.encode_value(&v))
    }

    fn ensure_event_pump(&self) -> Result<(), ConcordError> {
        let mut pump = self.event_pump.lock();
        if pump.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ConcordError::InvalidState("map events require a tokio runtime".into()))?;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let mut changes = self.database.changes();
        let table = self.name.clone();
        let codec = self.codec.clone();
        let events = self.events.clone();
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    next = changes.next() => match next {
                        Some(change) if change.table == table => match codec.decode_event(change) {
                            Ok(Some(event)) => {
                                let _ = events.send(event);
                            }
                            Ok(None) => {}
                            Err(e) => tracing::warn!(map = %table, error = %e, "undecodable change dropped"),
                        },
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        *pump = Some(token.drop_guard());
        Ok(())
    }
}

impl<K, V, T> AsyncConsistentMap<K, V> for DefaultAsyncConsistentMap<K, V, T>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
    T: Partition,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn size(&self) -> Result<usize, ConcordError> {
        self.database.size(&self.name).await
    }

    async fn is_empty(&self) -> Result<bool, ConcordError> {
        self.database.is_empty(&self.name).await
    }

    async fn contains_key(&self, key: &K) -> Result<bool, ConcordError> {
        let key = self.codec.encode_key(key)?;
        self.database.contains_key(&self.name, &key).await
    }

    async fn contains_value(&self, value: &V) -> Result<bool, ConcordError> {
        let value = self.codec.encode_value(value)?;
        self.database.contains_value(&self.name, &value).await
    }

    async fn get(&self, key: &K) -> Result<Option<Versioned<V>>, ConcordError> {
        let key = self.codec.encode_key(key)?;
        let value = self.database.get(&self.name, &key).await?;
        self.codec.decode_opt(value)
    }

    async fn update(
        &self,
        key: K,
        value: Option<V>,
        value_match: Match<V>,
        version_match: Match<u64>,
    ) -> Result<EntryUpdate<V>, ConcordError> {
        let key = self.codec.encode_key(&key)?;
        let value = value.map(|v| self.codec.encode_value(&v)).transpose()?;
        let value_match = value_match.try_map(|v| self.codec.encode_value(&v))?;

        let result = self.database.update(&self.name, &key, value, value_match, version_match).await?;
        if result.is_locked() {
            return Err(ConcordError::Locked);
        }
        let change = result
            .value
            .ok_or_else(|| ConcordError::Partition("update result without a value".into()))?;
        Ok(EntryUpdate {
            updated: change.updated,
            old_value: self.codec.decode_opt(change.old_value)?,
            new_value: self.codec.decode_opt(change.new_value)?,
        })
    }

    async fn key_set(&self) -> Result<Vec<K>, ConcordError> {
        let keys = self.database.key_set(&self.name).await?;
        keys.iter().map(|k| self.codec.decode_key(k)).collect()
    }

    async fn values(&self) -> Result<Vec<Versioned<V>>, ConcordError> {
        let values = self.database.values(&self.name).await?;
        values.into_iter().map(|v| self.codec.decode_value(v)).collect()
    }

    async fn entry_set(&self) -> Result<Vec<(K, Versioned<V>)>, ConcordError> {
        let entries = self.database.entry_set(&self.name).await?;
        entries
            .into_iter()
            .map(|(k, v)| Ok((self.codec.decode_key(&k)?, self.codec.decode_value(v)?)))
            .collect()
    }

    async fn clear(&self) -> Result<(), ConcordError> {
        self.database.clear(&self.name).await
    }

    async fn batch_update(&self, updates: Vec<UpdateOperation<K, V>>) -> Result<bool, ConcordError> {
        let raw = updates
            .into_iter()
            .map(|op| self.encode_update(op))
            .collect::<Result<Vec<_>, _>>()?;
        self.database.batch_update(raw).await
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<MapEvent<K, V>>, ConcordError> {
        // Subscribe before the pump exists so no change is missed.
        let rx = self.events.subscribe();
        self.ensure_event_pump()?;
        Ok(rx)
    }
}
