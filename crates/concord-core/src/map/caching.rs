use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use concord_types::{ConcordError, Match, UpdateOperation, Versioned};

use crate::events::{ListenerHandle, MapEvent};
use crate::map::{AsyncConsistentMap, EntryUpdate};

/// Cached reads plus a counter bumped by every invalidation. A read only
/// fills the cache if no invalidation happened while it was in flight.
struct Cache<K, V> {
    entries: DashMap<K, Option<Versioned<V>>>,
    generation: AtomicU64,
}

impl<K: Eq + Hash, V: Clone> Cache<K, V> {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn invalidate(&self, key: &K) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.remove(key);
    }

    fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
    }

    fn fill(&self, key: K, value: &Option<Versioned<V>>, seen: u64) {
        // Checked under the entry lock: a later invalidation waits for it and
        // then removes what was stored.
        if let Entry::Vacant(slot) = self.entries.entry(key) {
            if self.generation() == seen {
                slot.insert(value.clone());
            }
        }
    }
}

/// Read-through cache of `get` in front of any `AsyncConsistentMap`.
///
/// Entries are invalidated by local writes and by every change event of the
/// inner map, so remote writers are observed once their event arrives.
pub struct CachingAsyncConsistentMap<M, K, V> {
    inner: Arc<M>,
    cache: Arc<Cache<K, V>>,
    _invalidator: ListenerHandle,
}

impl<M, K, V> CachingAsyncConsistentMap<M, K, V>
where
    M: AsyncConsistentMap<K, V>,
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(inner: Arc<M>) -> Result<Self, ConcordError> {
        let cache = Arc::new(Cache { entries: DashMap::new(), generation: AtomicU64::new(0) });
        let invalidate = cache.clone();
        let invalidator = inner.add_listener(move |event: MapEvent<K, V>| {
            invalidate.invalidate(&event.key);
        })?;
        Ok(CachingAsyncConsistentMap { inner, cache, _invalidator: invalidator })
    }

    pub fn inner(&self) -> &Arc<M> {
        &self.inner
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.entries.len()
    }
}

impl<M, K, V> AsyncConsistentMap<K, V> for CachingAsyncConsistentMap<M, K, V>
where
    M: AsyncConsistentMap<K, V>,
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn size(&self) -> Result<usize, ConcordError> {
        self.inner.size().await
    }

    async fn is_empty(&self) -> Result<bool, ConcordError> {
        self.inner.is_empty().await
    }

    async fn contains_key(&self, key: &K) -> Result<bool, ConcordError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn contains_value(&self, value: &V) -> Result<bool, ConcordError> {
        self.inner.contains_value(value).await
    }

    async fn get(&self, key: &K) -> Result<Option<Versioned<V>>, ConcordError> {
        let hit = self.cache.entries.get(key).map(|entry| entry.value().clone());
        if let Some(hit) = hit {
            return Ok(hit);
        }
        let seen = self.cache.generation();
        let value = self.inner.get(key).await?;
        self.cache.fill(key.clone(), &value, seen);
        Ok(value)
    }

    async fn update(
        &self,
        key: K,
        value: Option<V>,
        value_match: Match<V>,
        version_match: Match<u64>,
    ) -> Result<EntryUpdate<V>, ConcordError> {
        self.cache.invalidate(&key);
        let result = self.inner.update(key.clone(), value, value_match, version_match).await;
        self.cache.invalidate(&key);
        result
    }

    async fn key_set(&self) -> Result<Vec<K>, ConcordError> {
        self.inner.key_set().await
    }

    async fn values(&self) -> Result<Vec<Versioned<V>>, ConcordError> {
        self.inner.values().await
    }

    async fn entry_set(&self) -> Result<Vec<(K, Versioned<V>)>, ConcordError> {
        self.inner.entry_set().await
    }

    async fn clear(&self) -> Result<(), ConcordError> {
        let result = self.inner.clear().await;
        self.cache.invalidate_all();
        result
    }

    async fn batch_update(&self, updates: Vec<UpdateOperation<K, V>>) -> Result<bool, ConcordError> {
        let keys: Vec<K> = updates.iter().map(|op| op.key.clone()).collect();
        let result = self.inner.batch_update(updates).await;
        for key in &keys {
            self.cache.invalidate(key);
        }
        result
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<MapEvent<K, V>>, ConcordError> {
        self.inner.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::database::tests::local_db;
    use crate::map::DefaultAsyncConsistentMap;
    use crate::partitioner::PartitionerKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cache_invalidated_by_other_writers() {
        let db = local_db(2, PartitionerKind::Key).await;
        let backing = Arc::new(DefaultAsyncConsistentMap::<String, String>::new(
            "hosts",
            db.clone(),
            Arc::new(JsonCodec::new()),
            Arc::new(JsonCodec::new()),
        ));
        let cached = CachingAsyncConsistentMap::new(backing.clone()).unwrap();
        // Another handle on the same table, bypassing the cache.
        let writer = DefaultAsyncConsistentMap::<String, String>::new(
            "hosts",
            db,
            Arc::new(JsonCodec::new()),
            Arc::new(JsonCodec::new()),
        );

        assert!(cached.get(&"h1".into()).await.unwrap().is_none());
        assert_eq!(cached.cached_entries(), 1);

        writer.put("h1".into(), "10.0.0.1".into()).await.unwrap();
        // The change event drops the stale negative entry.
        tokio::time::timeout(Duration::from_secs(1), async {
            while cached.cached_entries() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(cached.get(&"h1".into()).await.unwrap().unwrap().value, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_local_writes_invalidate() {
        let db = local_db(1, PartitionerKind::Key).await;
        let backing = Arc::new(DefaultAsyncConsistentMap::<String, String>::new(
            "hosts",
            db,
            Arc::new(JsonCodec::new()),
            Arc::new(JsonCodec::new()),
        ));
        let cached = CachingAsyncConsistentMap::new(backing).unwrap();

        cached.put("h".into(), "a".into()).await.unwrap();
        assert_eq!(cached.get(&"h".into()).await.unwrap().unwrap().value, "a");
        let v = cached.get(&"h".into()).await.unwrap().unwrap();
        assert!(cached.replace_version("h".into(), v.version, "b".into()).await.unwrap());
        assert_eq!(cached.get(&"h".into()).await.unwrap().unwrap().value, "b");
        cached.clear().await.unwrap();
        assert!(cached.get(&"h".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_overtaken_by_invalidation_is_not_cached() {
        let db = local_db(1, PartitionerKind::Key).await;
        let backing = Arc::new(DefaultAsyncConsistentMap::<String, String>::new(
            "hosts",
            db.clone(),
            Arc::new(JsonCodec::new()),
            Arc::new(JsonCodec::new()),
        ));
        let cached = CachingAsyncConsistentMap::new(backing.clone()).unwrap();
        let writer = DefaultAsyncConsistentMap::<String, String>::new(
            "hosts",
            db,
            Arc::new(JsonCodec::new()),
            Arc::new(JsonCodec::new()),
        );

        // A read starts, then a remote write lands before it completes.
        let seen = cached.cache.generation();
        let stale = backing.get(&"h".into()).await.unwrap();
        writer.put("h".into(), "10.0.0.2".into()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while cached.cache.generation() == seen {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cached.cache.fill("h".into(), &stale, seen);
        assert_eq!(cached.cached_entries(), 0);
        assert_eq!(cached.get(&"h".into()).await.unwrap().unwrap().value, "10.0.0.2");
        assert_eq!(cached.cached_entries(), 1);
    }
}
