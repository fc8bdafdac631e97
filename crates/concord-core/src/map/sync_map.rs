use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use concord_types::{ConcordError, Match, UpdateOperation, Versioned};

use crate::events::{ListenerHandle, MapEvent};
use crate::map::AsyncConsistentMap;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking façade over an `AsyncConsistentMap`.
///
/// Each call runs as a task on `runtime` and waits at most `timeout`. Must
/// not be called from a runtime worker thread, and the runtime must be
/// driven by its own threads (the multi-thread flavor).
pub struct ConsistentMap<M, K, V> {
    inner: Arc<M>,
    runtime: Handle,
    timeout: Duration,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<M, K, V> ConsistentMap<M, K, V>
where
    M: AsyncConsistentMap<K, V> + 'static,
    K: Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(inner: Arc<M>, runtime: Handle) -> Self {
        ConsistentMap { inner, runtime, timeout: DEFAULT_OPERATION_TIMEOUT, _types: PhantomData }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn async_map(&self) -> &Arc<M> {
        &self.inner
    }

    fn complete<R, F>(&self, op: impl FnOnce(Arc<M>) -> F) -> Result<R, ConcordError>
    where
        R: Send + 'static,
        F: Future<Output = Result<R, ConcordError>> + Send + 'static,
    {
        let task = self.runtime.spawn(op(self.inner.clone()));
        let abort = task.abort_handle();
        let timeout = self.timeout;
        self.runtime.block_on(async move {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "map operation did not complete");
                    Err(ConcordError::Interrupted)
                }
                Err(_) => {
                    // Aborting does not undo a command the partition already accepted.
                    abort.abort();
                    Err(ConcordError::Timeout)
                }
            }
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn size(&self) -> Result<usize, ConcordError> {
        self.complete(|map| async move { map.size().await })
    }

    pub fn is_empty(&self) -> Result<bool, ConcordError> {
        self.complete(|map| async move { map.is_empty().await })
    }

    pub fn contains_key(&self, key: &K) -> Result<bool, ConcordError> {
        let key = key.clone();
        self.complete(|map| async move { map.contains_key(&key).await })
    }

    pub fn contains_value(&self, value: &V) -> Result<bool, ConcordError> {
        let value = value.clone();
        self.complete(|map| async move { map.contains_value(&value).await })
    }

    pub fn get(&self, key: &K) -> Result<Option<Versioned<V>>, ConcordError> {
        let key = key.clone();
        self.complete(|map| async move { map.get(&key).await })
    }

    pub fn put(&self, key: K, value: V) -> Result<Option<Versioned<V>>, ConcordError> {
        self.complete(|map| async move { map.put(key, value).await })
    }

    pub fn put_and_get(&self, key: K, value: V) -> Result<Versioned<V>, ConcordError> {
        self.complete(|map| async move { map.put_and_get(key, value).await })
    }

    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<Versioned<V>>, ConcordError> {
        self.complete(|map| async move { map.put_if_absent(key, value).await })
    }

    pub fn remove(&self, key: K) -> Result<Option<Versioned<V>>, ConcordError> {
        self.complete(|map| async move { map.remove(key).await })
    }

    pub fn remove_if(&self, key: K, value_match: Match<V>) -> Result<bool, ConcordError> {
        self.complete(|map| async move { map.remove_if(key, value_match).await })
    }

    pub fn remove_version(&self, key: K, version: u64) -> Result<bool, ConcordError> {
        self.complete(|map| async move { map.remove_version(key, version).await })
    }

    pub fn replace(&self, key: K, old_value: V, new_value: V) -> Result<bool, ConcordError> {
        self.complete(|map| async move { map.replace(key, old_value, new_value).await })
    }

    pub fn replace_version(&self, key: K, old_version: u64, new_value: V) -> Result<bool, ConcordError> {
        self.complete(|map| async move { map.replace_version(key, old_version, new_value).await })
    }

    pub fn compute(
        &self,
        key: K,
        f: impl FnOnce(&K, Option<&V>) -> Option<V> + Send + 'static,
    ) -> Result<Option<Versioned<V>>, ConcordError> {
        self.complete(|map| async move { map.compute(key, f).await })
    }

    pub fn compute_if_absent(
        &self,
        key: K,
        f: impl FnOnce(&K) -> V + Send + 'static,
    ) -> Result<Option<Versioned<V>>, ConcordError> {
        self.complete(|map| async move { map.compute_if_absent(key, f).await })
    }

    pub fn key_set(&self) -> Result<Vec<K>, ConcordError> {
        self.complete(|map| async move { map.key_set().await })
    }

    pub fn values(&self) -> Result<Vec<Versioned<V>>, ConcordError> {
        self.complete(|map| async move { map.values().await })
    }

    pub fn entry_set(&self) -> Result<Vec<(K, Versioned<V>)>, ConcordError> {
        self.complete(|map| async move { map.entry_set().await })
    }

    pub fn clear(&self) -> Result<(), ConcordError> {
        self.complete(|map| async move { map.clear().await })
    }

    pub fn batch_update(&self, updates: Vec<UpdateOperation<K, V>>) -> Result<bool, ConcordError> {
        self.complete(|map| async move { map.batch_update(updates).await })
    }

    pub fn add_listener(
        &self,
        listener: impl FnMut(MapEvent<K, V>) + Send + 'static,
    ) -> Result<ListenerHandle, ConcordError> {
        let _runtime = self.runtime.enter();
        self.inner.add_listener(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::PartitionAssignment;
    use crate::codec::JsonCodec;
    use crate::database::PartitionedDatabase;
    use crate::map::{DefaultAsyncConsistentMap, EntryUpdate};
    use crate::partitioner::PartitionerKind;
    use concord_types::NodeId;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap()
    }

    fn sync_map(rt: &tokio::runtime::Runtime) -> ConsistentMap<DefaultAsyncConsistentMap<String, String>, String, String> {
        let assignment = PartitionAssignment::generate(&[NodeId::from("a"), NodeId::from("b")]);
        let db = PartitionedDatabase::local(&assignment, PartitionerKind::Key).unwrap();
        rt.block_on(db.open()).unwrap();
        let map = DefaultAsyncConsistentMap::new(
            "sync",
            Arc::new(db),
            Arc::new(JsonCodec::new()),
            Arc::new(JsonCodec::new()),
        );
        ConsistentMap::new(Arc::new(map), rt.handle().clone())
    }

    #[test]
    fn blocking_operations() {
        let rt = runtime();
        let map = sync_map(&rt);

        assert!(map.put("k".into(), "v1".into()).unwrap().is_none());
        let v1 = map.get(&"k".into()).unwrap().unwrap();
        assert!(map.replace_version("k".into(), v1.version, "v2".into()).unwrap());
        assert!(!map.replace_version("k".into(), v1.version, "v3".into()).unwrap());
        assert_eq!(map.get(&"k".into()).unwrap().unwrap().value, "v2");

        let computed = map.compute("n".into(), |_, v| Some(format!("{}!", v.map_or("", |s| s.as_str()))));
        assert_eq!(computed.unwrap().unwrap().value, "!");
        assert_eq!(map.size().unwrap(), 2);
        assert_eq!(map.key_set().unwrap().len(), 2);
        map.clear().unwrap();
        assert!(map.is_empty().unwrap());
    }

    /// A map whose every operation never finishes.
    struct Stalled;

    impl AsyncConsistentMap<String, String> for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }
        async fn size(&self) -> Result<usize, ConcordError> {
            std::future::pending().await
        }
        async fn is_empty(&self) -> Result<bool, ConcordError> {
            std::future::pending().await
        }
        async fn contains_key(&self, _key: &String) -> Result<bool, ConcordError> {
            std::future::pending().await
        }
        async fn contains_value(&self, _value: &String) -> Result<bool, ConcordError> {
            std::future::pending().await
        }
        async fn get(&self, _key: &String) -> Result<Option<Versioned<String>>, ConcordError> {
            std::future::pending().await
        }
        async fn update(
            &self,
            _key: String,
            _value: Option<String>,
            _value_match: Match<String>,
            _version_match: Match<u64>,
        ) -> Result<EntryUpdate<String>, ConcordError> {
            panic!("partition fault")
        }
        async fn key_set(&self) -> Result<Vec<String>, ConcordError> {
            std::future::pending().await
        }
        async fn values(&self) -> Result<Vec<Versioned<String>>, ConcordError> {
            std::future::pending().await
        }
        async fn entry_set(&self) -> Result<Vec<(String, Versioned<String>)>, ConcordError> {
            std::future::pending().await
        }
        async fn clear(&self) -> Result<(), ConcordError> {
            std::future::pending().await
        }
        async fn batch_update(&self, _updates: Vec<UpdateOperation<String, String>>) -> Result<bool, ConcordError> {
            std::future::pending().await
        }
        fn subscribe(&self) -> Result<tokio::sync::broadcast::Receiver<MapEvent<String, String>>, ConcordError> {
            Err(ConcordError::Unsupported("subscribe"))
        }
    }

    #[test]
    fn timeout_and_interruption() {
        let rt = runtime();
        let map = ConsistentMap::new(Arc::new(Stalled), rt.handle().clone())
            .with_timeout(Duration::from_millis(50));

        assert_eq!(map.get(&"k".into()), Err(ConcordError::Timeout));
        assert_eq!(map.put("k".into(), "v".into()), Err(ConcordError::Interrupted));
    }
}
