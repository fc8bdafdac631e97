use std::sync::Arc;

use concord_types::{ConcordError, Match};

use crate::map::AsyncConsistentMap;
use crate::retry::RetryPolicy;

/// A named `i64` stored in a consistent map. A counter never written reads
/// as zero.
pub struct AtomicCounter<M> {
    name: String,
    map: Arc<M>,
    retry: RetryPolicy,
}

impl<M: AsyncConsistentMap<String, i64>> AtomicCounter<M> {
    pub fn new(name: impl Into<String>, map: Arc<M>, retry: RetryPolicy) -> Self {
        AtomicCounter { name: name.into(), map, retry }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> Result<i64, ConcordError> {
        Ok(self.map.get(&self.name).await?.map_or(0, |v| v.value))
    }

    pub async fn set(&self, value: i64) -> Result<(), ConcordError> {
        self.map.put(self.name.clone(), value).await?;
        Ok(())
    }

    pub async fn increment_and_get(&self) -> Result<i64, ConcordError> {
        self.add_and_get(1).await
    }

    pub async fn get_and_increment(&self) -> Result<i64, ConcordError> {
        self.get_and_add(1).await
    }

    pub async fn add_and_get(&self, delta: i64) -> Result<i64, ConcordError> {
        let (_, new) = self.apply(|v| v.wrapping_add(delta)).await?;
        Ok(new)
    }

    pub async fn get_and_add(&self, delta: i64) -> Result<i64, ConcordError> {
        let (old, _) = self.apply(|v| v.wrapping_add(delta)).await?;
        Ok(old)
    }

    /// Set to `update` if the current value is `expect`.
    pub async fn compare_and_set(&self, expect: i64, update: i64) -> Result<bool, ConcordError> {
        self.retry
            .run("counter compare_and_set", move || async move {
                let existing = self.map.get(&self.name).await?;
                if existing.as_ref().map_or(0, |v| v.value) != expect {
                    return Ok(false);
                }
                let version_match = existing.map_or(Match::IsAbsent, |v| Match::Equals(v.version));
                let result = self
                    .map
                    .update(self.name.clone(), Some(update), Match::Any, version_match)
                    .await?;
                if result.updated {
                    Ok(true)
                } else {
                    Err(ConcordError::ConcurrentModification)
                }
            })
            .await
    }

    /// Fenced read-modify-write; returns `(old, new)`.
    async fn apply(&self, f: impl Fn(i64) -> i64) -> Result<(i64, i64), ConcordError> {
        let f = &f;
        self.retry
            .run("counter update", move || async move {
                let existing = self.map.get(&self.name).await?;
                let old = existing.as_ref().map_or(0, |v| v.value);
                let new = f(old);
                let version_match = existing.map_or(Match::IsAbsent, |v| Match::Equals(v.version));
                let result = self
                    .map
                    .update(self.name.clone(), Some(new), Match::Any, version_match)
                    .await?;
                if result.updated {
                    Ok((old, new))
                } else {
                    Err(ConcordError::ConcurrentModification)
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::database::tests::local_db;
    use crate::map::DefaultAsyncConsistentMap;
    use crate::partitioner::PartitionerKind;
    use concord_types::{NodeId, Transaction, TransactionId, UpdateOperation};
    use std::time::Duration;

    async fn counter_map() -> Arc<DefaultAsyncConsistentMap<String, i64>> {
        Arc::new(DefaultAsyncConsistentMap::new(
            "concord-counters",
            local_db(2, PartitionerKind::Key).await,
            Arc::new(BincodeCodec::new()),
            Arc::new(BincodeCodec::new()),
        ))
    }

    #[tokio::test]
    async fn test_counter_operations() {
        let counter = AtomicCounter::new("flows", counter_map().await, RetryPolicy::default());
        assert_eq!(counter.get().await.unwrap(), 0);
        assert_eq!(counter.increment_and_get().await.unwrap(), 1);
        assert_eq!(counter.get_and_increment().await.unwrap(), 1);
        assert_eq!(counter.add_and_get(10).await.unwrap(), 12);
        assert_eq!(counter.get_and_add(-2).await.unwrap(), 12);
        assert_eq!(counter.get().await.unwrap(), 10);

        assert!(!counter.compare_and_set(3, 4).await.unwrap());
        assert!(counter.compare_and_set(10, 4).await.unwrap());
        counter.set(-1).await.unwrap();
        assert_eq!(counter.get().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_compare_and_set_from_absent() {
        let counter = AtomicCounter::new("fresh", counter_map().await, RetryPolicy::default());
        assert!(counter.compare_and_set(0, 5).await.unwrap());
        assert_eq!(counter.get().await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_increments_are_not_lost() {
        let map = counter_map().await;
        let policy = RetryPolicy::new(std::time::Duration::from_millis(1), None);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let counter = AtomicCounter::new("hits", map.clone(), policy);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    counter.increment_and_get().await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let counter = AtomicCounter::new("hits", map, policy);
        assert_eq!(counter.get().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_increment_waits_for_prepared_transaction() {
        let map = counter_map().await;
        let policy = RetryPolicy::new(Duration::from_millis(5), None);
        let counter = Arc::new(AtomicCounter::new("held", map.clone(), policy));
        counter.set(1).await.unwrap();

        let op = map.encode_update(UpdateOperation::put(map.name(), "held".to_string(), 100)).unwrap();
        let tx = Transaction::new(TransactionId::new(), NodeId::from("n0"), vec![op]);
        assert!(map.database().prepare(&tx).await.unwrap());

        let pending = tokio::spawn({
            let counter = counter.clone();
            async move { counter.increment_and_get().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        map.database().rollback(&tx).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), 2);
    }
}
