use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use concord_consensus::{LocalPartition, Partition};
use concord_types::{ConcordError, NodeId};

use crate::cluster::{ClusterMembership, GroupMessaging};
use crate::codec::{BincodeCodec, Codec};
use crate::config::Settings;
use crate::counter::AtomicCounter;
use crate::database::PartitionedDatabase;
use crate::events::ListenerHandle;
use crate::leadership::LeadershipService;
use crate::map::{CachingAsyncConsistentMap, ConsistentMap, DefaultAsyncConsistentMap};
use crate::transaction::{TransactionContext, TransactionManager};

/// System map holding every atomic counter, keyed by counter name.
pub const COUNTERS_MAP: &str = "concord-counters";

/// Entry point of a Concord node: owns the partitioned database and the
/// services built on it.
pub struct StorageService<T = LocalPartition> {
    local: NodeId,
    settings: Settings,
    database: Arc<PartitionedDatabase<T>>,
    membership: Arc<dyn ClusterMembership>,
    transactions: Arc<TransactionManager<T>>,
    leadership: Arc<LeadershipService<T>>,
    counters: Arc<DefaultAsyncConsistentMap<String, i64, T>>,
    watches: Mutex<Vec<ListenerHandle>>,
    started: AtomicBool,
}

impl<T: Partition> StorageService<T> {
    pub fn new(
        database: Arc<PartitionedDatabase<T>>,
        membership: Arc<dyn ClusterMembership>,
        messaging: Arc<dyn GroupMessaging>,
        settings: Settings,
    ) -> Self {
        let local = membership.local_node();
        let transactions = Arc::new(TransactionManager::new(local.clone(), database.clone()));
        let leadership = Arc::new(LeadershipService::new(
            local.clone(),
            database.clone(),
            membership.clone(),
            messaging,
            settings.leadership.clone(),
        ));
        let counters = Arc::new(DefaultAsyncConsistentMap::new(
            COUNTERS_MAP,
            database.clone(),
            Arc::new(BincodeCodec::new()),
            Arc::new(BincodeCodec::new()),
        ));
        StorageService {
            local,
            settings,
            database,
            membership,
            transactions,
            leadership,
            counters,
            watches: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn database(&self) -> &Arc<PartitionedDatabase<T>> {
        &self.database
    }

    pub fn transactions(&self) -> &Arc<TransactionManager<T>> {
        &self.transactions
    }

    pub fn leadership(&self) -> &Arc<LeadershipService<T>> {
        &self.leadership
    }

    /// Open the partitions, finish transactions left behind by earlier runs
    /// and start the background services. Fails without side effects if the
    /// service is already running.
    pub async fn start(&self) -> Result<(), ConcordError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConcordError::InvalidState("storage service already started".into()));
        }
        if let Err(e) = self.start_services().await {
            self.leadership.stop();
            self.watches.lock().clear();
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    async fn start_services(&self) -> Result<(), ConcordError> {
        self.database.open().await?;
        let resumed = self.transactions.resume_pending().await?;
        if resumed > 0 {
            tracing::info!(resumed, "resumed pending transactions");
        }
        if self.settings.transactions.resume_on_membership_change {
            let watch = self.transactions.watch_membership(self.membership.as_ref());
            self.watches.lock().push(watch);
        }
        self.leadership.start()?;
        tracing::info!(node = %self.local, partitions = self.database.partitions().len(), "storage service started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ConcordError> {
        self.leadership.stop();
        self.watches.lock().clear();
        self.database.close().await?;
        self.started.store(false, Ordering::Release);
        tracing::info!(node = %self.local, "storage service stopped");
        Ok(())
    }

    pub fn consistent_map<K, V>(
        &self,
        name: &str,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Arc<DefaultAsyncConsistentMap<K, V, T>>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        Arc::new(DefaultAsyncConsistentMap::new(name, self.database.clone(), key_codec, value_codec))
    }

    /// Blocking view of a map, bounded by `storage.sync_timeout_ms`. Must be
    /// called from within a tokio runtime; the returned map must not be used
    /// from its worker threads.
    pub fn sync_map<K, V>(
        &self,
        name: &str,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Result<ConsistentMap<DefaultAsyncConsistentMap<K, V, T>, K, V>, ConcordError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|_| ConcordError::InvalidState("blocking maps require a tokio runtime".into()))?;
        Ok(ConsistentMap::new(self.consistent_map(name, key_codec, value_codec), runtime)
            .with_timeout(self.settings.storage.sync_timeout()))
    }

    /// Map with a read-through cache of `get`.
    pub fn caching_map<K, V>(
        &self,
        name: &str,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Result<CachingAsyncConsistentMap<DefaultAsyncConsistentMap<K, V, T>, K, V>, ConcordError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        CachingAsyncConsistentMap::new(self.consistent_map(name, key_codec, value_codec))
    }

    pub fn counter(&self, name: &str) -> AtomicCounter<DefaultAsyncConsistentMap<String, i64, T>> {
        AtomicCounter::new(name, self.counters.clone(), self.settings.counter.retry_policy())
    }

    pub fn transaction_context(&self) -> TransactionContext<T> {
        self.transactions.new_context()
    }
}
