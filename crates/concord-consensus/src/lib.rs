use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use concord_storage::{MapStateMachine, MemStateMachine};
use concord_types::{ConcordError, MapCommand, MapEntryUpdate, MapResponse};

/// Capacity of each partition's change-notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Partition trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future ensures generic callers can
// `.await` across thread boundaries.
// ---------------------------------------------------------------------------

/// One independently replicated shard of the key space.
///
/// Implementations must execute accepted commands in a single total order
/// (linearizably). Nothing is guaranteed across partitions. Faults from the
/// replication layer surface as `ConcordError::Partition`.
pub trait Partition: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn open(&self) -> impl std::future::Future<Output = Result<(), ConcordError>> + Send;

    fn close(&self) -> impl std::future::Future<Output = Result<(), ConcordError>> + Send;

    fn is_open(&self) -> bool;

    fn execute(
        &self,
        cmd: MapCommand,
    ) -> impl std::future::Future<Output = Result<MapResponse, ConcordError>> + Send;

    /// Stream of entry changes applied by this partition, in log order.
    fn subscribe(&self) -> broadcast::Receiver<MapEntryUpdate>;
}

// ---------------------------------------------------------------------------
// LocalPartition: single replica, commands serialized in process
// ---------------------------------------------------------------------------

/// In-process partition: a command log of one, applied to a state machine.
///
/// Stands in for a consensus-replicated partition in tests and single-node
/// deployments. Writes are serialized through `log`; each accepted write
/// takes the next index, which the state machine uses as the entry version.
pub struct LocalPartition<S = MemStateMachine> {
    name: String,
    state_machine: Arc<S>,
    /// Last assigned log index.
    log: Mutex<u64>,
    events: broadcast::Sender<MapEntryUpdate>,
    open: AtomicBool,
}

impl LocalPartition<MemStateMachine> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_state_machine(name, MemStateMachine::new())
    }
}

impl<S: MapStateMachine> LocalPartition<S> {
    pub fn with_state_machine(name: impl Into<String>, state_machine: S) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        LocalPartition {
            name: name.into(),
            state_machine: Arc::new(state_machine),
            log: Mutex::new(0),
            events,
            open: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), ConcordError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ConcordError::PartitionClosed(self.name.clone()))
        }
    }
}

impl<S: MapStateMachine> Partition for LocalPartition<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), ConcordError> {
        // Resume numbering after whatever the state machine already holds.
        let last = self.state_machine.last_applied().await.unwrap_or(0);
        let mut log = self.log.lock().await;
        *log = (*log).max(last);
        self.open.store(true, Ordering::Release);
        tracing::debug!(partition = %self.name, last_index = *log, "partition opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), ConcordError> {
        // Wait for any in-flight write before refusing new ones.
        let _log = self.log.lock().await;
        self.open.store(false, Ordering::Release);
        tracing::debug!(partition = %self.name, "partition closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn execute(&self, cmd: MapCommand) -> Result<MapResponse, ConcordError> {
        self.ensure_open()?;
        if cmd.is_query() {
            return self.state_machine.query(cmd).await;
        }

        let mut log = self.log.lock().await;
        self.ensure_open()?;
        let index = *log + 1;
        let applied = self.state_machine.apply(index, cmd).await?;
        *log = index;
        drop(log);

        for change in applied.changes {
            // No receivers is not an error: nobody is listening.
            let _ = self.events.send(change);
        }
        Ok(applied.response)
    }

    fn subscribe(&self) -> broadcast::Receiver<MapEntryUpdate> {
        self.events.subscribe()
    }
}
