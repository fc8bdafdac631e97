use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use concord_consensus::{LocalPartition, Partition};
use concord_types::{ConcordError, Match, NodeId, Versioned};

use crate::cluster::{ClusterEventKind, ClusterMembership, GroupMessaging, NodeState};
use crate::codec::BincodeCodec;
use crate::config::LeadershipSettings;
use crate::database::PartitionedDatabase;
use crate::leadership::{Leadership, LeadershipEvent, LeadershipEventKind, MutexState};
use crate::map::{AsyncConsistentMap, DefaultAsyncConsistentMap};
use crate::retry::RetryPolicy;

/// System map holding the authoritative `MutexState` of every topic.
pub const LEADERSHIP_MAP: &str = "concord-leadership";
/// Messaging subject carrying leadership events between nodes.
pub const LEADERSHIP_SUBJECT: &str = "concord-leadership-events";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Distributed mutual exclusion and leader election over a consistent map.
///
/// Every change to a topic is a fenced read-modify-write of its
/// `MutexState`. The leader board is a local cache fed by this node's own
/// transitions, by events gossiped from peers and by periodic refreshes
/// from the map. Nodes reported inactive are evicted by the sweep; a false
/// report can briefly give two nodes the same lock, but a crashed holder
/// never blocks a topic forever.
pub struct LeadershipService<T = LocalPartition> {
    local: NodeId,
    locks: DefaultAsyncConsistentMap<String, MutexState, T>,
    membership: Arc<dyn ClusterMembership>,
    messaging: Arc<dyn GroupMessaging>,
    leader_board: DashMap<String, Leadership>,
    events: broadcast::Sender<LeadershipEvent>,
    settings: LeadershipSettings,
    retry: RetryPolicy,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl<T: Partition> LeadershipService<T> {
    pub fn new(
        local: NodeId,
        database: Arc<PartitionedDatabase<T>>,
        membership: Arc<dyn ClusterMembership>,
        messaging: Arc<dyn GroupMessaging>,
        settings: LeadershipSettings,
    ) -> Self {
        let locks = DefaultAsyncConsistentMap::new(
            LEADERSHIP_MAP,
            database,
            Arc::new(BincodeCodec::new()),
            Arc::new(BincodeCodec::new()),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let retry = settings.retry_policy();
        LeadershipService {
            local,
            locks,
            membership,
            messaging,
            leader_board: DashMap::new(),
            events,
            settings,
            retry,
            shutdown: Mutex::new(None),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    // -----------------------------------------------------------------------
    // Lock operations
    // -----------------------------------------------------------------------

    /// Join the candidates of `topic`, taking the lock if it is free.
    pub async fn run_for_leadership(&self, topic: &str) -> Result<Leadership, ConcordError> {
        let local = self.local.clone();
        let (_, state) = self.transition(topic, |s| s.admit(&local)).await?;
        tracing::debug!(topic, node = %self.local, term = state.value.term, leader = ?state.value.holder, "ran for leadership");
        Ok(Leadership::from_state(topic, &state))
    }

    /// Leave `topic` entirely, releasing the lock if held.
    pub async fn withdraw(&self, topic: &str) -> Result<(), ConcordError> {
        let local = self.local.clone();
        self.transition(topic, |s| s.evict(&local)).await?;
        tracing::debug!(topic, node = %self.local, "withdrew from leadership");
        Ok(())
    }

    /// Release `topic` if this node holds it and rejoin at the back of the
    /// queue. Returns whether the lock was released.
    pub async fn stepdown(&self, topic: &str) -> Result<bool, ConcordError> {
        let local = self.local.clone();
        let (old, _) = self
            .transition(topic, |s| {
                if s.holder.as_ref() == Some(&local) {
                    s.evict(&local).admit(&local)
                } else {
                    s
                }
            })
            .await?;
        let released = old.holder.as_ref() == Some(&self.local);
        if released {
            tracing::info!(topic, node = %self.local, "stepped down");
        }
        Ok(released)
    }

    pub fn get_leader(&self, topic: &str) -> Option<NodeId> {
        self.leader_board.get(topic).and_then(|l| l.leader.clone())
    }

    pub fn get_leadership(&self, topic: &str) -> Option<Leadership> {
        self.leader_board.get(topic).map(|l| l.value().clone())
    }

    pub fn get_leader_board(&self) -> HashMap<String, Leadership> {
        self.leader_board
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Current candidates of `topic`, read from the authoritative map.
    pub async fn get_candidates(&self, topic: &str) -> Result<Vec<NodeId>, ConcordError> {
        Ok(self
            .locks
            .get(&topic.to_string())
            .await?
            .map(|v| v.value.candidates())
            .unwrap_or_default())
    }

    /// Topics `node` leads according to the leader board.
    pub fn owned_topics(&self, node: &NodeId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .leader_board
            .iter()
            .filter(|e| e.leader.as_ref() == Some(node))
            .map(|e| e.key().clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.events.subscribe()
    }

    /// Fenced read-modify-write of a topic's state, publishing the
    /// resulting event; returns `(old, new)`.
    async fn transition(
        &self,
        topic: &str,
        f: impl Fn(MutexState) -> MutexState + Send + Sync,
    ) -> Result<(MutexState, Versioned<MutexState>), ConcordError> {
        let (old, new) = self.update_state(topic, f).await?;
        if let Some(event) = LeadershipEvent::from_transition(topic, &old, &new) {
            self.publish(event);
        }
        Ok((old, new))
    }

    /// A no-op transition writes nothing and keeps the entry's version.
    async fn update_state(
        &self,
        topic: &str,
        f: impl Fn(MutexState) -> MutexState + Send + Sync,
    ) -> Result<(MutexState, Versioned<MutexState>), ConcordError> {
        let f = &f;
        self.retry
            .run("leadership transition", move || async move {
                let existing = self.locks.get(&topic.to_string()).await?;
                let (old, version) = existing.map_or((MutexState::default(), 0), |v| (v.value, v.version));
                let new = f(old.clone());
                if new == old {
                    return Ok((old, Versioned::new(new, version)));
                }
                let version_match = if version == 0 { Match::IsAbsent } else { Match::Equals(version) };
                let result = self.locks.update(topic.to_string(), Some(new), Match::Any, version_match).await?;
                match result.new_value {
                    Some(written) if result.updated => Ok((old, written)),
                    _ => Err(ConcordError::ConcurrentModification),
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Accept a locally produced event and tell the other nodes about it.
    fn publish(&self, event: LeadershipEvent) {
        if self.accept(event.clone()) {
            self.announce(&event);
        }
    }

    /// Apply `event` to the leader board if it supersedes the cached entry,
    /// then republish it to local subscribers. Returns whether it applied.
    fn accept(&self, event: LeadershipEvent) -> bool {
        let applied = match self.leader_board.entry(event.leadership.topic.clone()) {
            Entry::Occupied(mut cached) => {
                if event.supersedes(Some(cached.get())) {
                    cached.insert(event.leadership.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(event.leadership.clone());
                true
            }
        };
        if applied {
            tracing::debug!(topic = %event.leadership.topic, kind = ?event.kind, term = event.leadership.term, "leadership changed");
            let _ = self.events.send(event);
        }
        applied
    }

    fn announce(&self, event: &LeadershipEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode leadership event");
                return;
            }
        };
        if let Err(e) = self.messaging.broadcast(LEADERSHIP_SUBJECT, payload) {
            tracing::warn!(topic = %event.leadership.topic, error = %e, "failed to broadcast leadership event");
        }
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    /// Evict every inactive node from every topic. Returns how many topics
    /// changed; a topic that fails to update is retried on the next sweep.
    pub async fn run_sweep(&self) -> Result<usize, ConcordError> {
        let mut changed = 0;
        for (topic, state) in self.locks.entry_set().await? {
            let inactive: Vec<NodeId> = state
                .value
                .candidates()
                .into_iter()
                .filter(|n| self.membership.state(n) == NodeState::Inactive)
                .collect();
            if inactive.is_empty() {
                continue;
            }
            // Waiters go first so a promotion never lands on an inactive node.
            let evict = |s: MutexState| {
                let holder = s.holder.clone().filter(|h| inactive.contains(h));
                let s = inactive
                    .iter()
                    .filter(|n| holder.as_ref() != Some(*n))
                    .fold(s, |s, n| s.evict(n));
                match &holder {
                    Some(h) => s.evict(h),
                    None => s,
                }
            };
            match self.transition_after_failure(&topic, &inactive, evict).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "failed to evict inactive nodes, retrying next sweep");
                }
            }
        }
        Ok(changed)
    }

    async fn transition_after_failure(
        &self,
        topic: &str,
        inactive: &[NodeId],
        evict: impl Fn(MutexState) -> MutexState + Send + Sync,
    ) -> Result<bool, ConcordError> {
        let (old, new) = self.update_state(topic, evict).await?;
        if let Some(holder) = old.holder.as_ref().filter(|h| inactive.contains(h)) {
            tracing::info!(topic, node = %holder, term = old.term, "evicted inactive leader");
            // A promotion publishes only an election; announce the boot of
            // the failed holder ahead of it.
            if new.value.holder.is_some() {
                let leadership = Leadership {
                    topic: topic.to_string(),
                    leader: None,
                    candidates: new.value.candidates(),
                    term: old.term,
                    version: new.version,
                };
                self.publish(LeadershipEvent { kind: LeadershipEventKind::LeaderBooted, leadership });
            }
        }
        if let Some(event) = LeadershipEvent::from_transition(topic, &old, &new) {
            self.publish(event);
        }
        Ok(old != new.value)
    }

    /// Reconcile the leader board with the authoritative map.
    pub async fn refresh_leader_board(&self) -> Result<(), ConcordError> {
        for (topic, state) in self.locks.entry_set().await? {
            let current = Leadership::from_state(topic.clone(), &state);
            let cached = self.get_leadership(&topic);
            if cached.as_ref() == Some(&current) {
                continue;
            }
            let kind = match cached {
                Some(cached) if cached.leader == current.leader && cached.term == current.term => {
                    LeadershipEventKind::CandidatesChanged
                }
                _ if current.leader.is_some() => LeadershipEventKind::LeaderElected,
                _ => LeadershipEventKind::LeaderBooted,
            };
            self.accept(LeadershipEvent { kind, leadership: current });
        }
        Ok(())
    }

    /// Re-announce the topics this node leads.
    fn broadcast_held_topics(&self) {
        let held: Vec<Leadership> = self
            .leader_board
            .iter()
            .filter(|e| e.leader.as_ref() == Some(&self.local))
            .map(|e| e.value().clone())
            .collect();
        for leadership in held {
            self.announce(&LeadershipEvent { kind: LeadershipEventKind::LeaderElected, leadership });
        }
    }

    /// Start the sweep, broadcast, refresh and gossip tasks. Must be called
    /// from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), ConcordError> {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_some() {
            return Err(ConcordError::InvalidState("leadership service already started".into()));
        }
        let token = CancellationToken::new();

        let svc = self.clone();
        spawn_every(token.clone(), self.settings.sweep_interval(), move || {
            let svc = svc.clone();
            async move { svc.sweep_logged().await }
        });

        let svc = self.clone();
        spawn_every(token.clone(), self.settings.broadcast_interval(), move || {
            let svc = svc.clone();
            async move { svc.broadcast_held_topics() }
        });

        let svc = self.clone();
        spawn_every(token.clone(), self.settings.refresh_interval(), move || {
            let svc = svc.clone();
            async move {
                if let Err(e) = svc.refresh_leader_board().await {
                    tracing::warn!(error = %e, "leader board refresh failed");
                }
            }
        });

        self.spawn_gossip(token.clone());
        self.spawn_membership_watch(token.clone());

        tracing::info!(node = %self.local, "leadership service started");
        *shutdown = Some(token);
        Ok(())
    }

    /// Stop the background tasks. Topics held stay held.
    pub fn stop(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
            tracing::info!(node = %self.local, "leadership service stopped");
        }
    }

    async fn sweep_logged(&self) {
        match self.run_sweep().await {
            Ok(0) => {}
            Ok(changed) => tracing::debug!(changed, "sweep evicted inactive nodes"),
            Err(e) => tracing::warn!(error = %e, "sweep failed"),
        }
    }

    fn spawn_gossip(self: &Arc<Self>, token: CancellationToken) {
        let mut inbox = self.messaging.subscribe(LEADERSHIP_SUBJECT);
        let svc = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = inbox.recv() => match message {
                        Ok(message) => match serde_json::from_slice::<LeadershipEvent>(&message.payload) {
                            Ok(event) => {
                                svc.accept(event);
                            }
                            Err(e) => {
                                tracing::warn!(sender = %message.sender, error = %e, "undecodable leadership event");
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(lagged = n, "leadership gossip lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_membership_watch(self: &Arc<Self>, token: CancellationToken) {
        let mut events = self.membership.subscribe();
        let svc = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) if matches!(event.kind, ClusterEventKind::Deactivated | ClusterEventKind::Removed) => {
                            tracing::debug!(node = %event.node, kind = ?event.kind, "membership change, sweeping");
                            svc.sweep_logged().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => svc.sweep_logged().await,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

/// Run `tick` every `period` until `token` is cancelled.
fn spawn_every<F, Fut>(token: CancellationToken, period: Duration, mut tick: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    });
}
