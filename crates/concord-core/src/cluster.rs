use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use concord_types::{ConcordError, NodeId};

const CLUSTER_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEventKind {
    Added,
    Removed,
    Activated,
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: ClusterEventKind,
    pub node: NodeId,
}

/// View of cluster membership and failure detection.
pub trait ClusterMembership: Send + Sync + 'static {
    fn local_node(&self) -> NodeId;

    fn nodes(&self) -> Vec<NodeId>;

    /// Unknown nodes are `Inactive`.
    fn state(&self, node: &NodeId) -> NodeState;

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}

/// Membership driven by explicit calls; used by the node binary and tests.
pub struct LocalMembership {
    local: NodeId,
    nodes: RwLock<BTreeMap<NodeId, NodeState>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl LocalMembership {
    /// All nodes start `Active`.
    pub fn new(local: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let mut nodes: BTreeMap<NodeId, NodeState> =
            peers.into_iter().map(|n| (n, NodeState::Active)).collect();
        nodes.insert(local.clone(), NodeState::Active);
        let (events, _) = broadcast::channel(CLUSTER_CHANNEL_CAPACITY);
        LocalMembership { local, nodes: RwLock::new(nodes), events }
    }

    pub fn set_state(&self, node: &NodeId, state: NodeState) {
        let previous = self.nodes.write().insert(node.clone(), state);
        let kind = match (previous, state) {
            (None, _) => ClusterEventKind::Added,
            (Some(old), new) if old == new => return,
            (Some(_), NodeState::Active) => ClusterEventKind::Activated,
            (Some(_), NodeState::Inactive) => ClusterEventKind::Deactivated,
        };
        tracing::info!(node = %node, ?state, "membership changed");
        let _ = self.events.send(ClusterEvent { kind, node: node.clone() });
    }

    pub fn remove(&self, node: &NodeId) {
        if self.nodes.write().remove(node).is_some() {
            tracing::info!(node = %node, "node removed");
            let _ = self.events.send(ClusterEvent { kind: ClusterEventKind::Removed, node: node.clone() });
        }
    }
}

impl ClusterMembership for LocalMembership {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.nodes.read().keys().cloned().collect()
    }

    fn state(&self, node: &NodeId) -> NodeState {
        self.nodes.read().get(node).copied().unwrap_or(NodeState::Inactive)
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Group messaging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMessage {
    pub subject: String,
    pub sender: NodeId,
    pub payload: Vec<u8>,
}

/// Best-effort subject-addressed messaging between nodes.
pub trait GroupMessaging: Send + Sync + 'static {
    /// Deliver to every other node subscribed to `subject`.
    fn broadcast(&self, subject: &str, payload: Vec<u8>) -> Result<(), ConcordError>;

    fn unicast(&self, subject: &str, payload: Vec<u8>, to: &NodeId) -> Result<(), ConcordError>;

    fn subscribe(&self, subject: &str) -> broadcast::Receiver<ClusterMessage>;
}

/// Shared in-process broker connecting `LocalMessaging` endpoints.
///
/// Each (node, subject) pair owns a broadcast channel, created on first use.
#[derive(Default)]
pub struct LocalMessagingHub {
    members: Mutex<BTreeSet<NodeId>>,
    channels: Mutex<HashMap<(NodeId, String), broadcast::Sender<ClusterMessage>>>,
}

impl LocalMessagingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, node: NodeId) -> LocalMessaging {
        self.members.lock().insert(node.clone());
        LocalMessaging { local: node, hub: self.clone() }
    }

    fn channel(&self, node: &NodeId, subject: &str) -> broadcast::Sender<ClusterMessage> {
        self.channels
            .lock()
            .entry((node.clone(), subject.to_string()))
            .or_insert_with(|| broadcast::channel(CLUSTER_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn deliver(&self, to: &NodeId, message: ClusterMessage) {
        // A node with no subscriber for the subject simply misses the message.
        let _ = self.channel(to, &message.subject).send(message);
    }
}

pub struct LocalMessaging {
    local: NodeId,
    hub: Arc<LocalMessagingHub>,
}

impl GroupMessaging for LocalMessaging {
    fn broadcast(&self, subject: &str, payload: Vec<u8>) -> Result<(), ConcordError> {
        let members: Vec<NodeId> = self.hub.members.lock().iter().cloned().collect();
        for member in members.iter().filter(|m| **m != self.local) {
            self.hub.deliver(member, ClusterMessage {
                subject: subject.to_string(),
                sender: self.local.clone(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    fn unicast(&self, subject: &str, payload: Vec<u8>, to: &NodeId) -> Result<(), ConcordError> {
        if !self.hub.members.lock().contains(to) {
            return Err(ConcordError::InvalidArgument(format!("unknown node {to}")));
        }
        self.hub.deliver(to, ClusterMessage {
            subject: subject.to_string(),
            sender: self.local.clone(),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self, subject: &str) -> broadcast::Receiver<ClusterMessage> {
        self.hub.channel(&self.local, subject).subscribe()
    }
}
