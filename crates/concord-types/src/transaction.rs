use std::fmt;

use crate::{now_ms, MapEntryUpdate, NodeId, RawUpdateOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub uuid::Uuid);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(uuid::Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Two-phase commit progress.
///
/// `Preparing → Committing | RollingBack → Committed | RolledBack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransactionState {
    Preparing,
    Committing,
    RollingBack,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

/// A set of updates committed atomically on one partition.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub updates: Vec<RawUpdateOperation>,
    pub state: TransactionState,
    /// Node driving the commit; another node resumes it if this one dies.
    pub coordinator: NodeId,
    /// Milliseconds since the Unix epoch.
    pub last_updated: u64,
}

impl Transaction {
    pub fn new(id: TransactionId, coordinator: NodeId, updates: Vec<RawUpdateOperation>) -> Self {
        Transaction {
            id,
            updates,
            state: TransactionState::Preparing,
            coordinator,
            last_updated: now_ms(),
        }
    }

    pub fn transition(self, state: TransactionState) -> Self {
        Transaction { state, last_updated: now_ms(), ..self }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommitResponse {
    pub success: bool,
    pub updates: Vec<MapEntryUpdate>,
}

impl CommitResponse {
    pub fn success(updates: Vec<MapEntryUpdate>) -> Self {
        CommitResponse { success: true, updates }
    }

    pub fn failure() -> Self {
        CommitResponse { success: false, updates: Vec::new() }
    }
}
