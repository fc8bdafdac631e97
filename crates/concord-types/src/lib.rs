pub mod command;
pub mod transaction;
pub mod update;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use command::{MapCommand, MapResponse};
pub use transaction::{CommitResponse, Transaction, TransactionId, TransactionState};
pub use update::{
    MapEntryUpdate, Match, RawUpdateOperation, UpdateOperation, UpdateResult, UpdateStatus,
    UpdateType,
};

/// Identifier of a controller instance in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// A value paired with the version of the update that produced it.
///
/// Versions are assigned by the owning partition and strictly increase with
/// every successful mutation of the key. A missing key is `None`, never a
/// `Versioned` around an empty value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

impl<V> Versioned<V> {
    pub fn new(value: V, version: u64) -> Self {
        Versioned { value, version }
    }

    /// Transform the value, keeping the version.
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Versioned<U> {
        Versioned { value: f(self.value), version: self.version }
    }

    pub fn try_map<U, E>(self, f: impl FnOnce(V) -> Result<U, E>) -> Result<Versioned<U>, E> {
        Ok(Versioned { value: f(self.value)?, version: self.version })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcordError {
    /// A precondition or version check raced with a concurrent writer.
    #[error("concurrent modification")]
    ConcurrentModification,
    /// The key is held by a prepared transaction.
    #[error("key is locked by an in-flight transaction")]
    Locked,
    #[error("operation timed out")]
    Timeout,
    #[error("operation interrupted")]
    Interrupted,
    /// Any fault raised below the partition boundary.
    #[error("partition error: {0}")]
    Partition(String),
    #[error("partition {0} is closed")]
    PartitionClosed(String),
    #[error("updates span more than one partition")]
    CrossPartition,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl ConcordError {
    /// Errors a caller may resolve by re-reading and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConcordError::ConcurrentModification | ConcordError::Locked)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_map_keeps_version() {
        let v = Versioned::new("7".to_string(), 42);
        let mapped = v.map(|s| s.parse::<u32>().unwrap());
        assert_eq!(mapped, Versioned::new(7, 42));
    }

    #[test]
    fn retryable_kinds() {
        assert!(ConcordError::ConcurrentModification.is_retryable());
        assert!(ConcordError::Locked.is_retryable());
        assert!(!ConcordError::Timeout.is_retryable());
        assert!(!ConcordError::Partition("log fault".into()).is_retryable());
    }

    #[test]
    fn node_id_orders_by_string() {
        let mut ids = vec![NodeId::from("c"), NodeId::from("a"), NodeId::from("b")];
        ids.sort();
        assert_eq!(ids, vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")]);
        assert_eq!(ids[0].to_string(), "a");
    }
}
