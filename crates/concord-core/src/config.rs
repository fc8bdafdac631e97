use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::partitioner::PartitionerKind;
use crate::retry::RetryPolicy;

/// Runtime settings for a Concord node. `Default` matches
/// `config/default.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub transactions: TransactionSettings,
    pub leadership: LeadershipSettings,
    pub counter: CounterSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Partition assignment document. When unset, one is generated from the
    /// known nodes.
    pub partition_file: Option<String>,
    pub partitioner: PartitionerKind,
    /// Bound on each blocking `ConsistentMap` operation.
    pub sync_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            partition_file: None,
            partitioner: PartitionerKind::Key,
            sync_timeout_ms: 5_000,
        }
    }
}

impl StorageSettings {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// Take over transactions whose coordinator becomes inactive.
    pub resume_on_membership_change: bool,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        TransactionSettings { resume_on_membership_change: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadershipSettings {
    pub sweep_interval_ms: u64,
    pub broadcast_interval_ms: u64,
    pub refresh_interval_ms: u64,
    pub lock_retry_delay_ms: u64,
    /// `None` retries until the lock state update lands.
    pub lock_max_retries: Option<u32>,
}

impl Default for LeadershipSettings {
    fn default() -> Self {
        LeadershipSettings {
            sweep_interval_ms: 2_000,
            broadcast_interval_ms: 2_000,
            refresh_interval_ms: 10_000,
            lock_retry_delay_ms: 50,
            lock_max_retries: None,
        }
    }
}

impl LeadershipSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.lock_retry_delay_ms), self.lock_max_retries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterSettings {
    pub retry_delay_ms: u64,
    pub max_retries: Option<u32>,
}

impl Default for CounterSettings {
    fn default() -> Self {
        CounterSettings { retry_delay_ms: 50, max_retries: None }
    }
}

impl CounterSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.retry_delay_ms), self.max_retries)
    }
}
