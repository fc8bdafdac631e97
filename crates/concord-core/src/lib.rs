//! Partitioned, versioned consistent maps with two-phase-commit
//! transactions, distributed locks and leader election, atomic counters and
//! a caching decorator.

pub mod assignment;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod counter;
pub mod database;
pub mod events;
pub mod leadership;
pub mod map;
pub mod partitioner;
pub mod retry;
pub mod service;
pub mod transaction;

pub use assignment::PartitionAssignment;
pub use cluster::{ClusterMembership, GroupMessaging, LocalMembership, LocalMessaging, LocalMessagingHub, NodeState};
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use config::Settings;
pub use counter::AtomicCounter;
pub use database::PartitionedDatabase;
pub use events::{ListenerHandle, MapEvent, MapEventKind};
pub use leadership::{Leadership, LeadershipEvent, LeadershipEventKind, LeadershipService, MutexState};
pub use map::{AsyncConsistentMap, CachingAsyncConsistentMap, ConsistentMap, DefaultAsyncConsistentMap, EntryUpdate};
pub use partitioner::{Partitioner, PartitionerKind};
pub use retry::RetryPolicy;
pub use service::StorageService;
pub use transaction::{TransactionContext, TransactionManager, TransactionalMap};
