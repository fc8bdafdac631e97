//! Optimistic transactions over consistent maps, committed with two-phase
//! commit through the partitioned database.

mod context;
mod manager;
mod map;

pub use context::TransactionContext;
pub use manager::{TransactionManager, TRANSACTIONS_MAP};
pub use map::{TransactionalMap, TxParticipant};
