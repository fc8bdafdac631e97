use crate::{
    MapEntryUpdate, Match, RawUpdateOperation, Transaction, TransactionId, UpdateResult, Versioned,
};

/// Commands executed by a partition, in the partition's total order.
///
/// Every command addresses one table (a named map). Keys are the encoded,
/// hex-rendered form of the caller's key; values are opaque bytes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum MapCommand {
    Size { table: String },
    IsEmpty { table: String },
    ContainsKey { table: String, key: String },
    ContainsValue { table: String, value: Vec<u8> },
    Get { table: String, key: String },
    KeySet { table: String },
    Values { table: String },
    EntrySet { table: String },
    /// Conditional single-key write. `value == None` removes the key.
    Update {
        table: String,
        key: String,
        value: Option<Vec<u8>>,
        value_match: Match<Vec<u8>>,
        version_match: Match<u64>,
    },
    Clear { table: String },
    /// Apply every update or none of them.
    AtomicBatchUpdate { updates: Vec<RawUpdateOperation> },
    /// Verify preconditions and lock the transaction's keys.
    Prepare { transaction: Transaction },
    Commit { transaction_id: TransactionId },
    Rollback { transaction_id: TransactionId },
}

impl MapCommand {
    /// Read-only commands do not consume a log index.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            MapCommand::Size { .. }
                | MapCommand::IsEmpty { .. }
                | MapCommand::ContainsKey { .. }
                | MapCommand::ContainsValue { .. }
                | MapCommand::Get { .. }
                | MapCommand::KeySet { .. }
                | MapCommand::Values { .. }
                | MapCommand::EntrySet { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MapResponse {
    Size(usize),
    Bool(bool),
    Value(Option<Versioned<Vec<u8>>>),
    Keys(Vec<String>),
    Values(Vec<Versioned<Vec<u8>>>),
    Entries(Vec<(String, Versioned<Vec<u8>>)>),
    Update(UpdateResult<MapEntryUpdate>),
    Committed(Vec<MapEntryUpdate>),
    Unit,
}
