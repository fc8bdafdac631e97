use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use concord_types::{
    ConcordError, MapCommand, MapEntryUpdate, MapResponse, Match, RawUpdateOperation,
    Transaction, TransactionId, UpdateResult, Versioned,
};

use crate::traits::MapStateMachine;
use crate::types::Applied;

type Table = BTreeMap<String, Versioned<Vec<u8>>>;

struct MemSmInner {
    tables: BTreeMap<String, Table>,
    /// (table, key) → transaction holding the key between prepare and
    /// commit/rollback.
    prepared_keys: HashMap<(String, String), TransactionId>,
    prepared: HashMap<TransactionId, Transaction>,
    last_applied: Option<u64>,
}

impl MemSmInner {
    fn current(&self, table: &str, key: &str) -> Option<&Versioned<Vec<u8>>> {
        self.tables.get(table).and_then(|t| t.get(key))
    }

    fn locked_by(&self, table: &str, key: &str) -> Option<TransactionId> {
        self.prepared_keys.get(&(table.to_string(), key.to_string())).copied()
    }

    fn is_locked(&self, op: &RawUpdateOperation) -> bool {
        self.locked_by(&op.table, &op.key).is_some()
    }

    fn write(&mut self, table: &str, key: &str, value: Option<Vec<u8>>, index: u64) -> MapEntryUpdate {
        let new_value = value.map(|v| Versioned::new(v, index));
        let old_value = match &new_value {
            Some(v) => self
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(key.to_string(), v.clone()),
            None => {
                let removed = self.tables.get_mut(table).and_then(|t| t.remove(key));
                if self.tables.get(table).is_some_and(|t| t.is_empty()) {
                    self.tables.remove(table);
                }
                removed
            }
        };
        MapEntryUpdate {
            table: table.to_string(),
            key: key.to_string(),
            updated: true,
            old_value,
            new_value,
        }
    }

    fn write_op(&mut self, op: &RawUpdateOperation, index: u64) -> MapEntryUpdate {
        let value = if op.kind.is_remove() { None } else { op.value.clone() };
        self.write(&op.table, &op.key, value, index)
    }

    fn update(
        &mut self,
        index: u64,
        table: String,
        key: String,
        value: Option<Vec<u8>>,
        value_match: Match<Vec<u8>>,
        version_match: Match<u64>,
    ) -> Applied {
        let old = self.current(&table, &key).cloned();
        if old.is_none() && value.is_none() {
            let noop = MapEntryUpdate { table, key, updated: false, old_value: None, new_value: None };
            return Applied::unchanged(MapResponse::Update(UpdateResult::ok(noop)));
        }
        if self.locked_by(&table, &key).is_some() {
            return Applied::unchanged(MapResponse::Update(UpdateResult::locked()));
        }
        let holds = value_match.matches(old.as_ref().map(|v| &v.value))
            && version_match.matches(old.as_ref().map(|v| &v.version));
        if !holds {
            let unchanged = MapEntryUpdate {
                table,
                key,
                updated: false,
                old_value: old.clone(),
                new_value: old,
            };
            return Applied::unchanged(MapResponse::Update(UpdateResult::ok(unchanged)));
        }
        let change = self.write(&table, &key, value, index);
        Applied {
            response: MapResponse::Update(UpdateResult::ok(change.clone())),
            changes: vec![change],
        }
    }

    fn clear(&mut self, index: u64, table: &str) -> Applied {
        let keys: Vec<String> = match self.tables.get(table) {
            Some(t) => t.keys().cloned().collect(),
            None => Vec::new(),
        };
        let mut changes = Vec::with_capacity(keys.len());
        for key in keys {
            if self.locked_by(table, &key).is_some() {
                tracing::debug!(%table, %key, "clear skipped key held by a prepared transaction");
                continue;
            }
            changes.push(self.write(table, &key, None, index));
        }
        Applied { response: MapResponse::Unit, changes }
    }

    fn batch_update(&mut self, index: u64, updates: Vec<RawUpdateOperation>) -> Applied {
        let admissible = updates.iter().all(|op| {
            !self.is_locked(op) && op.precondition_holds(self.current(&op.table, &op.key))
        });
        if !admissible {
            return Applied::unchanged(MapResponse::Bool(false));
        }
        let changes = updates.iter().map(|op| self.write_op(op, index)).collect();
        Applied { response: MapResponse::Bool(true), changes }
    }

    fn prepare(&mut self, transaction: Transaction) -> Applied {
        if self.prepared.contains_key(&transaction.id) {
            return Applied::unchanged(MapResponse::Bool(true));
        }
        for op in &transaction.updates {
            if let Some(holder) = self.locked_by(&op.table, &op.key) {
                tracing::debug!(
                    tx = %transaction.id,
                    %holder,
                    table = %op.table,
                    "prepare conflicts with a concurrent transaction"
                );
                return Applied::unchanged(MapResponse::Bool(false));
            }
            if !op.precondition_holds(self.current(&op.table, &op.key)) {
                return Applied::unchanged(MapResponse::Bool(false));
            }
        }
        for op in &transaction.updates {
            self.prepared_keys.insert((op.table.clone(), op.key.clone()), transaction.id);
        }
        self.prepared.insert(transaction.id, transaction);
        Applied::unchanged(MapResponse::Bool(true))
    }

    fn release(&mut self, transaction: &Transaction) {
        for op in &transaction.updates {
            let slot = (op.table.clone(), op.key.clone());
            if self.prepared_keys.get(&slot) == Some(&transaction.id) {
                self.prepared_keys.remove(&slot);
            }
        }
    }

    fn commit(&mut self, index: u64, transaction_id: TransactionId) -> Applied {
        // Unknown ids were already committed or rolled back; repeating is harmless.
        let Some(transaction) = self.prepared.remove(&transaction_id) else {
            return Applied::unchanged(MapResponse::Committed(Vec::new()));
        };
        self.release(&transaction);
        let changes: Vec<MapEntryUpdate> =
            transaction.updates.iter().map(|op| self.write_op(op, index)).collect();
        Applied { response: MapResponse::Committed(changes.clone()), changes }
    }

    fn rollback(&mut self, transaction_id: TransactionId) -> Applied {
        if let Some(transaction) = self.prepared.remove(&transaction_id) {
            self.release(&transaction);
        }
        Applied::unchanged(MapResponse::Unit)
    }

    fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    fn query(&self, cmd: MapCommand) -> Result<MapResponse, ConcordError> {
        Ok(match cmd {
            MapCommand::Size { table } => MapResponse::Size(self.table(&table).map_or(0, |t| t.len())),
            MapCommand::IsEmpty { table } => {
                MapResponse::Bool(self.table(&table).map_or(true, |t| t.is_empty()))
            }
            MapCommand::ContainsKey { table, key } => {
                MapResponse::Bool(self.current(&table, &key).is_some())
            }
            MapCommand::ContainsValue { table, value } => MapResponse::Bool(
                self.table(&table).is_some_and(|t| t.values().any(|v| v.value == value)),
            ),
            MapCommand::Get { table, key } => MapResponse::Value(self.current(&table, &key).cloned()),
            MapCommand::KeySet { table } => MapResponse::Keys(
                self.table(&table).map(|t| t.keys().cloned().collect()).unwrap_or_default(),
            ),
            MapCommand::Values { table } => MapResponse::Values(
                self.table(&table).map(|t| t.values().cloned().collect()).unwrap_or_default(),
            ),
            MapCommand::EntrySet { table } => MapResponse::Entries(
                self.table(&table)
                    .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            ),
            other => {
                return Err(ConcordError::InvalidArgument(format!("{other:?} is not a query")))
            }
        })
    }
}

/// In-memory `MapStateMachine`.
///
/// Holds every table of one partition, the keys locked by prepared
/// transactions, and the prepared transactions themselves. Not persisted
/// across restarts.
pub struct MemStateMachine {
    inner: Arc<RwLock<MemSmInner>>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        MemStateMachine {
            inner: Arc::new(RwLock::new(MemSmInner {
                tables: BTreeMap::new(),
                prepared_keys: HashMap::new(),
                prepared: HashMap::new(),
                last_applied: None,
            })),
        }
    }
}

impl Default for MemStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl MapStateMachine for MemStateMachine {
    async fn last_applied(&self) -> Option<u64> {
        self.inner.read().await.last_applied
    }

    async fn apply(&self, index: u64, cmd: MapCommand) -> Result<Applied, ConcordError> {
        let mut g = self.inner.write().await;
        if g.last_applied.is_some_and(|last| index <= last) {
            return Err(ConcordError::InvalidState(format!(
                "index {index} is not after last applied {:?}",
                g.last_applied
            )));
        }

        let applied = match cmd {
            MapCommand::Update { table, key, value, value_match, version_match } => {
                g.update(index, table, key, value, value_match, version_match)
            }
            MapCommand::Clear { table } => g.clear(index, &table),
            MapCommand::AtomicBatchUpdate { updates } => g.batch_update(index, updates),
            MapCommand::Prepare { transaction } => g.prepare(transaction),
            MapCommand::Commit { transaction_id } => g.commit(index, transaction_id),
            MapCommand::Rollback { transaction_id } => g.rollback(transaction_id),
            query => Applied::unchanged(g.query(query)?),
        };

        g.last_applied = Some(index);
        Ok(applied)
    }

    async fn query(&self, cmd: MapCommand) -> Result<MapResponse, ConcordError> {
        self.inner.read().await.query(cmd)
    }
}
