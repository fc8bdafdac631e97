use std::future::Future;

use concord_types::{ConcordError, MapCommand, MapResponse};

use crate::types::Applied;

/// Deterministic key/value state machine for a single partition.
///
/// Methods use RPITIT (`-> impl Future + Send`) matching the `Partition`
/// trait in `concord-consensus`; no `async-trait` dependency.
///
/// The partition's command log calls `apply` once per accepted command, in
/// log order. `index` is strictly increasing and doubles as the version of
/// every entry written by the command.
pub trait MapStateMachine: Send + Sync + 'static {
    /// Index of the last applied command, or `None` if nothing was applied.
    fn last_applied(&self) -> impl Future<Output = Option<u64>> + Send;

    /// Apply a mutating command at log position `index`.
    fn apply(&self, index: u64, cmd: MapCommand)
        -> impl Future<Output = Result<Applied, ConcordError>> + Send;

    /// Answer a read-only command against the current state.
    fn query(&self, cmd: MapCommand)
        -> impl Future<Output = Result<MapResponse, ConcordError>> + Send;
}
