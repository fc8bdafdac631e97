use concord_types::{MapEntryUpdate, MapResponse};

/// Result of applying one command to a partition state machine.
#[derive(Debug, Clone)]
pub struct Applied {
    pub response: MapResponse,
    /// Entries whose stored value changed, in application order. Published to
    /// map listeners by the partition.
    pub changes: Vec<MapEntryUpdate>,
}

impl Applied {
    pub fn unchanged(response: MapResponse) -> Self {
        Applied { response, changes: Vec::new() }
    }
}
