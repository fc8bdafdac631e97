pub mod async_map;
pub mod caching;
pub mod sync_map;

pub use async_map::{AsyncConsistentMap, DefaultAsyncConsistentMap, EntryUpdate};
pub use caching::CachingAsyncConsistentMap;
pub use sync_map::{ConsistentMap, DEFAULT_OPERATION_TIMEOUT};
