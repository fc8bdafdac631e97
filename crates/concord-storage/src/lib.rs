pub mod mem;
pub mod traits;
pub mod types;

pub use mem::MemStateMachine;
pub use traits::MapStateMachine;
pub use types::Applied;
