//! Distributed locks and leader election.

mod service;
mod state;

pub use service::{LeadershipService, LEADERSHIP_MAP, LEADERSHIP_SUBJECT};
pub use state::{Leadership, LeadershipEvent, LeadershipEventKind, MutexState};
