//! BuddyMirror - Buddy Group Mirroring Core
//!
//! Keeps the two targets of a buddy group consistent. Every mutating
//! request is numbered by the requestor, applied by the group's primary
//! and forwarded to its secondary; whenever the secondary cannot follow,
//! the primary persists a needs-resync decision and reports it to the
//! coordinator.
//!
//! # Architecture
//!
//! - `state`: target states, target/buddy group topology and pool stores
//! - `mirror`: sequence windows, sessions, entry locks and the executor
//! - `resync`: the durable resync marker and the resync coordinator
//! - `network`: framed TCP transport between nodes
//! - `node`: wiring of all of the above into one serving node

pub mod config;
pub mod error;
pub mod mirror;
pub mod network;
pub mod node;
pub mod resync;
pub mod state;
pub mod timer;

pub use config::BuddyMirrorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::BuddyMirrorConfig;
    pub use crate::error::{Error, OpsResult, Result};
    pub use crate::mirror::{BuddyRequestor, Message, MirroredOperation, SequenceWindow};
    pub use crate::node::MirrorNode;
    pub use crate::resync::{ResyncCoordinator, ResyncState};
    pub use crate::state::{BuddyGroupDirectory, CombinedState, TargetStateStore};
}
