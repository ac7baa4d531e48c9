//! Buddy Resync Module
//!
//! Durable needs-resync decisions, their delivery to the coordinator and
//! the periodic check that starts resync jobs.

pub mod coordinator;
pub mod launcher;
pub mod marker;

pub use coordinator::{CoordinatorLink, ResyncCheck, ResyncCoordinator, ResyncSettings};
pub use launcher::{CommandResyncLauncher, LoggingResyncLauncher, ResyncLauncher};
pub use marker::{ResyncMarker, ResyncState};
