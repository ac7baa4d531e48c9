//! Buddy Mirroring Module
//!
//! Sequence numbering of mirrored requests, the mirrored operation
//! contract and its execution on primary and secondary.

pub mod entries;
pub mod executor;
pub mod locks;
pub mod operation;
pub mod protocol;
pub mod requestor;
pub mod session;
pub mod window;

pub use executor::{MirrorExecutor, SecondaryLink};
pub use locks::{EntryLock, EntryLockStore, LockKey, LockMode, LockSet};
pub use operation::{AckNotify, LocalOutcome, MirroredOperation, OpContext};
pub use protocol::{FrameHeader, Message, MirrorReply, MirrorRequest, NodeType, OpResponse, SeqHeader};
pub use requestor::{BuddyRequestor, MirrorTransport};
pub use session::{MirrorSessionStore, SlotClaim};
pub use window::{AckInfo, Acquired, SeqHandle, SequenceWindow};
