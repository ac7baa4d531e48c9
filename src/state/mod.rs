//! State Management Module
//!
//! Target states, target/buddy group topology and the auxiliary per-target
//! stores that follow it.

mod directory;
mod pools;
mod target_states;

pub use directory::{AuxiliaryStore, BuddyGroup, BuddyGroupDirectory, BuddyRole, GroupMapping};
pub use pools::{ExceededQuotaStore, StoragePoolStore, DEFAULT_POOL};
pub use target_states::{
    CombinedState, ConsistencyState, ReachabilityState, TargetStateEntry, TargetStateInfo,
    TargetStateStore, TopologySnapshot,
};

/// Storage or metadata target ID
pub type TargetId = u16;

/// Buddy group ID
pub type GroupId = u16;

/// Storage pool ID
pub type PoolId = u16;

/// Node ID
pub type NodeId = u32;
