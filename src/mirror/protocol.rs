//! Mirroring Protocol
//!
//! Defines the wire protocol spoken between requestors, buddies and the
//! coordinator.

use serde::{Deserialize, Serialize};

use super::window::AckInfo;
use crate::error::OpsResult;
use crate::state::{
    BuddyRole, ConsistencyState, GroupId, GroupMapping, NodeId, TargetId, TargetStateEntry,
};

/// Kind of service a node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Meta,
    Storage,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Meta => write!(f, "meta"),
            NodeType::Storage => write!(f, "storage"),
        }
    }
}

/// Sequence information attached to a mirrored request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqHeader {
    /// Sequence number of this request, 0 asks for a new base
    pub seq_no: u64,
    /// Finished sequence number the receiver may forget
    pub seq_done: u64,
    /// `seq_done` names a single number instead of a watermark
    pub selective: bool,
}

impl SeqHeader {
    /// Header asking the receiver for a sequence number base
    pub fn base_probe() -> Self {
        Self {
            seq_no: 0,
            seq_done: 0,
            selective: false,
        }
    }

    pub fn new(seq_no: u64, ack: AckInfo) -> Self {
        Self {
            seq_no,
            seq_done: ack.seq_no(),
            selective: ack.is_selective(),
        }
    }
}

/// Result code plus operation specific response data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResponse {
    pub result: OpsResult,
    pub payload: Vec<u8>,
}

impl OpResponse {
    pub fn new(result: OpsResult) -> Self {
        Self {
            result,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(result: OpsResult, payload: Vec<u8>) -> Self {
        Self { result, payload }
    }
}

/// A mirrored operation on its way to a primary or from a primary to its secondary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorRequest {
    pub group_id: GroupId,
    /// Node that originally issued the request
    pub requestor: NodeId,
    pub seq: Option<SeqHeader>,
    pub op_type: u16,
    pub payload: Vec<u8>,
}

/// Answer to a mirrored request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorReply {
    Response(OpResponse),
    /// The request carried sequence number 0, start numbering above this
    NewSeqNoBase(u64),
    /// The same sequence number is being processed right now
    TryAgain,
}

/// Node status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub local_target: TargetId,
    pub role: BuddyRole,
    pub group: Option<GroupMapping>,
    pub resync_state: String,
    pub in_flight: usize,
    pub mirror_sessions: usize,
    pub states: Vec<TargetStateEntry>,
}

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Topology ==========
    /// Full target state and buddy group list (from coordinator)
    SyncStatesAndGroups {
        states: Vec<TargetStateEntry>,
        groups: Vec<GroupMapping>,
    },

    /// Target registration (from coordinator)
    MapTarget {
        target_id: TargetId,
        node_id: NodeId,
        pool: u16,
    },

    /// Full target to node mapping (from coordinator)
    SyncTargets {
        targets: Vec<(TargetId, NodeId)>,
        pool: u16,
    },

    /// Generic result for topology updates
    TopologyResponse {
        result: OpsResult,
    },

    // ========== Consistency ==========
    /// Change the consistency state of targets
    SetTargetConsistencyStates {
        node_type: NodeType,
        targets: Vec<TargetId>,
        states: Vec<ConsistencyState>,
    },

    /// Consistency state change response
    SetTargetConsistencyStatesResponse {
        result: OpsResult,
    },

    // ========== Mirroring ==========
    /// Mirrored request from a requestor to a group's primary
    MirrorRequest(MirrorRequest),

    /// Mirrored request forwarded from the primary to its secondary
    ForwardedOperation(MirrorRequest),

    /// Answer to either of the above
    MirrorReply(MirrorReply),

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse(NodeStatus),

    // ========== Error ==========
    /// Error response
    Error {
        result: OpsResult,
        message: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::SyncStatesAndGroups { .. } => "SyncStatesAndGroups",
            Message::MapTarget { .. } => "MapTarget",
            Message::SyncTargets { .. } => "SyncTargets",
            Message::TopologyResponse { .. } => "TopologyResponse",
            Message::SetTargetConsistencyStates { .. } => "SetTargetConsistencyStates",
            Message::SetTargetConsistencyStatesResponse { .. } => "SetTargetConsistencyStatesResponse",
            Message::MirrorRequest(_) => "MirrorRequest",
            Message::ForwardedOperation(_) => "ForwardedOperation",
            Message::MirrorReply(_) => "MirrorReply",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse(_) => "StatusResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted message body
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
