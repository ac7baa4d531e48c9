//! Mirrored operation contract
//!
//! Every mutating request on a buddy group runs through the same two
//! paths: on the primary it is locked, applied locally and, when it
//! changed observable state, forwarded to the secondary; on the secondary
//! it is applied with the data the primary decided on.

use super::locks::{EntryLock, EntryLockStore, LockSet};
use super::protocol::{OpResponse, SeqHeader};
use crate::error::{OpsResult, Result};
use crate::state::{GroupId, NodeId};

/// Operation type of the acknowledgment-only notification
pub const OP_ACK_NOTIFY: u16 = 1;

/// Response of a local execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalOutcome {
    pub response: OpResponse,
    /// Whether the secondary has to apply the operation too
    pub changes_observable_state: bool,
}

impl LocalOutcome {
    /// Outcome whose observable effect follows its result
    pub fn from_result(result: OpsResult, payload: Vec<u8>) -> Self {
        Self {
            response: OpResponse::with_payload(result, payload),
            changes_observable_state: result.is_success(),
        }
    }
}

/// Where a mirrored request came from and what it carries
#[derive(Debug, Clone, Copy)]
pub struct OpContext {
    pub group_id: GroupId,
    /// Node that originally issued the request
    pub requestor: NodeId,
    pub seq: Option<SeqHeader>,
    /// The request was forwarded by the primary
    pub is_secondary: bool,
}

#[async_trait::async_trait]
pub trait MirroredOperation: Send + Sync {
    fn op_type(&self) -> u16;

    /// Short description for log messages
    fn log_context(&self) -> String;

    fn is_mirrored(&self) -> bool {
        true
    }

    /// Entry locks the primary holds while executing and forwarding
    fn lock_set(&self) -> Vec<EntryLock>;

    async fn lock(&self, store: &EntryLockStore) -> LockSet {
        store.lock_all(self.lock_set()).await
    }

    /// Apply the operation to the local store
    ///
    /// On the primary this may decide values (IDs, timestamps) that are
    /// then part of `forward_payload`; the secondary applies those values
    /// as given.
    async fn execute_locally(&mut self, is_secondary: bool) -> Result<LocalOutcome>;

    /// Payload the secondary decodes to replay this operation
    fn forward_payload(&self) -> Result<Vec<u8>>;

    fn process_secondary_response(&self, response: &OpResponse) -> OpsResult {
        response.result
    }

    fn expected_secondary_result(&self) -> OpsResult {
        OpsResult::Success
    }
}

/// Tells the secondary a request finished without observable change
///
/// Applying it only stores its response in the requestor's session, so
/// the retained state of earlier requests can be acknowledged.
#[derive(Debug, Default)]
pub struct AckNotify;

#[async_trait::async_trait]
impl MirroredOperation for AckNotify {
    fn op_type(&self) -> u16 {
        OP_ACK_NOTIFY
    }

    fn log_context(&self) -> String {
        "ack notify".to_string()
    }

    fn lock_set(&self) -> Vec<EntryLock> {
        Vec::new()
    }

    async fn execute_locally(&mut self, _is_secondary: bool) -> Result<LocalOutcome> {
        Ok(LocalOutcome {
            response: OpResponse::new(OpsResult::Success),
            changes_observable_state: false,
        })
    }

    fn forward_payload(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
