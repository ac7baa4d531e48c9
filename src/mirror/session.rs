//! Mirror Sessions
//!
//! Per-requestor memory of mirrored requests. A request retried with the
//! same sequence number is answered from here instead of being applied a
//! second time. Retained slots are dropped once the requestor acknowledges
//! them through the `seq_done` field of later requests.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;

use super::protocol::{OpResponse, SeqHeader};
use crate::state::NodeId;

/// Outcome of claiming a sequence number slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotClaim {
    /// First time this sequence number is seen, the caller must process it
    New,
    /// Another task is processing the same sequence number
    InProgress,
    /// Already processed, replay this response
    Replay(OpResponse),
}

/// Retained state for one requestor
#[derive(Debug, Default)]
pub struct MirrorSession {
    /// Sequence number -> response once processing finished
    slots: BTreeMap<u64, Option<OpResponse>>,
    highest_seen: u64,
}

impl MirrorSession {
    /// Claim a slot after dropping every slot up to and including `done`
    pub fn acquire_slot(&mut self, done: u64, seq: u64) -> SlotClaim {
        match done.checked_add(1) {
            Some(first_kept) => self.slots = self.slots.split_off(&first_kept),
            None => self.slots.clear(),
        }
        self.claim(seq)
    }

    /// Claim a slot after dropping exactly slot `done`
    pub fn acquire_slot_selective(&mut self, done: u64, seq: u64) -> SlotClaim {
        self.slots.remove(&done);
        self.claim(seq)
    }

    fn claim(&mut self, seq: u64) -> SlotClaim {
        self.highest_seen = self.highest_seen.max(seq);
        match self.slots.get(&seq) {
            Some(Some(response)) => SlotClaim::Replay(response.clone()),
            Some(None) => SlotClaim::InProgress,
            None => {
                self.slots.insert(seq, None);
                SlotClaim::New
            }
        }
    }

    /// Highest sequence number seen, at least 1
    pub fn seq_no_base(&self) -> u64 {
        self.highest_seen.max(1)
    }

    pub fn retained(&self) -> usize {
        self.slots.len()
    }
}

/// Mirror sessions of all requestors
#[derive(Default)]
pub struct MirrorSessionStore {
    sessions: Mutex<HashMap<NodeId, MirrorSession>>,
}

impl MirrorSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a request header, honoring its acknowledgment
    pub async fn claim(&self, requestor: NodeId, header: &SeqHeader) -> SlotClaim {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(requestor).or_default();

        if header.selective {
            session.acquire_slot_selective(header.seq_done, header.seq_no)
        } else {
            session.acquire_slot(header.seq_done, header.seq_no)
        }
    }

    /// Store the response of a claimed slot for later replay
    pub async fn complete(&self, requestor: NodeId, seq: u64, response: OpResponse) {
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions
            .get_mut(&requestor)
            .and_then(|session| session.slots.get_mut(&seq))
        {
            *slot = Some(response);
        }
    }

    /// Give up a claimed slot so a retry processes the request again
    pub async fn abandon(&self, requestor: NodeId, seq: u64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&requestor) {
            if let Some(None) = session.slots.get(&seq) {
                session.slots.remove(&seq);
            }
        }
    }

    pub async fn seq_no_base(&self, requestor: NodeId) -> u64 {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(requestor).or_default().seq_no_base()
    }

    pub async fn retained(&self, requestor: NodeId) -> usize {
        self.sessions
            .lock()
            .await
            .get(&requestor)
            .map(|session| session.retained())
            .unwrap_or(0)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Forget every session, after a completed resync
    pub async fn clear(&self) {
        let mut sessions = self.sessions.lock().await;
        tracing::info!("Dropping {} mirror sessions", sessions.len());
        sessions.clear();
    }
}
