//! Requestor side of mirrored operations
//!
//! Numbers every request to a buddy group from the group's sequence window
//! and sends it to the group's primary.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::operation::OP_ACK_NOTIFY;
use super::protocol::{MirrorReply, MirrorRequest, OpResponse, SeqHeader};
use super::window::{Acquired, SequenceWindow};
use crate::error::{Error, Result};
use crate::state::{BuddyGroupDirectory, GroupId, NodeId, TargetId};

/// Channel from a requestor to a group's primary
#[async_trait::async_trait]
pub trait MirrorTransport: Send + Sync {
    async fn send(&self, primary: TargetId, request: MirrorRequest) -> Result<MirrorReply>;
}

pub struct BuddyRequestor {
    node_id: NodeId,
    directory: Arc<BuddyGroupDirectory>,
    transport: Arc<dyn MirrorTransport>,
    shutdown: CancellationToken,
}

impl BuddyRequestor {
    pub fn new(
        node_id: NodeId,
        directory: Arc<BuddyGroupDirectory>,
        transport: Arc<dyn MirrorTransport>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            node_id,
            directory,
            transport,
            shutdown,
        }
    }

    /// Send one mirrored operation to the primary of `group_id`
    pub async fn request(
        &self,
        group_id: GroupId,
        op_type: u16,
        payload: Vec<u8>,
        allow_wait: bool,
    ) -> Result<OpResponse> {
        let window = self
            .directory
            .window(group_id)
            .await
            .ok_or(Error::UnknownGroup(group_id))?;
        let primary = self
            .directory
            .primary_of(group_id)
            .await
            .ok_or(Error::UnknownGroup(group_id))?;

        let acquired = self.acquire(&window, primary, allow_wait).await?;
        let seq_no = acquired.seq_no;
        let request = MirrorRequest {
            group_id,
            requestor: self.node_id,
            seq: Some(SeqHeader::new(seq_no, acquired.ack)),
            op_type,
            payload,
        };

        // the handle is dropped on every exit, cancellation included
        let result = self.transport.send(primary, request).await;
        drop(acquired.handle);

        match result? {
            MirrorReply::Response(response) => Ok(response),
            MirrorReply::TryAgain => Err(Error::TryAgain),
            MirrorReply::NewSeqNoBase(base) => {
                tracing::warn!(
                    "Primary target {} answered seq {} with a new base {}",
                    primary,
                    seq_no,
                    base
                );
                window.set_base(base);
                Err(Error::TryAgain)
            }
        }
    }

    /// Take a sequence number, asking the primary for a base on first use
    async fn acquire(&self, window: &SequenceWindow, primary: TargetId, allow_wait: bool) -> Result<Acquired> {
        match window.acquire(allow_wait, &self.shutdown).await {
            Err(Error::NotYetInitialized(group_id)) => {
                let base = self.probe_base(group_id, primary).await?;
                tracing::debug!("Group {} starts numbering above {}", group_id, base);
                window.set_base(base);
                window.acquire(allow_wait, &self.shutdown).await
            }
            other => other,
        }
    }

    async fn probe_base(&self, group_id: GroupId, primary: TargetId) -> Result<u64> {
        // an ack notification with sequence 0 is answered before it runs
        let probe = MirrorRequest {
            group_id,
            requestor: self.node_id,
            seq: Some(SeqHeader::base_probe()),
            op_type: OP_ACK_NOTIFY,
            payload: Vec::new(),
        };

        match self.transport.send(primary, probe).await? {
            MirrorReply::NewSeqNoBase(base) => Ok(base),
            _ => Err(Error::UnexpectedResponse("sequence base probe")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpsResult;
    use crate::state::GroupMapping;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Primary stand-in handing out base 100 and succeeding everything else
    #[derive(Default)]
    struct FakePrimary {
        seen: Mutex<Vec<(TargetId, Option<SeqHeader>)>>,
    }

    #[async_trait::async_trait]
    impl MirrorTransport for FakePrimary {
        async fn send(&self, primary: TargetId, request: MirrorRequest) -> Result<MirrorReply> {
            self.seen.lock().unwrap().push((primary, request.seq));
            match request.seq {
                Some(header) if header.seq_no == 0 => Ok(MirrorReply::NewSeqNoBase(100)),
                _ => Ok(MirrorReply::Response(OpResponse::new(OpsResult::Success))),
            }
        }
    }

    async fn requestor() -> (BuddyRequestor, Arc<FakePrimary>, Arc<BuddyGroupDirectory>) {
        let directory = Arc::new(BuddyGroupDirectory::new(2));
        directory
            .sync_groups_from_lists(&[GroupMapping { group_id: 4, primary: 7, secondary: 8 }])
            .await
            .unwrap();
        let primary = Arc::new(FakePrimary::default());
        let requestor = BuddyRequestor::new(55, directory.clone(), primary.clone(), CancellationToken::new());
        (requestor, primary, directory)
    }

    #[tokio::test]
    async fn test_first_request_probes_base() {
        let (requestor, primary, directory) = requestor().await;

        let response = requestor.request(4, 11, vec![1, 2, 3], true).await.unwrap();
        assert!(response.result.is_success());

        let seen = primary.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (7, Some(SeqHeader::base_probe())));
        let header = seen[1].1.unwrap();
        assert_eq!(header.seq_no, 101);
        assert_eq!(header.seq_done, 100);

        // the handle was released
        let window = directory.window(4).await.unwrap();
        assert_eq!(window.in_flight(), 0);

        requestor.request(4, 11, Vec::new(), true).await.unwrap();
        let seen = primary.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].1.unwrap(), SeqHeader { seq_no: 102, seq_done: 101, selective: true });
    }

    /// Primary stand-in that hands out a base and then never answers
    struct SilentPrimary;

    #[async_trait::async_trait]
    impl MirrorTransport for SilentPrimary {
        async fn send(&self, _primary: TargetId, request: MirrorRequest) -> Result<MirrorReply> {
            match request.seq {
                Some(header) if header.seq_no == 0 => Ok(MirrorReply::NewSeqNoBase(1)),
                _ => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_abandoned_request_frees_sequence_number() {
        let directory = Arc::new(BuddyGroupDirectory::new(1));
        directory
            .sync_groups_from_lists(&[GroupMapping { group_id: 4, primary: 7, secondary: 8 }])
            .await
            .unwrap();
        let requestor = BuddyRequestor::new(55, directory.clone(), Arc::new(SilentPrimary), CancellationToken::new());
        let window = directory.window(4).await.unwrap();

        for _ in 0..3 {
            let abandoned =
                tokio::time::timeout(Duration::from_millis(50), requestor.request(4, 11, Vec::new(), false)).await;
            assert!(abandoned.is_err());
            assert_eq!(window.in_flight(), 0);
        }

        // a full window would answer Busy here
        let acquired = window.acquire(false, &CancellationToken::new()).await.unwrap();
        assert_eq!(acquired.seq_no, 5);
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let (requestor, _, _) = requestor().await;
        assert!(matches!(
            requestor.request(9, 11, Vec::new(), false).await,
            Err(Error::UnknownGroup(9))
        ));
    }
}
