//! Mirror Executor
//!
//! Runs mirrored operations on both buddies. The primary applies an
//! operation locally while holding its entry locks and then forwards it to
//! the secondary; anything that keeps the secondary from applying it marks
//! the secondary as needing a resync instead of failing the operation.

use std::sync::Arc;
use std::time::Duration;

use super::locks::EntryLockStore;
use super::operation::{MirroredOperation, OpContext, OP_ACK_NOTIFY};
use super::protocol::{MirrorReply, MirrorRequest, OpResponse};
use super::session::{MirrorSessionStore, SlotClaim};
use crate::error::{Error, OpsResult, Result};
use crate::resync::ResyncCoordinator;
use crate::state::{BuddyGroupDirectory, GroupId, TargetId, TargetStateStore};

/// Channel from a primary to its secondary
#[async_trait::async_trait]
pub trait SecondaryLink: Send + Sync {
    async fn forward(&self, secondary: TargetId, request: MirrorRequest) -> Result<MirrorReply>;
}

pub struct MirrorExecutor {
    local_target: TargetId,
    directory: Arc<BuddyGroupDirectory>,
    states: Arc<TargetStateStore>,
    sessions: Arc<MirrorSessionStore>,
    locks: EntryLockStore,
    resync: Arc<ResyncCoordinator>,
    secondary: Arc<dyn SecondaryLink>,
    forward_timeout: Duration,
}

impl MirrorExecutor {
    pub fn new(
        local_target: TargetId,
        directory: Arc<BuddyGroupDirectory>,
        states: Arc<TargetStateStore>,
        resync: Arc<ResyncCoordinator>,
        secondary: Arc<dyn SecondaryLink>,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            local_target,
            directory,
            states,
            sessions: Arc::new(MirrorSessionStore::new()),
            locks: EntryLockStore::new(),
            resync,
            secondary,
            forward_timeout,
        }
    }

    pub fn sessions(&self) -> &Arc<MirrorSessionStore> {
        &self.sessions
    }

    pub fn locks(&self) -> &EntryLockStore {
        &self.locks
    }

    /// Process one mirrored request
    ///
    /// A failed forward still leaves the primary's result in the session,
    /// so a retry with the same sequence number replays it.
    pub async fn process(&self, op: &mut dyn MirroredOperation, ctx: OpContext) -> Result<MirrorReply> {
        let mirrored = op.is_mirrored();
        let primary_path = mirrored && !ctx.is_secondary;

        if primary_path {
            match self.directory.primary_of(ctx.group_id).await {
                None => return Err(Error::UnknownGroup(ctx.group_id)),
                Some(primary) if primary != self.local_target => {
                    tracing::debug!(
                        "Rejecting {}: target {} is not primary of group {}",
                        op.log_context(),
                        self.local_target,
                        ctx.group_id
                    );
                    return Ok(MirrorReply::Response(OpResponse::new(OpsResult::Again)));
                }
                Some(_) => {}
            }
        }

        let seq = if mirrored { ctx.seq } else { None };
        if let Some(header) = seq {
            if header.seq_no == 0 {
                let base = self.sessions.seq_no_base(ctx.requestor).await;
                return Ok(MirrorReply::NewSeqNoBase(base));
            }

            match self.sessions.claim(ctx.requestor, &header).await {
                SlotClaim::New => {}
                SlotClaim::InProgress => return Ok(MirrorReply::TryAgain),
                SlotClaim::Replay(response) => {
                    tracing::debug!(
                        "Replaying response for seq {} of node {}",
                        header.seq_no,
                        ctx.requestor
                    );
                    return Ok(MirrorReply::Response(response));
                }
            }
        }

        let _locks = if primary_path {
            Some(op.lock(&self.locks).await)
        } else {
            None
        };

        let outcome = match op.execute_locally(ctx.is_secondary).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(header) = seq {
                    self.sessions.abandon(ctx.requestor, header.seq_no).await;
                }
                return Err(e);
            }
        };

        let mut forward_error = None;
        if primary_path {
            if outcome.changes_observable_state {
                forward_error = self.forward_to_secondary(op, &ctx).await.err();
            } else if seq.is_some() {
                self.notify_secondary_of_ack(&ctx).await;
            }
        }

        if let Some(header) = seq {
            self.sessions
                .complete(ctx.requestor, header.seq_no, outcome.response.clone())
                .await;
        }

        match forward_error {
            Some(e) => Err(e),
            None => Ok(MirrorReply::Response(outcome.response)),
        }
    }

    async fn forward_to_secondary(&self, op: &dyn MirroredOperation, ctx: &OpContext) -> Result<()> {
        let Some(secondary) = self.ready_secondary(ctx.group_id).await else {
            return Ok(());
        };

        let payload = match op.forward_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Unable to encode {} for the secondary: {}", op.log_context(), e);
                self.mark_buddy_needs_resync().await;
                return Err(e);
            }
        };

        let request = MirrorRequest {
            group_id: ctx.group_id,
            requestor: ctx.requestor,
            seq: ctx.seq,
            op_type: op.op_type(),
            payload,
        };

        let reply = match tokio::time::timeout(
            self.forward_timeout,
            self.secondary.forward(secondary, request),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(self.forward_failed(op, secondary, e.to_string()).await),
            Err(_) => {
                let reason = format!("no answer within {:?}", self.forward_timeout);
                return Err(self.forward_failed(op, secondary, reason).await);
            }
        };

        let received = match reply {
            MirrorReply::Response(response) => op.process_secondary_response(&response),
            other => {
                tracing::warn!(
                    "Secondary target {} answered {} with {:?}",
                    secondary,
                    op.log_context(),
                    other
                );
                OpsResult::Internal
            }
        };

        let expected = op.expected_secondary_result();
        if received != expected {
            tracing::warn!(
                "Different results from primary and secondary for {}: expected {}, received {}. \
                 Setting secondary to needs-resync",
                op.log_context(),
                expected,
                received
            );
            self.mark_buddy_needs_resync().await;
        }
        Ok(())
    }

    async fn forward_failed(&self, op: &dyn MirroredOperation, secondary: TargetId, reason: String) -> Error {
        tracing::warn!(
            "Forwarding {} to secondary target {} failed: {}. Resync will be required",
            op.log_context(),
            secondary,
            reason
        );
        self.mark_buddy_needs_resync().await;
        Error::Communication(format!("secondary target {}: {}", secondary, reason))
    }

    /// Let the secondary drop retained state of an operation without effect
    async fn notify_secondary_of_ack(&self, ctx: &OpContext) {
        let Some(secondary) = self.ready_secondary(ctx.group_id).await else {
            return;
        };

        let request = MirrorRequest {
            group_id: ctx.group_id,
            requestor: ctx.requestor,
            seq: ctx.seq,
            op_type: OP_ACK_NOTIFY,
            payload: Vec::new(),
        };

        let acked = match tokio::time::timeout(
            self.forward_timeout,
            self.secondary.forward(secondary, request),
        )
        .await
        {
            Ok(Ok(MirrorReply::Response(response))) => response.result.is_success(),
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                tracing::debug!("Ack notification to target {} failed: {}", secondary, e);
                false
            }
            Err(_) => false,
        };

        if !acked {
            self.mark_buddy_needs_resync().await;
        }
    }

    /// The group's secondary if it may receive operations
    ///
    /// Anything but online and good means it missed or will miss updates.
    async fn ready_secondary(&self, group_id: GroupId) -> Option<TargetId> {
        let secondary = self.directory.secondary_of(group_id).await?;
        let state = self.states.get_state(secondary).await;

        if state.is_online_good() {
            return Some(secondary);
        }

        tracing::debug!(
            "Secondary target {} of group {} is {}, not forwarding",
            secondary,
            group_id,
            state
        );
        self.mark_buddy_needs_resync().await;
        None
    }

    async fn mark_buddy_needs_resync(&self) {
        if let Err(e) = self.resync.request_resync(true).await {
            tracing::error!("Unable to record that the buddy needs a resync: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::locks::{EntryLock, LockKey};
    use crate::mirror::operation::LocalOutcome;
    use crate::mirror::protocol::{NodeType, SeqHeader};
    use crate::resync::{
        CoordinatorLink, LoggingResyncLauncher, ResyncMarker, ResyncSettings, ResyncState,
    };
    use crate::state::{CombinedState, ConsistencyState, ReachabilityState, DEFAULT_POOL};
    use crate::timer::TimerQueue;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const REQUESTOR: u32 = 77;

    #[derive(Default)]
    struct CountingCoordinator {
        calls: Mutex<Vec<ConsistencyState>>,
    }

    #[async_trait::async_trait]
    impl CoordinatorLink for CountingCoordinator {
        async fn set_consistency_states(
            &self,
            _node_type: NodeType,
            _targets: Vec<TargetId>,
            states: Vec<ConsistencyState>,
        ) -> Result<OpsResult> {
            self.calls.lock().unwrap().extend(states);
            Ok(OpsResult::Success)
        }
    }

    /// Secondary stand-in answering from a script, `Success` once exhausted
    #[derive(Default)]
    struct ScriptedSecondary {
        requests: Mutex<Vec<MirrorRequest>>,
        replies: Mutex<VecDeque<Result<MirrorReply>>>,
    }

    impl ScriptedSecondary {
        fn push_reply(&self, reply: Result<MirrorReply>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn requests(&self) -> Vec<MirrorRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SecondaryLink for ScriptedSecondary {
        async fn forward(&self, _secondary: TargetId, request: MirrorRequest) -> Result<MirrorReply> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(MirrorReply::Response(OpResponse::new(OpsResult::Success))))
        }
    }

    /// Bumps a shared counter; the primary picks the new value, the
    /// secondary stores the value it was given
    struct BumpCounter {
        counter: Arc<AtomicU64>,
        fail: bool,
        value: Option<u64>,
    }

    #[async_trait::async_trait]
    impl MirroredOperation for BumpCounter {
        fn op_type(&self) -> u16 {
            100
        }

        fn log_context(&self) -> String {
            "bump counter".to_string()
        }

        fn lock_set(&self) -> Vec<EntryLock> {
            vec![EntryLock::exclusive(LockKey::FileId("counter".into()))]
        }

        async fn execute_locally(&mut self, is_secondary: bool) -> Result<LocalOutcome> {
            if self.fail {
                return Ok(LocalOutcome::from_result(OpsResult::NoEntry, Vec::new()));
            }
            let value = match (is_secondary, self.value) {
                (true, Some(value)) => value,
                _ => self.counter.load(Ordering::SeqCst) + 1,
            };
            self.counter.store(value, Ordering::SeqCst);
            self.value = Some(value);
            Ok(LocalOutcome::from_result(OpsResult::Success, value.to_le_bytes().to_vec()))
        }

        fn forward_payload(&self) -> Result<Vec<u8>> {
            Ok(self.value.unwrap_or_default().to_le_bytes().to_vec())
        }
    }

    struct Fixture {
        _dir: TempDir,
        states: Arc<TargetStateStore>,
        coordinator: Arc<CountingCoordinator>,
        secondary: Arc<ScriptedSecondary>,
        resync: Arc<ResyncCoordinator>,
        executor: MirrorExecutor,
        counter: Arc<AtomicU64>,
    }

    /// Local target 1 is primary of group 1, target 2 its secondary
    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(BuddyGroupDirectory::new(4));
        let states = Arc::new(TargetStateStore::new());
        directory.attach(states.clone()).await;
        directory.map_target(1, 10, DEFAULT_POOL).await.unwrap();
        directory.map_target(2, 20, DEFAULT_POOL).await.unwrap();
        directory.map_group(1, 1, 2, false).await.unwrap();

        let good = CombinedState::new(ReachabilityState::Online, ConsistencyState::Good);
        states.set_state(1, good).await;
        states.set_state(2, good).await;

        let coordinator = Arc::new(CountingCoordinator::default());
        let resync = ResyncCoordinator::new(
            ResyncSettings {
                node_type: NodeType::Meta,
                local_target: 1,
                retry_delay: Duration::from_secs(5),
                poffline_timeout: Duration::from_secs(30),
                offline_timeout: Duration::from_secs(180),
            },
            ResyncMarker::open(dir.path()).unwrap(),
            directory.clone(),
            states.clone(),
            coordinator.clone(),
            Arc::new(LoggingResyncLauncher::new()),
            Arc::new(TimerQueue::start()),
        );

        let secondary = Arc::new(ScriptedSecondary::default());
        let executor = MirrorExecutor::new(
            1,
            directory,
            states.clone(),
            resync.clone(),
            secondary.clone(),
            Duration::from_millis(500),
        );

        Fixture {
            _dir: dir,
            states,
            coordinator,
            secondary,
            resync,
            executor,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn bump(fx: &Fixture) -> BumpCounter {
        BumpCounter {
            counter: fx.counter.clone(),
            fail: false,
            value: None,
        }
    }

    fn primary_ctx(seq_no: u64) -> OpContext {
        OpContext {
            group_id: 1,
            requestor: REQUESTOR,
            seq: Some(SeqHeader { seq_no, seq_done: seq_no - 1, selective: false }),
            is_secondary: false,
        }
    }

    #[tokio::test]
    async fn test_observable_change_is_forwarded() {
        let fx = fixture().await;

        let reply = fx.executor.process(&mut bump(&fx), primary_ctx(5)).await.unwrap();
        assert_eq!(
            reply,
            MirrorReply::Response(OpResponse::with_payload(OpsResult::Success, 1u64.to_le_bytes().to_vec()))
        );

        let forwarded = fx.secondary.requests();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].op_type, 100);
        assert_eq!(forwarded[0].requestor, REQUESTOR);
        assert_eq!(forwarded[0].seq.unwrap().seq_no, 5);
        assert_eq!(forwarded[0].payload, 1u64.to_le_bytes().to_vec());

        assert_eq!(fx.resync.resync_state().await, ResyncState::NotRequired);
        assert!(fx.coordinator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_operation_sends_ack_notify() {
        let fx = fixture().await;
        let mut op = bump(&fx);
        op.fail = true;

        let reply = fx.executor.process(&mut op, primary_ctx(3)).await.unwrap();
        assert_eq!(reply, MirrorReply::Response(OpResponse::new(OpsResult::NoEntry)));

        let forwarded = fx.secondary.requests();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].op_type, OP_ACK_NOTIFY);
        assert!(!fx.resync.needs_resync().await);
    }

    #[tokio::test]
    async fn test_unhealthy_secondary_marked_not_contacted() {
        let fx = fixture().await;
        fx.states
            .set_reachability(2, ReachabilityState::ProbablyOffline)
            .await;

        let reply = fx.executor.process(&mut bump(&fx), primary_ctx(2)).await.unwrap();
        assert!(matches!(reply, MirrorReply::Response(r) if r.result.is_success()));

        assert!(fx.secondary.requests().is_empty());
        assert!(fx.resync.needs_resync().await);
        assert_eq!(*fx.coordinator.calls.lock().unwrap(), vec![ConsistencyState::NeedsResync]);
    }

    #[tokio::test]
    async fn test_forward_failure_surfaces_and_replays() {
        let fx = fixture().await;
        fx.secondary
            .push_reply(Err(Error::ConnectionFailed { address: "node-20:7700".into(), reason: "refused".into() }));

        let result = fx.executor.process(&mut bump(&fx), primary_ctx(9)).await;
        assert!(matches!(result, Err(Error::Communication(_))));
        assert!(fx.resync.needs_resync().await);
        assert_eq!(fx.counter.load(Ordering::SeqCst), 1);

        // the retry is answered from the session, not applied again
        let reply = fx.executor.process(&mut bump(&fx), primary_ctx(9)).await.unwrap();
        assert!(matches!(reply, MirrorReply::Response(r) if r.result.is_success()));
        assert_eq!(fx.counter.load(Ordering::SeqCst), 1);
        assert_eq!(fx.secondary.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_result_mismatch_marks_resync() {
        let fx = fixture().await;
        fx.secondary
            .push_reply(Ok(MirrorReply::Response(OpResponse::new(OpsResult::NoEntry))));

        let reply = fx.executor.process(&mut bump(&fx), primary_ctx(4)).await.unwrap();
        assert!(matches!(reply, MirrorReply::Response(r) if r.result.is_success()));
        assert!(fx.resync.needs_resync().await);
    }

    #[tokio::test]
    async fn test_zero_sequence_returns_base() {
        let fx = fixture().await;
        fx.executor.process(&mut bump(&fx), primary_ctx(41)).await.unwrap();

        let mut ctx = primary_ctx(1);
        ctx.seq = Some(SeqHeader::base_probe());
        let reply = fx.executor.process(&mut bump(&fx), ctx).await.unwrap();

        assert_eq!(reply, MirrorReply::NewSeqNoBase(41));
        assert_eq!(fx.counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_secondary_applies_given_value() {
        let fx = fixture().await;
        fx.counter.store(100, Ordering::SeqCst);
        let mut op = BumpCounter {
            counter: fx.counter.clone(),
            fail: false,
            value: Some(7),
        };
        let ctx = OpContext {
            is_secondary: true,
            ..primary_ctx(6)
        };

        let reply = fx.executor.process(&mut op, ctx).await.unwrap();
        assert!(matches!(reply, MirrorReply::Response(r) if r.result.is_success()));
        assert_eq!(fx.counter.load(Ordering::SeqCst), 7);
        assert!(fx.secondary.requests().is_empty());

        // same sequence number while still claimed elsewhere
        let header = SeqHeader { seq_no: 8, seq_done: 6, selective: false };
        fx.executor.sessions().claim(REQUESTOR, &header).await;
        let ctx = OpContext { seq: Some(header), ..ctx };
        assert_eq!(fx.executor.process(&mut op, ctx).await.unwrap(), MirrorReply::TryAgain);
    }

    #[tokio::test]
    async fn test_non_primary_answers_again() {
        let fx = fixture().await;
        let ctx = OpContext { group_id: 1, ..primary_ctx(2) };
        fx.executor.directory.switchover(1).await;

        let reply = fx.executor.process(&mut bump(&fx), ctx).await.unwrap();
        assert_eq!(reply, MirrorReply::Response(OpResponse::new(OpsResult::Again)));
        assert_eq!(fx.counter.load(Ordering::SeqCst), 0);

        let ctx = OpContext { group_id: 9, ..primary_ctx(2) };
        assert!(matches!(
            fx.executor.process(&mut bump(&fx), ctx).await,
            Err(Error::UnknownGroup(9))
        ));
    }
}
