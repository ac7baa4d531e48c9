//! Mirror Node
//!
//! Wires the topology tables, the resync coordinator and the mirror
//! executor of one node together and serves them over TCP.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::BuddyMirrorConfig;
use crate::error::{Error, OpsResult, Result};
use crate::mirror::entries::{EntryAttrStore, EntryOperations};
use crate::mirror::protocol::{Message, MirrorRequest, NodeStatus, NodeType};
use crate::mirror::{BuddyRequestor, MirrorExecutor, OpContext};
use crate::network::{
    MessageHandler, NetworkClient, NetworkCoordinatorLink, NetworkMirrorTransport,
    NetworkSecondaryLink, NetworkServer, PeerBook,
};
use crate::resync::{
    CommandResyncLauncher, LoggingResyncLauncher, ResyncCoordinator, ResyncLauncher,
    ResyncMarker, ResyncSettings,
};
use crate::state::{
    BuddyGroupDirectory, ConsistencyState, ExceededQuotaStore, StoragePoolStore, TargetId,
    TargetStateStore, DEFAULT_POOL,
};
use crate::timer::TimerQueue;

/// Idle time after which pooled connections are closed
const MAX_CONNECTION_IDLE: Duration = Duration::from_secs(300);

/// One buddy mirror node
pub struct MirrorNode {
    config: BuddyMirrorConfig,
    directory: Arc<BuddyGroupDirectory>,
    states: Arc<TargetStateStore>,
    pools: Arc<StoragePoolStore>,
    quotas: Arc<ExceededQuotaStore>,
    resync: Arc<ResyncCoordinator>,
    executor: MirrorExecutor,
    operations: EntryOperations,
    requestor: BuddyRequestor,
    client: Arc<NetworkClient>,
    timers: Arc<TimerQueue>,
    shutdown: CancellationToken,
}

impl MirrorNode {
    /// Build a node from its configuration
    pub async fn new(config: BuddyMirrorConfig) -> Result<Arc<Self>> {
        let local_target = config.node.target_id;
        let shutdown = CancellationToken::new();

        let directory = Arc::new(BuddyGroupDirectory::new(config.mirroring.window_capacity));
        let states = Arc::new(TargetStateStore::new());
        let pools = Arc::new(StoragePoolStore::new());
        let quotas = Arc::new(ExceededQuotaStore::new());
        directory.attach(states.clone()).await;
        directory.attach(pools.clone()).await;
        directory.attach(quotas.clone()).await;

        directory
            .map_target(local_target, config.node.id, DEFAULT_POOL)
            .await?;

        let client = Arc::new(NetworkClient::new(
            config.connect_timeout(),
            config.request_timeout(),
        ));
        let peers = Arc::new(PeerBook::from_config(&config));

        let launcher: Arc<dyn ResyncLauncher> = match config.resync.command.as_deref() {
            Some(command) => Arc::new(CommandResyncLauncher::new(command)?),
            None => Arc::new(LoggingResyncLauncher::new()),
        };

        let marker = ResyncMarker::open(config.data_dir())?;
        let timers = Arc::new(TimerQueue::start());
        let resync = ResyncCoordinator::new(
            ResyncSettings {
                node_type: config.node.node_type,
                local_target,
                retry_delay: config.retry_delay(),
                poffline_timeout: config.poffline_timeout(),
                offline_timeout: config.offline_timeout(),
            },
            marker,
            Arc::clone(&directory),
            Arc::clone(&states),
            Arc::new(NetworkCoordinatorLink::new(
                Arc::clone(&client),
                config.coordinator.address.clone(),
            )),
            launcher,
            Arc::clone(&timers),
        );

        let executor = MirrorExecutor::new(
            local_target,
            Arc::clone(&directory),
            Arc::clone(&states),
            Arc::clone(&resync),
            Arc::new(NetworkSecondaryLink::new(
                Arc::clone(&client),
                Arc::clone(&directory),
                Arc::clone(&peers),
            )),
            config.forward_timeout(),
        );

        let requestor = BuddyRequestor::new(
            config.node.id,
            Arc::clone(&directory),
            Arc::new(NetworkMirrorTransport::new(
                Arc::clone(&client),
                Arc::clone(&directory),
                peers,
            )),
            shutdown.clone(),
        );

        let operations = EntryOperations::new(Arc::new(EntryAttrStore::new(local_target)));

        Ok(Arc::new(Self {
            config,
            directory,
            states,
            pools,
            quotas,
            resync,
            executor,
            operations,
            requestor,
            client,
            timers,
            shutdown,
        }))
    }

    pub fn local_target(&self) -> TargetId {
        self.config.node.target_id
    }

    pub fn directory(&self) -> &Arc<BuddyGroupDirectory> {
        &self.directory
    }

    pub fn states(&self) -> &Arc<TargetStateStore> {
        &self.states
    }

    pub fn pools(&self) -> &Arc<StoragePoolStore> {
        &self.pools
    }

    pub fn quotas(&self) -> &Arc<ExceededQuotaStore> {
        &self.quotas
    }

    pub fn resync(&self) -> &Arc<ResyncCoordinator> {
        &self.resync
    }

    pub fn requestor(&self) -> &BuddyRequestor {
        &self.requestor
    }

    pub fn operations(&self) -> &EntryOperations {
        &self.operations
    }

    /// Serve requests and run the resync loop until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.resync.prepare().await {
            tracing::info!("Resending resync decision from a previous run");
        }

        let server = Arc::new(NetworkServer::new(
            self.config.node.bind_address.clone(),
            Arc::clone(&self) as Arc<dyn MessageHandler>,
        ));

        let server_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start().await })
        };

        let resync_task = {
            let resync = Arc::clone(&self.resync);
            let poll_interval = self.config.poll_interval();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { resync.run(poll_interval, shutdown).await })
        };

        let mut cleanup = tokio::time::interval(MAX_CONNECTION_IDLE);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            "Node {} serving {} target {}",
            self.config.node.id,
            self.config.node.node_type,
            self.local_target()
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = cleanup.tick() => self.client.cleanup_stale(MAX_CONNECTION_IDLE).await,
            }
        }

        server.stop();
        self.timers.shutdown().await;

        if let Err(e) = resync_task.await {
            tracing::error!("Resync task failed: {}", e);
        }
        match server_task.await {
            Ok(result) => result?,
            Err(e) => return Err(Error::Internal(format!("server task failed: {}", e))),
        }

        tracing::info!("Node {} stopped", self.config.node.id);
        Ok(())
    }

    /// Stop a running node
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Report of this node's view
    pub async fn status(&self) -> NodeStatus {
        let local = self.local_target();
        let group = match self.directory.local_group_id(local).await {
            Some(group_id) => self.directory.group(group_id).await,
            None => None,
        };
        let in_flight = match &group {
            Some(mapping) => match self.directory.window(mapping.group_id).await {
                Some(window) => window.in_flight(),
                None => 0,
            },
            None => 0,
        };

        NodeStatus {
            node_id: self.config.node.id,
            node_type: self.config.node.node_type,
            local_target: local,
            role: self.directory.buddy_role(local).await,
            group,
            resync_state: self.resync.resync_state().await.to_string(),
            in_flight,
            mirror_sessions: self.executor.sessions().session_count().await,
            states: self.states.states_as_list().await,
        }
    }

    async fn process_mirrored(&self, request: MirrorRequest, is_secondary: bool) -> Message {
        let mut op = match self.operations.decode(request.op_type, &request.payload) {
            Ok(op) => op,
            Err(e) => {
                return Message::Error {
                    result: OpsResult::Inval,
                    message: e.to_string(),
                }
            }
        };

        let ctx = OpContext {
            group_id: request.group_id,
            requestor: request.requestor,
            seq: request.seq,
            is_secondary,
        };

        match self.executor.process(op.as_mut(), ctx).await {
            Ok(reply) => Message::MirrorReply(reply),
            Err(e) => Message::Error {
                result: OpsResult::from(&e),
                message: e.to_string(),
            },
        }
    }

    async fn set_consistency_states(
        &self,
        node_type: NodeType,
        targets: &[TargetId],
        states: &[ConsistencyState],
    ) -> OpsResult {
        if node_type != self.config.node.node_type || targets.len() != states.len() {
            return OpsResult::Inval;
        }

        if let Some(unknown) = self.first_unknown_target(targets).await {
            tracing::debug!("Consistency update for unknown target {}", unknown);
            return OpsResult::UnknownTarget;
        }

        for (target_id, consistency) in targets.iter().zip(states) {
            if self.states.set_consistency(*target_id, *consistency).await {
                tracing::info!("Target {} is now {}", target_id, consistency);
            }
        }
        OpsResult::Success
    }

    async fn local_consistency(&self) -> ConsistencyState {
        self.states.get_state(self.local_target()).await.consistency
    }

    /// Retained mirror replies predate a resync of the local target and are
    /// dropped once the target turns good again
    async fn after_consistency_change(&self, before: ConsistencyState) {
        if before == ConsistencyState::NeedsResync && self.local_consistency().await == ConsistencyState::Good {
            tracing::info!("Target {} finished its resync", self.local_target());
            self.executor.sessions().clear().await;
        }
    }

    async fn first_unknown_target(&self, targets: &[TargetId]) -> Option<TargetId> {
        for target_id in targets {
            if !self.states.contains(*target_id).await {
                return Some(*target_id);
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl MessageHandler for MirrorNode {
    async fn handle(&self, peer: &str, message: Message) -> Option<Message> {
        let response = match message {
            Message::SyncStatesAndGroups { states, groups } => {
                let before = self.local_consistency().await;
                let result = match self
                    .states
                    .sync_states_and_groups_from_lists(&self.directory, &states, &groups)
                    .await
                {
                    Ok(()) => OpsResult::Success,
                    Err(e) => {
                        tracing::warn!("Rejected topology sync from {}: {}", peer, e);
                        OpsResult::from(&e)
                    }
                };
                self.after_consistency_change(before).await;
                Message::TopologyResponse { result }
            }

            Message::SyncTargets { targets, pool } => {
                let result = match self.directory.sync_targets_from_lists(&targets, pool).await {
                    Ok(_) => OpsResult::Success,
                    Err(e) => {
                        tracing::warn!("Rejected target sync from {}: {}", peer, e);
                        OpsResult::from(&e)
                    }
                };
                Message::TopologyResponse { result }
            }

            Message::MapTarget {
                target_id,
                node_id,
                pool,
            } => {
                let result = match self.directory.map_target(target_id, node_id, pool).await {
                    Ok(_) => OpsResult::Success,
                    Err(e) => OpsResult::from(&e),
                };
                Message::TopologyResponse { result }
            }

            Message::SetTargetConsistencyStates {
                node_type,
                targets,
                states,
            } => {
                let before = self.local_consistency().await;
                let result = self.set_consistency_states(node_type, &targets, &states).await;
                self.after_consistency_change(before).await;
                Message::SetTargetConsistencyStatesResponse { result }
            }

            Message::MirrorRequest(request) => self.process_mirrored(request, false).await,

            Message::ForwardedOperation(request) => self.process_mirrored(request, true).await,

            Message::StatusRequest => Message::StatusResponse(self.status().await),

            other => {
                tracing::debug!("Unexpected {} from {}", other.type_name(), peer);
                Message::Error {
                    result: OpsResult::Inval,
                    message: format!("unexpected message {}", other.type_name()),
                }
            }
        };

        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::entries::{encode_args, CreateEntryArgs, OP_CREATE_ENTRY};
    use crate::mirror::protocol::SeqHeader;
    use crate::network::send_once;
    use crate::resync::ResyncState;
    use crate::state::{GroupMapping, ReachabilityState, TargetStateEntry};

    fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn config(
        id: u32,
        target_id: u16,
        bind: &str,
        peer: (u32, &str),
        data_dir: &std::path::Path,
    ) -> BuddyMirrorConfig {
        let toml = format!(
            r#"
[node]
id = {id}
node_type = "meta"
target_id = {target_id}
bind_address = "{bind}"
data_dir = "{dir}"

[coordinator]
address = "127.0.0.1:1"
request_timeout_ms = 500

[mirroring]
connect_timeout_ms = 200
forward_timeout_ms = 1000

[[peers]]
id = {peer_id}
address = "{peer_address}"
"#,
            dir = data_dir.display(),
            peer_id = peer.0,
            peer_address = peer.1,
        );
        BuddyMirrorConfig::from_str(&toml).unwrap()
    }

    fn entry(target_id: u16, reachability: ReachabilityState) -> TargetStateEntry {
        TargetStateEntry {
            target_id,
            reachability,
            consistency: ConsistencyState::Good,
        }
    }

    async fn push_topology(node: &MirrorNode, secondary_node: u32, secondary: ReachabilityState) {
        let reply = node
            .handle(
                "test",
                Message::MapTarget {
                    target_id: 2,
                    node_id: secondary_node,
                    pool: DEFAULT_POOL,
                },
            )
            .await;
        assert!(matches!(reply, Some(Message::TopologyResponse { result: OpsResult::Success })));

        let reply = node
            .handle(
                "test",
                Message::SyncStatesAndGroups {
                    states: vec![entry(1, ReachabilityState::Online), entry(2, secondary)],
                    groups: vec![GroupMapping {
                        group_id: 1,
                        primary: 1,
                        secondary: 2,
                    }],
                },
            )
            .await;
        assert!(matches!(reply, Some(Message::TopologyResponse { result: OpsResult::Success })));
    }

    async fn wait_until_serving(address: &str) {
        for _ in 0..50 {
            if send_once(address, Message::StatusRequest, Duration::from_millis(200))
                .await
                .is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node at {} never started serving", address);
    }

    fn create(name: &str) -> Vec<u8> {
        encode_args(&CreateEntryArgs {
            parent_id: "root".into(),
            name: name.into(),
            mode: 0o644,
            entry_id: None,
            mtime: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_consistency_update_checks_node_type() {
        let dir = tempfile::tempdir().unwrap();
        let node = MirrorNode::new(config(10, 1, &free_address(), (20, "127.0.0.1:2"), dir.path()))
            .await
            .unwrap();

        let reply = node
            .handle(
                "coordinator",
                Message::SetTargetConsistencyStates {
                    node_type: NodeType::Storage,
                    targets: vec![1],
                    states: vec![ConsistencyState::NeedsResync],
                },
            )
            .await;
        assert!(matches!(
            reply,
            Some(Message::SetTargetConsistencyStatesResponse { result: OpsResult::Inval })
        ));

        let reply = node
            .handle(
                "coordinator",
                Message::SetTargetConsistencyStates {
                    node_type: NodeType::Meta,
                    targets: vec![1],
                    states: vec![ConsistencyState::NeedsResync],
                },
            )
            .await;
        assert!(matches!(
            reply,
            Some(Message::SetTargetConsistencyStatesResponse { result: OpsResult::Success })
        ));
        assert_eq!(
            node.states().get_state(1).await.consistency,
            ConsistencyState::NeedsResync
        );
    }

    #[tokio::test]
    async fn test_map_target_into_unknown_pool() {
        let dir = tempfile::tempdir().unwrap();
        let node = MirrorNode::new(config(10, 1, &free_address(), (20, "127.0.0.1:2"), dir.path()))
            .await
            .unwrap();

        let reply = node
            .handle(
                "coordinator",
                Message::MapTarget {
                    target_id: 5,
                    node_id: 30,
                    pool: 42,
                },
            )
            .await;
        assert!(matches!(
            reply,
            Some(Message::TopologyResponse { result: OpsResult::UnknownPool })
        ));
        assert!(!node.directory().target_exists(5).await);
    }

    #[tokio::test]
    async fn test_sync_targets() {
        let dir = tempfile::tempdir().unwrap();
        let node = MirrorNode::new(config(10, 1, &free_address(), (20, "127.0.0.1:2"), dir.path()))
            .await
            .unwrap();

        let sync = |targets: Vec<(TargetId, u32)>, pool: u16| Message::SyncTargets { targets, pool };

        let reply = node.handle("coordinator", sync(vec![(1, 10), (2, 20), (3, 30)], DEFAULT_POOL)).await;
        assert!(matches!(reply, Some(Message::TopologyResponse { result: OpsResult::Success })));
        assert_eq!(node.directory().node_of(3).await, Some(30));
        assert!(node.states().contains(3).await);

        let reply = node.handle("coordinator", sync(vec![(1, 10), (4, 40)], 42)).await;
        assert!(matches!(
            reply,
            Some(Message::TopologyResponse { result: OpsResult::UnknownPool })
        ));
        assert!(!node.directory().target_exists(4).await);
        assert!(node.directory().target_exists(3).await);
    }

    #[tokio::test]
    async fn test_finished_resync_drops_mirror_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let node = MirrorNode::new(config(20, 2, &free_address(), (10, "127.0.0.1:2"), dir.path()))
            .await
            .unwrap();
        push_topology(&node, 20, ReachabilityState::Online).await;

        let header = SeqHeader { seq_no: 7, seq_done: 0, selective: false };
        node.executor.sessions().claim(10, &header).await;
        assert_eq!(node.executor.sessions().session_count().await, 1);

        let set_local = |state: ConsistencyState| Message::SetTargetConsistencyStates {
            node_type: NodeType::Meta,
            targets: vec![2],
            states: vec![state],
        };

        node.handle("coordinator", set_local(ConsistencyState::NeedsResync)).await;
        assert_eq!(node.executor.sessions().session_count().await, 1);

        let reply = node.handle("coordinator", set_local(ConsistencyState::Good)).await;
        assert!(matches!(
            reply,
            Some(Message::SetTargetConsistencyStatesResponse { result: OpsResult::Success })
        ));
        assert_eq!(node.executor.sessions().session_count().await, 0);

        // a good target that stays good keeps its sessions
        node.executor.sessions().claim(10, &header).await;
        node.handle("coordinator", set_local(ConsistencyState::Good)).await;
        assert_eq!(node.executor.sessions().session_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_operation_mirrored_to_secondary_node() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let addr_a = free_address();
        let addr_b = free_address();

        let primary = MirrorNode::new(config(10, 1, &addr_a, (20, &addr_b), dir_a.path()))
            .await
            .unwrap();
        let secondary = MirrorNode::new(config(20, 2, &addr_b, (10, &addr_a), dir_b.path()))
            .await
            .unwrap();

        push_topology(&primary, 20, ReachabilityState::Online).await;
        push_topology(&secondary, 20, ReachabilityState::Online).await;

        let run_a = tokio::spawn(Arc::clone(&primary).run());
        let run_b = tokio::spawn(Arc::clone(&secondary).run());
        wait_until_serving(&addr_a).await;
        wait_until_serving(&addr_b).await;

        let response = primary
            .requestor()
            .request(1, OP_CREATE_ENTRY, create("a"), true)
            .await
            .unwrap();
        assert_eq!(response.result, OpsResult::Success);

        let on_primary = primary.operations().store().lookup("root", "a").await;
        let on_secondary = secondary.operations().store().lookup("root", "a").await;
        assert!(on_primary.is_some());
        assert_eq!(on_primary, on_secondary);
        assert_eq!(primary.resync().resync_state().await, ResyncState::NotRequired);

        primary.shutdown();
        secondary.shutdown();
        run_a.await.unwrap().unwrap();
        run_b.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offline_secondary_marks_resync() {
        let dir = tempfile::tempdir().unwrap();
        let addr = free_address();
        let primary = MirrorNode::new(config(10, 1, &addr, (20, "127.0.0.1:2"), dir.path()))
            .await
            .unwrap();
        push_topology(&primary, 20, ReachabilityState::Offline).await;

        let run = tokio::spawn(Arc::clone(&primary).run());
        wait_until_serving(&addr).await;

        let response = primary
            .requestor()
            .request(1, OP_CREATE_ENTRY, create("b"), true)
            .await
            .unwrap();
        assert_eq!(response.result, OpsResult::Success);

        // The coordinator is unreachable, so the decision stays unacknowledged
        assert_eq!(primary.resync().resync_state().await, ResyncState::RequiredUnacked);

        let status = primary.status().await;
        assert_eq!(status.resync_state, "REQUIRED_UNACKED");
        assert_eq!(status.mirror_sessions, 1);

        primary.shutdown();
        run.await.unwrap().unwrap();
    }
}
