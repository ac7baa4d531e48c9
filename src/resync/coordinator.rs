//! Resync Coordinator
//!
//! Decides locally whether the buddy of this node needs a resync, persists
//! that decision in the resync marker and reports it to the coordinator
//! until the coordinator has acknowledged it.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::launcher::ResyncLauncher;
use super::marker::{ResyncMarker, ResyncState};
use crate::error::{Error, OpsResult, Result};
use crate::mirror::protocol::NodeType;
use crate::state::{
    BuddyGroupDirectory, CombinedState, ConsistencyState, ReachabilityState, TargetId,
    TargetStateStore,
};
use crate::timer::{TimerHandle, TimerQueue};

/// Channel to the coordinator node
#[async_trait::async_trait]
pub trait CoordinatorLink: Send + Sync {
    /// Ask the coordinator to change the consistency state of targets
    ///
    /// `Err` means the coordinator could not be reached; a reachable
    /// coordinator answers with its result code.
    async fn set_consistency_states(
        &self,
        node_type: NodeType,
        targets: Vec<TargetId>,
        states: Vec<ConsistencyState>,
    ) -> Result<OpsResult>;
}

/// Outcome of one periodic resync check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncCheck {
    /// Only primaries start resyncs
    NotPrimary,
    /// The local target is not consistent itself
    SelfNotGood,
    /// The buddy does not wait for a resync
    BuddyHealthy,
    Started,
    AlreadyRunning,
    StartFailed,
}

/// Static parameters of a resync coordinator
#[derive(Debug, Clone)]
pub struct ResyncSettings {
    pub node_type: NodeType,
    pub local_target: TargetId,
    pub retry_delay: Duration,
    pub poffline_timeout: Duration,
    pub offline_timeout: Duration,
}

pub struct ResyncCoordinator {
    settings: ResyncSettings,
    marker: ResyncMarker,
    directory: Arc<BuddyGroupDirectory>,
    states: Arc<TargetStateStore>,
    coordinator: Arc<dyn CoordinatorLink>,
    launcher: Arc<dyn ResyncLauncher>,
    timers: Arc<TimerQueue>,
    /// Held from reading the marker until the coordinator answered, so
    /// decisions reach the coordinator in the order they were made
    decision: tokio::sync::Mutex<()>,
    /// Pending notification retry
    retry: Mutex<Option<TimerHandle>>,
    this: Weak<ResyncCoordinator>,
}

impl ResyncCoordinator {
    pub fn new(
        settings: ResyncSettings,
        marker: ResyncMarker,
        directory: Arc<BuddyGroupDirectory>,
        states: Arc<TargetStateStore>,
        coordinator: Arc<dyn CoordinatorLink>,
        launcher: Arc<dyn ResyncLauncher>,
        timers: Arc<TimerQueue>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            settings,
            marker,
            directory,
            states,
            coordinator,
            launcher,
            timers,
            decision: tokio::sync::Mutex::new(()),
            retry: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Resume an unacknowledged decision left over from a previous run
    pub async fn prepare(&self) -> bool {
        let state = self.marker.read().await;
        if !state.is_unacked() {
            return false;
        }

        tracing::info!("Found unacknowledged resync decision {}, resending", state);
        self.schedule_retry(Duration::ZERO);
        true
    }

    /// Record whether the buddy needs a resync and report it
    ///
    /// Asking for a resync that is already recorded as required does
    /// nothing. Clearing the decision always proceeds.
    pub async fn request_resync(&self, needed: bool) -> Result<()> {
        let _decision = self.decision.lock().await;

        let desired = ResyncState::new(needed, true);
        let prior = self
            .marker
            .replace_if(|current| !(needed && current.is_required()), desired)
            .await?;

        if needed && prior.is_required() {
            return Ok(());
        }

        self.cancel_retry();
        if needed {
            tracing::warn!("Buddy of target {} needs a resync", self.settings.local_target);
        } else {
            tracing::info!("Buddy of target {} no longer needs a resync", self.settings.local_target);
        }

        self.notify_locked().await;
        Ok(())
    }

    /// Persisted decision: does the buddy need a resync
    pub async fn needs_resync(&self) -> bool {
        self.marker.read().await.is_required()
    }

    pub async fn resync_state(&self) -> ResyncState {
        self.marker.read().await
    }

    /// Report the persisted decision to the coordinator if still unacked
    async fn notify(&self) {
        let _decision = self.decision.lock().await;
        self.notify_locked().await;
    }

    /// Caller holds `decision`
    async fn notify_locked(&self) {
        let state = self.marker.read().await;
        if !state.is_unacked() {
            return;
        }

        let buddy = match self.directory.buddy_target_id(self.settings.local_target).await {
            Some((buddy, true)) => buddy,
            _ => {
                // whoever is primary owns the decision
                tracing::debug!(
                    "Target {} is not a primary, dropping resync decision {}",
                    self.settings.local_target,
                    state
                );
                self.settle(state, ResyncState::NotRequired).await;
                return;
            }
        };

        let consistency = if state.is_required() {
            ConsistencyState::NeedsResync
        } else {
            ConsistencyState::Good
        };

        match self
            .coordinator
            .set_consistency_states(self.settings.node_type, vec![buddy], vec![consistency])
            .await
        {
            Err(e) => {
                tracing::warn!(
                    "Unable to report buddy target {} as {} to the coordinator: {}; retrying in {:?}",
                    buddy,
                    consistency,
                    e,
                    self.settings.retry_delay
                );
                self.schedule_retry(self.settings.retry_delay);
            }
            Ok(result) if !result.is_success() => {
                tracing::error!(
                    "Coordinator rejected setting buddy target {} to {}: {}",
                    buddy,
                    consistency,
                    result
                );
                self.settle(state, ResyncState::NotRequired).await;
            }
            Ok(_) => {
                tracing::info!("Coordinator acknowledged buddy target {} as {}", buddy, consistency);
                self.settle(state, state.acked()).await;
            }
        }
    }

    /// Replace `seen` with `next` unless another decision was persisted meanwhile
    async fn settle(&self, seen: ResyncState, next: ResyncState) {
        if let Err(e) = self.marker.replace_if(|current| current == seen, next).await {
            tracing::error!("Unable to update resync marker: {}", e);
        }
    }

    fn schedule_retry(&self, delay: Duration) {
        let this = self.this.clone();
        let handle = self.timers.enqueue(delay, async move {
            if let Some(coordinator) = this.upgrade() {
                coordinator.notify().await;
            }
        });

        let previous = self
            .retry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn cancel_retry(&self) {
        let pending = self
            .retry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pending) = pending {
            pending.cancel();
        }
    }

    /// Start a resync if this node is primary and its buddy waits for one
    pub async fn check_needs_resync(&self) -> ResyncCheck {
        let local = self.settings.local_target;
        let topology = self.states.snapshot_with_groups(&self.directory).await;
        let buddy = match topology.buddy_of(local) {
            Some((buddy, true)) => buddy,
            _ => return ResyncCheck::NotPrimary,
        };

        let own = topology.state_of(local);
        if own.consistency != ConsistencyState::Good {
            tracing::debug!("Target {} is {}, not checking its buddy", local, own.consistency);
            return ResyncCheck::SelfNotGood;
        }

        let waiting = CombinedState::new(ReachabilityState::Online, ConsistencyState::NeedsResync);
        if topology.state_of(buddy) != waiting {
            return ResyncCheck::BuddyHealthy;
        }

        match self.launcher.start_resync().await {
            Ok(()) => {
                tracing::info!("Started resync of buddy target {}", buddy);
                ResyncCheck::Started
            }
            Err(Error::Operation(OpsResult::InUse)) => {
                tracing::debug!("Resync of buddy target {} is already running", buddy);
                ResyncCheck::AlreadyRunning
            }
            Err(e) => {
                tracing::error!("Unable to start resync of buddy target {}: {}", buddy, e);
                ResyncCheck::StartFailed
            }
        }
    }

    /// Periodic resync check and reachability downgrade until shutdown
    pub async fn run(&self, poll_interval: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if self
                        .states
                        .auto_offline_targets(self.settings.poffline_timeout, self.settings.offline_timeout)
                        .await
                    {
                        tracing::info!("Target reachability downgraded after missed reports");
                    }
                    let check = self.check_needs_resync().await;
                    tracing::trace!("Resync check: {:?}", check);
                }
            }
        }

        self.cancel_retry();
        tracing::info!("Resync coordinator stopped");
    }
}
