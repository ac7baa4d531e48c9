//! Target State Store
//!
//! Reachability and consistency of every known target (or node, for
//! metadata services). Read on every request path, written only on real
//! state transitions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::directory::{AuxiliaryStore, BuddyGroupDirectory, GroupMapping};
use super::{GroupId, NodeId, PoolId, TargetId};
use crate::error::Result;

/// Network/liveness status of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReachabilityState {
    Online,
    ProbablyOffline,
    Offline,
}

impl std::fmt::Display for ReachabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReachabilityState::Online => write!(f, "Online"),
            ReachabilityState::ProbablyOffline => write!(f, "Probably-offline"),
            ReachabilityState::Offline => write!(f, "Offline"),
        }
    }
}

/// Whether a target's data can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsistencyState {
    Good,
    NeedsResync,
    Bad,
}

impl std::fmt::Display for ConsistencyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyState::Good => write!(f, "Good"),
            ConsistencyState::NeedsResync => write!(f, "Needs-resync"),
            ConsistencyState::Bad => write!(f, "Bad"),
        }
    }
}

/// Reachability and consistency as one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CombinedState {
    pub reachability: ReachabilityState,
    pub consistency: ConsistencyState,
}

impl CombinedState {
    pub const fn new(reachability: ReachabilityState, consistency: ConsistencyState) -> Self {
        Self { reachability, consistency }
    }

    /// The only state in which a buddy may receive mirrored writes
    pub fn is_online_good(&self) -> bool {
        *self == CombinedState::new(ReachabilityState::Online, ConsistencyState::Good)
    }
}

/// Unknown targets are reported as offline but good.
impl Default for CombinedState {
    fn default() -> Self {
        Self::new(ReachabilityState::Offline, ConsistencyState::Good)
    }
}

impl std::fmt::Display for CombinedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.reachability, self.consistency)
    }
}

/// Stored state of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStateInfo {
    pub state: CombinedState,
    /// Time of the last state report that was not a timeout
    pub last_changed: DateTime<Utc>,
}

impl TargetStateInfo {
    pub fn new(state: CombinedState) -> Self {
        Self {
            state,
            last_changed: Utc::now(),
        }
    }
}

/// One row of a bulk state sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStateEntry {
    pub target_id: TargetId,
    pub reachability: ReachabilityState,
    pub consistency: ConsistencyState,
}

impl TargetStateEntry {
    pub fn state(&self) -> CombinedState {
        CombinedState::new(self.reachability, self.consistency)
    }
}

/// A consistent view of states and buddy groups, read under both locks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub states: Vec<TargetStateEntry>,
    pub groups: Vec<GroupMapping>,
}

impl TopologySnapshot {
    /// State of a target in this snapshot, with the usual default for unknown targets
    pub fn state_of(&self, target_id: TargetId) -> CombinedState {
        self.states
            .iter()
            .find(|e| e.target_id == target_id)
            .map(|e| e.state())
            .unwrap_or_default()
    }

    pub fn group(&self, group_id: GroupId) -> Option<&GroupMapping> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }

    /// Buddy of a target and whether the target is the group's primary
    pub fn buddy_of(&self, target_id: TargetId) -> Option<(TargetId, bool)> {
        self.groups.iter().find_map(|g| {
            if g.primary == target_id {
                Some((g.secondary, true))
            } else if g.secondary == target_id {
                Some((g.primary, false))
            } else {
                None
            }
        })
    }
}

/// Concurrently readable table of target states
pub struct TargetStateStore {
    states: RwLock<HashMap<TargetId, TargetStateInfo>>,
}

impl TargetStateStore {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Current state of a target; unknown targets are `Offline / Good`
    pub async fn get_state(&self, target_id: TargetId) -> CombinedState {
        let states = self.states.read().await;
        states.get(&target_id).map(|info| info.state).unwrap_or_default()
    }

    /// Full state record, `None` if the target is unknown
    pub async fn get_state_info(&self, target_id: TargetId) -> Option<TargetStateInfo> {
        self.states.read().await.get(&target_id).copied()
    }

    pub async fn contains(&self, target_id: TargetId) -> bool {
        self.states.read().await.contains_key(&target_id)
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    /// Set both states of a target, returns whether anything changed
    pub async fn set_state(&self, target_id: TargetId, state: CombinedState) -> bool {
        let mut states = self.states.write().await;
        set_state_unlocked(&mut states, target_id, state)
    }

    pub async fn set_reachability(&self, target_id: TargetId, reachability: ReachabilityState) -> bool {
        let mut states = self.states.write().await;
        let consistency = states
            .get(&target_id)
            .map(|info| info.state.consistency)
            .unwrap_or(ConsistencyState::Good);
        set_state_unlocked(&mut states, target_id, CombinedState::new(reachability, consistency))
    }

    pub async fn set_consistency(&self, target_id: TargetId, consistency: ConsistencyState) -> bool {
        let mut states = self.states.write().await;
        let reachability = states
            .get(&target_id)
            .map(|info| info.state.reachability)
            .unwrap_or(ReachabilityState::Offline);
        set_state_unlocked(&mut states, target_id, CombinedState::new(reachability, consistency))
    }

    /// Overwrite the reachability of every known target
    ///
    /// Returns whether any target changed, so callers can skip redundant
    /// downstream notifications.
    pub async fn set_all_states(&self, reachability: ReachabilityState) -> bool {
        let mut states = self.states.write().await;
        let mut changed = false;

        for info in states.values_mut() {
            if info.state.reachability != reachability {
                info.state.reachability = reachability;
                info.last_changed = Utc::now();
                changed = true;
            }
        }

        changed
    }

    /// Add a target with the given state unless it is already known
    pub async fn add_if_not_exists(&self, target_id: TargetId, state: CombinedState) -> bool {
        let mut states = self.states.write().await;
        if states.contains_key(&target_id) {
            return false;
        }
        states.insert(target_id, TargetStateInfo::new(state));
        true
    }

    pub async fn remove_target(&self, target_id: TargetId) -> bool {
        self.states.write().await.remove(&target_id).is_some()
    }

    /// All states, ordered by target ID
    pub async fn states_as_list(&self) -> Vec<TargetStateEntry> {
        let states = self.states.read().await;
        to_entries(&states)
    }

    /// Replace the state table, returns whether it differed from the old one
    pub async fn sync_states_from_lists(&self, entries: &[TargetStateEntry]) -> bool {
        let new_states = from_entries(entries);
        let mut states = self.states.write().await;
        let changed = differs(&states, &new_states);
        *states = new_states;
        changed
    }

    /// Atomically replace the state table and the buddy group topology
    ///
    /// Both write locks are held for the whole swap (states first, then
    /// groups), so no reader of `snapshot_with_groups` can see a new state
    /// paired with an old topology or the other way round.
    pub async fn sync_states_and_groups_from_lists(
        &self,
        directory: &BuddyGroupDirectory,
        entries: &[TargetStateEntry],
        groups: &[GroupMapping],
    ) -> Result<()> {
        let new_states = from_entries(entries);

        let mut states = self.states.write().await;
        let mut group_table = directory.groups_write().await;

        directory.sync_groups_locked(&mut group_table, groups)?;
        *states = new_states;

        tracing::debug!(
            "Synced {} target states and {} buddy groups",
            states.len(),
            group_table.len()
        );
        Ok(())
    }

    /// Read states and groups together, taking the locks in sync order
    pub async fn snapshot_with_groups(&self, directory: &BuddyGroupDirectory) -> TopologySnapshot {
        let states = self.states.read().await;
        let groups = directory.groups_read().await;

        TopologySnapshot {
            states: to_entries(&states),
            groups: groups.values().map(|g| g.mapping()).collect(),
        }
    }

    /// Downgrade targets that have not reported for a while
    ///
    /// `last_changed` is not refreshed here, so it keeps pointing at the
    /// last real report. Returns whether any reachability changed.
    pub async fn auto_offline_targets(
        &self,
        poffline_timeout: Duration,
        offline_timeout: Duration,
    ) -> bool {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let mut changed = false;

        for (target_id, info) in states.iter_mut() {
            let silent_for = (now - info.last_changed).to_std().unwrap_or(Duration::ZERO);

            if silent_for > offline_timeout {
                if info.state.reachability != ReachabilityState::Offline {
                    tracing::warn!(
                        "No state report from target {} for {} seconds, setting it offline",
                        target_id,
                        silent_for.as_secs()
                    );
                    info.state.reachability = ReachabilityState::Offline;
                    changed = true;
                }
            } else if silent_for > poffline_timeout
                && info.state.reachability != ReachabilityState::ProbablyOffline
            {
                tracing::warn!(
                    "No state report from target {} for {} seconds, setting it probably-offline",
                    target_id,
                    silent_for.as_secs()
                );
                info.state.reachability = ReachabilityState::ProbablyOffline;
                changed = true;
            }
        }

        changed
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, target_id: TargetId, by: chrono::Duration) {
        if let Some(info) = self.states.write().await.get_mut(&target_id) {
            info.last_changed = info.last_changed - by;
        }
    }
}

impl Default for TargetStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuxiliaryStore for TargetStateStore {
    fn name(&self) -> &'static str {
        "target states"
    }

    async fn add_if_not_exists(&self, target_id: TargetId, _node_id: NodeId, _pool: PoolId) -> Result<()> {
        TargetStateStore::add_if_not_exists(
            self,
            target_id,
            CombinedState::new(ReachabilityState::ProbablyOffline, ConsistencyState::Good),
        )
        .await;
        Ok(())
    }

    async fn remove(&self, target_id: TargetId) {
        self.remove_target(target_id).await;
    }
}

fn set_state_unlocked(
    states: &mut HashMap<TargetId, TargetStateInfo>,
    target_id: TargetId,
    state: CombinedState,
) -> bool {
    match states.get_mut(&target_id) {
        Some(info) => {
            info.last_changed = Utc::now();
            if info.state == state {
                return false;
            }
            tracing::debug!("Target {}: {} -> {}", target_id, info.state, state);
            info.state = state;
            true
        }
        None => {
            states.insert(target_id, TargetStateInfo::new(state));
            true
        }
    }
}

fn from_entries(entries: &[TargetStateEntry]) -> HashMap<TargetId, TargetStateInfo> {
    entries
        .iter()
        .map(|e| (e.target_id, TargetStateInfo::new(e.state())))
        .collect()
}

fn to_entries(states: &HashMap<TargetId, TargetStateInfo>) -> Vec<TargetStateEntry> {
    let mut entries: Vec<TargetStateEntry> = states
        .iter()
        .map(|(id, info)| TargetStateEntry {
            target_id: *id,
            reachability: info.state.reachability,
            consistency: info.state.consistency,
        })
        .collect();
    entries.sort_by_key(|e| e.target_id);
    entries
}

fn differs(
    old: &HashMap<TargetId, TargetStateInfo>,
    new: &HashMap<TargetId, TargetStateInfo>,
) -> bool {
    old.len() != new.len()
        || new
            .iter()
            .any(|(id, info)| old.get(id).map(|o| o.state) != Some(info.state))
}
