//! Buddy Group Directory
//!
//! Maps targets to their owning nodes and buddy groups to their primary and
//! secondary targets. Target membership changes are propagated to every
//! attached auxiliary store as one all-or-nothing unit.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{GroupId, NodeId, PoolId, TargetId};
use crate::error::{Error, Result};
use crate::mirror::SequenceWindow;

/// A per-target store that follows target membership
///
/// Implementations must tolerate removal of targets they never saw and
/// must be idempotent on duplicate additions.
#[async_trait::async_trait]
pub trait AuxiliaryStore: Send + Sync {
    /// Store name (for logging)
    fn name(&self) -> &'static str;

    /// Register a target; an error vetoes the whole mapping
    async fn add_if_not_exists(&self, target_id: TargetId, node_id: NodeId, pool: PoolId) -> Result<()>;

    /// Forget a target
    async fn remove(&self, target_id: TargetId);
}

/// Role of a target within its buddy group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuddyRole {
    Primary,
    Secondary,
    Unmapped,
}

impl std::fmt::Display for BuddyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuddyRole::Primary => write!(f, "PRIMARY"),
            BuddyRole::Secondary => write!(f, "SECONDARY"),
            BuddyRole::Unmapped => write!(f, "UNMAPPED"),
        }
    }
}

/// Group ID with its current primary and secondary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMapping {
    pub group_id: GroupId,
    pub primary: TargetId,
    pub secondary: TargetId,
}

/// A buddy group and its sequence window
#[derive(Clone)]
pub struct BuddyGroup {
    pub group_id: GroupId,
    pub primary: TargetId,
    pub secondary: TargetId,
    window: Arc<SequenceWindow>,
}

impl BuddyGroup {
    fn new(group_id: GroupId, primary: TargetId, secondary: TargetId, capacity: usize) -> Self {
        Self {
            group_id,
            primary,
            secondary,
            window: Arc::new(SequenceWindow::new(group_id, capacity)),
        }
    }

    pub fn mapping(&self) -> GroupMapping {
        GroupMapping {
            group_id: self.group_id,
            primary: self.primary,
            secondary: self.secondary,
        }
    }

    pub fn window(&self) -> &Arc<SequenceWindow> {
        &self.window
    }

    /// The other member of the group, and whether `target_id` is the primary
    fn buddy_of(&self, target_id: TargetId) -> Option<(TargetId, bool)> {
        if self.primary == target_id {
            Some((self.secondary, true))
        } else if self.secondary == target_id {
            Some((self.primary, false))
        } else {
            None
        }
    }
}

type GroupTable = BTreeMap<GroupId, BuddyGroup>;

/// Target-to-node and group-to-target directory
pub struct BuddyGroupDirectory {
    /// Target ID -> owning node
    targets: RwLock<BTreeMap<TargetId, NodeId>>,
    /// Group ID -> buddy group
    groups: RwLock<GroupTable>,
    /// Stores notified about target additions and removals, in attach order
    stores: RwLock<Vec<Arc<dyn AuxiliaryStore>>>,
    /// Sequence window capacity for newly created groups
    window_capacity: usize,
}

impl BuddyGroupDirectory {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            targets: RwLock::new(BTreeMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            stores: RwLock::new(Vec::new()),
            window_capacity,
        }
    }

    /// Register an auxiliary store for future add/remove propagation
    pub async fn attach(&self, store: Arc<dyn AuxiliaryStore>) {
        tracing::debug!("Attaching auxiliary store: {}", store.name());
        self.stores.write().await.push(store);
    }

    // ========== Targets ==========

    /// Assign a target to a node
    ///
    /// A newly added target is registered with every attached store. If
    /// any store rejects it, all stores that already accepted it and the
    /// mapping itself are rolled back and the store's error is returned.
    /// Returns whether the target was new.
    pub async fn map_target(&self, target_id: TargetId, node_id: NodeId, pool: PoolId) -> Result<bool> {
        let mut targets = self.targets.write().await;

        let is_new = targets.insert(target_id, node_id).is_none();
        if !is_new {
            return Ok(false);
        }

        let stores = self.stores.read().await;
        for (i, store) in stores.iter().enumerate() {
            if let Err(e) = store.add_if_not_exists(target_id, node_id, pool).await {
                tracing::warn!(
                    "Store '{}' rejected target {} (pool {}): {}",
                    store.name(),
                    target_id,
                    pool,
                    e
                );
                for accepted in stores[..i].iter().rev() {
                    accepted.remove(target_id).await;
                }
                targets.remove(&target_id);
                return Err(e);
            }
        }

        tracing::debug!("Mapped new target {} to node {}", target_id, node_id);
        Ok(true)
    }

    /// Remove a target, returns whether it was mapped
    pub async fn unmap_target(&self, target_id: TargetId) -> bool {
        let mut targets = self.targets.write().await;
        if targets.remove(&target_id).is_none() {
            return false;
        }

        for store in self.stores.read().await.iter() {
            store.remove(target_id).await;
        }
        true
    }

    /// Remove every target owned by a node, returns whether any was mapped
    pub async fn unmap_by_node(&self, node_id: NodeId) -> bool {
        let mut targets = self.targets.write().await;
        let owned: Vec<TargetId> = targets
            .iter()
            .filter(|(_, owner)| **owner == node_id)
            .map(|(target, _)| *target)
            .collect();

        if owned.is_empty() {
            return false;
        }

        let stores = self.stores.read().await;
        for target_id in owned {
            targets.remove(&target_id);
            for store in stores.iter() {
                store.remove(target_id).await;
            }
        }
        true
    }

    /// Replace the target mapping, adding new targets to attached stores
    ///
    /// Stores keep entries for targets that disappeared; only additions are
    /// propagated. If a store rejects a new target, every addition of this
    /// sync is rolled back and the mapping stays as it was. Returns whether
    /// the mapping changed.
    pub async fn sync_targets_from_lists(&self, mapping: &[(TargetId, NodeId)], pool: PoolId) -> Result<bool> {
        let new_targets: BTreeMap<TargetId, NodeId> = mapping.iter().copied().collect();

        let mut targets = self.targets.write().await;
        if *targets == new_targets {
            return Ok(false);
        }

        let added: Vec<(TargetId, NodeId)> = new_targets
            .iter()
            .filter(|(target_id, _)| !targets.contains_key(target_id))
            .map(|(target_id, node_id)| (*target_id, *node_id))
            .collect();

        let stores = self.stores.read().await;
        for (n, (target_id, node_id)) in added.iter().enumerate() {
            for (i, store) in stores.iter().enumerate() {
                if let Err(e) = store.add_if_not_exists(*target_id, *node_id, pool).await {
                    tracing::warn!(
                        "Store '{}' rejected synced target {} (pool {}): {}",
                        store.name(),
                        target_id,
                        pool,
                        e
                    );
                    for accepted in stores[..i].iter().rev() {
                        accepted.remove(*target_id).await;
                    }
                    for (earlier, _) in added[..n].iter().rev() {
                        for accepted in stores.iter().rev() {
                            accepted.remove(*earlier).await;
                        }
                    }
                    return Err(e);
                }
            }
        }

        *targets = new_targets;
        tracing::debug!("Synced {} targets, {} new", targets.len(), added.len());
        Ok(true)
    }

    pub async fn node_of(&self, target_id: TargetId) -> Option<NodeId> {
        self.targets.read().await.get(&target_id).copied()
    }

    pub async fn target_exists(&self, target_id: TargetId) -> bool {
        self.targets.read().await.contains_key(&target_id)
    }

    pub async fn targets_of_node(&self, node_id: NodeId) -> Vec<TargetId> {
        self.targets
            .read()
            .await
            .iter()
            .filter(|(_, owner)| **owner == node_id)
            .map(|(target, _)| *target)
            .collect()
    }

    pub async fn targets_as_list(&self) -> Vec<(TargetId, NodeId)> {
        self.targets.read().await.iter().map(|(t, n)| (*t, *n)).collect()
    }

    // ========== Buddy groups ==========

    /// Create or update a buddy group, returns its ID
    ///
    /// `group_id == 0` asks for a newly generated ID.
    pub async fn map_group(
        &self,
        group_id: GroupId,
        primary: TargetId,
        secondary: TargetId,
        allow_update: bool,
    ) -> Result<GroupId> {
        if primary == secondary {
            return Err(Error::InvalidGroup(format!(
                "primary and secondary are both target {}",
                primary
            )));
        }

        // checked before taking the group lock, never nested with it
        for target in [primary, secondary] {
            if !self.target_exists(target).await {
                return Err(Error::UnknownTarget(target));
            }
        }

        let mut groups = self.groups.write().await;

        if group_id != 0 && !allow_update && groups.contains_key(&group_id) {
            return Err(Error::GroupExists(group_id));
        }

        for target in [primary, secondary] {
            if let Some(owner) = group_of_unlocked(&groups, target) {
                if owner.0 != group_id {
                    return Err(Error::TargetInUse { target, group: owner.0 });
                }
            }
        }

        let group_id = if group_id == 0 {
            generate_id(&groups)
                .ok_or_else(|| Error::InvalidGroup("no free buddy group ID left".into()))?
        } else {
            group_id
        };

        match groups.get_mut(&group_id) {
            Some(group) => {
                group.primary = primary;
                group.secondary = secondary;
            }
            None => {
                groups.insert(
                    group_id,
                    BuddyGroup::new(group_id, primary, secondary, self.window_capacity),
                );
            }
        }

        tracing::info!(
            "Mapped buddy group {}: primary {}, secondary {}",
            group_id,
            primary,
            secondary
        );
        Ok(group_id)
    }

    /// Remove a buddy group, returns whether it existed
    pub async fn unmap_group(&self, group_id: GroupId) -> bool {
        self.groups.write().await.remove(&group_id).is_some()
    }

    /// Swap primary and secondary of a group (failover)
    pub async fn switchover(&self, group_id: GroupId) -> bool {
        let mut groups = self.groups.write().await;
        match groups.get_mut(&group_id) {
            Some(group) => {
                std::mem::swap(&mut group.primary, &mut group.secondary);
                tracing::warn!(
                    "Switched buddy group {}: new primary {}, new secondary {}",
                    group_id,
                    group.primary,
                    group.secondary
                );
                true
            }
            None => false,
        }
    }

    /// Counterpart of a target and whether the target is the primary
    pub async fn buddy_target_id(&self, target_id: TargetId) -> Option<(TargetId, bool)> {
        let groups = self.groups.read().await;
        groups.values().find_map(|g| g.buddy_of(target_id))
    }

    /// Group of a target and whether the target is the primary
    pub async fn group_of(&self, target_id: TargetId) -> Option<(GroupId, bool)> {
        let groups = self.groups.read().await;
        group_of_unlocked(&groups, target_id)
    }

    /// Group the local target belongs to, if any
    pub async fn local_group_id(&self, local_target: TargetId) -> Option<GroupId> {
        self.group_of(local_target).await.map(|(group_id, _)| group_id)
    }

    pub async fn buddy_role(&self, target_id: TargetId) -> BuddyRole {
        match self.group_of(target_id).await {
            Some((_, true)) => BuddyRole::Primary,
            Some((_, false)) => BuddyRole::Secondary,
            None => BuddyRole::Unmapped,
        }
    }

    pub async fn primary_of(&self, group_id: GroupId) -> Option<TargetId> {
        self.groups.read().await.get(&group_id).map(|g| g.primary)
    }

    pub async fn secondary_of(&self, group_id: GroupId) -> Option<TargetId> {
        self.groups.read().await.get(&group_id).map(|g| g.secondary)
    }

    pub async fn group(&self, group_id: GroupId) -> Option<GroupMapping> {
        self.groups.read().await.get(&group_id).map(|g| g.mapping())
    }

    /// Sequence window of a group
    pub async fn window(&self, group_id: GroupId) -> Option<Arc<SequenceWindow>> {
        self.groups
            .read()
            .await
            .get(&group_id)
            .map(|g| Arc::clone(g.window()))
    }

    pub async fn groups_as_list(&self) -> Vec<GroupMapping> {
        self.groups.read().await.values().map(|g| g.mapping()).collect()
    }

    /// Replace all groups (outside of a combined state sync)
    pub async fn sync_groups_from_lists(&self, groups: &[GroupMapping]) -> Result<()> {
        let mut table = self.groups.write().await;
        self.sync_groups_locked(&mut table, groups)
    }

    pub(crate) async fn groups_read(&self) -> RwLockReadGuard<'_, GroupTable> {
        self.groups.read().await
    }

    pub(crate) async fn groups_write(&self) -> RwLockWriteGuard<'_, GroupTable> {
        self.groups.write().await
    }

    /// Rebuild the group table; caller holds the write lock
    ///
    /// Groups that survive keep their sequence window so sequence numbers
    /// already handed out are never issued again.
    pub(crate) fn sync_groups_locked(&self, table: &mut GroupTable, groups: &[GroupMapping]) -> Result<()> {
        if let Some(bad) = groups.iter().find(|g| g.group_id == 0) {
            return Err(Error::InvalidGroup(format!(
                "group ID 0 for targets {}/{}",
                bad.primary, bad.secondary
            )));
        }

        let mut new_table = GroupTable::new();
        for mapping in groups {
            let group = match table.remove(&mapping.group_id) {
                Some(mut existing) => {
                    existing.primary = mapping.primary;
                    existing.secondary = mapping.secondary;
                    existing
                }
                None => BuddyGroup::new(
                    mapping.group_id,
                    mapping.primary,
                    mapping.secondary,
                    self.window_capacity,
                ),
            };
            new_table.insert(mapping.group_id, group);
        }

        *table = new_table;
        Ok(())
    }
}

fn group_of_unlocked(groups: &GroupTable, target_id: TargetId) -> Option<(GroupId, bool)> {
    groups
        .values()
        .find_map(|g| g.buddy_of(target_id).map(|(_, is_primary)| (g.group_id, is_primary)))
}

/// Pick a free group ID: one past the highest, else 1, else the first gap
fn generate_id(groups: &GroupTable) -> Option<GroupId> {
    let (first, last) = match (groups.keys().next(), groups.keys().next_back()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Some(1),
    };

    if last < GroupId::MAX {
        return Some(last + 1);
    }
    if first > 1 {
        return Some(1);
    }

    groups
        .keys()
        .zip(groups.keys().skip(1))
        .find(|(a, b)| **a + 1 < **b)
        .map(|(a, _)| *a + 1)
}
