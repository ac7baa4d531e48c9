//! Storage pool and quota stores attached to the buddy group directory

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::RwLock;

use super::directory::AuxiliaryStore;
use super::{NodeId, PoolId, TargetId};
use crate::error::{Error, Result};

/// Pool every target lands in unless told otherwise
pub const DEFAULT_POOL: PoolId = 1;

/// Storage pools and their member targets
pub struct StoragePoolStore {
    pools: RwLock<BTreeMap<PoolId, BTreeSet<TargetId>>>,
}

impl StoragePoolStore {
    /// Create a store holding only the default pool
    pub fn new() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(DEFAULT_POOL, BTreeSet::new());
        Self {
            pools: RwLock::new(pools),
        }
    }

    /// Create an empty pool, returns false if it already exists
    pub async fn add_pool(&self, pool: PoolId) -> bool {
        let mut pools = self.pools.write().await;
        if pools.contains_key(&pool) {
            return false;
        }
        pools.insert(pool, BTreeSet::new());
        true
    }

    /// Remove an empty pool
    pub async fn remove_pool(&self, pool: PoolId) -> Result<()> {
        if pool == DEFAULT_POOL {
            return Err(Error::Config("the default pool cannot be removed".into()));
        }

        let mut pools = self.pools.write().await;
        match pools.get(&pool) {
            None => Err(Error::UnknownPool(pool)),
            Some(members) if !members.is_empty() => Err(Error::Operation(crate::error::OpsResult::InUse)),
            Some(_) => {
                pools.remove(&pool);
                Ok(())
            }
        }
    }

    pub async fn pool_of(&self, target_id: TargetId) -> Option<PoolId> {
        self.pools
            .read()
            .await
            .iter()
            .find(|(_, members)| members.contains(&target_id))
            .map(|(pool, _)| *pool)
    }

    pub async fn targets_in_pool(&self, pool: PoolId) -> Vec<TargetId> {
        self.pools
            .read()
            .await
            .get(&pool)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.read().await.keys().copied().collect()
    }
}

impl Default for StoragePoolStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuxiliaryStore for StoragePoolStore {
    fn name(&self) -> &'static str {
        "storage pools"
    }

    async fn add_if_not_exists(&self, target_id: TargetId, _node_id: NodeId, pool: PoolId) -> Result<()> {
        let mut pools = self.pools.write().await;

        if !pools.contains_key(&pool) {
            return Err(Error::UnknownPool(pool));
        }
        // a target lives in exactly one pool, the first assignment wins
        if pools.values().any(|members| members.contains(&target_id)) {
            return Ok(());
        }

        if let Some(members) = pools.get_mut(&pool) {
            members.insert(target_id);
        }
        Ok(())
    }

    async fn remove(&self, target_id: TargetId) {
        for members in self.pools.write().await.values_mut() {
            members.remove(&target_id);
        }
    }
}

/// Targets tracked for quota exceedance
pub struct ExceededQuotaStore {
    /// Target ID -> whether the target currently exceeds its quota
    targets: RwLock<HashMap<TargetId, bool>>,
}

impl ExceededQuotaStore {
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, target_id: TargetId) -> bool {
        self.targets.read().await.contains_key(&target_id)
    }

    /// Update the exceeded flag of a tracked target
    pub async fn set_exceeded(&self, target_id: TargetId, exceeded: bool) -> bool {
        match self.targets.write().await.get_mut(&target_id) {
            Some(flag) => {
                *flag = exceeded;
                true
            }
            None => false,
        }
    }

    pub async fn is_exceeded(&self, target_id: TargetId) -> bool {
        self.targets.read().await.get(&target_id).copied().unwrap_or(false)
    }

    pub async fn exceeded_targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self
            .targets
            .read()
            .await
            .iter()
            .filter(|(_, exceeded)| **exceeded)
            .map(|(target, _)| *target)
            .collect();
        targets.sort_unstable();
        targets
    }
}

impl Default for ExceededQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuxiliaryStore for ExceededQuotaStore {
    fn name(&self) -> &'static str {
        "exceeded quota"
    }

    async fn add_if_not_exists(&self, target_id: TargetId, _node_id: NodeId, _pool: PoolId) -> Result<()> {
        self.targets.write().await.entry(target_id).or_insert(false);
        Ok(())
    }

    async fn remove(&self, target_id: TargetId) {
        self.targets.write().await.remove(&target_id);
    }
}
