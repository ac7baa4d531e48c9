//! Built-in mirrored entry operations
//!
//! A small in-memory entry table (directory entries with attributes) and
//! the mirrored operations that mutate it. IDs and timestamps are chosen
//! by the primary and shipped to the secondary, which never derives them
//! itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::locks::{EntryLock, LockKey};
use super::operation::{AckNotify, LocalOutcome, MirroredOperation, OP_ACK_NOTIFY};
use crate::error::{Error, OpsResult, Result};

pub const OP_CREATE_ENTRY: u16 = 10;
pub const OP_SET_ENTRY_ATTR: u16 = 11;
pub const OP_REMOVE_ENTRY: u16 = 12;

/// Attributes of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAttrs {
    pub mode: u32,
    /// Modification time in seconds since the epoch
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub parent_id: String,
    pub name: String,
    pub attrs: EntryAttrs,
}

#[derive(Default)]
struct EntryTable {
    entries: HashMap<String, Entry>,
    /// (parent ID, name) -> entry ID
    names: HashMap<(String, String), String>,
}

/// In-memory entry table of one target
pub struct EntryAttrStore {
    table: RwLock<EntryTable>,
    next_id: AtomicU64,
    id_prefix: String,
}

impl EntryAttrStore {
    /// Entry IDs created here start with the local target's ID
    pub fn new(local_target: u16) -> Self {
        Self {
            table: RwLock::new(EntryTable::default()),
            next_id: AtomicU64::new(1),
            id_prefix: format!("{:X}", local_target),
        }
    }

    fn generate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:X}-{:X}", self.id_prefix, Utc::now().timestamp(), n)
    }

    pub async fn get(&self, entry_id: &str) -> Option<Entry> {
        self.table.read().await.entries.get(entry_id).cloned()
    }

    pub async fn lookup(&self, parent_id: &str, name: &str) -> Option<String> {
        self.table
            .read()
            .await
            .names
            .get(&(parent_id.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn create(&self, entry_id: &str, parent_id: &str, name: &str, attrs: EntryAttrs) -> OpsResult {
        let mut table = self.table.write().await;
        let key = (parent_id.to_string(), name.to_string());
        if table.names.contains_key(&key) || table.entries.contains_key(entry_id) {
            return OpsResult::Exists;
        }

        table.names.insert(key, entry_id.to_string());
        table.entries.insert(
            entry_id.to_string(),
            Entry {
                parent_id: parent_id.to_string(),
                name: name.to_string(),
                attrs,
            },
        );
        OpsResult::Success
    }

    async fn set_attrs(&self, entry_id: &str, attrs: EntryAttrs) -> OpsResult {
        match self.table.write().await.entries.get_mut(entry_id) {
            Some(entry) => {
                entry.attrs = attrs;
                OpsResult::Success
            }
            None => OpsResult::NoEntry,
        }
    }

    async fn remove(&self, parent_id: &str, name: &str) -> OpsResult {
        let mut table = self.table.write().await;
        match table.names.remove(&(parent_id.to_string(), name.to_string())) {
            Some(entry_id) => {
                table.entries.remove(&entry_id);
                OpsResult::Success
            }
            None => OpsResult::NoEntry,
        }
    }
}

/// Create `name` in `parent_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntryArgs {
    pub parent_id: String,
    pub name: String,
    pub mode: u32,
    /// Set by the primary
    pub entry_id: Option<String>,
    /// Set by the primary
    pub mtime: Option<i64>,
}

pub struct CreateEntry {
    store: Arc<EntryAttrStore>,
    args: CreateEntryArgs,
}

impl CreateEntry {
    pub fn new(store: Arc<EntryAttrStore>, args: CreateEntryArgs) -> Self {
        Self { store, args }
    }
}

#[async_trait::async_trait]
impl MirroredOperation for CreateEntry {
    fn op_type(&self) -> u16 {
        OP_CREATE_ENTRY
    }

    fn log_context(&self) -> String {
        format!("create entry '{}' in {}", self.args.name, self.args.parent_id)
    }

    fn lock_set(&self) -> Vec<EntryLock> {
        vec![
            EntryLock::shared(LockKey::DirId(self.args.parent_id.clone())),
            EntryLock::exclusive(LockKey::ParentName {
                parent: self.args.parent_id.clone(),
                name: self.args.name.clone(),
            }),
        ]
    }

    async fn execute_locally(&mut self, is_secondary: bool) -> Result<LocalOutcome> {
        let (entry_id, mtime) = match (is_secondary, &self.args.entry_id, self.args.mtime) {
            (true, Some(id), Some(mtime)) => (id.clone(), mtime),
            (true, _, _) => return Err(Error::Internal("forwarded create lacks entry ID".into())),
            (false, _, _) => (self.store.generate_id(), Utc::now().timestamp()),
        };

        let attrs = EntryAttrs { mode: self.args.mode, mtime };
        let result = self
            .store
            .create(&entry_id, &self.args.parent_id, &self.args.name, attrs)
            .await;

        if result.is_success() {
            self.args.entry_id = Some(entry_id.clone());
            self.args.mtime = Some(mtime);
            return Ok(LocalOutcome::from_result(result, entry_id.into_bytes()));
        }
        Ok(LocalOutcome::from_result(result, Vec::new()))
    }

    fn forward_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.args)?)
    }
}

/// Replace the attributes of an entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetEntryAttrArgs {
    pub entry_id: String,
    pub mode: u32,
    /// Set by the primary
    pub mtime: Option<i64>,
}

pub struct SetEntryAttr {
    store: Arc<EntryAttrStore>,
    args: SetEntryAttrArgs,
}

impl SetEntryAttr {
    pub fn new(store: Arc<EntryAttrStore>, args: SetEntryAttrArgs) -> Self {
        Self { store, args }
    }
}

#[async_trait::async_trait]
impl MirroredOperation for SetEntryAttr {
    fn op_type(&self) -> u16 {
        OP_SET_ENTRY_ATTR
    }

    fn log_context(&self) -> String {
        format!("set attributes of {}", self.args.entry_id)
    }

    fn lock_set(&self) -> Vec<EntryLock> {
        vec![EntryLock::exclusive(LockKey::FileId(self.args.entry_id.clone()))]
    }

    async fn execute_locally(&mut self, is_secondary: bool) -> Result<LocalOutcome> {
        let mtime = match (is_secondary, self.args.mtime) {
            (true, Some(mtime)) => mtime,
            (true, None) => return Err(Error::Internal("forwarded setattr lacks mtime".into())),
            (false, _) => Utc::now().timestamp(),
        };

        let attrs = EntryAttrs { mode: self.args.mode, mtime };
        let result = self.store.set_attrs(&self.args.entry_id, attrs).await;
        self.args.mtime = Some(mtime);
        Ok(LocalOutcome::from_result(result, Vec::new()))
    }

    fn forward_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.args)?)
    }
}

/// Remove `name` from `parent_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveEntryArgs {
    pub parent_id: String,
    pub name: String,
}

pub struct RemoveEntry {
    store: Arc<EntryAttrStore>,
    args: RemoveEntryArgs,
}

impl RemoveEntry {
    pub fn new(store: Arc<EntryAttrStore>, args: RemoveEntryArgs) -> Self {
        Self { store, args }
    }
}

#[async_trait::async_trait]
impl MirroredOperation for RemoveEntry {
    fn op_type(&self) -> u16 {
        OP_REMOVE_ENTRY
    }

    fn log_context(&self) -> String {
        format!("remove entry '{}' from {}", self.args.name, self.args.parent_id)
    }

    fn lock_set(&self) -> Vec<EntryLock> {
        vec![
            EntryLock::exclusive(LockKey::DirId(self.args.parent_id.clone())),
            EntryLock::exclusive(LockKey::ParentName {
                parent: self.args.parent_id.clone(),
                name: self.args.name.clone(),
            }),
        ]
    }

    async fn execute_locally(&mut self, _is_secondary: bool) -> Result<LocalOutcome> {
        let result = self.store.remove(&self.args.parent_id, &self.args.name).await;
        Ok(LocalOutcome::from_result(result, Vec::new()))
    }

    fn forward_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.args)?)
    }
}

/// Decodes mirrored entry operations from their wire form
#[derive(Clone)]
pub struct EntryOperations {
    store: Arc<EntryAttrStore>,
}

impl EntryOperations {
    pub fn new(store: Arc<EntryAttrStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<EntryAttrStore> {
        &self.store
    }

    pub fn decode(&self, op_type: u16, payload: &[u8]) -> Result<Box<dyn MirroredOperation>> {
        let store = Arc::clone(&self.store);
        let op: Box<dyn MirroredOperation> = match op_type {
            OP_ACK_NOTIFY => Box::new(AckNotify),
            OP_CREATE_ENTRY => Box::new(CreateEntry::new(store, bincode::deserialize(payload)?)),
            OP_SET_ENTRY_ATTR => Box::new(SetEntryAttr::new(store, bincode::deserialize(payload)?)),
            OP_REMOVE_ENTRY => Box::new(RemoveEntry::new(store, bincode::deserialize(payload)?)),
            other => {
                return Err(Error::Internal(format!("unknown mirrored operation type {}", other)))
            }
        };
        Ok(op)
    }
}

/// Encode operation arguments for a requestor
pub fn encode_args<T: Serialize>(args: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(args)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_args(name: &str) -> CreateEntryArgs {
        CreateEntryArgs {
            parent_id: "root".into(),
            name: name.into(),
            mode: 0o644,
            entry_id: None,
            mtime: None,
        }
    }

    #[tokio::test]
    async fn test_secondary_replays_primary_decisions() {
        let primary = Arc::new(EntryAttrStore::new(1));
        let secondary = Arc::new(EntryAttrStore::new(2));

        let mut op = CreateEntry::new(primary.clone(), create_args("a"));
        let outcome = op.execute_locally(false).await.unwrap();
        assert!(outcome.changes_observable_state);
        let entry_id = String::from_utf8(outcome.response.payload).unwrap();

        let mut replay = EntryOperations::new(secondary.clone())
            .decode(OP_CREATE_ENTRY, &op.forward_payload().unwrap())
            .unwrap();
        replay.execute_locally(true).await.unwrap();

        assert_eq!(secondary.lookup("root", "a").await, Some(entry_id.clone()));
        assert_eq!(primary.get(&entry_id).await, secondary.get(&entry_id).await);
    }

    #[tokio::test]
    async fn test_duplicate_create_has_no_effect() {
        let store = Arc::new(EntryAttrStore::new(1));
        CreateEntry::new(store.clone(), create_args("a"))
            .execute_locally(false)
            .await
            .unwrap();

        let outcome = CreateEntry::new(store.clone(), create_args("a"))
            .execute_locally(false)
            .await
            .unwrap();
        assert_eq!(outcome.response.result, OpsResult::Exists);
        assert!(!outcome.changes_observable_state);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_set_attr_and_remove() {
        let store = Arc::new(EntryAttrStore::new(1));
        let mut create = CreateEntry::new(store.clone(), create_args("b"));
        let entry_id =
            String::from_utf8(create.execute_locally(false).await.unwrap().response.payload).unwrap();

        let mut set = SetEntryAttr::new(
            store.clone(),
            SetEntryAttrArgs { entry_id: entry_id.clone(), mode: 0o600, mtime: None },
        );
        assert!(set.execute_locally(false).await.unwrap().changes_observable_state);
        assert_eq!(store.get(&entry_id).await.unwrap().attrs.mode, 0o600);

        let mut remove = RemoveEntry::new(
            store.clone(),
            RemoveEntryArgs { parent_id: "root".into(), name: "b".into() },
        );
        assert!(remove.execute_locally(false).await.unwrap().response.result.is_success());
        let again = remove.execute_locally(false).await.unwrap();
        assert_eq!(again.response.result, OpsResult::NoEntry);
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let ops = EntryOperations::new(Arc::new(EntryAttrStore::new(1)));
        assert!(ops.decode(999, &[]).is_err());
        assert!(ops.decode(OP_ACK_NOTIFY, &[]).is_ok());
    }

    #[tokio::test]
    async fn test_forwarded_create_requires_primary_values() {
        let ops = EntryOperations::new(Arc::new(EntryAttrStore::new(2)));
        let payload = encode_args(&create_args("c")).unwrap();
        let mut op = ops.decode(OP_CREATE_ENTRY, &payload).unwrap();
        assert!(op.execute_locally(true).await.is_err());
    }
}
