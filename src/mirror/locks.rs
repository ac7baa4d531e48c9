//! Entry Lock Store
//!
//! Entry-scoped locks taken by the primary around a mirrored operation.
//! Every lock set is acquired in one global order so operations touching
//! overlapping entries cannot deadlock each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// What an entry lock protects, in acquisition order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    /// A hash directory bucket
    HashDir(u32),
    /// A directory by ID
    DirId(String),
    /// A name within a parent directory
    ParentName { parent: String, name: String },
    /// A file by ID
    FileId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One requested lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryLock {
    pub key: LockKey,
    pub mode: LockMode,
}

impl EntryLock {
    pub fn shared(key: LockKey) -> Self {
        Self { key, mode: LockMode::Shared }
    }

    pub fn exclusive(key: LockKey) -> Self {
        Self { key, mode: LockMode::Exclusive }
    }
}

enum Guard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

type LockTable = HashMap<LockKey, Arc<RwLock<()>>>;

/// Table of entry locks currently in use
#[derive(Clone, Default)]
pub struct EntryLockStore {
    table: Arc<Mutex<LockTable>>,
}

impl EntryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire all requested locks in global order
    ///
    /// Duplicate keys collapse to the strongest requested mode.
    pub async fn lock_all(&self, mut locks: Vec<EntryLock>) -> LockSet {
        locks.sort();
        // sorted shared-before-exclusive, so keeping the last of each key keeps the strongest
        let mut ordered: Vec<EntryLock> = Vec::with_capacity(locks.len());
        for lock in locks {
            match ordered.last_mut() {
                Some(prev) if prev.key == lock.key => *prev = lock,
                _ => ordered.push(lock),
            }
        }

        let mut guards = Vec::with_capacity(ordered.len());
        for lock in ordered {
            let entry = self.entry(&lock.key);
            let guard = match lock.mode {
                LockMode::Shared => Guard::Shared(entry.read_owned().await),
                LockMode::Exclusive => Guard::Exclusive(entry.write_owned().await),
            };
            guards.push((lock.key, guard));
        }

        LockSet {
            guards,
            table: Arc::clone(&self.table),
        }
    }

    /// Number of entries with a holder or waiter
    pub fn active_entries(&self) -> usize {
        lock_table(&self.table).len()
    }

    fn entry(&self, key: &LockKey) -> Arc<RwLock<()>> {
        let mut table = lock_table(&self.table);
        Arc::clone(table.entry(key.clone()).or_default())
    }
}

fn lock_table(table: &Mutex<LockTable>) -> std::sync::MutexGuard<'_, LockTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held entry locks, released on drop
#[must_use = "entry locks are released as soon as the set is dropped"]
pub struct LockSet {
    guards: Vec<(LockKey, Guard)>,
    table: Arc<Mutex<LockTable>>,
}

impl LockSet {
    /// A set holding nothing
    pub fn empty() -> Self {
        Self {
            guards: Vec::new(),
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.guards.iter().map(|(key, _)| key)
    }

    pub fn is_exclusive(&self, key: &LockKey) -> bool {
        self.guards
            .iter()
            .any(|(k, guard)| k == key && matches!(guard, Guard::Exclusive(_)))
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        let keys: Vec<LockKey> = self.guards.drain(..).rev().map(|(key, _)| key).collect();

        let mut table = lock_table(&self.table);
        for key in keys {
            // only the table still references an idle entry
            if table.get(&key).is_some_and(|entry| Arc::strong_count(entry) == 1) {
                table.remove(&key);
            }
        }
    }
}
