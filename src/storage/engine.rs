//! Ordered, Transactional Storage Engine
//!
//! This module implements the backing store FlashMC fronts. It keeps every
//! *space* (a named collection of records) in an ordered `BTreeMap` keyed by
//! the record key, and offers exactly what the cache front end needs:
//!
//! - point reads under a shared lock
//! - transactions with an undo log (commit keeps, rollback restores)
//! - full ordered iteration through a resumable cursor
//! - space length
//! - numerically coded errors ([`StoreError`])
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │                                                             │
//! │   RwLock<HashMap<SpaceId, Space>>                           │
//! │      │                                                      │
//! │      ├── read()  ──> get / len         (many readers)       │
//! │      └── write() ──> Transaction       (one writer)         │
//! │                        ├── undo log                         │
//! │                        └── commit / rollback / drop         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Transaction`] owns the write guard for its whole lifetime. The guard is
//! not `Send`, so a transaction can never be held across an `.await` in a
//! spawned task; transactions are always short and synchronous.
//!
//! Iteration does not borrow the map. A [`SpaceIterator`] remembers the last key
//! it returned and resumes strictly after it, so it stays valid across
//! transactions, deletes and inserts.

use crate::error::{StoreError, StoreResult};
use crate::storage::record::Record;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

/// Identifier of a space (collection) in the store.
pub type SpaceId = u32;

/// A single ordered collection of records.
#[derive(Debug, Default)]
struct Space {
    name: String,
    index: BTreeMap<Bytes, Record>,
}

/// Undo log entry: how to revert one mutation.
#[derive(Debug)]
enum Undo {
    /// The key did not exist before; remove it.
    Remove(SpaceId, Bytes),
    /// The key held this record before; put it back.
    Restore(SpaceId, Record),
}

/// The backing store.
///
/// Designed to be wrapped in an `Arc` and shared by the service, every
/// connection and the expiration task.
///
/// # Example
///
/// ```
/// use flashmc::storage::{Record, StorageEngine};
/// use bytes::Bytes;
///
/// let store = StorageEngine::new();
/// store.create_space(512, "cache").unwrap();
///
/// let mut txn = store.begin();
/// txn.replace(512, Record::new(Bytes::from("k"), Bytes::from("v"), 0, 0, 1, 0)).unwrap();
/// txn.commit();
///
/// assert_eq!(store.len(512).unwrap(), 1);
/// ```
pub struct StorageEngine {
    spaces: RwLock<HashMap<SpaceId, Space>>,

    /// Statistics: committed transactions
    commits: AtomicU64,

    /// Statistics: rolled back transactions
    rollbacks: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let spaces = self.spaces.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StorageEngine")
            .field("spaces", &spaces.len())
            .field("commits", &self.commits.load(Ordering::Relaxed))
            .field("rollbacks", &self.rollbacks.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates an empty store with no spaces.
    pub fn new() -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    /// Creates a new, empty space.
    pub fn create_space(&self, id: SpaceId, name: impl Into<String>) -> StoreResult<()> {
        let mut spaces = self.spaces.write().unwrap_or_else(PoisonError::into_inner);
        if spaces.contains_key(&id) {
            return Err(StoreError::space_exists(id));
        }
        spaces.insert(
            id,
            Space {
                name: name.into(),
                index: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Drops a space and all of its records.
    pub fn drop_space(&self, id: SpaceId) -> StoreResult<()> {
        let mut spaces = self.spaces.write().unwrap_or_else(PoisonError::into_inner);
        spaces
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::no_such_space(id))
    }

    /// Returns the name a space was created with.
    pub fn space_name(&self, id: SpaceId) -> StoreResult<String> {
        let spaces = self.spaces.read().unwrap_or_else(PoisonError::into_inner);
        spaces
            .get(&id)
            .map(|space| space.name.clone())
            .ok_or_else(|| StoreError::no_such_space(id))
    }

    /// Returns the number of records in a space.
    pub fn len(&self, id: SpaceId) -> StoreResult<usize> {
        let spaces = self.spaces.read().unwrap_or_else(PoisonError::into_inner);
        spaces
            .get(&id)
            .map(|space| space.index.len())
            .ok_or_else(|| StoreError::no_such_space(id))
    }

    /// Reads a record by key under a shared lock.
    ///
    /// This is the fast path for lookups; anything that mutates goes through
    /// [`StorageEngine::begin`].
    pub fn get(&self, id: SpaceId, key: &[u8]) -> StoreResult<Option<Record>> {
        let spaces = self.spaces.read().unwrap_or_else(PoisonError::into_inner);
        let space = spaces.get(&id).ok_or_else(|| StoreError::no_such_space(id))?;
        Ok(space.index.get(key).cloned())
    }

    /// Creates a full, ordered iterator over a space's primary index.
    pub fn iterator(&self, id: SpaceId) -> StoreResult<SpaceIterator> {
        let spaces = self.spaces.read().unwrap_or_else(PoisonError::into_inner);
        if !spaces.contains_key(&id) {
            return Err(StoreError::no_such_space(id));
        }
        Ok(SpaceIterator {
            space: id,
            last: None,
            exhausted: false,
        })
    }

    /// Begins a transaction.
    ///
    /// The transaction holds the store's write lock until it is committed,
    /// rolled back or dropped. Dropping an uncommitted transaction rolls it back.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            spaces: self.spaces.write().unwrap_or_else(PoisonError::into_inner),
            undo: Vec::new(),
            store: self,
            finished: false,
        }
    }

    /// Returns (commits, rollbacks) performed so far.
    pub fn txn_stats(&self) -> (u64, u64) {
        (
            self.commits.load(Ordering::Relaxed),
            self.rollbacks.load(Ordering::Relaxed),
        )
    }
}

/// A resumable cursor over one space, in key order.
///
/// The cursor does not borrow the store; every step is taken through a
/// [`Transaction`].
#[derive(Debug, Clone)]
pub struct SpaceIterator {
    space: SpaceId,
    last: Option<Bytes>,
    exhausted: bool,
}

impl SpaceIterator {
    /// The space this iterator walks.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Returns true once the iterator has run past the last record.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// An open transaction on the store.
///
/// Mutations apply immediately and are recorded in an undo log, so reads inside
/// the transaction see its own writes.
pub struct Transaction<'a> {
    spaces: RwLockWriteGuard<'a, HashMap<SpaceId, Space>>,
    undo: Vec<Undo>,
    store: &'a StorageEngine,
    finished: bool,
}

impl Transaction<'_> {
    fn space(&self, id: SpaceId) -> StoreResult<&Space> {
        self.spaces.get(&id).ok_or_else(|| StoreError::no_such_space(id))
    }

    fn space_mut(&mut self, id: SpaceId) -> StoreResult<&mut Space> {
        self.spaces
            .get_mut(&id)
            .ok_or_else(|| StoreError::no_such_space(id))
    }

    /// Reads a record by key.
    pub fn get(&self, id: SpaceId, key: &[u8]) -> StoreResult<Option<Record>> {
        Ok(self.space(id)?.index.get(key).cloned())
    }

    /// Number of records in a space, including this transaction's writes.
    pub fn len(&self, id: SpaceId) -> StoreResult<usize> {
        Ok(self.space(id)?.index.len())
    }

    /// Inserts or replaces a record, returning the previous one.
    pub fn replace(&mut self, id: SpaceId, record: Record) -> StoreResult<Option<Record>> {
        let key = record.key.clone();
        let old = self.space_mut(id)?.index.insert(key.clone(), record);
        self.undo.push(match &old {
            Some(previous) => Undo::Restore(id, previous.clone()),
            None => Undo::Remove(id, key),
        });
        Ok(old)
    }

    /// Deletes a record by primary key, returning it if it existed.
    pub fn delete(&mut self, id: SpaceId, key: &[u8]) -> StoreResult<Option<Record>> {
        let old = self.space_mut(id)?.index.remove(key);
        if let Some(previous) = &old {
            self.undo.push(Undo::Restore(id, previous.clone()));
        }
        Ok(old)
    }

    /// Removes every record in a space, returning how many were removed.
    pub fn truncate(&mut self, id: SpaceId) -> StoreResult<usize> {
        let index = std::mem::take(&mut self.space_mut(id)?.index);
        let removed = index.len();
        self.undo
            .extend(index.into_values().map(|record| Undo::Restore(id, record)));
        Ok(removed)
    }

    /// Advances an iterator, returning the next record in key order.
    ///
    /// Returns `Ok(None)` once the space is exhausted; the iterator stays
    /// exhausted afterwards.
    pub fn next(&mut self, iter: &mut SpaceIterator) -> StoreResult<Option<Record>> {
        let space = self.space(iter.space)?;
        if iter.exhausted {
            return Ok(None);
        }

        let lower = match &iter.last {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Unbounded,
        };
        let next = space
            .index
            .range::<Bytes, _>((lower, Bound::Unbounded))
            .next()
            .map(|(_, record)| record.clone());

        match &next {
            Some(record) => iter.last = Some(record.key.clone()),
            None => iter.exhausted = true,
        }
        Ok(next)
    }

    /// Makes every change in this transaction permanent.
    pub fn commit(mut self) {
        self.undo.clear();
        self.finished = true;
        self.store.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Reverts every change made in this transaction.
    pub fn rollback(mut self) {
        self.revert();
    }

    fn revert(&mut self) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Remove(id, key) => {
                    if let Some(space) = self.spaces.get_mut(&id) {
                        space.index.remove(&key);
                    }
                }
                Undo::Restore(id, record) => {
                    if let Some(space) = self.spaces.get_mut(&id) {
                        space.index.insert(record.key.clone(), record);
                    }
                }
            }
        }
        self.finished = true;
        self.store.rollbacks.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.revert();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    const SPACE: SpaceId = 512;

    fn record(key: &str, value: &str) -> Record {
        Record::new(Bytes::from(key.to_string()), Bytes::from(value.to_string()), 0, 0, 1, 0)
    }

    fn store_with(keys: &[&str]) -> StorageEngine {
        let store = StorageEngine::new();
        store.create_space(SPACE, "cache").unwrap();
        let mut txn = store.begin();
        for key in keys {
            txn.replace(SPACE, record(key, "v")).unwrap();
        }
        txn.commit();
        store
    }

    #[test]
    fn test_create_and_drop_space() {
        let store = StorageEngine::new();
        store.create_space(SPACE, "cache").unwrap();
        assert_eq!(store.space_name(SPACE).unwrap(), "cache");

        let err = store.create_space(SPACE, "again").unwrap_err();
        assert_eq!(err.code(), codes::SPACE_EXISTS);

        store.drop_space(SPACE).unwrap();
        let err = store.len(SPACE).unwrap_err();
        assert_eq!(err.code(), codes::NO_SUCH_SPACE);
    }

    #[test]
    fn test_commit_keeps_changes() {
        let store = store_with(&["a"]);
        let mut txn = store.begin();
        txn.replace(SPACE, record("b", "2")).unwrap();
        txn.delete(SPACE, b"a").unwrap();
        txn.commit();

        assert!(store.get(SPACE, b"a").unwrap().is_none());
        assert_eq!(store.get(SPACE, b"b").unwrap().unwrap().value, Bytes::from("2"));
    }

    #[test]
    fn test_rollback_restores_state() {
        let store = store_with(&["a", "b"]);
        let mut txn = store.begin();
        txn.replace(SPACE, record("a", "changed")).unwrap();
        txn.replace(SPACE, record("c", "new")).unwrap();
        txn.delete(SPACE, b"b").unwrap();
        assert_eq!(txn.len(SPACE).unwrap(), 2);
        txn.rollback();

        assert_eq!(store.len(SPACE).unwrap(), 2);
        assert_eq!(store.get(SPACE, b"a").unwrap().unwrap().value, Bytes::from("v"));
        assert!(store.get(SPACE, b"b").unwrap().is_some());
        assert!(store.get(SPACE, b"c").unwrap().is_none());
    }

    #[test]
    fn test_drop_rolls_back() {
        let store = store_with(&["a"]);
        {
            let mut txn = store.begin();
            txn.truncate(SPACE).unwrap();
        }
        assert_eq!(store.len(SPACE).unwrap(), 1);
        assert_eq!(store.txn_stats(), (1, 1));
    }

    #[test]
    fn test_iterator_walks_in_key_order() {
        let store = store_with(&["c", "a", "b"]);
        let mut iter = store.iterator(SPACE).unwrap();
        let mut txn = store.begin();

        let mut seen = Vec::new();
        while let Some(record) = txn.next(&mut iter).unwrap() {
            seen.push(record.key);
        }
        assert_eq!(seen, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
        assert!(iter.is_exhausted());
        assert!(txn.next(&mut iter).unwrap().is_none());
    }

    #[test]
    fn test_iterator_resumes_across_transactions() {
        let store = store_with(&["a", "b", "c", "d"]);
        let mut iter = store.iterator(SPACE).unwrap();

        {
            let mut txn = store.begin();
            let first = txn.next(&mut iter).unwrap().unwrap();
            assert_eq!(first.key, Bytes::from("a"));
            // Deleting the current key must not disturb the cursor.
            txn.delete(SPACE, b"a").unwrap();
            txn.commit();
        }

        // A key inserted behind the cursor is not revisited in this pass.
        {
            let mut txn = store.begin();
            txn.replace(SPACE, record("0", "v")).unwrap();
            txn.commit();
        }

        let mut txn = store.begin();
        assert_eq!(txn.next(&mut iter).unwrap().unwrap().key, Bytes::from("b"));
        assert_eq!(txn.next(&mut iter).unwrap().unwrap().key, Bytes::from("c"));
        assert_eq!(txn.next(&mut iter).unwrap().unwrap().key, Bytes::from("d"));
        assert!(txn.next(&mut iter).unwrap().is_none());
    }

    #[test]
    fn test_iterator_on_dropped_space_fails() {
        let store = store_with(&["a"]);
        let mut iter = store.iterator(SPACE).unwrap();
        store.drop_space(SPACE).unwrap();

        let mut txn = store.begin();
        let err = txn.next(&mut iter).unwrap_err();
        assert_eq!(err.code(), codes::NO_SUCH_SPACE);
    }

    #[test]
    fn test_concurrent_writers() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(store_with(&[]));
        let mut handles = vec![];

        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    let mut txn = store.begin();
                    txn.replace(SPACE, record(&format!("key-{}-{}", i, j), "v"))
                        .unwrap();
                    txn.commit();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(SPACE).unwrap(), 800);
    }
}
