//! Command Handler Module
//!
//! This module implements the memcached command semantics for FlashMC. Both
//! wire protocols decode their requests and call into the same
//! [`CommandHandler`], so a `set` behaves identically whether it arrived as a
//! text line or a binary packet.
//!
//! ## Supported Commands
//!
//! ### Retrieval
//! - `get` / `gets` - Fetch one or more items (with CAS for `gets`)
//! - `gat` / `gats` - Fetch and update the exptime
//!
//! ### Storage
//! - `set` - Store unconditionally
//! - `add` - Store only if the key is absent
//! - `replace` - Store only if the key is present
//! - `append` / `prepend` - Extend an existing value
//! - `cas` - Store only if the CAS stamp still matches
//!
//! ### Other
//! - `delete`, `incr`, `decr`, `touch`
//! - `flush_all [delay]` - Invalidate everything (can be disabled)
//! - `stats`, `version`, `verbosity`
//!
//! ## Expiry
//!
//! Every access re-checks the record against the current time and the pending
//! `flush_all` deadline. An expired record found on access is deleted right
//! there and counted as `reclaimed`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ TextProtocol │   │BinaryProtocol│
//! └──────┬───────┘   └──────┬───────┘
//!        └────────┬─────────┘
//!                 ▼
//!        ┌─────────────────┐
//!        │ CommandHandler  │──> ServiceStats
//!        └────────┬────────┘
//!                 ▼
//!          StorageEngine (one transaction per command)
//! ```

use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::service::stats::bump;
use crate::service::Service;
use crate::storage::{absolute_exptime, now_secs, Record, SpaceId, Transaction};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Longest key accepted, in bytes.
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest value accepted, in bytes (1 MB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// How a storage command treats an existing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    /// Store only if the item's CAS stamp equals this one
    Cas(u64),
}

/// Direction of an arithmetic command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Incr,
    Decr,
}

/// Executes memcached commands against a service's space.
#[derive(Clone)]
pub struct CommandHandler {
    service: Arc<Service>,
}

impl CommandHandler {
    /// Creates a new command handler for the given service.
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    fn space(&self) -> SpaceId {
        self.service.space_id()
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    /// Reads a live record inside a transaction, deleting it if it expired.
    fn load(
        &self,
        txn: &mut Transaction<'_>,
        key: &[u8],
        now: u64,
        flush: u64,
    ) -> StoreResult<Option<Record>> {
        match txn.get(self.space(), key)? {
            Some(record) if record.is_expired(now, flush) => {
                txn.delete(self.space(), key)?;
                bump(&self.service.stats().reclaimed);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Reads a live record, reclaiming it if it expired.
    fn lookup(&self, key: &[u8]) -> StoreResult<Option<Record>> {
        let now = now_secs();
        let flush = self.service.flush_time();
        match self.service.store().get(self.space(), key)? {
            Some(record) if record.is_expired(now, flush) => {
                let mut txn = self.service.store().begin();
                self.load(&mut txn, key, now, flush)?;
                txn.commit();
                Ok(None)
            }
            other => Ok(other),
        }
    }

    // ========================================================================
    // Retrieval Commands
    // ========================================================================

    /// get / gets
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Record>> {
        check_key(key)?;
        bump(&self.service.stats().cmd_get);

        let found = self.lookup(key)?;
        let stats = self.service.stats();
        bump(if found.is_some() {
            &stats.get_hits
        } else {
            &stats.get_misses
        });
        Ok(found)
    }

    /// gat / gats: fetch and set a new exptime
    pub fn get_and_touch(&self, key: &[u8], exptime: i64) -> StoreResult<Option<Record>> {
        check_key(key)?;
        let stats = self.service.stats();
        bump(&stats.cmd_get);
        bump(&stats.cmd_touch);

        let now = now_secs();
        let mut txn = self.service.store().begin();
        let Some(mut record) = self.load(&mut txn, key, now, self.service.flush_time())? else {
            txn.commit();
            bump(&stats.get_misses);
            bump(&stats.touch_misses);
            return Ok(None);
        };

        record.exptime = absolute_exptime(exptime, now);
        txn.replace(self.space(), record.clone())?;
        txn.commit();

        bump(&stats.get_hits);
        bump(&stats.touch_hits);
        Ok(Some(record))
    }

    // ========================================================================
    // Storage Commands
    // ========================================================================

    /// set / add / replace / append / prepend / cas
    ///
    /// Returns the CAS stamp of the stored item.
    pub fn store(
        &self,
        mode: StoreMode,
        key: Bytes,
        value: Bytes,
        flags: u32,
        exptime: i64,
    ) -> StoreResult<u64> {
        check_key(&key)?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::kind(ErrorKind::TooLarge));
        }

        let stats = self.service.stats();
        bump(&stats.cmd_set);

        let now = now_secs();
        let mut txn = self.service.store().begin();
        let current = self.load(&mut txn, &key, now, self.service.flush_time())?;

        let (value, flags, exptime) = match (mode, current) {
            (StoreMode::Add, Some(_)) => return Err(StoreError::kind(ErrorKind::NotStored)),
            (StoreMode::Replace | StoreMode::Append | StoreMode::Prepend, None) => {
                return Err(StoreError::kind(ErrorKind::NotStored))
            }
            (StoreMode::Cas(_), None) => {
                bump(&stats.cas_misses);
                return Err(StoreError::kind(ErrorKind::KeyNotFound));
            }
            (StoreMode::Cas(expected), Some(old)) if old.cas != expected => {
                bump(&stats.cas_badval);
                return Err(StoreError::kind(ErrorKind::KeyExists));
            }
            (StoreMode::Append, Some(old)) => (concat(&old.value, &value)?, old.flags, old.exptime),
            (StoreMode::Prepend, Some(old)) => (concat(&value, &old.value)?, old.flags, old.exptime),
            (mode, _) => {
                if matches!(mode, StoreMode::Cas(_)) {
                    bump(&stats.cas_hits);
                }
                (value, flags, absolute_exptime(exptime, now))
            }
        };

        let cas = self.service.next_cas();
        txn.replace(self.space(), Record::new(key, value, flags, exptime, cas, now))?;
        txn.commit();

        bump(&stats.total_items);
        Ok(cas)
    }

    /// delete
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        check_key(key)?;
        let stats = self.service.stats();
        bump(&stats.cmd_delete);

        let mut txn = self.service.store().begin();
        if self
            .load(&mut txn, key, now_secs(), self.service.flush_time())?
            .is_none()
        {
            txn.commit();
            bump(&stats.delete_misses);
            return Err(StoreError::kind(ErrorKind::KeyNotFound));
        }

        txn.delete(self.space(), key)?;
        txn.commit();
        bump(&stats.delete_hits);
        Ok(())
    }

    /// incr / decr
    ///
    /// Increments wrap around at 2^64, decrements stop at 0. When the key is
    /// missing and `initial` is given (binary protocol), the item is created
    /// with `(value, exptime)` instead of failing.
    ///
    /// Returns the new value and the item's CAS stamp.
    pub fn arith(
        &self,
        op: ArithOp,
        key: Bytes,
        delta: u64,
        initial: Option<(u64, i64)>,
    ) -> StoreResult<(u64, u64)> {
        check_key(&key)?;
        let stats = self.service.stats();
        let (cmd, hits, misses) = match op {
            ArithOp::Incr => (&stats.cmd_incr, &stats.incr_hits, &stats.incr_misses),
            ArithOp::Decr => (&stats.cmd_decr, &stats.decr_hits, &stats.decr_misses),
        };
        bump(cmd);

        let now = now_secs();
        let mut txn = self.service.store().begin();
        let current = self.load(&mut txn, &key, now, self.service.flush_time())?;

        let (value, flags, exptime) = match (current, initial) {
            (Some(old), _) => {
                let value = parse_counter(&old.value)?;
                let value = match op {
                    ArithOp::Incr => value.wrapping_add(delta),
                    ArithOp::Decr => value.saturating_sub(delta),
                };
                bump(hits);
                (value, old.flags, old.exptime)
            }
            (None, Some((value, exptime))) => {
                bump(misses);
                (value, 0, absolute_exptime(exptime, now))
            }
            (None, None) => {
                txn.commit();
                bump(misses);
                return Err(StoreError::kind(ErrorKind::KeyNotFound));
            }
        };

        let cas = self.service.next_cas();
        let record = Record::new(key, Bytes::from(value.to_string()), flags, exptime, cas, now);
        txn.replace(self.space(), record)?;
        txn.commit();
        Ok((value, cas))
    }

    /// touch: set a new exptime, keeping the CAS stamp
    pub fn touch(&self, key: &[u8], exptime: i64) -> StoreResult<()> {
        check_key(key)?;
        let stats = self.service.stats();
        bump(&stats.cmd_touch);

        let now = now_secs();
        let mut txn = self.service.store().begin();
        let Some(mut record) = self.load(&mut txn, key, now, self.service.flush_time())? else {
            txn.commit();
            bump(&stats.touch_misses);
            return Err(StoreError::kind(ErrorKind::KeyNotFound));
        };

        record.exptime = absolute_exptime(exptime, now);
        txn.replace(self.space(), record)?;
        txn.commit();
        bump(&stats.touch_hits);
        Ok(())
    }

    // ========================================================================
    // Server Commands
    // ========================================================================

    /// flush_all [delay]
    ///
    /// Without a delay every item is removed at once. With one, items stored up
    /// to the deadline count as expired once it passes.
    pub fn flush_all(&self, delay: i64) -> StoreResult<()> {
        if !self.service.config().flush_enabled {
            return Err(StoreError::protocol(
                ErrorKind::NotSupported,
                "flush_all is disabled",
            ));
        }
        bump(&self.service.stats().cmd_flush);

        if delay <= 0 {
            let mut txn = self.service.store().begin();
            txn.truncate(self.space())?;
            txn.commit();
            self.service.set_flush_time(0);
        } else {
            self.service
                .set_flush_time(absolute_exptime(delay, now_secs()));
        }
        Ok(())
    }

    /// verbosity: returns the level applied
    pub fn verbosity(&self, level: u32) -> u8 {
        self.service.set_verbosity(level)
    }

    /// version
    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    /// stats: `(name, value)` pairs in report order
    pub fn stats(&self) -> StoreResult<Vec<(String, String)>> {
        let curr_items = self.service.store().len(self.space())?;

        let mut report = vec![
            ("pid".to_string(), std::process::id().to_string()),
            ("uptime".to_string(), self.service.uptime().to_string()),
            ("time".to_string(), now_secs().to_string()),
            ("version".to_string(), crate::VERSION.to_string()),
            ("curr_items".to_string(), curr_items.to_string()),
        ];
        report.extend(
            self.service
                .stats()
                .snapshot()
                .entries()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_string())),
        );
        Ok(report)
    }
}

fn check_key(key: &[u8]) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::protocol(ErrorKind::InvalidArguments, "empty key"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StoreError::protocol(ErrorKind::InvalidArguments, "key too long"));
    }
    Ok(())
}

fn concat(head: &[u8], tail: &[u8]) -> StoreResult<Bytes> {
    if head.len() + tail.len() > MAX_VALUE_SIZE {
        return Err(StoreError::kind(ErrorKind::TooLarge));
    }
    let mut joined = BytesMut::with_capacity(head.len() + tail.len());
    joined.extend_from_slice(head);
    joined.extend_from_slice(tail);
    Ok(joined.freeze())
}

fn parse_counter(value: &[u8]) -> StoreResult<u64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim_end().parse().ok())
        .ok_or_else(|| StoreError::kind(ErrorKind::DeltaBadValue))
}
