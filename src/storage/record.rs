//! Stored Records and Expiry Time
//!
//! A [`Record`] is one cache item as the backing store holds it. Expiry is an
//! absolute unix timestamp in seconds, with `0` meaning "never".
//!
//! ## Exptime on the wire
//!
//! Clients send memcached-style exptimes, which are converted on the way in:
//!
//! ```text
//!   0                    never expires
//!   1 ..= 30 days        relative, seconds from now
//!   > 30 days            absolute unix timestamp
//!   < 0                  already expired
//! ```

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest exptime still interpreted as relative (30 days).
pub const MAX_RELATIVE_EXPTIME: i64 = 60 * 60 * 24 * 30;

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Converts a wire exptime into an absolute expiry timestamp.
pub fn absolute_exptime(exptime: i64, now: u64) -> u64 {
    match exptime {
        0 => 0,
        // Anything at or before the epoch+1 is already in the past.
        e if e < 0 => 1,
        e if e <= MAX_RELATIVE_EXPTIME => now + e as u64,
        e => e as u64,
    }
}

/// One cache entry in the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Primary key
    pub key: Bytes,
    /// Opaque value bytes
    pub value: Bytes,
    /// Client flags, returned verbatim
    pub flags: u32,
    /// Absolute expiry in unix seconds (0 = never)
    pub exptime: u64,
    /// When the record was last stored, in unix seconds
    pub time: u64,
    /// CAS stamp of the last mutation
    pub cas: u64,
}

impl Record {
    pub fn new(key: Bytes, value: Bytes, flags: u32, exptime: u64, cas: u64, now: u64) -> Self {
        Self {
            key,
            value,
            flags,
            exptime,
            time: now,
            cas,
        }
    }

    /// Checks whether this record is expired at `now`.
    ///
    /// `flush` is the service's pending `flush_all` deadline (0 = none): once it
    /// has passed, every record stored at or before it counts as expired.
    #[inline]
    pub fn is_expired(&self, now: u64, flush: u64) -> bool {
        (self.exptime != 0 && self.exptime <= now)
            || (flush != 0 && flush <= now && self.time <= flush)
    }
}
