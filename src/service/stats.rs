//! Service Statistics
//!
//! Counters shared by every connection and the expiration task of a service.
//! Connections run on a multi-threaded runtime, so each counter is an
//! `AtomicU64` updated with relaxed ordering: we only need each counter to be
//! exact on its own, not consistent with its neighbours.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of a service.
#[derive(Debug, Default)]
pub struct ServiceStats {
    pub total_items: AtomicU64,
    pub curr_conns: AtomicU64,
    pub total_conns: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,

    pub cmd_get: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,

    pub cmd_delete: AtomicU64,
    pub delete_hits: AtomicU64,
    pub delete_misses: AtomicU64,

    pub cmd_set: AtomicU64,
    pub cas_hits: AtomicU64,
    pub cas_badval: AtomicU64,
    pub cas_misses: AtomicU64,

    pub cmd_incr: AtomicU64,
    pub incr_hits: AtomicU64,
    pub incr_misses: AtomicU64,
    pub cmd_decr: AtomicU64,
    pub decr_hits: AtomicU64,
    pub decr_misses: AtomicU64,

    pub cmd_touch: AtomicU64,
    pub touch_hits: AtomicU64,
    pub touch_misses: AtomicU64,
    pub cmd_flush: AtomicU64,

    /// Records removed by the expiration task
    pub evictions: AtomicU64,
    /// Expired records removed lazily on access
    pub reclaimed: AtomicU64,
}

/// Increments a counter by one.
#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ServiceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        bump(&self.curr_conns);
        bump(&self.total_conns);
    }

    pub fn connection_closed(&self) {
        self.curr_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn evicted(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Number of connections currently open.
    pub fn current_connections(&self) -> u64 {
        self.curr_conns.load(Ordering::Acquire)
    }

    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            total_items: load(&self.total_items),
            curr_conns: load(&self.curr_conns),
            total_conns: load(&self.total_conns),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            cmd_get: load(&self.cmd_get),
            get_hits: load(&self.get_hits),
            get_misses: load(&self.get_misses),
            cmd_delete: load(&self.cmd_delete),
            delete_hits: load(&self.delete_hits),
            delete_misses: load(&self.delete_misses),
            cmd_set: load(&self.cmd_set),
            cas_hits: load(&self.cas_hits),
            cas_badval: load(&self.cas_badval),
            cas_misses: load(&self.cas_misses),
            cmd_incr: load(&self.cmd_incr),
            incr_hits: load(&self.incr_hits),
            incr_misses: load(&self.incr_misses),
            cmd_decr: load(&self.cmd_decr),
            decr_hits: load(&self.decr_hits),
            decr_misses: load(&self.decr_misses),
            cmd_touch: load(&self.cmd_touch),
            touch_hits: load(&self.touch_hits),
            touch_misses: load(&self.touch_misses),
            cmd_flush: load(&self.cmd_flush),
            evictions: load(&self.evictions),
            reclaimed: load(&self.reclaimed),
        }
    }
}

/// Plain copy of [`ServiceStats`] at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_items: u64,
    pub curr_conns: u64,
    pub total_conns: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub cmd_get: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub cmd_delete: u64,
    pub delete_hits: u64,
    pub delete_misses: u64,
    pub cmd_set: u64,
    pub cas_hits: u64,
    pub cas_badval: u64,
    pub cas_misses: u64,
    pub cmd_incr: u64,
    pub incr_hits: u64,
    pub incr_misses: u64,
    pub cmd_decr: u64,
    pub decr_hits: u64,
    pub decr_misses: u64,
    pub cmd_touch: u64,
    pub touch_hits: u64,
    pub touch_misses: u64,
    pub cmd_flush: u64,
    pub evictions: u64,
    pub reclaimed: u64,
}

impl StatsSnapshot {
    /// Counters as `(name, value)` pairs, in the order `stats` reports them.
    pub fn entries(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("total_items", self.total_items),
            ("curr_connections", self.curr_conns),
            ("total_connections", self.total_conns),
            ("bytes_read", self.bytes_read),
            ("bytes_written", self.bytes_written),
            ("cmd_get", self.cmd_get),
            ("get_hits", self.get_hits),
            ("get_misses", self.get_misses),
            ("cmd_delete", self.cmd_delete),
            ("delete_hits", self.delete_hits),
            ("delete_misses", self.delete_misses),
            ("cmd_set", self.cmd_set),
            ("cas_hits", self.cas_hits),
            ("cas_badval", self.cas_badval),
            ("cas_misses", self.cas_misses),
            ("cmd_incr", self.cmd_incr),
            ("incr_hits", self.incr_hits),
            ("incr_misses", self.incr_misses),
            ("cmd_decr", self.cmd_decr),
            ("decr_hits", self.decr_hits),
            ("decr_misses", self.decr_misses),
            ("cmd_touch", self.cmd_touch),
            ("touch_hits", self.touch_hits),
            ("touch_misses", self.touch_misses),
            ("cmd_flush", self.cmd_flush),
            ("evictions", self.evictions),
            ("reclaimed", self.reclaimed),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let stats = ServiceStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.curr_conns, 1);
        assert_eq!(snap.total_conns, 2);
        assert_eq!(stats.current_connections(), 1);
    }

    #[test]
    fn test_byte_counters() {
        let stats = ServiceStats::new();
        stats.bytes_read(10);
        stats.bytes_read(5);
        stats.bytes_written(7);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_read, 15);
        assert_eq!(snap.bytes_written, 7);
    }

    #[test]
    fn test_entries_cover_evictions() {
        let stats = ServiceStats::new();
        stats.evicted(3);
        let entries = stats.snapshot().entries();
        assert!(entries.contains(&("evictions", 3)));
        assert!(entries.contains(&("reclaimed", 0)));
    }
}
