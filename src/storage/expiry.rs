//! Expiration Engine
//!
//! The backing store has no notion of TTL, so every service runs one
//! background task that walks its space and deletes records whose exptime has
//! passed. Lazy expiry (on access) still happens in the command handlers; this
//! task catches the records nobody reads again.
//!
//! ## Sweep
//!
//! The task is a perpetual sweep over the space's primary index:
//!
//! 1. take (or keep) a cursor over the space
//! 2. in one transaction, visit up to `batch_size` records and delete the
//!    expired ones; when the cursor runs out, commit and start over on the
//!    next round
//! 3. sleep for the pacing delay, the only point where it can be cancelled
//!
//! ## Pacing
//!
//! ```text
//!   delay = min(1s, batch_size * time_budget / (space_len + 1))
//! ```
//!
//! A small space is swept almost continuously, a large one slowly enough that
//! a full pass takes about `time_budget` seconds. The cap keeps the task from
//! sleeping for long stretches when the space is tiny.
//!
//! Cancellation goes through a `watch` channel polled only in the `select!`
//! around that sleep; a batch in flight always commits or rolls back first.

use crate::error::StoreResult;
use crate::service::Service;
use crate::storage::engine::SpaceIterator;
use crate::storage::record::now_secs;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Computes the sleep between two expiration batches.
///
/// The result is always within `[0, 1]` seconds and never grows as the space
/// grows.
pub fn pacing_delay(batch_size: u32, time_budget: u32, len: usize) -> Duration {
    let secs = f64::from(batch_size) * f64::from(time_budget) / (len as f64 + 1.0);
    Duration::from_secs_f64(secs.clamp(0.0, 1.0))
}

/// Runs one expiration batch.
///
/// Visits up to `batch` records starting at `cursor` (or at the beginning of
/// the space when `cursor` is `None`) and deletes the expired ones, all inside
/// one transaction. Returns the cursor to resume from, or `None` once the space
/// has been fully walked.
///
/// On error the transaction is rolled back and nothing is counted.
pub fn expire_batch(
    service: &Service,
    cursor: Option<SpaceIterator>,
    batch: u32,
) -> StoreResult<Option<SpaceIterator>> {
    let store = service.store();
    let mut iter = match cursor {
        Some(iter) => iter,
        None => store.iterator(service.space_id())?,
    };

    let now = now_secs();
    let flush = service.flush_time();
    let mut expired = 0u64;

    let mut txn = store.begin();
    for _ in 0..batch {
        let Some(record) = txn.next(&mut iter)? else {
            break;
        };
        if record.is_expired(now, flush) {
            txn.delete(iter.space(), &record.key)?;
            expired += 1;
        }
    }
    txn.commit();

    if expired > 0 {
        service.stats().evicted(expired);
        debug!(service = %service.name(), expired, "Expired records removed");
    }

    Ok(if iter.is_exhausted() { None } else { Some(iter) })
}

/// Handle to a running expiration task.
///
/// Dropping the handle drops the shutdown sender, which also ends the task at
/// its next sleep.
#[derive(Debug)]
pub struct ExpireTask {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ExpireTask {
    /// Spawns the expiration task for a service.
    ///
    /// The task only holds a weak reference, so it never keeps the service
    /// alive; it ends on its own once the service is gone.
    pub fn spawn(service: Weak<Service>, name: &str) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(expire_loop(service, shutdown_rx));

        info!(service = %name, "Expire task started");

        Self { shutdown_tx, join }
    }

    /// Requests cancellation and waits for the task to end.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "Expire task did not end cleanly");
        }
    }

    /// Returns true once the task has ended, for any reason.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Runs one batch and computes the sleep before the next one.
fn sweep_step(
    service: &Service,
    cursor: Option<SpaceIterator>,
) -> StoreResult<(Option<SpaceIterator>, Duration)> {
    let config = service.config().expire;
    let cursor = expire_batch(service, cursor, config.batch_size)?;
    let len = service.store().len(service.space_id())?;
    Ok((cursor, pacing_delay(config.batch_size, config.time_budget, len)))
}

async fn expire_loop(service: Weak<Service>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut cursor = None;

    loop {
        let delay = {
            let Some(service) = service.upgrade() else {
                debug!("Service dropped, expire task exiting");
                return;
            };
            match sweep_step(&service, cursor.take()) {
                Ok((next, delay)) => {
                    cursor = next;
                    delay
                }
                Err(e) => {
                    error!(
                        service = %service.name(),
                        code = e.code(),
                        error = %e.message(),
                        "Expire task failed"
                    );
                    return;
                }
            }
        };

        trace!(delay_ms = delay.as_millis() as u64, "Expire task sleeping");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expire task received shutdown signal");
                    return;
                }
            }
        }
    }
}
