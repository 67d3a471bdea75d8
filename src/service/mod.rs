//! Cache Service
//!
//! A [`Service`] is one named cache instance: it binds a space of the backing
//! store to the memcached front end and owns everything its connections and
//! its expiration task share.
//!
//! ## Ownership
//!
//! ```text
//!                     ┌──────────────────────────────┐
//!                     │           Service            │
//!                     │  name, space id              │
//!                     │  RwLock<ServiceConfig>       │
//!                     │  ServiceStats (atomics)      │
//!                     │  cas counter, flush deadline │
//!                     │  BufferPool                  │
//!                     │  Option<ExpireTask>          │
//!                     └───────┬──────────────┬───────┘
//!               Arc<Service>  │              │  Weak<Service>
//!                             ▼              ▼
//!                  ConnectionHandler    expiration task
//!                   (one per socket)    (one per service)
//! ```
//!
//! ## Lifecycle
//!
//! 1. [`Service::new`]: create with a name and a space id
//! 2. [`Service::start`]: launch the expiration task if enabled
//! 3. serve connections with [`handle_connection`](crate::connection::handle_connection)
//! 4. [`Service::stop`]: stop the expiration task, then wait for every
//!    connection to close
//! 5. [`Service::destroy`]: stop and release

pub mod config;
pub mod stats;

pub use config::{
    clamp_verbosity, ExpireConfig, ProtocolMode, ServiceConfig, UnknownProtocol,
    DEFAULT_BATCH_COUNT, DEFAULT_EXPIRE_BATCH_SIZE, DEFAULT_EXPIRE_TIME_BUDGET,
    DEFAULT_READAHEAD, MAX_VERBOSITY,
};
pub use stats::{ServiceStats, StatsSnapshot};

use crate::connection::buffer::BufferPool;
use crate::storage::expiry::ExpireTask;
use crate::storage::{SpaceId, StorageEngine};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Errors from service lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// At most one expiration task may run per service
    #[error("expire task is already running for service '{0}'")]
    ExpireAlreadyRunning(String),
}

/// One named cache instance.
pub struct Service {
    name: String,
    space_id: SpaceId,
    store: Arc<StorageEngine>,
    config: RwLock<ServiceConfig>,
    stats: ServiceStats,

    /// Next CAS stamp; starts at 1
    cas: AtomicU64,

    /// Pending `flush_all` deadline in unix seconds (0 = none)
    flush: AtomicU64,

    started: AtomicBool,
    started_at: Instant,
    expire: Mutex<Option<ExpireTask>>,

    /// Signalled whenever a connection closes
    idle: Notify,

    buffers: BufferPool,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("space_id", &self.space_id)
            .field("config", &self.config())
            .field("curr_conns", &self.stats.current_connections())
            .field("expire_running", &self.is_expire_running())
            .finish()
    }
}

impl Service {
    /// Creates a service with the default configuration.
    ///
    /// The space is not checked here; a missing space surfaces as a store error
    /// on first use.
    pub fn new(name: impl Into<String>, space_id: SpaceId, store: Arc<StorageEngine>) -> Arc<Self> {
        Self::with_config(name, space_id, store, ServiceConfig::default())
    }

    /// Creates a service with an explicit configuration.
    pub fn with_config(
        name: impl Into<String>,
        space_id: SpaceId,
        store: Arc<StorageEngine>,
        config: ServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            space_id,
            store,
            config: RwLock::new(config),
            stats: ServiceStats::new(),
            cas: AtomicU64::new(1),
            flush: AtomicU64::new(0),
            started: AtomicBool::new(false),
            started_at: Instant::now(),
            expire: Mutex::new(None),
            idle: Notify::new(),
            buffers: BufferPool::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn store(&self) -> &Arc<StorageEngine> {
        &self.store
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Seconds since the service was created.
    pub fn uptime(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Returns a snapshot of the current configuration.
    pub fn config(&self) -> ServiceConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_config(&self, f: impl FnOnce(&mut ServiceConfig)) -> ServiceConfig {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut config);
        *config
    }

    /// Returns a fresh CAS stamp. Stamps strictly increase.
    pub fn next_cas(&self) -> u64 {
        self.cas.fetch_add(1, Ordering::Relaxed)
    }

    /// The pending `flush_all` deadline (0 = none).
    pub fn flush_time(&self) -> u64 {
        self.flush.load(Ordering::Relaxed)
    }

    pub(crate) fn set_flush_time(&self, deadline: u64) {
        self.flush.store(deadline, Ordering::Relaxed);
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_readahead(&self, bytes: usize) {
        self.update_config(|c| c.readahead = bytes.max(1));
    }

    pub fn set_batch_count(&self, count: usize) {
        self.update_config(|c| c.batch_count = count.max(1));
    }

    /// Sets how many records one expiration transaction visits.
    ///
    /// A running expiration task picks the new value up on its next batch.
    pub fn set_expire_batch_size(&self, batch_size: u32) {
        self.update_config(|c| c.expire.batch_size = batch_size.max(1));
    }

    /// Sets the target duration of a full sweep, in seconds.
    pub fn set_expire_time_budget(&self, seconds: u32) {
        self.update_config(|c| c.expire.time_budget = seconds);
    }

    /// Enables or disables expiry.
    ///
    /// Disabling cancels the running expiration task and waits for it to end.
    /// Enabling a started service launches a fresh task.
    pub async fn set_expire_enabled(self: &Arc<Self>, enabled: bool) -> Result<(), ServiceError> {
        self.update_config(|c| c.expire.enabled = enabled);
        if !enabled {
            self.stop_expire().await;
        } else if self.started.load(Ordering::Acquire) && !self.is_expire_running() {
            self.start_expire()?;
        }
        Ok(())
    }

    pub fn set_flush_enabled(&self, enabled: bool) {
        self.update_config(|c| c.flush_enabled = enabled);
    }

    /// Sets the verbosity level, clamping values above
    /// [`MAX_VERBOSITY`]. Returns the level applied.
    pub fn set_verbosity(&self, level: u32) -> u8 {
        self.update_config(|c| c.verbosity = clamp_verbosity(level))
            .verbosity
    }

    pub fn set_protocol(&self, mode: ProtocolMode) {
        self.update_config(|c| c.protocol = mode);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts the service, launching the expiration task if expiry is enabled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        self.started.store(true, Ordering::Release);
        if self.config().expire.enabled {
            self.start_expire()?;
        }
        info!(service = %self.name, space = self.space_id, "Service started");
        Ok(())
    }

    /// Launches the expiration task.
    ///
    /// Fails if a task is already running. A task that ended on its own (after
    /// a store error) no longer counts as running and is replaced.
    pub fn start_expire(self: &Arc<Self>) -> Result<(), ServiceError> {
        let mut slot = self.expire.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(ServiceError::ExpireAlreadyRunning(self.name.clone()));
        }
        *slot = Some(ExpireTask::spawn(Arc::downgrade(self), &self.name));
        Ok(())
    }

    /// Cancels the expiration task and waits for it to end.
    pub async fn stop_expire(&self) {
        let task = self
            .expire
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
            debug!(service = %self.name, "Expire task joined");
        }
    }

    /// Returns true while the expiration task is scheduled.
    pub fn is_expire_running(&self) -> bool {
        self.expire
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the expiration task, then waits until no connection is open.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.stop_expire().await;
        self.wait_idle().await;
        info!(service = %self.name, "Service stopped");
    }

    /// Stops the service and releases it.
    pub async fn destroy(self: Arc<Self>) {
        self.stop().await;
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a close between the check and the
            // await is not missed.
            notified.as_mut().enable();
            if self.stats.current_connections() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.stats.connection_opened();
    }

    pub(crate) fn connection_closed(&self) {
        self.stats.connection_closed();
        self.idle.notify_waiters();
    }
}
