//! # FlashMC - A memcached-compatible cache front end
//!
//! FlashMC serves the memcached text and binary protocols on top of a
//! transactional, space-partitioned key-value store. Expired items are removed
//! lazily on access and by a self-throttling background sweep.
//!
//! ## Features
//!
//! - **memcached-Compatible**: text and binary protocols, negotiated per
//!   connection from the first byte
//! - **Pipelining**: up to `batch_count` requests answered per vectored write
//! - **TTL Support**: memcached exptime semantics plus delayed `flush_all`
//! - **Async I/O**: Built on Tokio for handling thousands of concurrent connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              FlashMC                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Protocol   │                  │
//! │  │ (Listener)  │    │  Handler    │    │ text/binary │                  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │                  ▼                         │
//! │                            │           ┌─────────────┐                  │
//! │                            │           │  Command    │                  │
//! │                            │           │  Handler    │                  │
//! │                            │           └──────┬──────┘                  │
//! │                            ▼                  ▼                         │
//! │  ┌──────────────────────────┐    ┌───────────────────────────────────┐ │
//! │  │         Service          │    │          StorageEngine            │ │
//! │  │ config, stats, cas, pool │    │  spaces ─ BTreeMap, transactions  │ │
//! │  └────────────┬─────────────┘    └───────────────────────────────────┘ │
//! │               │                                   ▲                     │
//! │               ▼                                   │                     │
//! │  ┌────────────────────────────────────────────────┴──────────────────┐ │
//! │  │                 ExpireTask (Background Tokio Task)                │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashmc::connection::handle_connection;
//! use flashmc::service::Service;
//! use flashmc::storage::StorageEngine;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Create the backing store and the space the cache lives in
//!     let store = Arc::new(StorageEngine::new());
//!     store.create_space(512, "cache")?;
//!
//!     // Create the service and start its expiration task
//!     let service = Service::new("cache", 512, store);
//!     service.start()?;
//!
//!     // Start listening for connections
//!     let listener = TcpListener::bind("127.0.0.1:11211").await?;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         tokio::spawn(handle_connection(stream, addr, Arc::clone(&service)));
//!     }
//! }
//! ```
//!
//! ## Supported Commands
//!
//! ### Retrieval
//! - `get <key>*` / `gets <key>*`
//! - `gat <exptime> <key>*` / `gats <exptime> <key>*`
//!
//! ### Storage
//! - `set` / `add` / `replace` / `append` / `prepend`
//!   `<key> <flags> <exptime> <bytes> [noreply]`
//! - `cas <key> <flags> <exptime> <bytes> <cas unique> [noreply]`
//!
//! ### Other
//! - `delete <key> [noreply]`
//! - `incr <key> <value> [noreply]` / `decr <key> <value> [noreply]`
//! - `touch <key> <exptime> [noreply]`
//! - `flush_all [delay] [noreply]`
//! - `stats`, `version`, `verbosity <level> [noreply]`, `quit`
//!
//! The binary protocol carries the same commands plus `noop` and the quiet
//! variants.
//!
//! ## Module Overview
//!
//! - [`protocol`]: text and binary wire protocols behind one trait
//! - [`commands`]: the memcached command set over the store
//! - [`connection`]: per-connection state and the connection engine
//! - [`service`]: configuration, statistics and lifecycle of a cache instance
//! - [`storage`]: the transactional store, records and the expiration engine
//! - [`error`]: coded store errors shared by all of the above
//!
//! ## Design Highlights
//!
//! ### Lazy + Active Expiry
//!
//! Items with an exptime are expired in two ways:
//! 1. **Lazy**: When an item is accessed, we check if it's expired
//! 2. **Active**: A background task walks the space in small transactions,
//!    pacing itself so a full sweep takes about `expire_time_budget` seconds
//!
//! This ensures memory is reclaimed even for items that are never accessed again.

pub mod commands;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod service;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use connection::{handle_connection, ConnectionError, ConnectionHandler};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use protocol::{BinaryProtocol, Protocol, TextProtocol};
pub use service::{ProtocolMode, Service, ServiceConfig, ServiceError};
pub use storage::{ExpireTask, Record, StorageEngine};

/// The default port FlashMC listens on (same as memcached)
pub const DEFAULT_PORT: u16 = 11211;

/// The default host FlashMC binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FlashMC
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
