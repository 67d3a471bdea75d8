//! Connection Module
//!
//! This module manages individual client connections to FlashMC.
//! Each client connection is handled by its own async task, allowing
//! the server to handle thousands of concurrent clients efficiently.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Read bytes  │───>│ Protocol::  │───>│ Protocol::  │      │
//! │  │ into input  │    │ parse       │    │ process     │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      ┌─────────────┐        │
//! │                                      │ Flush output│        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Layout
//!
//! - [`state`]: the buffers and flags a protocol works on
//! - [`buffer`]: output segments, savepoints and the input buffer pool
//! - [`handler`]: the engine that drives a connection
//!
//! ## Example
//!
//! ```ignore
//! use flashmc::connection::handle_connection;
//! use flashmc::service::Service;
//! use flashmc::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! let store = Arc::new(StorageEngine::new());
//! store.create_space(512, "cache")?;
//! let service = Service::new("cache", 512, store);
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, Arc::clone(&service)));
//! ```

pub mod buffer;
pub mod handler;
pub mod state;

// Re-export commonly used types
pub use buffer::{BufferPool, OutputBuffer, Savepoint};
pub use handler::{escalate, handle_connection, ConnectionError, ConnectionHandler};
pub use state::ConnectionState;
