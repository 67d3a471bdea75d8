//! Command Handler Module
//!
//! This module implements the command processing layer for FlashMC.
//! Protocol handlers decode a request, call the matching [`CommandHandler`]
//! method, and encode whatever it returns.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ Text / Binary   │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Validate     │
//! │  - Expire lazily│
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ StorageEngine   │  (storage module)
//! └─────────────────┘
//! ```
//!
//! Failures come back as [`StoreError`](crate::error::StoreError)s carrying an
//! [`ErrorKind`](crate::error::ErrorKind); each protocol renders them its own
//! way.

pub mod handler;

// Re-export the main command handler
pub use handler::{ArithOp, CommandHandler, StoreMode, MAX_KEY_LENGTH, MAX_VALUE_SIZE};
