//! Storage Module
//!
//! The backing store FlashMC fronts, plus the expiration engine that adds
//! memcached TTL semantics on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌────────────────┐ ┌────────────────┐                      │
//! │  │ Space 512      │ │ Space ...      │   ordered BTreeMap   │
//! │  │ key -> Record  │ │ key -> Record  │   per space          │
//! │  └────────────────┘ └────────────────┘                      │
//! │         transactions with undo log, resumable cursors       │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │ batch of deletes per transaction
//!              ┌─────────────┴─────────────┐
//!              │        ExpireTask         │
//!              │  (one Tokio task/service) │
//!              └───────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Spaces**: independent ordered collections, addressed by id
//! - **Transactions**: writes apply in place, rollback replays an undo log
//! - **Cursors**: iteration survives concurrent inserts and deletes
//! - **Coded Errors**: every failure carries a numeric code
//! - **Active Expiry**: a paced background sweep deletes expired records

pub mod engine;
pub mod expiry;
pub mod record;

// Re-export commonly used types
pub use engine::{SpaceId, SpaceIterator, StorageEngine, Transaction};
pub use expiry::{expire_batch, pacing_delay, ExpireTask};
pub use record::{absolute_exptime, now_secs, Record, MAX_RELATIVE_EXPTIME};
