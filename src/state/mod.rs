//! Transfer state persistence in SQLite
//!
//! Handles:
//! - Keyed transfer records with monotonic status
//! - Per-transfer write serialization
//! - Collection snapshots and per-status counts

mod store;

pub use store::TransferStore;
