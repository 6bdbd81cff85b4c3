//! SQLite-backed task store.
//!
//! This crate provides:
//! - Task CRUD with compare-and-set status writes
//! - Filtered, paginated listing
//! - Per-task log entries
//! - Store statistics and old-task cleanup
//! - Integrity checks, best-effort repair and reset
//! - Online backups and restore

pub mod backup;
pub mod error;
pub mod integrity;
pub mod schema;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use schema::SCHEMA_VERSION;
pub use store::{StoreConfig, TaskStore};
