//! Audit store implementations for tracevault.
//!
//! Three backends honor the [`tracevault_core::AuditStore`] contract:
//! in-memory (bounded, lock-protected), an append-only file log
//! (NDJSON or JSON array, batched and rotated), and a SQL store over
//! `sqlx`. The [`registry`] resolves configured store names — including
//! the `database`/`db` aliases — and hosts custom factories.

pub mod file;
pub mod filter;
pub mod in_memory;
pub mod registry;

#[cfg(feature = "sqlite")]
pub mod sql;

pub use file::{FileFormat, FileStore, FileStoreConfig};
pub use in_memory::{MemoryStore, MemoryStoreConfig};
pub use registry::StoreRegistry;

#[cfg(feature = "sqlite")]
pub use sql::{SqlStore, SqlStoreConfig};
