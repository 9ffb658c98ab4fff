//! # tracevault Core
//!
//! Domain types, the store contract, and error definitions for the
//! tracevault audit subsystem. This crate defines the model that every
//! other crate implements against: the [`AuditEntry`] record, the
//! [`AuditStore`] persistence trait, query/filter types, and the shared
//! trace summary projection.
//!
//! Implementations (memory, file, SQL stores; the trace context; the
//! lifecycle interceptor) live in their respective crates and depend
//! inward on this one.

pub mod entry;
pub mod error;
pub mod store;
pub mod summary;

// Re-export key types at crate root for ergonomics
pub use entry::{AuditEntry, Cost, EntryStatus, SpanOutcome, TokenUsage};
pub use error::{AuditError, EntryError, Result, StoreError};
pub use store::{
    AuditStore, BatchOutcome, EntryFilter, EntryQuery, OrderBy, OrderDir, StoreStats, TraceRecord,
};
pub use summary::TraceSummary;
