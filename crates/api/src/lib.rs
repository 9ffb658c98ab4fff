//! # tracevault
//!
//! Hierarchical audit traces for AI runtimes. tracevault captures model
//! invocations, tool executions, agent runs, and MCP requests as nested
//! spans, sanitizes their payloads, and persists them to pluggable
//! stores (in-memory, append-only file log, SQL) for later query,
//! export, and analysis.
//!
//! The pieces compose bottom-up:
//! - [`AuditEntry`] — the atomic record of one completed span;
//! - [`Sanitizer`] — redacts sensitive keys and truncates oversized
//!   payloads before they are recorded;
//! - [`TraceContext`] — the per-execution span stack and aggregator;
//! - [`AuditStore`] implementations behind a uniform contract;
//! - [`AuditInterceptor`] — turns runtime lifecycle events into spans.
//!
//! The [`ops`] module exposes the operations a host binding layer calls:
//! creating a context, querying a store, exporting a trace, and
//! inspecting audit status.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tracevault::{ops, MemoryStore, SpanOutcome};
//!
//! # async fn demo() -> tracevault::Result<()> {
//! let store = Arc::new(MemoryStore::default());
//! let mut ctx = ops::context(Some(store.clone()));
//! ctx.start_span("model", "chat", None, None)?;
//! ctx.end_span(SpanOutcome::ok("hi")).await;
//! ctx.complete().await;
//!
//! let exported = ops::export_trace(store.as_ref(), ctx.trace_id(), None).await?;
//! println!("{exported}");
//! # Ok(())
//! # }
//! ```

pub mod ops;

pub use tracevault_context::{ExportFormat, TraceContext, TraceNode, TraceTree};
pub use tracevault_core::{
    AuditEntry, AuditError, AuditStore, BatchOutcome, Cost, EntryError, EntryFilter, EntryQuery,
    EntryStatus, OrderBy, OrderDir, Result, SpanOutcome, StoreError, StoreStats, TokenUsage,
    TraceRecord, TraceSummary,
};
pub use tracevault_intercept::{
    AuditConfig, AuditInterceptor, AuditStatus, ExecutionId, LifecycleEvent, ENV_PREFIX,
};
pub use tracevault_sanitize::Sanitizer;
pub use tracevault_stores::{
    FileFormat, FileStore, FileStoreConfig, MemoryStore, MemoryStoreConfig, SqlStore,
    SqlStoreConfig, StoreRegistry,
};
