//! Per-trace span context.
//!
//! A [`TraceContext`] belongs to exactly one logical execution and owns the
//! live state of one trace: the stack of open spans, the list of completed
//! entries, trace-level metadata and tenant identifiers, and an optional
//! store that completed entries are handed to as they close.

pub mod context;
pub mod tree;

pub use context::{ExportFormat, TraceContext};
pub use tree::{TraceNode, TraceTree};
