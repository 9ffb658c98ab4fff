//! The store contract — uniform persistence for audit entries.
//!
//! Implementations: in-memory, append-only file log, SQL. Each store
//! carries its own configuration and state; shared behavior (filtering,
//! ordering, pagination) is expressed by composition in the stores crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::entry::{parse_timestamp, AuditEntry};
use crate::error::StoreError;
use crate::summary::TraceSummary;

/// Default page size when a query does not specify one.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Exact-match and time-window filters. All present filters are AND'd.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFilter {
    pub trace_id: Option<String>,
    pub span_type: Option<String>,
    pub operation: Option<String>,
    pub status: Option<String>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Inclusive lower bound on `start_time`.
    pub start_time_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `start_time`.
    pub start_time_before: Option<DateTime<Utc>>,
}

impl EntryFilter {
    /// Parse a JSON filter map. Unrecognized keys are ignored so newer
    /// callers can pass filters older stores do not know about.
    pub fn from_value(value: &Value) -> Self {
        let mut filter = Self::default();
        let Some(map) = value.as_object() else {
            return filter;
        };

        let text = |key: &str| -> Option<String> {
            map.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        let time = |key: &str| -> Option<DateTime<Utc>> {
            map.get(key)
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
        };

        filter.trace_id = text("traceId");
        filter.span_type = text("spanType");
        filter.operation = text("operation");
        filter.status = text("status");
        filter.user_id = text("userId");
        filter.conversation_id = text("conversationId");
        filter.tenant_id = text("tenantId");
        filter.start_time_after = time("startTimeAfter");
        filter.start_time_before = time("startTimeBefore");
        filter
    }

    pub fn for_trace(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Sort keys a query may use. The fixed set doubles as the SQL column
/// allow-list, so user-supplied order strings never reach a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    StartTime,
    EndTime,
    DurationMs,
    SpanType,
    Operation,
    Status,
}

impl OrderBy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "startTime" => Some(Self::StartTime),
            "endTime" => Some(Self::EndTime),
            "durationMs" => Some(Self::DurationMs),
            "spanType" => Some(Self::SpanType),
            "operation" => Some(Self::Operation),
            "status" => Some(Self::Status),
            _ => None,
        }
    }

    /// Column name in persisted form.
    pub fn column(&self) -> &'static str {
        match self {
            Self::StartTime => "startTime",
            Self::EndTime => "endTime",
            Self::DurationMs => "durationMs",
            Self::SpanType => "spanType",
            Self::Operation => "operation",
            Self::Status => "status",
        }
    }
}

/// Sort direction; queries default to newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDir {
    Asc,
    #[default]
    Desc,
}

impl OrderDir {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// A filtered, ordered, paginated entry query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryQuery {
    pub filter: EntryFilter,
    pub limit: Option<usize>,
    pub offset: usize,
    pub order_by: OrderBy,
    pub order_dir: OrderDir,
}

impl EntryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: EntryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn order_dir(mut self, order_dir: OrderDir) -> Self {
        self.order_dir = order_dir;
        self
    }

    /// Effective page size (`DEFAULT_QUERY_LIMIT` when unspecified).
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
    }
}

/// Result of a batched write; atomicity across entries is not promised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub stored: usize,
    pub failed: usize,
}

/// Aggregate counters for a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_entries: u64,
    pub total_traces: u64,
    pub by_span_type: HashMap<String, u64>,
    pub by_status: HashMap<String, u64>,
    /// Persisted entries that could not be parsed and were skipped.
    pub corrupt_entries: u64,
}

/// All entries of one trace, ordered by start time, plus the rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub trace_id: String,
    pub entries: Vec<AuditEntry>,
    pub summary: TraceSummary,
}

impl TraceRecord {
    pub fn new(trace_id: impl Into<String>, entries: Vec<AuditEntry>) -> Self {
        let trace_id = trace_id.into();
        let summary = TraceSummary::from_entries(trace_id.clone(), &entries, true);
        Self {
            trace_id,
            entries,
            summary,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("traceId".into(), Value::String(self.trace_id.clone()));
        map.insert(
            "entries".into(),
            Value::Array(
                self.entries
                    .iter()
                    .map(|e| Value::Object(e.to_struct()))
                    .collect(),
            ),
        );
        map.insert("summary".into(), self.summary.to_value());
        Value::Object(map)
    }
}

/// Uniform persistence contract for audit entries.
///
/// Writes may arrive concurrently from many execution units; each store
/// preserves its invariants behind its own synchronization. Explicit
/// calls propagate errors; swallowing failures is the interceptor's job,
/// not the store's.
#[async_trait]
pub trait AuditStore: Send + Sync + std::fmt::Debug {
    /// Short backend name (`memory`, `file`, `jdbc`, ...).
    fn name(&self) -> &str;

    /// Persist a single entry.
    async fn store(&self, entry: AuditEntry) -> Result<(), StoreError>;

    /// Persist many entries, counting per-entry failures.
    async fn store_batch(&self, entries: Vec<AuditEntry>) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        for entry in entries {
            match self.store(entry).await {
                Ok(()) => outcome.stored += 1,
                Err(_) => outcome.failed += 1,
            }
        }
        Ok(outcome)
    }

    /// Entries matching every filter, ordered and paginated.
    async fn query(&self, query: &EntryQuery) -> Result<Vec<AuditEntry>, StoreError>;

    /// Single entry lookup by span id.
    async fn get_by_id(&self, span_id: &str) -> Result<Option<AuditEntry>, StoreError>;

    /// All entries of a trace, `start_time` ascending. Unknown traces
    /// yield an empty record, not an error.
    async fn get_trace(&self, trace_id: &str) -> Result<TraceRecord, StoreError>;

    /// Remove a whole trace; reports whether anything was deleted.
    async fn delete_trace(&self, trace_id: &str) -> Result<bool, StoreError>;

    /// Remove entries whose `end_time` predates the cutoff; returns the
    /// number removed.
    async fn purge(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Drop all persisted state.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Push buffered writes down; a no-op for unbuffered stores.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Flush and release backing resources.
    async fn close(&self) -> Result<(), StoreError> {
        self.flush().await
    }
}
