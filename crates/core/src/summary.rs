//! Aggregated trace projections shared by contexts and stores.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::entry::{format_timestamp, AuditEntry, EntryStatus, TokenUsage};

/// Rollup over the completed entries of one trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceSummary {
    pub trace_id: String,
    pub span_count: usize,
    pub error_count: usize,
    pub completed: bool,
    /// Sum of per-entry token usage (absent counters count as zero).
    pub tokens: TokenUsage,
    /// Sum of per-entry cost amounts.
    pub cost_amount: f64,
    /// First non-empty currency encountered.
    pub cost_currency: String,
    /// Earliest start across entries.
    pub start_time: Option<DateTime<Utc>>,
    /// Latest end across entries.
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

impl TraceSummary {
    pub fn from_entries(trace_id: impl Into<String>, entries: &[AuditEntry], completed: bool) -> Self {
        let mut summary = Self {
            trace_id: trace_id.into(),
            span_count: entries.len(),
            completed,
            ..Self::default()
        };

        for entry in entries {
            if entry.status == EntryStatus::Error {
                summary.error_count += 1;
            }
            if let Some(tokens) = &entry.tokens {
                summary.tokens.add(tokens);
            }
            if let Some(cost) = &entry.cost {
                summary.cost_amount += cost.amount;
                if summary.cost_currency.is_empty() && !cost.currency.is_empty() {
                    summary.cost_currency = cost.currency.clone();
                }
            }
            summary.start_time = match summary.start_time {
                Some(current) => Some(current.min(entry.start_time)),
                None => Some(entry.start_time),
            };
            if let Some(end) = entry.end_time {
                summary.end_time = match summary.end_time {
                    Some(current) => Some(current.max(end)),
                    None => Some(end),
                };
            }
        }

        if let (Some(start), Some(end)) = (summary.start_time, summary.end_time) {
            summary.duration_ms = (end - start).num_milliseconds().max(0);
        }
        summary
    }

    /// JSON form used by exports and trace records.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("traceId".into(), Value::String(self.trace_id.clone()));
        map.insert("spanCount".into(), Value::from(self.span_count));
        map.insert("errorCount".into(), Value::from(self.error_count));
        map.insert("completed".into(), Value::Bool(self.completed));
        map.insert(
            "tokens".into(),
            serde_json::to_value(&self.tokens).unwrap_or_else(|_| Value::Object(Map::new())),
        );
        let mut cost = Map::new();
        cost.insert("amount".into(), Value::from(self.cost_amount));
        cost.insert("currency".into(), Value::String(self.cost_currency.clone()));
        map.insert("cost".into(), Value::Object(cost));
        map.insert(
            "startTime".into(),
            Value::String(self.start_time.map(format_timestamp).unwrap_or_default()),
        );
        map.insert(
            "endTime".into(),
            Value::String(self.end_time.map(format_timestamp).unwrap_or_default()),
        );
        map.insert("durationMs".into(), Value::from(self.duration_ms));
        Value::Object(map)
    }
}
