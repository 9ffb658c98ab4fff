//! Hierarchical trace projection.

use serde_json::{Map, Value};
use std::collections::HashSet;

use tracevault_core::entry::AuditEntry;
use tracevault_core::summary::TraceSummary;

/// One entry with its direct children.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceNode {
    pub entry: AuditEntry,
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    fn to_value(&self) -> Value {
        let mut map = self.entry.to_struct();
        map.insert(
            "children".into(),
            Value::Array(self.children.iter().map(TraceNode::to_value).collect()),
        );
        Value::Object(map)
    }
}

/// The full trace: roots with nested children, plus the summary.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceTree {
    pub trace_id: String,
    pub roots: Vec<TraceNode>,
    pub summary: TraceSummary,
}

impl TraceTree {
    /// Group entries by `parent_span_id`. Entries whose parent is absent
    /// from the trace are treated as roots; sibling order follows the
    /// entry list.
    pub fn build(trace_id: impl Into<String>, entries: &[AuditEntry], summary: TraceSummary) -> Self {
        let known: HashSet<&str> = entries.iter().map(|e| e.span_id.as_str()).collect();
        let roots = entries
            .iter()
            .filter(|entry| {
                entry
                    .parent_span_id
                    .as_deref()
                    .is_none_or(|parent| !known.contains(parent))
            })
            .map(|entry| build_node(entry, entries))
            .collect();

        Self {
            trace_id: trace_id.into(),
            roots,
            summary,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("traceId".into(), Value::String(self.trace_id.clone()));
        map.insert(
            "entries".into(),
            Value::Array(self.roots.iter().map(TraceNode::to_value).collect()),
        );
        map.insert("summary".into(), self.summary.to_value());
        Value::Object(map)
    }
}

fn build_node(entry: &AuditEntry, entries: &[AuditEntry]) -> TraceNode {
    let children = entries
        .iter()
        .filter(|candidate| candidate.parent_span_id.as_deref() == Some(entry.span_id.as_str()))
        .map(|child| build_node(child, entries))
        .collect();
    TraceNode {
        entry: entry.clone(),
        children,
    }
}
