//! The operations exposed to host binding layers.
//!
//! Four entry points: create a trace context, query a store, export a
//! trace (optionally to a file, written atomically), and inspect audit
//! status. These propagate errors — swallowing failures is the
//! interceptor's policy, not the explicit API's.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};

use tracevault_context::TraceContext;
use tracevault_core::error::{Result, StoreError};
use tracevault_core::store::{AuditStore, EntryFilter, EntryQuery, OrderBy, OrderDir};
use tracevault_intercept::{AuditInterceptor, AuditStatus};

/// Create a trace context, optionally bound to a store so completed
/// entries persist automatically.
pub fn context(store: Option<Arc<dyn AuditStore>>) -> TraceContext {
    match store {
        Some(store) => TraceContext::new().with_store(store),
        None => TraceContext::new(),
    }
}

/// Query a store with a JSON filter map. Unknown filter keys are
/// ignored; unknown `order_by`/`order_dir` values fall back to the
/// defaults (`startTime` descending). Returns persisted-form maps.
pub async fn query(
    store: &dyn AuditStore,
    filters: &Value,
    limit: Option<usize>,
    offset: usize,
    order_by: Option<&str>,
    order_dir: Option<&str>,
) -> Result<Vec<Map<String, Value>>> {
    let mut entry_query = EntryQuery::new()
        .with_filter(EntryFilter::from_value(filters))
        .with_offset(offset);
    if let Some(limit) = limit {
        entry_query = entry_query.with_limit(limit);
    }
    if let Some(order_by) = order_by.and_then(OrderBy::parse) {
        entry_query = entry_query.order_by(order_by);
    }
    if let Some(order_dir) = order_dir.and_then(OrderDir::parse) {
        entry_query = entry_query.order_dir(order_dir);
    }

    let entries = store.query(&entry_query).await?;
    Ok(entries.iter().map(|entry| entry.to_struct()).collect())
}

/// Export a trace as pretty JSON. With a destination path the document
/// is also written to disk atomically (temp file + rename), creating
/// parent directories as needed.
pub async fn export_trace(
    store: &dyn AuditStore,
    trace_id: &str,
    destination: Option<&Path>,
) -> Result<String> {
    let record = store.get_trace(trace_id).await?;
    let rendered = serde_json::to_string_pretty(&record.to_value())?;

    if let Some(path) = destination {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Storage(format!("failed to create export directory: {e}"))
            })?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &rendered)
            .map_err(|e| StoreError::Storage(format!("failed to write export: {e}")))?;
        fs::rename(&tmp, path)
            .map_err(|e| StoreError::Storage(format!("failed to finalize export: {e}")))?;
    }
    Ok(rendered)
}

/// Introspect the audit subsystem.
pub async fn status(interceptor: &AuditInterceptor) -> AuditStatus {
    interceptor.status().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tracevault_core::entry::{AuditEntry, SpanOutcome};
    use tracevault_intercept::{AuditConfig, ExecutionId, LifecycleEvent};
    use tracevault_stores::MemoryStore;

    fn entry(span_id: &str, trace_id: &str, span_type: &str) -> AuditEntry {
        let mut e = AuditEntry::new(trace_id, span_type, "op")
            .unwrap()
            .with_span_id(span_id);
        e.complete(SpanOutcome::ok("done"));
        e
    }

    #[tokio::test]
    async fn context_persists_through_bound_store() {
        let store = Arc::new(MemoryStore::default());
        let mut ctx = context(Some(store.clone()));
        ctx.start_span("model", "chat", None, None).unwrap();
        ctx.end_span(SpanOutcome::ok("hi")).await;

        let record = store.get_trace(ctx.trace_id()).await.unwrap();
        assert_eq!(record.entries.len(), 1);
    }

    #[tokio::test]
    async fn query_parses_filters_and_ignores_unknown_keys() {
        let store = MemoryStore::default();
        store.store(entry("s1", "t1", "model")).await.unwrap();
        store.store(entry("s2", "t1", "tool")).await.unwrap();
        store.store(entry("s3", "t2", "model")).await.unwrap();

        let rows = query(
            &store,
            &json!({"traceId": "t1", "spanType": "model", "someFutureKey": 1}),
            None,
            0,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["spanId"], "s1");
        assert_eq!(rows[0]["status"], "ok");
    }

    #[tokio::test]
    async fn query_orders_and_limits() {
        let store = MemoryStore::default();
        for i in 0..5 {
            let mut e = entry(&format!("s{i}"), "t1", "model");
            e.start_time += chrono_ms(i);
            store.store(e).await.unwrap();
        }

        let rows = query(&store, &json!({}), Some(2), 1, Some("startTime"), Some("asc"))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["spanId"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    fn chrono_ms(i: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(i)
    }

    #[tokio::test]
    async fn export_returns_trace_document() {
        let store = MemoryStore::default();
        store.store(entry("s1", "t1", "model")).await.unwrap();

        let rendered = export_trace(&store, "t1", None).await.unwrap();
        let value: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["traceId"], "t1");
        assert_eq!(value["summary"]["spanCount"], 1);
        assert_eq!(value["entries"][0]["spanId"], "s1");
    }

    #[tokio::test]
    async fn export_writes_destination_atomically() {
        let store = MemoryStore::default();
        store.store(entry("s1", "t1", "model")).await.unwrap();

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("exports").join("trace.json");
        let rendered = export_trace(&store, "t1", Some(&dest)).await.unwrap();

        let on_disk = fs::read_to_string(&dest).unwrap();
        assert_eq!(on_disk, rendered);
        // no temp file left behind
        assert!(!dest.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn export_of_unknown_trace_is_empty_document() {
        let store = MemoryStore::default();
        let rendered = export_trace(&store, "ghost", None).await.unwrap();
        let value: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["traceId"], "ghost");
        assert_eq!(value["entries"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn status_reflects_interceptor_activity() {
        let interceptor = AuditInterceptor::new(AuditConfig {
            enabled: true,
            ..AuditConfig::default()
        })
        .await;
        let exec = ExecutionId::next();
        interceptor
            .before_model_invoke(exec, &LifecycleEvent::new().with_model("m"))
            .await;
        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new().with_response(json!("ok")))
            .await;

        let report = status(&interceptor).await;
        assert!(report.enabled);
        assert_eq!(report.total_entries, 1);
        assert_eq!(report.active_executions, 0);
    }
}
