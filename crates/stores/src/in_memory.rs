//! In-memory store — useful for testing, ephemeral sessions, and as the
//! fallback when a configured store cannot be constructed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

use tracevault_core::entry::AuditEntry;
use tracevault_core::error::StoreError;
use tracevault_core::store::{AuditStore, EntryQuery, StoreStats, TraceRecord};

use crate::filter;

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStoreConfig {
    /// Entry cap; inserting past it evicts the oldest entry by start time.
    #[serde(default, alias = "maxSize")]
    pub max_size: Option<usize>,
}

#[derive(Default, Debug)]
struct Inner {
    by_span: HashMap<String, AuditEntry>,
    by_trace: HashMap<String, Vec<String>>,
}

impl Inner {
    fn insert(&mut self, entry: AuditEntry) {
        let span_id = entry.span_id.clone();
        let trace_id = entry.trace_id.clone();
        match self.by_span.insert(span_id.clone(), entry) {
            Some(prev) if prev.trace_id != trace_id => {
                if let Some(ids) = self.by_trace.get_mut(&prev.trace_id) {
                    ids.retain(|id| id != &span_id);
                    if ids.is_empty() {
                        self.by_trace.remove(&prev.trace_id);
                    }
                }
                self.by_trace.entry(trace_id).or_default().push(span_id);
            }
            Some(_) => {}
            None => {
                self.by_trace.entry(trace_id).or_default().push(span_id);
            }
        }
    }

    fn remove(&mut self, span_id: &str) -> Option<AuditEntry> {
        let entry = self.by_span.remove(span_id)?;
        if let Some(ids) = self.by_trace.get_mut(&entry.trace_id) {
            ids.retain(|id| id != span_id);
            if ids.is_empty() {
                self.by_trace.remove(&entry.trace_id);
            }
        }
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .by_span
            .values()
            .min_by(|a, b| filter::trace_order(a, b))
            .map(|entry| entry.span_id.clone());
        if let Some(span_id) = oldest {
            self.remove(&span_id);
        }
    }
}

/// In-process store guarded by a single lock.
#[derive(Debug)]
pub struct MemoryStore {
    max_size: Option<usize>,
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            max_size: config.max_size,
            inner: RwLock::new(Inner::default()),
        }
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.insert(entry);
        if let Some(max) = self.max_size {
            while inner.by_span.len() > max {
                inner.evict_oldest();
            }
        }
        Ok(())
    }

    async fn query(&self, query: &EntryQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.inner.read().await;
        let entries: Vec<AuditEntry> = inner.by_span.values().cloned().collect();
        Ok(filter::apply_query(entries, query))
    }

    async fn get_by_id(&self, span_id: &str) -> Result<Option<AuditEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.by_span.get(span_id).cloned())
    }

    async fn get_trace(&self, trace_id: &str) -> Result<TraceRecord, StoreError> {
        let inner = self.inner.read().await;
        let mut entries: Vec<AuditEntry> = inner
            .by_trace
            .get(trace_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_span.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(filter::trace_order);
        Ok(TraceRecord::new(trace_id, entries))
    }

    async fn delete_trace(&self, trace_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(ids) = inner.by_trace.remove(trace_id) else {
            return Ok(false);
        };
        for id in &ids {
            inner.by_span.remove(id);
        }
        Ok(!ids.is_empty())
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .by_span
            .values()
            .filter(|entry| entry.end_time.is_some_and(|end| end < older_than))
            .map(|entry| entry.span_id.clone())
            .collect();
        for span_id in &expired {
            inner.remove(span_id);
        }
        Ok(expired.len())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.inner.read().await;
        let mut stats = StoreStats {
            total_entries: inner.by_span.len() as u64,
            total_traces: inner.by_trace.len() as u64,
            ..Default::default()
        };
        for entry in inner.by_span.values() {
            *stats.by_span_type.entry(entry.span_type.clone()).or_insert(0) += 1;
            *stats
                .by_status
                .entry(entry.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.by_span.clear();
        inner.by_trace.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tracevault_core::entry::SpanOutcome;
    use tracevault_core::store::{EntryFilter, OrderBy, OrderDir};

    fn entry(span_id: &str, trace_id: &str) -> AuditEntry {
        let mut e = AuditEntry::new(trace_id, "model", "chat")
            .unwrap()
            .with_span_id(span_id);
        e.complete(SpanOutcome::default());
        e
    }

    fn store() -> MemoryStore {
        MemoryStore::default()
    }

    #[tokio::test]
    async fn store_and_get_by_id() {
        let s = store();
        s.store(entry("a", "t1")).await.unwrap();

        let found = s.get_by_id("a").await.unwrap();
        assert_eq!(found.unwrap().span_id, "a");
        assert!(s.get_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_same_span_id_replaces() {
        let s = store();
        s.store(entry("a", "t1")).await.unwrap();
        s.store(entry("a", "t1")).await.unwrap();

        let stats = s.stats().await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.total_traces, 1);
    }

    #[tokio::test]
    async fn get_trace_orders_by_start_time() {
        let s = store();
        let mut first = entry("b", "t1");
        let mut second = entry("a", "t1");
        second.start_time = first.start_time + Duration::milliseconds(10);
        first.start_time -= Duration::milliseconds(10);
        s.store(second).await.unwrap();
        s.store(first).await.unwrap();
        s.store(entry("c", "t2")).await.unwrap();

        let record = s.get_trace("t1").await.unwrap();
        assert_eq!(record.entries.len(), 2);
        assert_eq!(record.entries[0].span_id, "b");
        assert_eq!(record.entries[1].span_id, "a");
        assert_eq!(record.summary.span_count, 2);
    }

    #[tokio::test]
    async fn get_trace_unknown_is_empty() {
        let record = store().get_trace("nope").await.unwrap();
        assert!(record.entries.is_empty());
        assert_eq!(record.trace_id, "nope");
    }

    #[tokio::test]
    async fn trace_record_matches_trace_filter_query() {
        let s = store();
        for i in 0..5 {
            s.store(entry(&format!("a{i}"), "t1")).await.unwrap();
            s.store(entry(&format!("b{i}"), "t2")).await.unwrap();
        }

        let record = s.get_trace("t1").await.unwrap();
        let query = EntryQuery::new()
            .with_filter(EntryFilter::for_trace("t1"))
            .with_limit(usize::MAX);
        let queried = s.query(&query).await.unwrap();

        let mut record_ids: Vec<_> = record.entries.iter().map(|e| &e.span_id).collect();
        let mut query_ids: Vec<_> = queried.iter().map(|e| &e.span_id).collect();
        record_ids.sort();
        query_ids.sort();
        assert_eq!(record_ids, query_ids);
    }

    #[tokio::test]
    async fn delete_trace_reports_removal() {
        let s = store();
        s.store(entry("a", "t1")).await.unwrap();
        s.store(entry("b", "t1")).await.unwrap();

        assert!(s.delete_trace("t1").await.unwrap());
        assert!(!s.delete_trace("t1").await.unwrap());
        assert_eq!(s.stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn purge_removes_only_older_completed_entries() {
        let s = store();
        let mut old = entry("old", "t1");
        old.end_time = Some(old.end_time.unwrap() - Duration::days(30));
        let fresh = entry("fresh", "t1");
        let mut open = AuditEntry::new("t1", "agent", "run").unwrap().with_span_id("open");
        open.start_time -= Duration::days(60);
        s.store(old).await.unwrap();
        s.store(fresh).await.unwrap();
        s.store(open).await.unwrap();

        let cutoff = Utc::now() - Duration::days(7);
        assert_eq!(s.purge(cutoff).await.unwrap(), 1);

        assert!(s.get_by_id("old").await.unwrap().is_none());
        assert!(s.get_by_id("fresh").await.unwrap().is_some());
        // entries without an end time are never purged
        assert!(s.get_by_id("open").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn eviction_drops_oldest_by_start_time() {
        let s = MemoryStore::new(MemoryStoreConfig { max_size: Some(2) });
        let mut oldest = entry("oldest", "t1");
        oldest.start_time -= Duration::minutes(10);
        s.store(oldest).await.unwrap();
        s.store(entry("mid", "t1")).await.unwrap();
        s.store(entry("new", "t1")).await.unwrap();

        assert_eq!(s.stats().await.unwrap().total_entries, 2);
        assert!(s.get_by_id("oldest").await.unwrap().is_none());
        assert!(s.get_by_id("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn query_orders_and_paginates() {
        let s = store();
        let base = Utc::now();
        for i in 0..6 {
            let mut e = entry(&format!("s{i}"), "t1");
            e.start_time = base + Duration::milliseconds(i);
            s.store(e).await.unwrap();
        }

        let page = s
            .query(&EntryQuery::new().with_limit(2).with_offset(2))
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|e| e.span_id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s2"]);

        let asc = s
            .query(
                &EntryQuery::new()
                    .order_by(OrderBy::StartTime)
                    .order_dir(OrderDir::Asc)
                    .with_limit(3),
            )
            .await
            .unwrap();
        let ids: Vec<_> = asc.iter().map(|e| e.span_id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2"]);
    }

    #[tokio::test]
    async fn pagination_concatenation_covers_full_scan() {
        let s = store();
        let base = Utc::now();
        for i in 0..10 {
            let mut e = entry(&format!("s{i:02}"), "t1");
            e.start_time = base + Duration::milliseconds(i);
            s.store(e).await.unwrap();
        }

        let full = s
            .query(&EntryQuery::new().with_limit(usize::MAX))
            .await
            .unwrap();
        let mut paged = Vec::new();
        for page in 0..4 {
            let chunk = s
                .query(&EntryQuery::new().with_limit(3).with_offset(page * 3))
                .await
                .unwrap();
            paged.extend(chunk);
        }

        let full_ids: Vec<_> = full.iter().map(|e| &e.span_id).collect();
        let paged_ids: Vec<_> = paged.iter().map(|e| &e.span_id).collect();
        assert_eq!(full_ids, paged_ids);
    }

    #[tokio::test]
    async fn stats_count_by_type_and_status() {
        let s = store();
        s.store(entry("a", "t1")).await.unwrap();
        let mut failed = AuditEntry::new("t1", "tool", "exec").unwrap().with_span_id("b");
        failed.complete(SpanOutcome::err("boom"));
        s.store(failed).await.unwrap();

        let stats = s.stats().await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_traces, 1);
        assert_eq!(stats.by_span_type.get("model"), Some(&1));
        assert_eq!(stats.by_span_type.get("tool"), Some(&1));
        assert_eq!(stats.by_status.get("ok"), Some(&1));
        assert_eq!(stats.by_status.get("error"), Some(&1));
    }

    #[tokio::test]
    async fn clear_resets_everything() {
        let s = store();
        s.store(entry("a", "t1")).await.unwrap();
        s.clear().await.unwrap();
        let stats = s.stats().await.unwrap();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.total_traces, 0);
    }

    #[tokio::test]
    async fn concurrent_writers_preserve_counts() {
        let s = std::sync::Arc::new(store());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    s.store(entry(&format!("w{worker}-{i}"), &format!("t{worker}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = s.stats().await.unwrap();
        assert_eq!(stats.total_entries, 200);
        assert_eq!(stats.total_traces, 8);
    }
}
