//! Shared filter/order/pagination helpers for scan-based stores.

use std::cmp::Ordering;

use tracevault_core::entry::AuditEntry;
use tracevault_core::store::{EntryFilter, EntryQuery, OrderBy, OrderDir};

/// Whether an entry satisfies every present filter (AND semantics).
/// Time bounds are inclusive.
pub fn matches(filter: &EntryFilter, entry: &AuditEntry) -> bool {
    fn text_matches(wanted: &Option<String>, actual: Option<&str>) -> bool {
        match wanted {
            Some(wanted) => actual == Some(wanted.as_str()),
            None => true,
        }
    }

    text_matches(&filter.trace_id, Some(&entry.trace_id))
        && text_matches(&filter.span_type, Some(&entry.span_type))
        && text_matches(&filter.operation, Some(&entry.operation))
        && text_matches(&filter.status, Some(entry.status.as_str()))
        && text_matches(&filter.user_id, entry.user_id.as_deref())
        && text_matches(&filter.conversation_id, entry.conversation_id.as_deref())
        && text_matches(&filter.tenant_id, entry.tenant_id.as_deref())
        && filter
            .start_time_after
            .is_none_or(|after| entry.start_time >= after)
        && filter
            .start_time_before
            .is_none_or(|before| entry.start_time <= before)
}

/// Sort entries on the requested key. Ties always break on `span_id`
/// ascending, whatever the direction, so pagination is stable.
pub fn sort_entries(entries: &mut [AuditEntry], order_by: OrderBy, order_dir: OrderDir) {
    entries.sort_by(|a, b| {
        let primary = match order_by {
            OrderBy::StartTime => a.start_time.cmp(&b.start_time),
            OrderBy::EndTime => a.end_time.cmp(&b.end_time),
            OrderBy::DurationMs => a.duration_ms.cmp(&b.duration_ms),
            OrderBy::SpanType => a.span_type.cmp(&b.span_type),
            OrderBy::Operation => a.operation.cmp(&b.operation),
            OrderBy::Status => a.status.as_str().cmp(b.status.as_str()),
        };
        let primary = match order_dir {
            OrderDir::Asc => primary,
            OrderDir::Desc => primary.reverse(),
        };
        primary.then_with(|| a.span_id.cmp(&b.span_id))
    });
}

/// Page slice applied after filtering and ordering.
pub fn paginate(entries: Vec<AuditEntry>, limit: usize, offset: usize) -> Vec<AuditEntry> {
    entries.into_iter().skip(offset).take(limit).collect()
}

/// Filter, order, and paginate in one pass over owned entries.
pub fn apply_query(entries: Vec<AuditEntry>, query: &EntryQuery) -> Vec<AuditEntry> {
    let mut matched: Vec<AuditEntry> = entries
        .into_iter()
        .filter(|entry| matches(&query.filter, entry))
        .collect();
    sort_entries(&mut matched, query.order_by, query.order_dir);
    paginate(matched, query.effective_limit(), query.offset)
}

/// Ordering for trace assembly: `start_time` ascending, `span_id` ties.
pub fn trace_order(a: &AuditEntry, b: &AuditEntry) -> Ordering {
    a.start_time
        .cmp(&b.start_time)
        .then_with(|| a.span_id.cmp(&b.span_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracevault_core::entry::SpanOutcome;

    fn entry(span_id: &str, span_type: &str) -> AuditEntry {
        let mut e = AuditEntry::new("trace-1", span_type, "op")
            .unwrap()
            .with_span_id(span_id);
        e.complete(SpanOutcome::default());
        e
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EntryFilter::default();
        assert!(matches(&filter, &entry("a", "model")));
    }

    #[test]
    fn filters_are_anded() {
        let mut e = entry("a", "model");
        e.user_id = Some("u1".into());

        let filter = EntryFilter {
            span_type: Some("model".into()),
            user_id: Some("u1".into()),
            ..Default::default()
        };
        assert!(matches(&filter, &e));

        let filter = EntryFilter {
            span_type: Some("model".into()),
            user_id: Some("someone-else".into()),
            ..Default::default()
        };
        assert!(!matches(&filter, &e));
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let e = entry("a", "model");
        let filter = EntryFilter {
            start_time_after: Some(e.start_time),
            start_time_before: Some(e.start_time),
            ..Default::default()
        };
        assert!(matches(&filter, &e));
    }

    #[test]
    fn sort_ties_break_on_span_id_ascending() {
        let shared = entry("b", "model").start_time;
        let mut entries = vec![entry("c", "model"), entry("a", "model"), entry("b", "model")];
        for e in &mut entries {
            e.start_time = shared;
        }

        sort_entries(&mut entries, OrderBy::StartTime, OrderDir::Desc);
        let ids: Vec<_> = entries.iter().map(|e| e.span_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        sort_entries(&mut entries, OrderBy::StartTime, OrderDir::Asc);
        let ids: Vec<_> = entries.iter().map(|e| e.span_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn pagination_after_ordering() {
        let mut entries: Vec<_> = (0..5)
            .map(|i| entry(&format!("s{i}"), "model"))
            .collect();
        let base = entries[0].start_time;
        for (i, e) in entries.iter_mut().enumerate() {
            e.start_time = base + chrono::Duration::milliseconds(i as i64);
        }

        let query = EntryQuery::new().with_limit(2).with_offset(1);
        let page = apply_query(entries, &query);
        let ids: Vec<_> = page.iter().map(|e| e.span_id.as_str()).collect();
        // desc by start time: s4 s3 s2 s1 s0 → offset 1, limit 2
        assert_eq!(ids, vec!["s3", "s2"]);
    }
}
