//! SQL store over `sqlx`.
//!
//! Entries live in one relational table keyed by `spanId`, with the
//! frequently filtered columns indexed and the structured payloads kept
//! as JSON text. All statements are parameterized; the table identifier
//! is validated up front and the ORDER BY clause comes from a fixed
//! enum-to-column mapping, so user input never reaches SQL as syntax.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use tracevault_core::entry::{format_timestamp, AuditEntry};
use tracevault_core::error::StoreError;
use tracevault_core::store::{
    AuditStore, BatchOutcome, EntryQuery, StoreStats, TraceRecord,
};

use crate::filter;

fn default_table() -> String {
    "audit_traces".into()
}

/// Configuration for [`SqlStore`].
#[derive(Debug, Clone, Deserialize)]
pub struct SqlStoreConfig {
    /// Connection string, e.g. `sqlite:audit.db` or `sqlite::memory:`.
    #[serde(default)]
    pub datasource: String,
    #[serde(default = "default_table")]
    pub table: String,
}

impl SqlStoreConfig {
    pub fn new(datasource: impl Into<String>) -> Self {
        Self {
            datasource: datasource.into(),
            table: default_table(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.datasource.trim().is_empty() {
            return Err(StoreError::MissingDatasource);
        }
        if !valid_table_name(&self.table) {
            return Err(StoreError::InvalidTableName(self.table.clone()));
        }
        Ok(())
    }
}

/// `^[A-Za-z_][A-Za-z0-9_]*$` — anything else is rejected before the
/// identifier is ever interpolated into a statement.
fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

const COLUMNS: &str = "spanId, traceId, parentSpanId, spanType, operation, status, \
     startTime, endTime, durationMs, userId, conversationId, tenantId, \
     input, output, tokens, cost, error, reasoning, metadata";

const INDEXED_COLUMNS: &[&str] = &[
    "traceId",
    "spanType",
    "operation",
    "status",
    "startTime",
    "endTime",
    "userId",
    "conversationId",
    "tenantId",
];

/// Relational audit store.
#[derive(Debug)]
pub struct SqlStore {
    pool: SqlitePool,
    table: String,
    corrupt: AtomicU64,
}

impl SqlStore {
    /// Validate the configuration, open a pool, and create the schema if
    /// it does not exist yet.
    pub async fn connect(config: SqlStoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let in_memory = config.datasource.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.datasource)
            .map_err(|e| StoreError::Storage(format!("Invalid datasource: {e}")))?
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open datasource: {e}")))?;

        let store = Self {
            pool,
            table: config.table,
            corrupt: AtomicU64::new(0),
        };
        store.init_schema().await?;
        info!(table = %store.table, "SQL audit store initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                spanId         TEXT PRIMARY KEY,
                traceId        TEXT NOT NULL,
                parentSpanId   TEXT,
                spanType       TEXT NOT NULL,
                operation      TEXT NOT NULL,
                status         TEXT NOT NULL,
                startTime      TEXT NOT NULL,
                endTime        TEXT,
                durationMs     INTEGER,
                userId         TEXT,
                conversationId TEXT,
                tenantId       TEXT,
                input          TEXT,
                output         TEXT,
                tokens         TEXT,
                cost           TEXT,
                error          TEXT,
                reasoning      TEXT,
                metadata       TEXT
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("schema creation failed: {e}")))?;

        for column in INDEXED_COLUMNS {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table}({column})"
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("index creation failed: {e}")))?;
        }

        debug!(table = %table, "SQL schema ready");
        Ok(())
    }

    fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry, String> {
        fn text(row: &SqliteRow, col: &str) -> Result<Option<String>, String> {
            row.try_get::<Option<String>, _>(col)
                .map_err(|e| format!("{col}: {e}"))
        }
        fn json_text(row: &SqliteRow, col: &str) -> Result<Option<Value>, String> {
            match text(row, col)? {
                Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| format!("{col}: {e}")),
                _ => Ok(None),
            }
        }

        let mut map = Map::new();
        for col in ["spanId", "traceId", "spanType", "operation", "status", "startTime"] {
            map.insert(
                col.to_string(),
                Value::String(text(row, col)?.unwrap_or_default()),
            );
        }
        for col in [
            "parentSpanId",
            "endTime",
            "userId",
            "conversationId",
            "tenantId",
            "error",
            "reasoning",
        ] {
            if let Some(value) = text(row, col)? {
                map.insert(col.to_string(), Value::String(value));
            }
        }
        if let Some(duration) = row
            .try_get::<Option<i64>, _>("durationMs")
            .map_err(|e| format!("durationMs: {e}"))?
        {
            map.insert("durationMs".into(), Value::from(duration));
        }
        for col in ["input", "output", "tokens", "cost", "metadata"] {
            if let Some(value) = json_text(row, col)? {
                map.insert(col.to_string(), value);
            }
        }

        AuditEntry::from_struct(&map).map_err(|e| e.to_string())
    }

    fn decode_rows(&self, rows: &[SqliteRow]) -> Vec<AuditEntry> {
        rows.iter()
            .filter_map(|row| match Self::row_to_entry(row) {
                Ok(entry) => Some(entry),
                Err(error) => {
                    self.corrupt.fetch_add(1, Ordering::Relaxed);
                    warn!(table = %self.table, %error, "Skipping corrupt audit row");
                    None
                }
            })
            .collect()
    }

    /// WHERE clause plus bind values for the recognized filters only.
    fn build_where(query: &EntryQuery) -> (String, Vec<String>) {
        let filter = &query.filter;
        let mut conditions: Vec<&'static str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        let mut text = |condition: &'static str, value: &Option<String>| {
            if let Some(value) = value {
                conditions.push(condition);
                binds.push(value.clone());
            }
        };
        text("traceId = ?", &filter.trace_id);
        text("spanType = ?", &filter.span_type);
        text("operation = ?", &filter.operation);
        text("status = ?", &filter.status);
        text("userId = ?", &filter.user_id);
        text("conversationId = ?", &filter.conversation_id);
        text("tenantId = ?", &filter.tenant_id);

        if let Some(after) = filter.start_time_after {
            conditions.push("startTime >= ?");
            binds.push(format_timestamp(after));
        }
        if let Some(before) = filter.start_time_before {
            conditions.push("startTime <= ?");
            binds.push(format_timestamp(before));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        (clause, binds)
    }

    async fn insert(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let table = &self.table;
        let placeholders = (1..=19)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            INSERT INTO {table} ({COLUMNS})
            VALUES ({placeholders})
            ON CONFLICT(spanId) DO UPDATE SET
                traceId = excluded.traceId,
                parentSpanId = excluded.parentSpanId,
                spanType = excluded.spanType,
                operation = excluded.operation,
                status = excluded.status,
                startTime = excluded.startTime,
                endTime = excluded.endTime,
                durationMs = excluded.durationMs,
                userId = excluded.userId,
                conversationId = excluded.conversationId,
                tenantId = excluded.tenantId,
                input = excluded.input,
                output = excluded.output,
                tokens = excluded.tokens,
                cost = excluded.cost,
                error = excluded.error,
                reasoning = excluded.reasoning,
                metadata = excluded.metadata
            "#
        );

        let json_opt = |value: &Option<Value>| value.as_ref().map(Value::to_string);
        sqlx::query(&sql)
            .bind(&entry.span_id)
            .bind(&entry.trace_id)
            .bind(&entry.parent_span_id)
            .bind(&entry.span_type)
            .bind(&entry.operation)
            .bind(entry.status.as_str())
            .bind(format_timestamp(entry.start_time))
            .bind(entry.end_time.map(format_timestamp))
            .bind(entry.duration_ms)
            .bind(&entry.user_id)
            .bind(&entry.conversation_id)
            .bind(&entry.tenant_id)
            .bind(json_opt(&entry.input))
            .bind(json_opt(&entry.output))
            .bind(
                entry
                    .tokens
                    .as_ref()
                    .and_then(|t| serde_json::to_string(t).ok()),
            )
            .bind(
                entry
                    .cost
                    .as_ref()
                    .and_then(|c| serde_json::to_string(c).ok()),
            )
            .bind(&entry.error)
            .bind(&entry.reasoning)
            .bind(Value::Object(entry.metadata.clone()).to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("INSERT failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for SqlStore {
    fn name(&self) -> &str {
        "jdbc"
    }

    async fn store(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.insert(&entry).await
    }

    async fn store_batch(&self, entries: Vec<AuditEntry>) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        for entry in &entries {
            match self.insert(entry).await {
                Ok(()) => outcome.stored += 1,
                Err(error) => {
                    warn!(table = %self.table, %error, "Batch insert failed for entry");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn query(&self, query: &EntryQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let (where_sql, binds) = Self::build_where(query);
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY {} {}, spanId ASC LIMIT ? OFFSET ?",
            self.table,
            where_sql,
            query.order_by.column(),
            query.order_dir.keyword(),
        );

        let mut db_query = sqlx::query(&sql);
        for bind in &binds {
            db_query = db_query.bind(bind);
        }
        let limit = query.effective_limit().min(i64::MAX as usize) as i64;
        let rows = db_query
            .bind(limit)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("query: {e}")))?;

        Ok(self.decode_rows(&rows))
    }

    async fn get_by_id(&self, span_id: &str) -> Result<Option<AuditEntry>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE spanId = ?", self.table);
        let row = sqlx::query(&sql)
            .bind(span_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get by id: {e}")))?;

        Ok(row.and_then(|row| self.decode_rows(std::slice::from_ref(&row)).pop()))
    }

    async fn get_trace(&self, trace_id: &str) -> Result<TraceRecord, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE traceId = ? ORDER BY startTime ASC, spanId ASC",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(trace_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get trace: {e}")))?;

        let mut entries = self.decode_rows(&rows);
        entries.sort_by(filter::trace_order);
        Ok(TraceRecord::new(trace_id, entries))
    }

    async fn delete_trace(&self, trace_id: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE traceId = ?", self.table);
        let result = sqlx::query(&sql)
            .bind(trace_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE endTime IS NOT NULL AND endTime < ?",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(format_timestamp(older_than))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("PURGE failed: {e}")))?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let count = |sql: String| async move {
            sqlx::query_scalar::<_, i64>(&sql)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("stats: {e}")))
        };

        let total_entries = count(format!("SELECT COUNT(*) FROM {}", self.table)).await?;
        let total_traces =
            count(format!("SELECT COUNT(DISTINCT traceId) FROM {}", self.table)).await?;

        let mut stats = StoreStats {
            total_entries: total_entries.max(0) as u64,
            total_traces: total_traces.max(0) as u64,
            corrupt_entries: self.corrupt.load(Ordering::Relaxed),
            ..Default::default()
        };

        for (group, target) in [("spanType", &mut stats.by_span_type), ("status", &mut stats.by_status)]
        {
            let sql = format!(
                "SELECT {group} AS k, COUNT(*) AS c FROM {} GROUP BY {group}",
                self.table
            );
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("stats group: {e}")))?;
            for row in rows {
                let key: String = row.try_get("k").unwrap_or_default();
                let value: i64 = row.try_get("c").unwrap_or_default();
                target.insert(key, value.max(0) as u64);
            }
        }
        Ok(stats)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {}", self.table);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("CLEAR failed: {e}")))?;
        self.corrupt.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
