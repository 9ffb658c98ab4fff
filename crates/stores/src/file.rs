//! Append-oriented durable file store.
//!
//! Entries buffer in memory and land on disk in batches, one file per
//! rotation window. NDJSON is the default format (one entry per line);
//! `json` keeps a JSON array per file, rewritten on each flush. Raw files
//! are the source of truth: reads re-parse them lazily and skip anything
//! unparseable instead of failing the scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tracevault_core::entry::AuditEntry;
use tracevault_core::error::StoreError;
use tracevault_core::store::{
    AuditStore, BatchOutcome, EntryQuery, OrderBy, OrderDir, StoreStats, TraceRecord,
};

use crate::filter;

const FILE_PREFIX: &str = "audit-";
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

/// On-disk layout of a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// One JSON-serialized entry per line.
    #[default]
    Ndjson,
    /// A JSON array per file, rewritten on each flush.
    Json,
}

impl FileFormat {
    fn extension(&self) -> &'static str {
        match self {
            Self::Ndjson => "ndjson",
            Self::Json => "json",
        }
    }
}

/// Configuration for [`FileStore`].
#[derive(Debug, Clone, Deserialize)]
pub struct FileStoreConfig {
    /// Directory holding the log files (created on first write).
    pub path: PathBuf,
    #[serde(default)]
    pub format: FileFormat,
    /// Buffered entries before an automatic flush.
    #[serde(default = "default_batch_size", alias = "batchSize")]
    pub batch_size: usize,
    /// Byte threshold that forces rotation to a fresh file.
    #[serde(default = "default_max_file_size", alias = "maxFileSize")]
    pub max_file_size: u64,
    /// Rotate when the calendar day changes.
    #[serde(default, alias = "rotateDaily")]
    pub rotate_daily: bool,
}

impl FileStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: FileFormat::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            rotate_daily: false,
        }
    }

    pub fn with_format(mut self, format: FileFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_rotate_daily(mut self, rotate_daily: bool) -> Self {
        self.rotate_daily = rotate_daily;
        self
    }
}

#[derive(Debug)]
struct FileState {
    buffer: Vec<AuditEntry>,
    current: Option<PathBuf>,
    closed: bool,
}

/// Durable append log over a directory of rotated files.
///
/// A single writer serializes all mutation through one lock; readers get
/// a point-in-time view because every read flushes first and then parses
/// the files independently.
#[derive(Debug)]
pub struct FileStore {
    config: FileStoreConfig,
    state: Mutex<FileState>,
}

impl FileStore {
    pub fn new(config: FileStoreConfig) -> Result<Self, StoreError> {
        if config.path.as_os_str().is_empty() {
            return Err(StoreError::NotConfigured(
                "file store requires a path".into(),
            ));
        }
        let config = FileStoreConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        Ok(Self {
            config,
            state: Mutex::new(FileState {
                buffer: Vec::new(),
                current: None,
                closed: false,
            }),
        })
    }

    fn day_stamp(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    /// Date stamp embedded in a log file name, if any.
    fn file_day(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(FILE_PREFIX)?;
        (rest.len() >= 10).then(|| rest[..10].to_string())
    }

    fn is_log_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name.starts_with(FILE_PREFIX)
            && name.ends_with(&format!(".{}", self.config.format.extension()))
    }

    /// All log files, newest first.
    fn list_files(&self) -> Vec<PathBuf> {
        let Ok(dir) = fs::read_dir(&self.config.path) else {
            return Vec::new();
        };
        let mut files: Vec<(SystemTime, PathBuf)> = dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| self.is_log_file(path))
            .map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, path)
            })
            .collect();
        files.sort_by(|a, b| b.cmp(a));
        files.into_iter().map(|(_, path)| path).collect()
    }

    /// The newest file stamped with today's date, the append target after
    /// a restart. Older files are read-only.
    fn latest_same_day(&self, today: &str) -> Option<PathBuf> {
        self.list_files().into_iter().find(|path| {
            Self::file_day(path)
                .as_deref()
                .is_some_and(|day| day == today)
        })
    }

    fn next_file_path(&self, now: DateTime<Utc>) -> PathBuf {
        let base = format!(
            "{FILE_PREFIX}{}-{}",
            Self::day_stamp(now),
            now.format("%H%M%S")
        );
        let ext = self.config.format.extension();
        let mut candidate = self.config.path.join(format!("{base}.{ext}"));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.config.path.join(format!("{base}-{n}.{ext}"));
            n += 1;
        }
        candidate
    }

    fn flush_locked(&self, state: &mut FileState) -> Result<(), StoreError> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.config.path)
            .map_err(|e| StoreError::Storage(format!("failed to create audit directory: {e}")))?;

        let now = Utc::now();
        let today = Self::day_stamp(now);
        let mut target = state
            .current
            .clone()
            .filter(|path| path.exists())
            .or_else(|| self.latest_same_day(&today));

        if self.config.rotate_daily
            && let Some(path) = &target
            && Self::file_day(path).as_deref() != Some(today.as_str())
        {
            target = None;
        }

        let lines: Vec<String> = state
            .buffer
            .iter()
            .map(|entry| {
                serde_json::to_string(&Value::Object(entry.to_struct()))
                    .map_err(|e| StoreError::Storage(format!("failed to serialize entry: {e}")))
            })
            .collect::<Result<_, _>>()?;
        let pending: u64 = lines.iter().map(|l| l.len() as u64 + 1).sum();

        if let Some(path) = &target {
            let current_len = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
            if current_len > 0 && current_len + pending > self.config.max_file_size {
                target = None;
            }
        }

        let path = target.unwrap_or_else(|| self.next_file_path(now));
        match self.config.format {
            FileFormat::Ndjson => {
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| StoreError::Storage(format!("failed to open {path:?}: {e}")))?;
                // one write call per batch: committed whole or not at all
                let payload = lines.join("\n") + "\n";
                file.write_all(payload.as_bytes())
                    .map_err(|e| StoreError::Storage(format!("failed to append to {path:?}: {e}")))?;
            }
            FileFormat::Json => {
                let mut existing: Vec<Value> = if path.exists() {
                    fs::read_to_string(&path)
                        .ok()
                        .and_then(|raw| serde_json::from_str::<Vec<Value>>(&raw).ok())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                existing.extend(
                    state
                        .buffer
                        .iter()
                        .map(|entry| Value::Object(entry.to_struct())),
                );
                let rendered = serde_json::to_string_pretty(&Value::Array(existing))
                    .map_err(|e| StoreError::Storage(format!("failed to render array: {e}")))?;
                write_atomic(&path, rendered.as_bytes())?;
            }
        }

        debug!(path = %path.display(), entries = state.buffer.len(), "Flushed audit batch");
        state.current = Some(path);
        state.buffer.clear();
        Ok(())
    }

    /// Parse one file, skipping whatever cannot be decoded.
    fn read_file(&self, path: &Path, corrupt: &mut u64) -> Vec<AuditEntry> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(path = %path.display(), %error, "Failed to read audit file");
                return Vec::new();
            }
        };

        fn decode(path: &Path, value: &Value, entries: &mut Vec<AuditEntry>, corrupt: &mut u64) {
            match value.as_object().map(AuditEntry::from_struct) {
                Some(Ok(entry)) => entries.push(entry),
                _ => {
                    *corrupt += 1;
                    warn!(path = %path.display(), "Skipping corrupt audit entry");
                }
            }
        }

        let mut entries = Vec::new();
        match self.config.format {
            FileFormat::Ndjson => {
                for line in raw.lines().filter(|line| !line.trim().is_empty()) {
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => decode(path, &value, &mut entries, corrupt),
                        Err(_) => {
                            *corrupt += 1;
                            warn!(path = %path.display(), "Skipping unparseable audit line");
                        }
                    }
                }
            }
            FileFormat::Json => match serde_json::from_str::<Vec<Value>>(&raw) {
                Ok(values) => {
                    for value in &values {
                        decode(path, value, &mut entries, corrupt);
                    }
                }
                Err(error) => {
                    *corrupt += 1;
                    warn!(path = %path.display(), %error, "Skipping unparseable audit file");
                }
            },
        }
        entries
    }

    /// Scan every file newest-first.
    fn read_all(&self, corrupt: &mut u64) -> Vec<AuditEntry> {
        let mut entries = Vec::new();
        for path in self.list_files() {
            entries.extend(self.read_file(&path, corrupt));
        }
        entries
    }

    /// Rewrite one file keeping only entries the predicate accepts.
    /// Undecodable lines are preserved as-is. Returns how many entries
    /// were dropped.
    fn rewrite_file(
        &self,
        state: &mut FileState,
        path: &Path,
        keep: &dyn Fn(&AuditEntry) -> bool,
    ) -> Result<usize, StoreError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| StoreError::Storage(format!("failed to read {path:?}: {e}")))?;
        let mut removed = 0;

        let remaining: Vec<String> = match self.config.format {
            FileFormat::Ndjson => raw
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter(|line| {
                    let entry = serde_json::from_str::<Value>(line)
                        .ok()
                        .and_then(|value| value.as_object().cloned())
                        .and_then(|map| AuditEntry::from_struct(&map).ok());
                    match entry {
                        Some(entry) if !keep(&entry) => {
                            removed += 1;
                            false
                        }
                        _ => true,
                    }
                })
                .map(str::to_owned)
                .collect(),
            FileFormat::Json => {
                let values: Vec<Value> = serde_json::from_str(&raw).unwrap_or_default();
                let kept: Vec<Value> = values
                    .into_iter()
                    .filter(|value| {
                        let entry = value
                            .as_object()
                            .and_then(|map| AuditEntry::from_struct(map).ok());
                        match entry {
                            Some(entry) if !keep(&entry) => {
                                removed += 1;
                                false
                            }
                            _ => true,
                        }
                    })
                    .collect();
                if removed == 0 {
                    return Ok(0);
                }
                let rendered = serde_json::to_string_pretty(&Value::Array(kept))
                    .map_err(|e| StoreError::Storage(format!("failed to render array: {e}")))?;
                write_atomic(path, rendered.as_bytes())?;
                return Ok(removed);
            }
        };

        if removed == 0 {
            return Ok(0);
        }
        if remaining.is_empty() {
            fs::remove_file(path)
                .map_err(|e| StoreError::Storage(format!("failed to remove {path:?}: {e}")))?;
            if state.current.as_deref() == Some(path) {
                state.current = None;
            }
        } else {
            let payload = remaining.join("\n") + "\n";
            write_atomic(path, payload.as_bytes())?;
        }
        Ok(removed)
    }

    /// Apply a removal predicate across buffer and files, best-effort per
    /// file: one bad file does not abort the rest.
    fn remove_matching(
        &self,
        state: &mut FileState,
        keep: &dyn Fn(&AuditEntry) -> bool,
    ) -> Result<usize, StoreError> {
        self.flush_locked(state)?;
        let before = state.buffer.len();
        state.buffer.retain(|entry| keep(entry));
        let mut removed = before - state.buffer.len();

        for path in self.list_files() {
            match self.rewrite_file(state, &path, keep) {
                Ok(count) => removed += count,
                Err(error) => {
                    warn!(path = %path.display(), %error, "Failed to rewrite audit file");
                }
            }
        }
        Ok(removed)
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .map_err(|e| StoreError::Storage(format!("failed to write {tmp:?}: {e}")))?;
    fs::rename(&tmp, path)
        .map_err(|e| StoreError::Storage(format!("failed to replace {path:?}: {e}")))
}

#[async_trait]
impl AuditStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn store(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        state.buffer.push(entry);
        if state.buffer.len() >= self.config.batch_size {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    async fn store_batch(&self, entries: Vec<AuditEntry>) -> Result<BatchOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let stored = entries.len();
        state.buffer.extend(entries);
        if state.buffer.len() >= self.config.batch_size {
            self.flush_locked(&mut state)?;
        }
        Ok(BatchOutcome { stored, failed: 0 })
    }

    async fn query(&self, query: &EntryQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state)?;

        let needed = query.offset.saturating_add(query.effective_limit());
        let default_order =
            query.order_by == OrderBy::StartTime && query.order_dir == OrderDir::Desc;
        let mut corrupt = 0;
        let mut matched = Vec::new();
        for path in self.list_files() {
            matched.extend(
                self.read_file(&path, &mut corrupt)
                    .into_iter()
                    .filter(|entry| filter::matches(&query.filter, entry)),
            );
            // newest-first file scan: once the page is covered under the
            // default ordering, older files cannot contribute to it
            if default_order && needed != usize::MAX && matched.len() >= needed {
                break;
            }
        }

        filter::sort_entries(&mut matched, query.order_by, query.order_dir);
        Ok(filter::paginate(matched, query.effective_limit(), query.offset))
    }

    async fn get_by_id(&self, span_id: &str) -> Result<Option<AuditEntry>, StoreError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state)?;

        let mut corrupt = 0;
        for path in self.list_files() {
            if let Some(entry) = self
                .read_file(&path, &mut corrupt)
                .into_iter()
                .find(|entry| entry.span_id == span_id)
            {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn get_trace(&self, trace_id: &str) -> Result<TraceRecord, StoreError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state)?;

        let mut corrupt = 0;
        let mut entries: Vec<AuditEntry> = self
            .read_all(&mut corrupt)
            .into_iter()
            .filter(|entry| entry.trace_id == trace_id)
            .collect();
        entries.sort_by(filter::trace_order);
        Ok(TraceRecord::new(trace_id, entries))
    }

    async fn delete_trace(&self, trace_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let removed = self.remove_matching(&mut state, &|entry| entry.trace_id != trace_id)?;
        Ok(removed > 0)
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        self.remove_matching(&mut state, &|entry| {
            !entry.end_time.is_some_and(|end| end < older_than)
        })
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state)?;

        let mut corrupt = 0;
        let entries = self.read_all(&mut corrupt);
        let mut stats = StoreStats {
            total_entries: entries.len() as u64,
            corrupt_entries: corrupt,
            ..Default::default()
        };
        let mut traces = std::collections::HashSet::new();
        for entry in &entries {
            traces.insert(entry.trace_id.clone());
            *stats.by_span_type.entry(entry.span_type.clone()).or_insert(0) += 1;
            *stats
                .by_status
                .entry(entry.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats.total_traces = traces.len() as u64;
        Ok(stats)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.buffer.clear();
        state.current = None;
        for path in self.list_files() {
            if let Err(error) = fs::remove_file(&path) {
                warn!(path = %path.display(), %error, "Failed to remove audit file");
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state)
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state)?;
        state.closed = true;
        Ok(())
    }
}
