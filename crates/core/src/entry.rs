//! The atomic audit record.
//!
//! An [`AuditEntry`] captures one timed unit of work (a span) inside a
//! trace: what ran, when, under which parent, with what input/output,
//! token usage, and cost. Entries are mutable until [`AuditEntry::complete`]
//! is called and read-only afterwards.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EntryError;

/// Completion status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Ok,
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token accounting for a span.
///
/// Model-specific keys (`cached_tokens`, `reasoning_tokens`, ...) ride in
/// `extra` and round-trip through serialization unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt: u64,
    #[serde(default)]
    pub completion: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64, total: u64) -> Self {
        Self {
            prompt,
            completion,
            total,
            extra: Map::new(),
        }
    }

    /// Attach a model-specific counter (e.g. `cached_tokens`).
    pub fn with_extra(mut self, key: impl Into<String>, value: u64) -> Self {
        self.extra.insert(key.into(), Value::from(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.prompt == 0 && self.completion == 0 && self.total == 0 && self.extra.is_empty()
    }

    /// Accumulate another usage record into this one. Absent counters are
    /// treated as zero; numeric extras are summed key-wise.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
        for (key, value) in &other.extra {
            match (self.extra.get(key).and_then(Value::as_u64), value.as_u64()) {
                (Some(mine), Some(theirs)) => {
                    self.extra.insert(key.clone(), Value::from(mine + theirs));
                }
                _ => {
                    self.extra.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }
}

/// Monetary cost of a span.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
}

impl Cost {
    pub fn new(amount: f64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }
}

/// Everything a span can report when it closes.
#[derive(Debug, Clone, Default)]
pub struct SpanOutcome {
    pub output: Option<Value>,
    pub error: Option<String>,
    pub tokens: Option<TokenUsage>,
    pub cost: Option<Cost>,
}

impl SpanOutcome {
    /// A successful outcome carrying an output payload.
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    /// A failed outcome carrying an error message.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Current UTC time truncated to millisecond precision.
///
/// Entries always carry millisecond timestamps so values survive the
/// RFC 3339 round trip through every store format bit-for-bit.
pub fn now() -> DateTime<Utc> {
    let millis = Utc::now().timestamp_millis();
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

/// Format a timestamp the way every store persists it.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a persisted timestamp.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A single audit record: one completed span or standalone event.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    /// Unique span identifier (generated when not supplied).
    pub span_id: String,
    /// Trace this entry belongs to.
    pub trace_id: String,
    /// Enclosing span, `None` for roots.
    pub parent_span_id: Option<String>,
    /// Categorical label: `agent`, `model`, `tool`, `mcp`, `embed`, ...
    pub span_type: String,
    /// Name of the action performed.
    pub operation: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time in milliseconds, computed on first completion.
    pub duration_ms: Option<i64>,
    pub status: EntryStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub tokens: Option<TokenUsage>,
    pub cost: Option<Cost>,
    pub error: Option<String>,
    pub reasoning: Option<String>,
    pub metadata: Map<String, Value>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub tenant_id: Option<String>,
    completed: bool,
}

/// Field names in the persisted struct form.
const STRUCT_KEYS: &[&str] = &[
    "spanId",
    "traceId",
    "parentSpanId",
    "spanType",
    "operation",
    "startTime",
    "endTime",
    "durationMs",
    "status",
    "input",
    "output",
    "tokens",
    "cost",
    "error",
    "reasoning",
    "metadata",
    "userId",
    "conversationId",
    "tenantId",
];

impl AuditEntry {
    /// Create a new open entry.
    ///
    /// `trace_id`, `span_type`, and `operation` must be non-empty.
    pub fn new(
        trace_id: impl Into<String>,
        span_type: impl Into<String>,
        operation: impl Into<String>,
    ) -> Result<Self, EntryError> {
        let trace_id = trace_id.into();
        let span_type = span_type.into();
        let operation = operation.into();
        for (field, value) in [
            ("traceId", &trace_id),
            ("spanType", &span_type),
            ("operation", &operation),
        ] {
            if value.is_empty() {
                return Err(EntryError::Invalid(format!("{field} is required")));
            }
        }

        Ok(Self {
            span_id: Uuid::new_v4().to_string(),
            trace_id,
            parent_span_id: None,
            span_type,
            operation,
            start_time: now(),
            end_time: None,
            duration_ms: None,
            status: EntryStatus::Ok,
            input: None,
            output: None,
            tokens: None,
            cost: None,
            error: None,
            reasoning: None,
            metadata: Map::new(),
            user_id: None,
            conversation_id: None,
            tenant_id: None,
            completed: false,
        })
    }

    /// Use a caller-supplied span id instead of the generated one.
    pub fn with_span_id(mut self, span_id: impl Into<String>) -> Self {
        let span_id = span_id.into();
        if !span_id.is_empty() {
            self.span_id = span_id;
        }
        self
    }

    /// Link this entry under a parent span.
    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        let parent = parent_span_id.into();
        self.parent_span_id = (!parent.is_empty()).then_some(parent);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    // --- Fluent mutators (ignored once completed) ---

    pub fn set_input(&mut self, input: impl Into<Value>) -> &mut Self {
        if !self.completed {
            self.input = Some(input.into());
        }
        self
    }

    pub fn set_output(&mut self, output: impl Into<Value>) -> &mut Self {
        if !self.completed {
            self.output = Some(output.into());
        }
        self
    }

    pub fn set_tokens(&mut self, tokens: TokenUsage) -> &mut Self {
        if !self.completed {
            self.tokens = Some(tokens);
        }
        self
    }

    pub fn set_cost(&mut self, cost: Cost) -> &mut Self {
        if !self.completed {
            self.cost = Some(cost);
        }
        self
    }

    /// Merge keys into the entry metadata; later writes win.
    pub fn set_metadata(&mut self, metadata: Map<String, Value>) -> &mut Self {
        if !self.completed {
            for (key, value) in metadata {
                self.metadata.insert(key, value);
            }
        }
        self
    }

    pub fn set_reasoning(&mut self, reasoning: impl Into<String>) -> &mut Self {
        if !self.completed {
            self.reasoning = Some(reasoning.into());
        }
        self
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) -> &mut Self {
        if !self.completed {
            self.user_id = Some(user_id.into());
        }
        self
    }

    pub fn set_conversation_id(&mut self, conversation_id: impl Into<String>) -> &mut Self {
        if !self.completed {
            self.conversation_id = Some(conversation_id.into());
        }
        self
    }

    pub fn set_tenant_id(&mut self, tenant_id: impl Into<String>) -> &mut Self {
        if !self.completed {
            self.tenant_id = Some(tenant_id.into());
        }
        self
    }

    /// Close the entry. Idempotent: the second and later calls change
    /// nothing. A non-empty error (supplied here or set earlier) flips
    /// the status to [`EntryStatus::Error`].
    pub fn complete(&mut self, outcome: SpanOutcome) -> &mut Self {
        if self.completed {
            return self;
        }

        let end = now();
        self.end_time = Some(end);
        self.duration_ms = Some((end - self.start_time).num_milliseconds().max(0));

        if let Some(output) = outcome.output {
            self.output = Some(output);
        }
        if let Some(tokens) = outcome.tokens {
            self.tokens = Some(tokens);
        }
        if let Some(cost) = outcome.cost {
            self.cost = Some(cost);
        }
        if let Some(error) = outcome.error
            && !error.is_empty()
        {
            self.error = Some(error);
        }

        self.status = match self.error.as_deref() {
            Some(e) if !e.is_empty() => EntryStatus::Error,
            _ => EntryStatus::Ok,
        };
        self.completed = true;
        self
    }

    /// Serialize to the flat persisted form. Every documented field is
    /// present; absent scalars become `""`, absent maps `{}`.
    pub fn to_struct(&self) -> Map<String, Value> {
        fn opt_str(value: &Option<String>) -> Value {
            Value::String(value.clone().unwrap_or_default())
        }
        fn opt_map<T: Serialize>(value: &Option<T>) -> Value {
            value
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok())
                .unwrap_or_else(|| Value::Object(Map::new()))
        }

        let mut map = Map::new();
        map.insert("spanId".into(), Value::String(self.span_id.clone()));
        map.insert("traceId".into(), Value::String(self.trace_id.clone()));
        map.insert("parentSpanId".into(), opt_str(&self.parent_span_id));
        map.insert("spanType".into(), Value::String(self.span_type.clone()));
        map.insert("operation".into(), Value::String(self.operation.clone()));
        map.insert(
            "startTime".into(),
            Value::String(format_timestamp(self.start_time)),
        );
        map.insert(
            "endTime".into(),
            Value::String(self.end_time.map(format_timestamp).unwrap_or_default()),
        );
        map.insert(
            "durationMs".into(),
            Value::from(self.duration_ms.unwrap_or(0)),
        );
        map.insert("status".into(), Value::String(self.status.as_str().into()));
        map.insert(
            "input".into(),
            self.input.clone().unwrap_or_else(|| Value::String(String::new())),
        );
        map.insert(
            "output".into(),
            self.output.clone().unwrap_or_else(|| Value::String(String::new())),
        );
        map.insert("tokens".into(), opt_map(&self.tokens));
        map.insert("cost".into(), opt_map(&self.cost));
        map.insert("error".into(), opt_str(&self.error));
        map.insert("reasoning".into(), opt_str(&self.reasoning));
        map.insert("metadata".into(), Value::Object(self.metadata.clone()));
        map.insert("userId".into(), opt_str(&self.user_id));
        map.insert("conversationId".into(), opt_str(&self.conversation_id));
        map.insert("tenantId".into(), opt_str(&self.tenant_id));
        map
    }

    /// Reconstruct an entry from its persisted form.
    ///
    /// Fails when `traceId`, `spanType`, or `operation` is missing or
    /// empty, or when `status` is anything other than `ok`/`error`.
    /// Unknown keys are preserved verbatim in `metadata`.
    pub fn from_struct(map: &Map<String, Value>) -> Result<Self, EntryError> {
        fn required(map: &Map<String, Value>, key: &str) -> Result<String, EntryError> {
            map.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| EntryError::Invalid(format!("{key} is required")))
        }
        fn optional(map: &Map<String, Value>, key: &str) -> Option<String> {
            map.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        }
        fn optional_payload(map: &Map<String, Value>, key: &str) -> Option<Value> {
            match map.get(key) {
                None => None,
                Some(Value::String(s)) if s.is_empty() => None,
                Some(other) => Some(other.clone()),
            }
        }
        fn optional_struct<T: serde::de::DeserializeOwned>(
            map: &Map<String, Value>,
            key: &str,
        ) -> Result<Option<T>, EntryError> {
            match map.get(key) {
                Some(Value::Object(obj)) if !obj.is_empty() => {
                    serde_json::from_value(Value::Object(obj.clone()))
                        .map(Some)
                        .map_err(|e| EntryError::Invalid(format!("invalid {key}: {e}")))
                }
                _ => Ok(None),
            }
        }

        let trace_id = required(map, "traceId")?;
        let span_type = required(map, "spanType")?;
        let operation = required(map, "operation")?;

        let status = match map.get("status") {
            None => EntryStatus::Ok,
            Some(Value::String(s)) if s == "ok" => EntryStatus::Ok,
            Some(Value::String(s)) if s == "error" => EntryStatus::Error,
            Some(other) => {
                return Err(EntryError::Invalid(format!(
                    "unsupported status value: {other}"
                )));
            }
        };

        let start_time = match optional(map, "startTime") {
            Some(raw) => parse_timestamp(&raw)
                .ok_or_else(|| EntryError::Invalid(format!("invalid startTime '{raw}'")))?,
            None => now(),
        };
        let end_time = match optional(map, "endTime") {
            Some(raw) => Some(
                parse_timestamp(&raw)
                    .ok_or_else(|| EntryError::Invalid(format!("invalid endTime '{raw}'")))?,
            ),
            None => None,
        };
        let duration_ms = end_time.map(|end| {
            map.get("durationMs")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| (end - start_time).num_milliseconds().max(0))
        });

        let mut metadata = match map.get("metadata") {
            Some(Value::Object(obj)) => obj.clone(),
            _ => Map::new(),
        };
        for (key, value) in map {
            if !STRUCT_KEYS.contains(&key.as_str()) {
                metadata.insert(key.clone(), value.clone());
            }
        }

        let completed = end_time.is_some();
        Ok(Self {
            span_id: optional(map, "spanId").unwrap_or_else(|| Uuid::new_v4().to_string()),
            trace_id,
            parent_span_id: optional(map, "parentSpanId"),
            span_type,
            operation,
            start_time,
            end_time,
            duration_ms,
            status,
            input: optional_payload(map, "input"),
            output: optional_payload(map, "output"),
            tokens: optional_struct(map, "tokens")?,
            cost: optional_struct(map, "cost")?,
            error: optional(map, "error"),
            reasoning: optional(map, "reasoning"),
            metadata,
            user_id: optional(map, "userId"),
            conversation_id: optional(map, "conversationId"),
            tenant_id: optional(map, "tenantId"),
            completed,
        })
    }
}
