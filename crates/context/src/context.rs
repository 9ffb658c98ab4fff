//! The trace context: span lifecycle, aggregation, auto-persistence.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use tracevault_core::entry::{AuditEntry, SpanOutcome};
use tracevault_core::error::{AuditError, Result};
use tracevault_core::store::AuditStore;
use tracevault_core::summary::TraceSummary;
use tracevault_sanitize::Sanitizer;

use crate::tree::TraceTree;

/// Formats `export` can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// In-process aggregator for one trace.
///
/// Spans nest through an explicit stack: the top of the stack is the
/// parent of the next span started. Completed entries are appended in the
/// order their spans *closed* and, when a store is bound, handed to it
/// immediately. Store failures on this path are logged and swallowed so
/// auditing can never take the host down.
pub struct TraceContext {
    trace_id: String,
    entries: Vec<AuditEntry>,
    stack: Vec<AuditEntry>,
    metadata: Map<String, Value>,
    user_id: Option<String>,
    conversation_id: Option<String>,
    tenant_id: Option<String>,
    recording: bool,
    completed: bool,
    store: Option<Arc<dyn AuditStore>>,
    sanitizer: Sanitizer,
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceContext")
            .field("trace_id", &self.trace_id)
            .field("entries", &self.entries.len())
            .field("open_spans", &self.stack.len())
            .field("recording", &self.recording)
            .field("completed", &self.completed)
            .finish()
    }
}

impl TraceContext {
    /// Create a recording context with a fresh trace id.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            entries: Vec::new(),
            stack: Vec::new(),
            metadata: Map::new(),
            user_id: None,
            conversation_id: None,
            tenant_id: None,
            recording: true,
            completed: false,
            store: None,
            sanitizer: Sanitizer::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        let trace_id = trace_id.into();
        if !trace_id.is_empty() {
            self.trace_id = trace_id;
        }
        self
    }

    /// Bind a store; every entry completed from now on is persisted to it.
    pub fn with_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Span id of the innermost open span, `""` when none is open.
    pub fn current_span_id(&self) -> String {
        self.stack
            .last()
            .map(|entry| entry.span_id.clone())
            .unwrap_or_default()
    }

    /// Number of open spans.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Completed entries in completion order.
    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    // --- Fluent trace-level setters ---

    pub fn set_recording(&mut self, recording: bool) -> &mut Self {
        self.recording = recording;
        self
    }

    /// Merge keys into the context metadata; applied to every entry at
    /// span start and again at span close.
    pub fn set_context_metadata(&mut self, metadata: Map<String, Value>) -> &mut Self {
        for (key, value) in metadata {
            self.metadata.insert(key, value);
        }
        self
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) -> &mut Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn set_conversation_id(&mut self, conversation_id: impl Into<String>) -> &mut Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn set_tenant_id(&mut self, tenant_id: impl Into<String>) -> &mut Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    // --- Span lifecycle ---

    /// Open a span under the current parent and return its id.
    ///
    /// Returns the `""` sentinel and records nothing when the context is
    /// not recording or already completed.
    pub fn start_span(
        &mut self,
        span_type: impl Into<String>,
        operation: impl Into<String>,
        input: Option<Value>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<String> {
        if !self.recording || self.completed {
            return Ok(String::new());
        }

        let mut entry = AuditEntry::new(self.trace_id.clone(), span_type, operation)
            .map_err(AuditError::from)?;
        if let Some(parent) = self.stack.last() {
            entry = entry.with_parent(parent.span_id.clone());
        }

        self.apply_trace_fields(&mut entry);
        if let Some(extra) = metadata {
            entry.set_metadata(extra);
        }
        if let Some(input) = input {
            entry.set_input(self.sanitizer.sanitize_input(&input));
        }

        let span_id = entry.span_id.clone();
        self.stack.push(entry);
        Ok(span_id)
    }

    /// Close the innermost open span. A no-op on an empty stack or a
    /// non-recording context.
    pub async fn end_span(&mut self, outcome: SpanOutcome) {
        if !self.recording || self.completed {
            return;
        }
        let Some(mut entry) = self.stack.pop() else {
            return;
        };

        let outcome = self.sanitize_outcome(outcome);
        entry.set_metadata(self.metadata.clone());
        entry.complete(outcome);
        self.push_and_persist(entry).await;
    }

    /// Record a standalone event: no stack interaction, completed
    /// immediately.
    pub async fn add_entry(
        &mut self,
        span_type: impl Into<String>,
        operation: impl Into<String>,
        data: Option<Value>,
    ) -> Result<String> {
        if !self.recording || self.completed {
            return Ok(String::new());
        }

        let mut entry = AuditEntry::new(self.trace_id.clone(), span_type, operation)
            .map_err(AuditError::from)?;
        self.apply_trace_fields(&mut entry);
        if let Some(data) = data {
            entry.set_input(self.sanitizer.sanitize_input(&data));
        }
        entry.complete(SpanOutcome::default());

        let span_id = entry.span_id.clone();
        self.push_and_persist(entry).await;
        Ok(span_id)
    }

    /// Close every open span innermost-first with empty output, then seal
    /// the context; all later mutating calls are no-ops.
    pub async fn complete(&mut self) {
        if self.completed {
            return;
        }
        while let Some(mut entry) = self.stack.pop() {
            entry.set_metadata(self.metadata.clone());
            entry.complete(SpanOutcome::default());
            self.push_and_persist(entry).await;
        }
        self.completed = true;
    }

    // --- Projections ---

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_entries(self.trace_id.clone(), &self.entries, self.completed)
    }

    /// Hierarchical view: entries carrying their direct children.
    pub fn full_trace(&self) -> TraceTree {
        TraceTree::build(self.trace_id.clone(), &self.entries, self.summary())
    }

    /// Textual representation of the full trace plus summary.
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(&self.full_trace().to_value()).map_err(Into::into)
            }
        }
    }

    // --- Internals ---

    fn apply_trace_fields(&self, entry: &mut AuditEntry) {
        if let Some(user_id) = &self.user_id {
            entry.set_user_id(user_id.clone());
        }
        if let Some(conversation_id) = &self.conversation_id {
            entry.set_conversation_id(conversation_id.clone());
        }
        if let Some(tenant_id) = &self.tenant_id {
            entry.set_tenant_id(tenant_id.clone());
        }
        entry.set_metadata(self.metadata.clone());
    }

    fn sanitize_outcome(&self, mut outcome: SpanOutcome) -> SpanOutcome {
        outcome.output = outcome
            .output
            .map(|output| self.sanitizer.sanitize_output(&output));
        outcome
    }

    async fn push_and_persist(&mut self, entry: AuditEntry) {
        if let Some(store) = &self.store
            && let Err(error) = store.store(entry.clone()).await
        {
            warn!(
                store = store.name(),
                trace_id = %self.trace_id,
                span_id = %entry.span_id,
                %error,
                "Failed to persist audit entry"
            );
        }
        self.entries.push(entry);
    }
}
