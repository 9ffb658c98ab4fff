//! The audit interceptor: runtime events in, nested spans out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tracevault_context::TraceContext;
use tracevault_core::entry::SpanOutcome;
use tracevault_core::store::AuditStore;
use tracevault_stores::{MemoryStore, StoreRegistry};

use crate::config::AuditConfig;
use crate::event::LifecycleEvent;

/// Identity of one logical execution unit.
///
/// Synchronous hosts can rely on [`ExecutionId::current`], which hands
/// every thread a stable id; async hosts allocate one per task with
/// [`ExecutionId::next`] and pass it through. Two executions with
/// different ids can never observe each other's spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(u64);

impl ExecutionId {
    /// Allocate a fresh execution id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The calling thread's execution id.
    pub fn current() -> Self {
        thread_local! {
            static CURRENT: ExecutionId = ExecutionId::next();
        }
        CURRENT.with(|id| *id)
    }
}

struct ExecState {
    context: TraceContext,
    depth: usize,
}

/// Wrap collected input fields, honoring the master capture flag.
fn payload(config: &AuditConfig, input: Map<String, Value>) -> Option<Value> {
    (config.capture_input && !input.is_empty()).then(|| Value::Object(input))
}

/// Introspection report for the audit subsystem.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatus {
    pub enabled: bool,
    pub store: String,
    pub active_executions: usize,
    pub total_entries: u64,
    pub total_traces: u64,
}

/// Bridges runtime lifecycle events to per-execution trace contexts.
///
/// Audit must never disrupt the host: every handler swallows internal
/// failures after logging them, and a store that cannot be constructed
/// is replaced by an in-memory one so auditing stays operational.
pub struct AuditInterceptor {
    config: AuditConfig,
    store: Arc<dyn AuditStore>,
    executions: Mutex<HashMap<ExecutionId, ExecState>>,
}

impl AuditInterceptor {
    /// Build with the default registry (built-in stores only).
    pub async fn new(config: AuditConfig) -> Self {
        Self::with_registry(config, &StoreRegistry::new()).await
    }

    /// Build, resolving the configured store through `registry`. A
    /// failed store construction falls back to memory with a warning.
    pub async fn with_registry(config: AuditConfig, registry: &StoreRegistry) -> Self {
        let store = match registry.build(&config.store, &config.store_config).await {
            Ok(store) => store,
            Err(error) => {
                warn!(
                    store = %config.store,
                    %error,
                    "Failed to construct configured audit store, falling back to memory"
                );
                Arc::new(MemoryStore::default()) as Arc<dyn AuditStore>
            }
        };
        Self {
            config,
            store,
            executions: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn store(&self) -> Arc<dyn AuditStore> {
        self.store.clone()
    }

    /// Trace id of the execution's live context, if one is attached.
    pub async fn active_trace_id(&self, exec: ExecutionId) -> Option<String> {
        let executions = self.executions.lock().await;
        executions
            .get(&exec)
            .map(|state| state.context.trace_id().to_string())
    }

    // --- Model invocations ---

    pub async fn before_model_invoke(&self, exec: ExecutionId, event: &LifecycleEvent) {
        let operation = event
            .operation
            .clone()
            .or_else(|| event.model.clone())
            .unwrap_or_else(|| "invoke".into());

        let mut input = Map::new();
        if let Some(model) = &event.model {
            input.insert("model".into(), Value::String(model.clone()));
        }
        if let Some(provider) = &event.provider {
            input.insert("provider".into(), Value::String(provider.clone()));
        }
        if self.config.capture_messages
            && let Some(messages) = &event.messages
        {
            input.insert("messages".into(), messages.clone());
        }
        self.begin_span(exec, "model", operation, payload(&self.config, input))
            .await;
    }

    pub async fn after_model_invoke(&self, exec: ExecutionId, event: &LifecycleEvent) {
        self.finish_span(exec, self.after_outcome(event)).await;
    }

    // --- Tool executions ---

    pub async fn before_tool_execute(&self, exec: ExecutionId, event: &LifecycleEvent) {
        let operation = event
            .tool_name
            .clone()
            .or_else(|| event.operation.clone())
            .unwrap_or_else(|| "execute".into());

        let mut input = Map::new();
        if self.config.capture_tool_args
            && let Some(arguments) = &event.arguments
        {
            input.insert("arguments".into(), arguments.clone());
        }
        self.begin_span(exec, "tool", operation, payload(&self.config, input))
            .await;
    }

    pub async fn after_tool_execute(&self, exec: ExecutionId, event: &LifecycleEvent) {
        self.finish_span(exec, self.after_outcome(event)).await;
    }

    // --- Agent runs ---

    pub async fn before_agent_run(&self, exec: ExecutionId, event: &LifecycleEvent) {
        let operation = event
            .agent_name
            .clone()
            .or_else(|| event.operation.clone())
            .unwrap_or_else(|| "run".into());

        let mut input = Map::new();
        if let Some(value) = &event.input {
            input.insert("input".into(), value.clone());
        }
        self.begin_span(exec, "agent", operation, payload(&self.config, input))
            .await;
    }

    pub async fn after_agent_run(&self, exec: ExecutionId, event: &LifecycleEvent) {
        self.finish_span(exec, self.after_outcome(event)).await;
    }

    // --- MCP requests ---

    pub async fn on_mcp_request(&self, exec: ExecutionId, event: &LifecycleEvent) {
        let operation = event
            .request_method
            .clone()
            .or_else(|| event.operation.clone())
            .unwrap_or_else(|| "request".into());

        let mut input = Map::new();
        if let Some(server) = &event.server_name {
            input.insert("serverName".into(), Value::String(server.clone()));
        }
        if let Some(value) = &event.input {
            input.insert("input".into(), value.clone());
        }
        self.begin_span(exec, "mcp", operation, payload(&self.config, input))
            .await;
    }

    pub async fn on_mcp_response(&self, exec: ExecutionId, event: &LifecycleEvent) {
        self.finish_span(exec, self.after_outcome(event)).await;
    }

    pub async fn on_mcp_error(&self, exec: ExecutionId, event: &LifecycleEvent) {
        let message = event.error_text().unwrap_or_else(|| "MCP error".into());
        self.finish_span(exec, SpanOutcome::err(message)).await;
    }

    // --- Errors ---

    /// Treats the event as the closing half of the current span, with an
    /// error message. Depth is decremented and, at zero, the context
    /// detaches exactly as on the success path.
    pub async fn on_error(&self, exec: ExecutionId, event: &LifecycleEvent) {
        let message = event.error_text().unwrap_or_else(|| "AI error".into());
        self.finish_span(exec, SpanOutcome::err(message)).await;
    }

    // --- Application metadata ---

    /// Attach a namespaced metadata map to the execution's context,
    /// creating the context if the execution has none yet. A no-op when
    /// audit is disabled.
    pub async fn set_application_metadata(
        &self,
        exec: ExecutionId,
        namespace: impl Into<String>,
        metadata: Map<String, Value>,
    ) {
        if !self.config.enabled {
            return;
        }
        let mut executions = self.executions.lock().await;
        let state = executions.entry(exec).or_insert_with(|| self.fresh_state());
        state.context.set_context_metadata(Map::from_iter([(
            namespace.into(),
            Value::Object(metadata),
        )]));
    }

    /// Introspect the audit subsystem.
    pub async fn status(&self) -> AuditStatus {
        let active_executions = self.executions.lock().await.len();
        let stats = self.store.stats().await.unwrap_or_default();
        AuditStatus {
            enabled: self.config.enabled,
            store: self.store.name().to_string(),
            active_executions,
            total_entries: stats.total_entries,
            total_traces: stats.total_traces,
        }
    }

    // --- Internals ---

    fn fresh_state(&self) -> ExecState {
        ExecState {
            context: TraceContext::new()
                .with_store(self.store.clone())
                .with_sanitizer(self.config.sanitizer()),
            depth: 0,
        }
    }

    fn after_outcome(&self, event: &LifecycleEvent) -> SpanOutcome {
        let mut outcome = match event.error_text() {
            Some(error) => SpanOutcome::err(error),
            None => SpanOutcome::default(),
        };
        if self.config.capture_output
            && let Some(output) = event.output()
        {
            outcome.output = Some(output);
        }
        outcome
    }

    async fn begin_span(
        &self,
        exec: ExecutionId,
        span_type: &str,
        operation: String,
        input: Option<Value>,
    ) {
        if !self.config.enabled {
            return;
        }
        let mut executions = self.executions.lock().await;
        let state = executions.entry(exec).or_insert_with(|| self.fresh_state());
        match state.context.start_span(span_type, operation, input, None) {
            Ok(span_id) => {
                state.depth += 1;
                debug!(?exec, span_type, %span_id, depth = state.depth, "Audit span opened");
            }
            Err(error) => {
                warn!(?exec, span_type, %error, "Failed to open audit span");
            }
        }
    }

    /// Close the innermost span and, at depth zero, complete and detach
    /// the context. The state leaves the map while persisting so the map
    /// lock is never held across store I/O.
    async fn finish_span(&self, exec: ExecutionId, outcome: SpanOutcome) {
        if !self.config.enabled {
            return;
        }
        let Some(mut state) = self.executions.lock().await.remove(&exec) else {
            return;
        };

        state.context.end_span(outcome).await;
        state.depth = state.depth.saturating_sub(1);

        if state.depth == 0 {
            state.context.complete().await;
            if let Err(error) = self.store.flush().await {
                warn!(?exec, %error, "Failed to flush audit store");
            }
            debug!(?exec, trace_id = %state.context.trace_id(), "Audit context detached");
        } else {
            self.executions.lock().await.insert(exec, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracevault_core::entry::EntryStatus;
    use tracevault_core::store::EntryQuery;

    fn enabled_config() -> AuditConfig {
        AuditConfig {
            enabled: true,
            ..AuditConfig::default()
        }
    }

    async fn stored_entries(interceptor: &AuditInterceptor) -> Vec<tracevault_core::AuditEntry> {
        interceptor
            .store()
            .query(&EntryQuery::new().with_limit(usize::MAX))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn disabled_interceptor_records_nothing() {
        let interceptor = AuditInterceptor::new(AuditConfig::default()).await;
        let exec = ExecutionId::next();

        let event = LifecycleEvent::new().with_model("gpt-x");
        interceptor.before_model_invoke(exec, &event).await;
        interceptor.after_model_invoke(exec, &event).await;

        assert!(interceptor.active_trace_id(exec).await.is_none());
        assert!(stored_entries(&interceptor).await.is_empty());
    }

    #[tokio::test]
    async fn balanced_events_produce_nested_spans_and_detach() {
        let interceptor = AuditInterceptor::new(enabled_config()).await;
        let exec = ExecutionId::next();

        interceptor
            .before_agent_run(exec, &LifecycleEvent::new().with_agent("planner"))
            .await;
        interceptor
            .before_model_invoke(
                exec,
                &LifecycleEvent::new()
                    .with_model("claude")
                    .with_messages(json!([{"role": "user", "content": "hi"}])),
            )
            .await;
        assert!(interceptor.active_trace_id(exec).await.is_some());

        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new().with_response(json!("hello")))
            .await;
        interceptor
            .after_agent_run(exec, &LifecycleEvent::new().with_response(json!("done")))
            .await;

        // depth returned to zero: context detached
        assert!(interceptor.active_trace_id(exec).await.is_none());

        let entries = stored_entries(&interceptor).await;
        assert_eq!(entries.len(), 2);
        let model = entries.iter().find(|e| e.span_type == "model").unwrap();
        let agent = entries.iter().find(|e| e.span_type == "agent").unwrap();
        assert_eq!(model.parent_span_id.as_deref(), Some(agent.span_id.as_str()));
        assert_eq!(model.trace_id, agent.trace_id);
        assert_eq!(model.operation, "claude");
        assert_eq!(agent.operation, "planner");
    }

    #[tokio::test]
    async fn error_event_cleans_up_and_next_pair_is_well_formed() {
        let interceptor = AuditInterceptor::new(enabled_config()).await;
        let exec = ExecutionId::next();

        interceptor
            .before_model_invoke(exec, &LifecycleEvent::new().with_model("m1"))
            .await;
        interceptor
            .on_error(exec, &LifecycleEvent::new().with_error("provider exploded"))
            .await;
        assert!(interceptor.active_trace_id(exec).await.is_none());

        interceptor
            .before_model_invoke(exec, &LifecycleEvent::new().with_model("m2"))
            .await;
        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new().with_response(json!("ok")))
            .await;
        assert!(interceptor.active_trace_id(exec).await.is_none());

        let entries = stored_entries(&interceptor).await;
        assert_eq!(entries.len(), 2);
        let failed = entries.iter().find(|e| e.operation == "m1").unwrap();
        assert_eq!(failed.status, EntryStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("provider exploded"));
        let ok = entries.iter().find(|e| e.operation == "m2").unwrap();
        assert_eq!(ok.status, EntryStatus::Ok);
        // the two pairs ran in separate traces
        assert_ne!(failed.trace_id, ok.trace_id);
    }

    #[tokio::test]
    async fn error_inside_nested_spans_keeps_outer_span_open() {
        let interceptor = AuditInterceptor::new(enabled_config()).await;
        let exec = ExecutionId::next();

        interceptor
            .before_agent_run(exec, &LifecycleEvent::new().with_agent("outer"))
            .await;
        interceptor
            .before_tool_execute(exec, &LifecycleEvent::new().with_tool("shell"))
            .await;
        interceptor
            .on_error(exec, &LifecycleEvent::new().with_error_message("tool died"))
            .await;

        // outer agent span still open, context still attached
        assert!(interceptor.active_trace_id(exec).await.is_some());

        interceptor
            .after_agent_run(exec, &LifecycleEvent::new())
            .await;
        assert!(interceptor.active_trace_id(exec).await.is_none());

        let entries = stored_entries(&interceptor).await;
        assert_eq!(entries.len(), 2);
        let tool = entries.iter().find(|e| e.span_type == "tool").unwrap();
        assert_eq!(tool.status, EntryStatus::Error);
    }

    #[tokio::test]
    async fn orphan_after_event_is_harmless() {
        let interceptor = AuditInterceptor::new(enabled_config()).await;
        let exec = ExecutionId::next();

        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new().with_response(json!("stray")))
            .await;
        assert!(interceptor.active_trace_id(exec).await.is_none());
        assert!(stored_entries(&interceptor).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_executions_never_interleave() {
        let interceptor = Arc::new(AuditInterceptor::new(enabled_config()).await);
        let exec_a = ExecutionId::next();
        let exec_b = ExecutionId::next();

        interceptor
            .before_agent_run(exec_a, &LifecycleEvent::new().with_agent("a"))
            .await;
        interceptor
            .before_agent_run(exec_b, &LifecycleEvent::new().with_agent("b"))
            .await;

        let trace_a = interceptor.active_trace_id(exec_a).await.unwrap();
        let trace_b = interceptor.active_trace_id(exec_b).await.unwrap();
        assert_ne!(trace_a, trace_b);

        interceptor
            .after_agent_run(exec_a, &LifecycleEvent::new())
            .await;
        // b is untouched by a's completion
        assert_eq!(interceptor.active_trace_id(exec_b).await.unwrap(), trace_b);
        interceptor
            .after_agent_run(exec_b, &LifecycleEvent::new())
            .await;

        let entries = stored_entries(&interceptor).await;
        let a = entries.iter().find(|e| e.operation == "a").unwrap();
        let b = entries.iter().find(|e| e.operation == "b").unwrap();
        assert_ne!(a.trace_id, b.trace_id);
        assert!(a.parent_span_id.is_none());
        assert!(b.parent_span_id.is_none());
    }

    #[tokio::test]
    async fn mcp_events_map_to_mcp_spans() {
        let interceptor = AuditInterceptor::new(enabled_config()).await;
        let exec = ExecutionId::next();

        interceptor
            .on_mcp_request(
                exec,
                &LifecycleEvent::new()
                    .with_server_name("files")
                    .with_request_method("resources/list"),
            )
            .await;
        interceptor
            .on_mcp_response(exec, &LifecycleEvent::new().with_results(json!(["a.txt"])))
            .await;

        let entries = stored_entries(&interceptor).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].span_type, "mcp");
        assert_eq!(entries[0].operation, "resources/list");
        assert_eq!(entries[0].output, Some(json!(["a.txt"])));

        let exec = ExecutionId::next();
        interceptor
            .on_mcp_request(exec, &LifecycleEvent::new().with_server_name("files"))
            .await;
        interceptor
            .on_mcp_error(exec, &LifecycleEvent::new().with_error("server gone"))
            .await;
        assert!(interceptor.active_trace_id(exec).await.is_none());
    }

    #[tokio::test]
    async fn capture_flags_suppress_payloads() {
        let config = AuditConfig {
            enabled: true,
            capture_messages: false,
            capture_tool_args: false,
            capture_output: false,
            ..AuditConfig::default()
        };
        let interceptor = AuditInterceptor::new(config).await;
        let exec = ExecutionId::next();

        interceptor
            .before_model_invoke(
                exec,
                &LifecycleEvent::new()
                    .with_model("m")
                    .with_messages(json!(["private"])),
            )
            .await;
        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new().with_response(json!("secret out")))
            .await;

        interceptor
            .before_tool_execute(
                exec,
                &LifecycleEvent::new()
                    .with_tool("shell")
                    .with_arguments(json!({"cmd": "rm"})),
            )
            .await;
        interceptor
            .after_tool_execute(exec, &LifecycleEvent::new())
            .await;

        let entries = stored_entries(&interceptor).await;
        let model = entries.iter().find(|e| e.span_type == "model").unwrap();
        let input = model.input.as_ref().unwrap();
        assert_eq!(input["model"], "m");
        assert!(input.get("messages").is_none());
        assert!(model.output.is_none());

        let tool = entries.iter().find(|e| e.span_type == "tool").unwrap();
        assert!(tool.input.is_none());
    }

    #[tokio::test]
    async fn model_input_is_sanitized() {
        let interceptor = AuditInterceptor::new(enabled_config()).await;
        let exec = ExecutionId::next();

        interceptor
            .before_model_invoke(
                exec,
                &LifecycleEvent::new()
                    .with_model("m")
                    .with_messages(json!({"apiKey": "sk-123", "content": "hi"})),
            )
            .await;
        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new())
            .await;

        let entries = stored_entries(&interceptor).await;
        let input = entries[0].input.as_ref().unwrap();
        assert_eq!(input["messages"]["apiKey"], "[REDACTED]");
        assert_eq!(input["messages"]["content"], "hi");
    }

    #[tokio::test]
    async fn unknown_store_falls_back_to_memory() {
        let config = AuditConfig {
            enabled: true,
            store: "nonexistent".into(),
            ..AuditConfig::default()
        };
        let interceptor = AuditInterceptor::new(config).await;
        assert_eq!(interceptor.store().name(), "memory");

        let exec = ExecutionId::next();
        interceptor
            .before_model_invoke(exec, &LifecycleEvent::new().with_model("m"))
            .await;
        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new())
            .await;
        assert_eq!(stored_entries(&interceptor).await.len(), 1);
    }

    #[tokio::test]
    async fn jdbc_without_datasource_falls_back_to_memory() {
        let config = AuditConfig {
            enabled: true,
            store: "jdbc".into(),
            ..AuditConfig::default()
        };
        let interceptor = AuditInterceptor::new(config).await;
        assert_eq!(interceptor.store().name(), "memory");
    }

    #[tokio::test]
    async fn application_metadata_lands_on_entries() {
        let interceptor = AuditInterceptor::new(enabled_config()).await;
        let exec = ExecutionId::next();

        interceptor
            .set_application_metadata(
                exec,
                "app",
                Map::from_iter([("name".into(), json!("webshop"))]),
            )
            .await;
        interceptor
            .before_model_invoke(exec, &LifecycleEvent::new().with_model("m"))
            .await;
        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new())
            .await;

        let entries = stored_entries(&interceptor).await;
        assert_eq!(entries[0].metadata["app"]["name"], "webshop");
    }

    #[tokio::test]
    async fn status_reports_store_and_counts() {
        let interceptor = AuditInterceptor::new(enabled_config()).await;
        let exec = ExecutionId::next();

        interceptor
            .before_model_invoke(exec, &LifecycleEvent::new().with_model("m"))
            .await;
        let status = interceptor.status().await;
        assert!(status.enabled);
        assert_eq!(status.store, "memory");
        assert_eq!(status.active_executions, 1);

        interceptor
            .after_model_invoke(exec, &LifecycleEvent::new())
            .await;
        let status = interceptor.status().await;
        assert_eq!(status.active_executions, 0);
        assert_eq!(status.total_entries, 1);
        assert_eq!(status.total_traces, 1);
    }

    #[test]
    fn execution_ids_are_unique_per_thread() {
        let here = ExecutionId::current();
        assert_eq!(here, ExecutionId::current());

        let other = std::thread::spawn(ExecutionId::current).join().unwrap();
        assert_ne!(here, other);

        assert_ne!(ExecutionId::next(), ExecutionId::next());
    }
}
