//! Lifecycle event payloads handed in by the host runtime.
//!
//! The binding layer flattens its objects before calling the
//! interceptor: model/provider/agent handles arrive as their names,
//! request data as the method string. Every field is optional; handlers
//! pick what applies to them.

use serde_json::Value;

/// Payload of one runtime lifecycle event.
#[derive(Debug, Clone, Default)]
pub struct LifecycleEvent {
    /// Model name (`model.getName()` upstream).
    pub model: Option<String>,
    /// Chat messages (`chatRequest.getMessages()` upstream).
    pub messages: Option<Value>,
    /// Free-form results of the operation.
    pub results: Option<Value>,
    /// Tool name.
    pub tool_name: Option<String>,
    /// Tool arguments.
    pub arguments: Option<Value>,
    /// Agent name (`agent.getAgentName()` upstream).
    pub agent_name: Option<String>,
    pub input: Option<Value>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub error_message: Option<String>,
    pub operation: Option<String>,
    pub can_retry: Option<bool>,
    /// Provider name (`provider.getName()` upstream).
    pub provider: Option<String>,
    /// MCP request method (`requestData.method` upstream).
    pub request_method: Option<String>,
    pub server_name: Option<String>,
}

impl LifecycleEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_messages(mut self, messages: impl Into<Value>) -> Self {
        self.messages = Some(messages.into());
        self
    }

    pub fn with_results(mut self, results: impl Into<Value>) -> Self {
        self.results = Some(results.into());
        self
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: impl Into<Value>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_response(mut self, response: impl Into<Value>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_error_message(mut self, error_message: impl Into<String>) -> Self {
        self.error_message = Some(error_message.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_can_retry(mut self, can_retry: bool) -> Self {
        self.can_retry = Some(can_retry);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_request_method(mut self, request_method: impl Into<String>) -> Self {
        self.request_method = Some(request_method.into());
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// First non-empty error text, `error` winning over `errorMessage`.
    pub fn error_text(&self) -> Option<String> {
        self.error
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| self.error_message.clone().filter(|e| !e.is_empty()))
    }

    /// The output payload of an `after*` event.
    pub fn output(&self) -> Option<Value> {
        self.response.clone().or_else(|| self.results.clone())
    }
}
