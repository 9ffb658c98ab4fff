//! Lifecycle interception for tracevault.
//!
//! The [`AuditInterceptor`] turns paired `before*`/`after*` runtime events
//! (model invocations, tool executions, agent runs, MCP requests) into
//! nested spans on per-execution [`tracevault_context::TraceContext`]s.
//! Executions are isolated through an explicit [`ExecutionId`] map, depth
//! is tracked per execution, and error events tear state down exactly
//! like their `after*` counterparts, so failures never leak contexts.

pub mod config;
pub mod event;
pub mod interceptor;

pub use config::{AuditConfig, ENV_PREFIX};
pub use event::LifecycleEvent;
pub use interceptor::{AuditInterceptor, AuditStatus, ExecutionId};
