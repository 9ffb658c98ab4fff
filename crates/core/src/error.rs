//! Error types for the tracevault domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum.

use thiserror::Error;

/// The top-level error type for all tracevault operations.
#[derive(Debug, Error)]
pub enum AuditError {
    // --- Entry errors ---
    #[error("Entry error: {0}")]
    Entry(#[from] EntryError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our AuditError.
pub type Result<T> = std::result::Result<T, AuditError>;

// --- Bounded context errors ---

/// Violations of the audit entry invariants.
#[derive(Debug, Clone, Error)]
pub enum EntryError {
    #[error("Invalid audit entry: {0}")]
    Invalid(String),
}

/// Failures from the store family.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown store '{0}'")]
    UnknownStore(String),

    #[error("Datasource is required and must not be empty")]
    MissingDatasource,

    #[error("Invalid table name '{0}'")]
    InvalidTableName(String),

    #[error("Store not configured: {0}")]
    NotConfigured(String),

    #[error("Store is closed")]
    Closed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}
