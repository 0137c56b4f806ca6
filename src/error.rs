//! Error types for the query assistant.
//!
//! Defines the main error enum used throughout the application.

use thiserror::Error;

/// Main error type for query-assistant operations.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution errors (syntax errors, unknown column/table, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// SQL rejected by the read-only safety gate or whitelist check.
    #[error("SQL safety violation: {0}")]
    SqlUnsafe(String),

    /// LLM API errors (rate limits, auth, timeouts, etc.)
    #[error("LLM error: {0}")]
    Llm(String),

    /// A node received or produced a JSON shape that does not satisfy its contract.
    #[error("Graph node '{node}' contract violation: {message}")]
    NodeContract { node: String, message: String },

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence errors (state database, chat history, workflow log).
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Authentication/authorization errors.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Errors exporting chat result rows (CSV, filesystem).
    #[error("Export error: {0}")]
    Export(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a SQL-safety error with the given message.
    pub fn sql_unsafe(msg: impl Into<String>) -> Self {
        Self::SqlUnsafe(msg.into())
    }

    /// Creates an LLM error with the given message.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    /// Creates a node-contract error for the given node name.
    pub fn node_contract(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeContract {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates an auth error with the given message.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Creates an export error with the given message.
    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for logging/display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Query(_) => "Query Error",
            Self::SqlUnsafe(_) => "SQL Safety Error",
            Self::Llm(_) => "LLM Error",
            Self::NodeContract { .. } => "Node Contract Error",
            Self::Config(_) => "Configuration Error",
            Self::Persistence(_) => "Persistence Error",
            Self::Auth(_) => "Auth Error",
            Self::Export(_) => "Export Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Returns the stable `reason_code` used in `/api/chat` responses and
    /// workflow log rows, per the result-return truth table.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "db_connection_error",
            Self::Query(_) => "execution_error",
            Self::SqlUnsafe(_) => "readonly_violation",
            Self::Llm(_) => "llm_error",
            Self::NodeContract { .. } => "node_contract_error",
            Self::Config(_) => "config_error",
            Self::Persistence(_) => "persistence_error",
            Self::Auth(_) => "auth_error",
            Self::Export(_) => "export_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Result type alias using AppError.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_connection() {
        let err = AppError::connection("Cannot connect to localhost:5432");
        assert_eq!(
            err.to_string(),
            "Connection error: Cannot connect to localhost:5432"
        );
        assert_eq!(err.category(), "Connection Error");
    }

    #[test]
    fn test_error_display_sql_unsafe() {
        let err = AppError::sql_unsafe("SQL 验证失败：仅允许查询语句（SELECT/WITH）");
        assert_eq!(err.category(), "SQL Safety Error");
        assert_eq!(err.reason_code(), "readonly_violation");
    }

    #[test]
    fn test_node_contract_error_fields() {
        let err = AppError::node_contract("intent_recognition", "missing merged_query");
        match &err {
            AppError::NodeContract { node, message } => {
                assert_eq!(node, "intent_recognition");
                assert_eq!(message, "missing merged_query");
            }
            _ => panic!("expected NodeContract"),
        }
        assert_eq!(err.reason_code(), "node_contract_error");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AppError>();
    }
}
