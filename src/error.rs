/// Unified error handling for the query router
///
/// This module provides the error type system shared by the connection
/// manager, the analyzer, the replication monitor and the router itself.
/// Errors are split by where they can be recovered: connection failures
/// are retryable, query failures are propagated verbatim.
use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for router operations
#[derive(Debug, Error)]
pub enum RouterError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection could not be established or was lost
    #[error("Connection error on {node}: {message}")]
    Connection { node: String, message: String },

    /// Pool could not hand out a connection before the connect timeout
    #[error("Timed out acquiring a connection from {node} after {waited_ms}ms")]
    PoolTimeout { node: String, waited_ms: u64 },

    /// The database rejected the statement; message is the server's own
    #[error("{message}")]
    Query {
        node: String,
        message: String,
        code: Option<String>,
    },

    /// The statement exceeded its session-level statement timeout
    #[error("Statement timeout on {node}: {message}")]
    StatementTimeout { node: String, message: String },

    /// No node can serve the request
    #[error("No healthy connection available: {message}")]
    NoHealthyNode { message: String },

    /// Primary failed and no replica could be promoted
    #[error("Cluster is write-unavailable: {message}")]
    WriteUnavailable { message: String },

    /// Retries against the primary were exhausted
    #[error("Query failed after {attempts} retries: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Transaction control failure (BEGIN/COMMIT/ROLLBACK)
    #[error("Transaction error: {message}")]
    Transaction { message: String },

    /// Prepared statement registry errors
    #[error("Unknown prepared statement: {name}")]
    UnknownStatement { name: String },

    /// Row decoding errors
    #[error("Row decode error: {message}")]
    Decode { message: String },

    /// Cache backend errors (never fatal to a query)
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Operation attempted after shutdown
    #[error("Router is shut down")]
    Shutdown,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Shared cache tier errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("RESP protocol error: {message}")]
    Protocol { message: String },

    #[error("Cache command {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Convenience methods for creating specific error types
impl RouterError {
    /// Create a connection error
    pub fn connection<N: Into<String>, S: Into<String>>(node: N, message: S) -> Self {
        RouterError::Connection {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a query error carrying the server message verbatim
    pub fn query<N: Into<String>, S: Into<String>>(node: N, message: S) -> Self {
        RouterError::Query {
            node: node.into(),
            message: message.into(),
            code: None,
        }
    }

    /// Create a statement timeout error
    pub fn statement_timeout<N: Into<String>, S: Into<String>>(node: N, message: S) -> Self {
        RouterError::StatementTimeout {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a no-healthy-node error
    pub fn no_healthy_node<S: Into<String>>(message: S) -> Self {
        RouterError::NoHealthyNode {
            message: message.into(),
        }
    }

    /// Create a write-unavailable error
    pub fn write_unavailable<S: Into<String>>(message: S) -> Self {
        RouterError::WriteUnavailable {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction<S: Into<String>>(message: S) -> Self {
        RouterError::Transaction {
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        RouterError::Decode {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        RouterError::Internal {
            message: message.into(),
        }
    }

    /// The node the failure happened on, when it is tied to one
    pub fn node(&self) -> Option<&str> {
        match self {
            RouterError::Connection { node, .. }
            | RouterError::PoolTimeout { node, .. }
            | RouterError::Query { node, .. }
            | RouterError::StatementTimeout { node, .. } => Some(node.as_str()),
            _ => None,
        }
    }

    /// True when the failure is about reaching a node rather than the
    /// statement itself. Connection-level failures feed pool recovery.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RouterError::Network(_)
                | RouterError::Connection { .. }
                | RouterError::PoolTimeout { .. }
        )
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            RouterError::Network(_) => true,
            RouterError::Connection { .. } => true,
            RouterError::PoolTimeout { .. } => true,
            RouterError::StatementTimeout { .. } => true,
            RouterError::NoHealthyNode { .. } => true,
            RouterError::Cache(_) => true,
            _ => false,
        }
    }

    /// Errors the router's retry policy may re-run against the primary.
    /// Statement errors (syntax, constraint violations) never qualify.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RouterError::Cache(_)) && self.is_recoverable()
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RouterError::Config(_) => ErrorSeverity::Critical,
            RouterError::Internal { .. } => ErrorSeverity::Critical,
            RouterError::WriteUnavailable { .. } => ErrorSeverity::Critical,
            RouterError::Network(_) => ErrorSeverity::Warning,
            RouterError::Connection { .. } => ErrorSeverity::Warning,
            RouterError::PoolTimeout { .. } => ErrorSeverity::Warning,
            RouterError::StatementTimeout { .. } => ErrorSeverity::Warning,
            RouterError::Cache(_) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

impl CacheError {
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        CacheError::Unavailable {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        CacheError::Protocol {
            message: message.into(),
        }
    }

    pub fn command<C: Into<String>, S: Into<String>>(command: C, message: S) -> Self {
        CacheError::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = RouterError::connection("replica-1", "connection refused");
        assert!(matches!(error, RouterError::Connection { .. }));
        assert_eq!(
            error.to_string(),
            "Connection error on replica-1: connection refused"
        );
    }

    #[test]
    fn test_error_node() {
        let timeout = RouterError::PoolTimeout {
            node: "replica-2".to_string(),
            waited_ms: 500,
        };
        assert_eq!(timeout.node(), Some("replica-2"));
        assert_eq!(RouterError::no_healthy_node("none").node(), None);
    }

    #[test]
    fn test_query_error_is_verbatim() {
        let error = RouterError::query(
            "primary",
            "duplicate key value violates unique constraint \"properties_pkey\"",
        );
        assert_eq!(
            error.to_string(),
            "duplicate key value violates unique constraint \"properties_pkey\""
        );
    }

    #[test]
    fn test_error_severity() {
        let config_error = RouterError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error =
            RouterError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);

        let cache_error = RouterError::Cache(CacheError::unavailable("down"));
        assert_eq!(cache_error.severity(), ErrorSeverity::Info);
    }

    #[test]
    fn test_error_recoverability() {
        let network_error =
            RouterError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert!(network_error.is_recoverable());
        assert!(network_error.is_retryable());
        assert!(network_error.is_connection_error());

        let config_error = RouterError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());

        let syntax = RouterError::query("primary", "syntax error at or near \"SELEC\"");
        assert!(!syntax.is_retryable());
        assert!(!syntax.is_connection_error());

        let timeout = RouterError::statement_timeout("replica-1", "canceling statement");
        assert!(timeout.is_retryable());
        assert!(!timeout.is_connection_error());
    }

    #[test]
    fn test_retries_exhausted_names_count() {
        let error = RouterError::RetriesExhausted {
            attempts: 3,
            last_error: "Connection error on primary: reset".to_string(),
        };
        assert!(error.to_string().contains("after 3 retries"));
    }
}
