/// Unified error handling for shardis
///
/// This module provides the error taxonomy shared by routing, replication,
/// session affinity, subscriptions and the transport layer. Every protocol
/// call returns a `ShardisResult`, which the fault classifier inspects to
/// decide what happens to the connection that produced it.

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for shardis operations
#[derive(Debug, Error)]
pub enum ShardisError {
    /// No shard could be built or selected (empty node set at build time)
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// Replication topology errors
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// The transport to a node failed; the connection is unusable
    #[error("Connection to {node} failed: {source}")]
    ConnectionFatal {
        node: String,
        #[source]
        source: io::Error,
    },

    /// The server rejected a command; the connection is still healthy
    #[error("Server error: {message}")]
    Data { message: String },

    /// Session misuse (nested session, terminal command without a session)
    #[error("Session state error: {message}")]
    SessionState { message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Unparseable or unexpected protocol frames
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Replication topology errors
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("replication chain has no nodes")]
    EmptyChain,

    #[error("master index {index} out of range for chain of {len} nodes")]
    InvalidMasterIndex { index: usize, len: usize },

    #[error("shard index {index} out of range for {len} shards")]
    UnknownShard { index: usize, len: usize },

    #[error("link `{link}` on {node} failed after {applied} applied links: {source}")]
    LinkFailed {
        node: String,
        link: String,
        applied: usize,
        #[source]
        source: Box<ShardisError>,
    },
}

/// Result type alias for shardis operations
pub type ShardisResult<T> = Result<T, ShardisError>;

/// Convenience methods for creating specific error types
impl ShardisError {
    /// Create a routing error
    pub fn routing<S: Into<String>>(message: S) -> Self {
        ShardisError::Routing {
            message: message.into(),
        }
    }

    /// Create a connection-fatal error for a node
    pub fn connection<S: Into<String>>(node: S, source: io::Error) -> Self {
        ShardisError::ConnectionFatal {
            node: node.into(),
            source,
        }
    }

    /// Create a data-level error from a server error reply
    pub fn data<S: Into<String>>(message: S) -> Self {
        ShardisError::Data {
            message: message.into(),
        }
    }

    /// Create a session state error
    pub fn session_state<S: Into<String>>(message: S) -> Self {
        ShardisError::SessionState {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ShardisError::Protocol(message.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ShardisError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        ShardisError::Internal {
            message: message.into(),
        }
    }

    /// The error code of a server rejection (`WRONGTYPE`, `ERR`, ...)
    pub fn data_code(&self) -> Option<&str> {
        match self {
            ShardisError::Data { message } => message.split_whitespace().next(),
            _ => None,
        }
    }

    /// Check if the caller may retry the operation on a fresh connection
    pub fn is_recoverable(&self) -> bool {
        match self {
            ShardisError::ConnectionFatal { .. } => true,
            ShardisError::Timeout { .. } => true,
            ShardisError::Topology(TopologyError::LinkFailed { .. }) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ShardisError::Config(_) => ErrorSeverity::Critical,
            ShardisError::Routing { .. } => ErrorSeverity::Critical,
            ShardisError::Internal { .. } => ErrorSeverity::Critical,
            ShardisError::ConnectionFatal { .. } => ErrorSeverity::Warning,
            ShardisError::Timeout { .. } => ErrorSeverity::Warning,
            ShardisError::Data { .. } => ErrorSeverity::Info,
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
