//! Error types for replication and CDC operations
//!
//! Every error carries a category so callers can decide between aborting the
//! session, reconnecting, or skipping a single event.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for alerting and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed packets, sequence mismatches, unsupported events
    ProtocolFatal,
    /// Broken connections and timeouts that a reconnect may cure
    TransientConnection,
    /// Excluded tables, missing tables, missing metadata
    Schema,
    /// Errors raised by user event handlers
    Handler,
    /// Snapshot dump failures
    Dump,
    /// Programming or data-corruption errors
    Invariant,
    /// Invalid settings
    Configuration,
    /// Everything else
    Other,
}

/// Errors produced by the replication client and the canal.
#[derive(Error, Debug)]
pub enum CanalError {
    /// Malformed packet or event body
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Received packet sequence number does not match the expected one
    #[error("Packet sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    /// ERR packet returned by the server
    #[error("Server error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },

    /// Binlog event type that cannot be decoded and is not ignorable
    #[error("Binlog event type {0} is not supported")]
    UnsupportedEvent(u8),

    /// Rows event layout that cannot be decoded
    #[error("Rows event version {0} is not supported")]
    UnsupportedRowsVersion(u8),

    /// CRC32 verification of a binlog event failed
    #[error("Binlog checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// Connection was closed or reset by the peer
    #[error("Connection broken: {0}")]
    ConnectionBroken(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The table is filtered out by the include/exclude rules
    #[error("table is excluded")]
    ExcludedTable,

    /// The table does not exist on the server
    #[error("table is not exist: {0}")]
    TableNotExist(String),

    /// Metadata for the table could not be fetched
    #[error("missing table meta: {0}")]
    MissingTableMeta(String),

    /// Error returned by a user event handler
    #[error("Handler error: {0}")]
    Handler(String),

    /// Snapshot dump failed
    #[error("Dump error: {0}")]
    Dump(String),

    /// The dump utility is not installed
    #[error("Dump utility not found: {0}")]
    DumpUtilityNotFound(String),

    /// Internal contract violated
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command connection query error
    #[error("Query error: {0}")]
    Query(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation cancelled by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CanalError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a broken-connection error
    pub fn connection_broken(msg: impl Into<String>) -> Self {
        Self::ConnectionBroken(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Create a dump error
    pub fn dump(msg: impl Into<String>) -> Self {
        Self::Dump(msg.into())
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for errors a fresh connection may cure. Protocol-fatal
    /// errors abort the current session but a reconnect starts a new one, so
    /// they are retriable at the session level as well.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionBroken(_) | Self::Timeout(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::BrokenPipe
                        | ErrorKind::UnexpectedEof
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Protocol(_)
            | Self::SequenceMismatch { .. }
            | Self::ChecksumMismatch { .. } => true,
            Self::Server { code, .. } => is_transient_server_error(*code),
            _ => false,
        }
    }

    /// Schema errors that drop the event instead of stopping the stream.
    pub fn is_skippable_table_error(&self) -> bool {
        matches!(
            self,
            Self::ExcludedTable | Self::TableNotExist(_) | Self::MissingTableMeta(_)
        )
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Protocol(_)
            | Self::SequenceMismatch { .. }
            | Self::Server { .. }
            | Self::UnsupportedEvent(_)
            | Self::UnsupportedRowsVersion(_)
            | Self::ChecksumMismatch { .. } => ErrorCategory::ProtocolFatal,
            Self::ConnectionBroken(_) | Self::Io(_) | Self::Timeout(_) | Self::Query(_) => {
                ErrorCategory::TransientConnection
            }
            Self::ExcludedTable | Self::TableNotExist(_) | Self::MissingTableMeta(_) => {
                ErrorCategory::Schema
            }
            Self::Handler(_) => ErrorCategory::Handler,
            Self::Dump(_) | Self::DumpUtilityNotFound(_) => ErrorCategory::Dump,
            Self::InvariantViolation(_) => ErrorCategory::Invariant,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Json(_) | Self::Cancelled | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::SequenceMismatch { .. } => "sequence_mismatch",
            Self::Server { .. } => "server_error",
            Self::UnsupportedEvent(_) => "unsupported_event",
            Self::UnsupportedRowsVersion(_) => "unsupported_rows_version",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::ConnectionBroken(_) => "connection_broken",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::ExcludedTable => "excluded_table",
            Self::TableNotExist(_) => "table_not_exist",
            Self::MissingTableMeta(_) => "missing_table_meta",
            Self::Handler(_) => "handler_error",
            Self::Dump(_) => "dump_error",
            Self::DumpUtilityNotFound(_) => "dump_utility_not_found",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Config(_) => "config_error",
            Self::Query(_) => "query_error",
            Self::Json(_) => "json_error",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "unknown",
        }
    }
}

/// Server error codes that signal a lost or restarting source.
fn is_transient_server_error(code: u16) -> bool {
    // ER_SERVER_SHUTDOWN, ER_NET_READ_ERROR, ER_NET_READ_INTERRUPTED,
    // ER_NET_ERROR_ON_WRITE, ER_NET_WRITE_INTERRUPTED, ER_MASTER_FATAL_ERROR_READING_BINLOG
    matches!(code, 1053 | 1158 | 1159 | 1160 | 1161 | 1236)
}

impl From<mysql_async::Error> for CanalError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            mysql_async::Error::Io(io) => Self::ConnectionBroken(io.to_string()),
            mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed) => {
                Self::ConnectionBroken("command connection closed".to_string())
            }
            mysql_async::Error::Server(server) => Self::Server {
                code: server.code,
                state: server.state,
                message: server.message,
            },
            other => Self::Query(other.to_string()),
        }
    }
}

/// Result type for canal operations
pub type Result<T> = std::result::Result<T, CanalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CanalError::SequenceMismatch {
            expected: 3,
            actual: 7,
        };
        assert!(err.to_string().contains("expected 3"));
        assert!(err.to_string().contains("got 7"));

        let err = CanalError::UnsupportedEvent(200);
        assert_eq!(err.to_string(), "Binlog event type 200 is not supported");
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(CanalError::connection_broken("reset").is_retriable());
        assert!(CanalError::timeout("5s").is_retriable());
        assert!(CanalError::protocol("short packet").is_retriable());
        assert!(CanalError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).is_retriable());

        assert!(!CanalError::handler("boom").is_retriable());
        assert!(!CanalError::config("bad config").is_retriable());
        assert!(!CanalError::invariant("odd rows").is_retriable());
        assert!(!CanalError::UnsupportedEvent(200).is_retriable());
    }

    #[test]
    fn test_skippable_table_errors() {
        assert!(CanalError::ExcludedTable.is_skippable_table_error());
        assert!(CanalError::TableNotExist("a.b".into()).is_skippable_table_error());
        assert!(CanalError::MissingTableMeta("a.b".into()).is_skippable_table_error());
        assert!(!CanalError::handler("x").is_skippable_table_error());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CanalError::protocol("x").category(),
            ErrorCategory::ProtocolFatal
        );
        assert_eq!(
            CanalError::SequenceMismatch {
                expected: 0,
                actual: 1
            }
            .category(),
            ErrorCategory::ProtocolFatal
        );
        assert_eq!(
            CanalError::timeout("x").category(),
            ErrorCategory::TransientConnection
        );
        assert_eq!(CanalError::ExcludedTable.category(), ErrorCategory::Schema);
        assert_eq!(CanalError::handler("x").category(), ErrorCategory::Handler);
        assert_eq!(CanalError::invariant("x").category(), ErrorCategory::Invariant);
    }

    #[test]
    fn test_server_error_retriable() {
        let err = CanalError::Server {
            code: 1236,
            state: "HY000".into(),
            message: "Could not find first log file name".into(),
        };
        assert!(err.is_retriable());
        let err = CanalError::Server {
            code: 1045,
            state: "28000".into(),
            message: "Access denied".into(),
        };
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CanalError::Cancelled.error_code(), "cancelled");
        assert_eq!(CanalError::timeout("x").error_code(), "timeout");
        assert_eq!(CanalError::config("x").error_code(), "config_error");
    }
}
