//! Error types for the WebSocket stream transport.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use ws_stream_transport::{Result, StreamConn};
//!
//! async fn echo_once(conn: &StreamConn) -> Result<()> {
//!     let mut buf = [0u8; 1024];
//!     let n = conn.read(&mut buf).await?;
//!     conn.write(&buf[..n]).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Closed | [`Error::ConnectionClosed`], [`Error::ListenerClosed`] |
//! | Admission | [`Error::AdmissionRejected`] |
//! | Protocol | [`Error::Protocol`] |
//! | Timing | [`Error::DeadlineExceeded`], [`Error::ConnectionTimeout`], [`Error::Cancelled`] |
//! | Transport | [`Error::Transport`], [`Error::Io`], [`Error::WebSocket`], [`Error::Tls`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::{Error as IoError, ErrorKind};
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::transport::listener::RejectReason;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// No operation in this crate retries; every variant is surfaced to the
/// immediate caller, which owns the retry and backoff policy.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when listener, connector or upgrade options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Closed Errors
    // ========================================================================
    /// Operation attempted on a closed stream connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Accept attempted on a closed listener.
    #[error("listener closed")]
    ListenerClosed,

    // ========================================================================
    // Admission Errors
    // ========================================================================
    /// The admission queue refused a new connection.
    ///
    /// An expected overload signal, not a bug.
    #[error("Admission rejected: {reason}")]
    AdmissionRejected {
        /// Why the connection was refused.
        reason: RejectReason,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// A message that cannot carry stream payload was received.
    ///
    /// The connection should be considered unusable and closed by its owner.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Timing Errors
    // ========================================================================
    /// A read or write deadline elapsed.
    #[error("Deadline exceeded: {operation}")]
    DeadlineExceeded {
        /// The operation that was interrupted.
        operation: String,
    },

    /// The WebSocket handshake did not complete in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The caller cancelled the operation before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Server-side session failure reported by the HTTP upgrade layer.
    #[error("Transport error: {0}")]
    Transport(#[from] axum::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// TLS connector setup error.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a deadline exceeded error.
    #[inline]
    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an admission rejected error.
    #[inline]
    pub fn admission_rejected(reason: RejectReason) -> Self {
        Self::AdmissionRejected { reason }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded { .. } | Self::ConnectionTimeout { .. }
        )
    }

    /// Returns `true` if the connection or listener is already closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::ListenerClosed
                | Self::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed)
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Transport(_)
                | Self::Io(_)
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry by the caller.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::DeadlineExceeded { .. }
                | Self::AdmissionRejected {
                    reason: RejectReason::Full
                }
        )
    }

    /// Maps this error onto the closest [`ErrorKind`].
    #[must_use]
    pub fn io_kind(&self) -> ErrorKind {
        match self {
            Self::Io(err) => err.kind(),
            Self::DeadlineExceeded { .. } | Self::ConnectionTimeout { .. } => ErrorKind::TimedOut,
            Self::ConnectionClosed | Self::ListenerClosed => ErrorKind::NotConnected,
            Self::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                ErrorKind::BrokenPipe
            }
            Self::AdmissionRejected { .. } => ErrorKind::ConnectionRefused,
            Self::Protocol { .. } => ErrorKind::InvalidData,
            Self::Config { .. } => ErrorKind::InvalidInput,
            Self::Cancelled => ErrorKind::Interrupted,
            Self::Transport(_) | Self::WebSocket(_) | Self::Tls(_) => ErrorKind::Other,
        }
    }
}

impl From<Error> for IoError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => IoError::new(other.io_kind(), other),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::protocol("unexpected text message");
        assert_eq!(err.to_string(), "Protocol error: unexpected text message");
    }

    #[test]
    fn test_listener_closed_display() {
        assert_eq!(Error::ListenerClosed.to_string(), "listener closed");
    }

    #[test]
    fn test_admission_rejected_display() {
        let err = Error::admission_rejected(RejectReason::Full);
        assert_eq!(
            err.to_string(),
            "Admission rejected: connection queue is full"
        );
    }

    #[test]
    fn test_is_timeout() {
        let deadline = Error::deadline_exceeded("read");
        let handshake = Error::connection_timeout(5000);
        let other = Error::ConnectionClosed;

        assert!(deadline.is_timeout());
        assert!(handshake.is_timeout());
        assert!(!other.is_timeout());
    }

    #[test]
    fn test_is_closed() {
        assert!(Error::ConnectionClosed.is_closed());
        assert!(Error::ListenerClosed.is_closed());
        assert!(Error::WebSocket(WsError::AlreadyClosed).is_closed());
        assert!(!Error::Cancelled.is_closed());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::admission_rejected(RejectReason::Full).is_recoverable());
        assert!(!Error::admission_rejected(RejectReason::Closed).is_recoverable());
        assert!(!Error::config("bad").is_recoverable());
    }

    #[test]
    fn test_into_io_error_kind() {
        let io: IoError = Error::deadline_exceeded("write").into();
        assert_eq!(io.kind(), ErrorKind::TimedOut);

        let io: IoError = Error::protocol("text").into();
        assert_eq!(io.kind(), ErrorKind::InvalidData);

        let io: IoError = Error::ConnectionClosed.into();
        assert_eq!(io.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn test_transport_error_keeps_source() {
        let inner = IoError::new(ErrorKind::BrokenPipe, "peer gone");
        let err: Error = axum::Error::new(inner).into();

        assert!(err.is_connection_error());
        assert_eq!(err.to_string(), "Transport error: peer gone");

        let source = std::error::Error::source(&err).expect("source is kept");
        assert_eq!(source.to_string(), "peer gone");
    }

    #[test]
    fn test_io_error_passthrough() {
        let original = IoError::new(ErrorKind::AddrInUse, "busy");
        let err: Error = original.into();
        assert!(matches!(err, Error::Io(_)));

        let back: IoError = err.into();
        assert_eq!(back.kind(), ErrorKind::AddrInUse);
    }
}
