//! Reactor error types and the audit log event record.

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the reactor, its intent futures, and the pool built
/// on top of it.
///
/// The I/O variant wraps its cause in an `Arc` so terminal future states can
/// be cloned out to every waiter.
#[derive(Error, Debug, Clone)]
pub enum ReactorError {
    /// Underlying socket or multiplexer failure
    #[error("i/o failure: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Host name could not be resolved to a socket address
    #[error("host could not be resolved: {0}")]
    Unresolved(String),

    /// Operation submitted after the reactor left the ACTIVE state
    #[error("i/o reactor has been shut down")]
    IllegalState,

    /// Pending intent exceeded its deadline
    #[error("operation timed out")]
    Timeout,

    /// Pending intent was cancelled before it could resolve
    #[error("operation cancelled")]
    Cancelled,

    /// A protocol handler panicked inside a dispatch callback
    #[error("handler fault: {0}")]
    HandlerFault(String),

    /// Invalid reactor configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TLS protocol failure
    #[cfg(feature = "tls")]
    #[error("tls failure: {0}")]
    Tls(String),
}

impl From<io::Error> for ReactorError {
    fn from(err: io::Error) -> Self {
        ReactorError::Io(Arc::new(err))
    }
}

impl ReactorError {
    /// Whether this error is the distinct timeout outcome rather than a
    /// genuine fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReactorError::Timeout)
    }
}

/// A fatal or logged reactor error along with the time it was recorded.
///
/// Appended to the in-memory audit log, inspectable after shutdown.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// The recorded cause
    pub error: ReactorError,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub(crate) fn now(error: ReactorError) -> Self {
        AuditEvent {
            error,
            timestamp: Utc::now(),
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.timestamp, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_clone_through_arc() {
        let err: ReactorError = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        let copy = err.clone();
        assert!(matches!(copy, ReactorError::Io(_)));
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn timeout_is_distinct() {
        assert!(ReactorError::Timeout.is_timeout());
        assert!(!ReactorError::Cancelled.is_timeout());
    }

    #[test]
    fn audit_event_renders_timestamp_and_cause() {
        let event = AuditEvent::now(ReactorError::IllegalState);
        let rendered = event.to_string();
        assert!(rendered.contains("shut down"));
    }
}
