//! Callback surfaces: the protocol handler and the exception policy.

use std::io;

use crate::session::Session;

/// Event callbacks delivered to the protocol layer.
///
/// All callbacks for a given session run on the worker thread that owns its
/// registration; implementations never race against themselves for one
/// session. Callbacks are expected to mutate the session's interest mask and
/// move bytes through its channel. An `Err` return routes through the
/// reactor's [`ExceptionPolicy`].
pub trait IoHandler: Send + Sync {
    /// A new session has been created and handed to the protocol layer.
    fn connected(&self, session: &Session) -> io::Result<()>;

    /// The session has been closed; fired exactly once per session.
    fn disconnected(&self, session: &Session) -> io::Result<()>;

    /// The session's channel is ready to produce input.
    fn input_ready(&self, session: &Session) -> io::Result<()>;

    /// The session's channel is ready to accept output.
    fn output_ready(&self, session: &Session) -> io::Result<()>;

    /// The session's socket timeout elapsed without activity.
    fn timeout(&self, session: &Session) -> io::Result<()>;
}

/// Classifies faults raised by handlers or per-registration I/O.
///
/// `true` means recoverable: the fault is logged and the dispatch loop
/// continues. `false` means fatal: the fault is appended to the audit log and
/// the whole reactor begins shutting down.
pub trait ExceptionPolicy: Send + Sync {
    /// Classify an I/O error raised during dispatch.
    fn handle_io(&self, _err: &io::Error) -> bool {
        false
    }

    /// Classify a runtime fault (handler panic) caught during dispatch.
    fn handle_fault(&self, _detail: &str) -> bool {
        false
    }
}

/// Default policy: every fault is fatal.
///
/// Matches the behavior when no handler is installed: fail fast and inspect
/// the audit log.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFastPolicy;

impl ExceptionPolicy for FailFastPolicy {}

/// Query object a session uses to report pending buffered bytes.
pub trait BufferStatus: Send + Sync {
    /// Whether the input side holds undrained data.
    fn has_buffered_input(&self) -> bool;

    /// Whether the output side holds unflushed data.
    fn has_buffered_output(&self) -> bool;
}
