//! Paired input and output buffers attachable to a session.

use encoding_rs::Encoding;
use parking_lot::{Mutex, MutexGuard};
use whirl_reactor::BufferStatus;

use crate::input::SessionInputBuffer;
use crate::output::SessionOutputBuffer;

/// One session's input and output buffers behind locks, so the reactor's
/// buffer-status query and the handler can share them.
///
/// Install with `session.set_buffer_status(buffers.clone())` after
/// wrapping in an `Arc`.
pub struct IoBuffers {
    input: Mutex<SessionInputBuffer>,
    output: Mutex<SessionOutputBuffer>,
}

impl IoBuffers {
    /// Creates a buffer pair transcoding with `encoding`.
    pub fn new(encoding: &'static Encoding) -> IoBuffers {
        IoBuffers {
            input: Mutex::new(SessionInputBuffer::new(encoding)),
            output: Mutex::new(SessionOutputBuffer::new(encoding)),
        }
    }

    /// Locks the input buffer.
    pub fn input(&self) -> MutexGuard<'_, SessionInputBuffer> {
        self.input.lock()
    }

    /// Locks the output buffer.
    pub fn output(&self) -> MutexGuard<'_, SessionOutputBuffer> {
        self.output.lock()
    }
}

impl BufferStatus for IoBuffers {
    fn has_buffered_input(&self) -> bool {
        self.input.lock().has_data()
    }

    fn has_buffered_output(&self) -> bool {
        self.output.lock().has_data()
    }
}
