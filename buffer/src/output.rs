//! The outbound half: encoded lines in, channel bytes out.

use std::io::{self, Write};

use bytes::{Buf, BytesMut};
use encoding_rs::Encoding;

use crate::error::BufferError;

/// Growable buffer accumulating outbound channel bytes.
pub struct SessionOutputBuffer {
    buf: BytesMut,
    encoding: &'static Encoding,
}

impl SessionOutputBuffer {
    /// Creates a buffer encoding text with `encoding`.
    pub fn new(encoding: &'static Encoding) -> SessionOutputBuffer {
        SessionOutputBuffer {
            buf: BytesMut::new(),
            encoding,
        }
    }

    /// Pushes buffered bytes to `dst` without blocking.
    ///
    /// Returns the number of bytes written; `0` when the sink would
    /// block or nothing is buffered.
    pub fn flush<W: Write>(&mut self, dst: &mut W) -> Result<usize, BufferError> {
        if self.buf.is_empty() {
            return Ok(0);
        }
        loop {
            match dst.write(&self.buf) {
                Ok(n) => {
                    self.buf.advance(n);
                    return Ok(n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(BufferError::Io(err)),
            }
        }
    }

    /// Whether any bytes await flushing.
    pub fn has_data(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no bytes await flushing.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends raw bytes.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Encodes `line` and appends it with a CRLF terminator.
    ///
    /// Text the encoding cannot represent is rejected whole; nothing is
    /// buffered on failure.
    pub fn write_line(&mut self, line: &str) -> Result<(), BufferError> {
        let (encoded, _, unmappable) = self.encoding.encode(line);
        if unmappable {
            return Err(BufferError::Encode);
        }
        self.buf.extend_from_slice(&encoded);
        self.buf.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Discards everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
