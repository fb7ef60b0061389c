//! The inbound half: channel bytes in, decoded lines out.

use std::io::{self, Read};

use bytes::{Buf, BytesMut};
use encoding_rs::Encoding;

use crate::error::BufferError;

const FILL_CHUNK: usize = 8 * 1024;

/// Growable buffer accumulating inbound channel bytes.
pub struct SessionInputBuffer {
    buf: BytesMut,
    encoding: &'static Encoding,
}

impl SessionInputBuffer {
    /// Creates a buffer decoding text with `encoding`.
    pub fn new(encoding: &'static Encoding) -> SessionInputBuffer {
        SessionInputBuffer {
            buf: BytesMut::with_capacity(FILL_CHUNK),
            encoding,
        }
    }

    /// Pulls available bytes from `src` without blocking.
    ///
    /// Returns the number of bytes taken, `0` when the source has nothing
    /// right now, and `-1` at end of stream.
    pub fn fill<R: Read>(&mut self, src: &mut R) -> Result<isize, BufferError> {
        let mut chunk = [0u8; FILL_CHUNK];
        loop {
            match src.read(&mut chunk) {
                Ok(0) => return Ok(-1),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n as isize);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(BufferError::Io(err)),
            }
        }
    }

    /// Whether any bytes are buffered.
    pub fn has_data(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Moves up to `dst.len()` raw bytes out of the buffer.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.buf.len().min(dst.len());
        dst[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }

    /// Takes one raw byte, if any is buffered.
    pub fn read_byte(&mut self) -> Option<u8> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.get_u8())
        }
    }

    /// Takes the next complete text line.
    ///
    /// Lines end at LF; a CR immediately before the LF is stripped. When
    /// `eof` is set, a trailing unterminated chunk counts as the final
    /// line. Returns `None` while no complete line is buffered.
    pub fn read_line(&mut self, eof: bool) -> Result<Option<String>, BufferError> {
        let raw = match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                line
            }
            None if eof && !self.buf.is_empty() => self.buf.split(),
            None => return Ok(None),
        };
        match self
            .encoding
            .decode_without_bom_handling_and_without_replacement(&raw)
        {
            Some(text) => Ok(Some(text.into_owned())),
            None => Err(BufferError::Decode),
        }
    }

    /// Discards everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
