use std::io;

use thiserror::Error;

/// Failures raised by the session buffers.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Channel failure during fill or flush
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    /// Inbound bytes are not valid in the configured encoding
    #[error("malformed input for configured encoding")]
    Decode,
    /// Outbound text has no representation in the configured encoding
    #[error("unmappable output for configured encoding")]
    Encode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_and_encode_failures_are_distinct() {
        assert_ne!(BufferError::Decode.to_string(), BufferError::Encode.to_string());
    }
}
