//! Charset-aware i/o buffering for reactor sessions.
//!
//! This crate provides growable input and output buffers that move bytes
//! between a non-blocking channel and line-oriented text, decoding and
//! encoding with a configurable character encoding. A paired
//! [`IoBuffers`] plugs into the reactor's buffer-status query so close
//! decisions can account for undrained data.
//!
//! ## Features
//!
//! - **Non-blocking fill/flush**: would-block is a count of zero, end of
//!   stream a count of minus one, never an error
//! - **Line codec**: LF-delimited reads with CR stripping, CRLF-appended
//!   writes
//! - **Strict transcoding**: malformed input and unmappable output
//!   surface as distinct errors instead of replacement characters

#![warn(missing_docs)]
#![warn(clippy::all)]

mod buffers;
mod error;
mod input;
mod output;

pub use buffers::IoBuffers;
pub use error::BufferError;
pub use input::SessionInputBuffer;
pub use output::SessionOutputBuffer;
