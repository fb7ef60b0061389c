//! Multi-threaded non-blocking i/o reactor with connecting and listening
//! front ends.
//!
//! This crate provides the event-dispatch core: a driver thread that
//! acquires channels (outbound connects or accepted inbound connections)
//! and a pool of worker threads that each own a multiplexer and turn
//! readiness notifications into handler callbacks.
//!
//! ## Features
//!
//! - **Connecting reactor**: outbound connects tracked by waitable
//!   session requests with live deadlines
//! - **Listening reactor**: endpoint handles with pause/resume of the
//!   whole accepting side
//! - **Sessions**: thread-safe interest masks, typed extension store,
//!   inactivity timeouts, idempotent close
//! - **Fault containment**: handler errors and panics consult a
//!   pluggable exception policy; unrecovered defects land in an audit
//!   log and shut the reactor down
//! - **TLS** (feature `tls`): rustls layered transparently under any
//!   handler
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::io;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use whirl_reactor::{
//!     ConnectingReactor, EventMask, FailFastPolicy, IoHandler, ReactorConfig, Session,
//! };
//!
//! struct Echo;
//!
//! impl IoHandler for Echo {
//!     fn connected(&self, session: &Session) -> io::Result<()> {
//!         session.set_event(EventMask::READ);
//!         Ok(())
//!     }
//!     fn disconnected(&self, _session: &Session) -> io::Result<()> {
//!         Ok(())
//!     }
//!     fn input_ready(&self, session: &Session) -> io::Result<()> {
//!         // read from session.channel(), write back
//!         Ok(())
//!     }
//!     fn output_ready(&self, _session: &Session) -> io::Result<()> {
//!         Ok(())
//!     }
//!     fn timeout(&self, session: &Session) -> io::Result<()> {
//!         session.close();
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), whirl_reactor::ReactorError> {
//! let reactor = ConnectingReactor::start(
//!     ReactorConfig::default(),
//!     Arc::new(Echo),
//!     Arc::new(FailFastPolicy),
//! )?;
//! let request = reactor.connect::<()>("127.0.0.1:7000".parse().unwrap(), None, None, None)?;
//! let session = request.wait_timeout(Duration::from_secs(5))?;
//! drop(session);
//! reactor.shutdown(Duration::from_secs(5));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connecting;
pub mod engine;
pub mod error;
pub mod future;
pub mod handler;
pub mod interest;
pub mod listening;
pub mod session;
#[cfg(feature = "tls")]
pub mod tls;
mod worker;

pub use config::ReactorConfig;
pub use connecting::{resolve_addr, ConnectingReactor, SessionRequest};
pub use engine::ReactorStatus;
pub use error::{AuditEvent, ReactorError};
pub use future::{CompletionCallback, IoFuture};
pub use handler::{BufferStatus, ExceptionPolicy, FailFastPolicy, IoHandler};
pub use interest::EventMask;
pub use listening::{ListenerEndpoint, ListeningReactor};
pub use session::{ChannelGuard, ExtMap, Session, SessionStatus};
#[cfg(feature = "tls")]
pub use tls::{client_config, server_config, TlsHandler, TlsMode, TlsSession, TlsStatus};
