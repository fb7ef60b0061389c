//! Route-keyed session pooling over the connecting reactor.
//!
//! This crate provides a pool of reactor sessions keyed by an
//! application-defined route, with optional per-session state matching,
//! per-route and total capacity caps, and FIFO queueing of lease requests
//! that exceed capacity.
//!
//! ## Features
//!
//! - **Route keys**: any `Clone + Eq + Hash` type identifies a pool
//!   partition; a [`RouteResolver`] maps it to a socket address
//! - **State matching**: leases may request a state token and are only
//!   granted idle sessions carrying that state (or none yet)
//! - **Capacity caps**: over-cap leases queue FIFO instead of failing,
//!   with optional deadlines
//! - **Managed leases**: [`ManagedSession`] releases back to the pool
//!   exactly once, reusable or not, and aborts on drop

#![warn(missing_docs)]
#![warn(clippy::all)]

mod managed;
mod pool;

pub use managed::ManagedSession;
pub use pool::{PoolConfig, PoolStats, PoolToken, RouteResolver, SessionPool};
