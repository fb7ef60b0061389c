//! Reactor configuration.
//!
//! Consumed read-only by the engine; validated once at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReactorError;

/// Configuration for a multi-worker I/O reactor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactorConfig {
    /// Number of dispatch worker threads (>= 1)
    pub worker_count: usize,
    /// Upper bound for every blocking multiplexer wait; also throttles the
    /// timeout sweep
    pub select_interval: Duration,
    /// Route interest-mask changes through the owning worker's queue instead
    /// of mutating the registration directly
    pub interest_ops_queueing: bool,
    /// Maximum time `shutdown` waits for worker threads to drain
    pub grace_period: Duration,
    /// Enable TCP_NODELAY on accepted and connected sockets
    pub tcp_no_delay: bool,
    /// SO_LINGER applied to accepted and connected sockets
    pub so_linger: Option<Duration>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            select_interval: Duration::from_millis(1000),
            interest_ops_queueing: false,
            grace_period: Duration::from_millis(5000),
            tcp_no_delay: false,
            so_linger: None,
        }
    }
}

impl ReactorConfig {
    /// Checks the configuration invariants.
    pub fn validate(&self) -> Result<(), ReactorError> {
        if self.worker_count == 0 {
            return Err(ReactorError::Config(
                "worker count may not be zero".into(),
            ));
        }
        if self.select_interval.is_zero() {
            return Err(ReactorError::Config(
                "select interval may not be zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ReactorConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = ReactorConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReactorError::Config(_))
        ));
    }

    #[test]
    fn zero_select_interval_rejected() {
        let config = ReactorConfig {
            select_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
