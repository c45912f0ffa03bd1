//! Per-client configuration

use crate::constants::{DEFAULT_LISTENER_CONCURRENCY, DEFAULT_RECONNECT_INTERVAL_SECS};
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::Level;

/// Options for [`EslClient`](crate::EslClient).
///
/// Each client owns its copy; nothing here is process-wide.
/// Use [`Default::default()`] for standard settings.
#[derive(Debug, Clone)]
pub struct EslClientOptions {
    /// Redial after a failed dial or a lost socket. Default: `true`.
    pub auto_reconnect: bool,
    /// Delay before each reconnect attempt. Zero disables reconnection. Default: 5s.
    pub reconnect_interval: Duration,
    /// Reconnect attempts allowed since the last successful authentication.
    /// `0` means unlimited. Default: `0`.
    pub max_reconnect_attempts: u32,
    /// Verbosity of this client's per-frame and per-event diagnostics.
    /// Default: `INFO`.
    pub log_level: LevelFilter,
    /// Listener notifications allowed to run at once. Default: 64.
    pub listener_concurrency: usize,
    /// Upper bound on waiting for a command reply. `None` waits until the
    /// reply arrives or the socket closes. A timed-out command closes the
    /// socket, since later replies can no longer be attributed. Default: `None`.
    pub command_timeout: Option<Duration>,
}

impl Default for EslClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(DEFAULT_RECONNECT_INTERVAL_SECS),
            max_reconnect_attempts: 0,
            log_level: LevelFilter::INFO,
            listener_concurrency: DEFAULT_LISTENER_CONCURRENCY,
            command_timeout: None,
        }
    }
}

impl EslClientOptions {
    pub(crate) fn reconnect_enabled(&self) -> bool {
        self.auto_reconnect
            && !self
                .reconnect_interval
                .is_zero()
    }

    /// Whether another reconnect may follow `attempts` earlier ones.
    pub(crate) fn may_reconnect(&self, attempts: u32) -> bool {
        self.max_reconnect_attempts == 0 || attempts < self.max_reconnect_attempts
    }

    pub(crate) fn enabled(&self, level: Level) -> bool {
        level <= self.log_level
    }
}
