//! Centralized configuration for the tether runtime.
//!
//! Protocol limits live in constant structs; reconnection behaviour is a
//! builder-style value so wrappers can be tuned per peer.

use crate::retry::RetryConfig;
use std::time::Duration;

/// Wire-level limits for the frame codec.
pub struct FrameConfig;

impl FrameConfig {
    /// Size of the little-endian `i32` length prefix.
    pub const HEADER_SIZE: usize = 4;
    /// Largest frame body accepted before the frame is treated as garbage.
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
    /// Fixed part of every body: kind, flags, token.
    pub const ENVELOPE_SIZE: usize = 1 + 1 + 8;
}

/// Connection and transport configuration.
pub struct ConnectionConfig;

impl ConnectionConfig {
    /// Capacity of the Disconnected event channel per connection.
    pub const EVENT_CHANNEL_CAPACITY: usize = 16;
    /// Buffer size of each direction of an in-memory loopback pair.
    pub const LOOPBACK_BUFFER_SIZE: usize = 64 * 1024;
    /// Default timeout for a single connect attempt.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long a stopping writer waits for the stream to shut down.
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(250);
    /// Peers a listener server serves at once; extra peers are turned away.
    pub const MAX_SESSIONS: usize = 256;
    /// Pause after a failed accept before trying again.
    pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
}

/// Configuration for the reconnecting wrappers.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff between failed connect/accept attempts.
    pub retry: RetryConfig,
    /// Timeout applied to each individual connect attempt.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::new()
                .with_max_attempts(None)
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(30)),
            connect_timeout: ConnectionConfig::CONNECT_TIMEOUT,
        }
    }
}

impl ReconnectConfig {
    /// Create a reconnect config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the backoff policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Tight timings for loopback and tests.
    pub fn local() -> Self {
        Self {
            retry: RetryConfig::new()
                .with_max_attempts(None)
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(500))
                .with_jitter(false),
            connect_timeout: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reconnect_is_unlimited() {
        let config = ReconnectConfig::default();
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.connect_timeout, ConnectionConfig::CONNECT_TIMEOUT);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ReconnectConfig::new()
            .with_connect_timeout(Duration::from_secs(1))
            .with_retry(RetryConfig::new().with_max_attempts(Some(2)));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts, Some(2));
    }
}
