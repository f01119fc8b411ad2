//! Connection-level configuration.

use std::time::Duration;

/// Per-connection configuration controlling backpressure and timeouts.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound messages per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when sending a message to a connection.
    pub send_timeout: Duration,
    /// Timeout used by `Connection::request` when the caller gives none.
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client-side connection pool sizing and dial policy.
#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    /// Number of live connections the pool maintains.
    pub size: usize,
    /// Dial attempts before a production failure is reported.
    pub dial_attempts: u32,
    /// Base delay between dial attempts; each retry adds up to 50% jitter.
    pub dial_backoff: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            dial_attempts: 3,
            dial_backoff: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.outbound_channel_capacity, 256);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn pool_config_defaults() {
        let config = ConnectionPoolConfig::default();
        assert_eq!(config.size, 4);
        assert_eq!(config.dial_attempts, 3);
        assert_eq!(config.dial_backoff, Duration::from_millis(200));
    }
}
