//! Configuration for rpcbus scopes and the WebSocket uplink

use std::time::Duration;

/// Default aggregation window between the first push and the flush
pub const DEFAULT_AGGREGATE: Duration = Duration::from_millis(1);

/// Default capacity of an endpoint's outbound queue, in envelopes
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default upper bound for a single frame payload
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Settings shared by every endpoint a scope (client, server or hub) opens
#[derive(Debug, Clone)]
pub struct ScopeConfig {
    /// Delay between the first outbound push and the batched flush
    pub aggregate: Duration,

    /// Outbound envelopes buffered per endpoint before new ones are dropped
    pub queue_capacity: usize,

    /// Largest frame payload accepted from a byte stream
    pub max_frame_len: usize,

    /// Label announced to the peer on the first flush
    pub label: Option<String>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeConfig {
    /// Create a configuration with the default aggregation window and limits
    pub fn new() -> Self {
        Self {
            aggregate: DEFAULT_AGGREGATE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            label: None,
        }
    }

    /// Set the aggregation window
    pub fn aggregate(mut self, window: Duration) -> Self {
        self.aggregate = window;
        self
    }

    /// Set the outbound queue capacity (at least one envelope)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the maximum accepted frame payload
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Set the label announced to peers
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Configuration for keeping a client attached to a WebSocket broker
#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    /// Broker URL (e.g., "ws://localhost:8080/ws")
    pub url: String,

    /// Whether to automatically reconnect on disconnect
    pub auto_reconnect: bool,

    /// Initial delay before reconnecting
    pub reconnect_delay: Duration,

    /// Maximum delay between reconnection attempts
    pub max_reconnect_delay: Duration,
}

impl WebsocketConfig {
    /// Create a new configuration for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set the reconnection delay range
    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Backoff before the given reconnect attempt (zero-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_config_defaults() {
        let config = ScopeConfig::new();

        assert_eq!(config.aggregate, Duration::from_millis(1));
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.max_frame_len, 16 * 1024 * 1024);
        assert!(config.label.is_none());
    }

    #[test]
    fn test_scope_config_builder_chain() {
        let config = ScopeConfig::new()
            .aggregate(Duration::from_millis(20))
            .queue_capacity(0)
            .max_frame_len(4096)
            .label("edge-1");

        assert_eq!(config.aggregate, Duration::from_millis(20));
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.max_frame_len, 4096);
        assert_eq!(config.label.as_deref(), Some("edge-1"));
    }

    #[test]
    fn test_websocket_config_new_defaults() {
        let config = WebsocketConfig::new("ws://localhost:8080/ws");

        assert_eq!(config.url, "ws://localhost:8080/ws");
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_websocket_config_no_reconnect() {
        let config = WebsocketConfig::new("ws://localhost:8080/ws").no_reconnect();

        assert!(!config.auto_reconnect);
    }

    #[test]
    fn test_websocket_backoff_doubles_and_caps() {
        let config = WebsocketConfig::new("ws://localhost:8080/ws")
            .reconnect_delay(Duration::from_millis(500), Duration::from_secs(3));

        assert_eq!(config.backoff(0), Duration::from_millis(500));
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(3));
        assert_eq!(config.backoff(40), Duration::from_secs(3));
    }
}
