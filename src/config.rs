//! Configuration for channels and subscriptions.
//!
//! Plain config structs with sensible defaults and fluent setters. A
//! [`ChannelConfig`] is attached to a [`Channel`](crate::Channel) at
//! construction and inherited by the operations and subscriptions it creates.

use std::time::Duration;

/// Default timeout for connect waits.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for operation waits.
pub const DEFAULT_OPERATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default subscription queue capacity (delivery slots in the free pool).
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

/// Configuration for a channel and everything created from it.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Timeout applied by the blocking connect helpers.
    pub connect_timeout: Duration,
    /// Timeout applied by the blocking operate/get/put helpers.
    pub operate_timeout: Duration,
    /// Number of delivery slots in a subscription's free pool.
    ///
    /// Must be at least 1; fixed at subscription connect time.
    pub queue_capacity: usize,
}

impl ChannelConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operate_timeout: DEFAULT_OPERATE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the operate timeout.
    pub fn operate_timeout(mut self, timeout: Duration) -> Self {
        self.operate_timeout = timeout;
        self
    }

    /// Set the subscription queue capacity.
    ///
    /// Values below 1 are clamped to 1.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}
