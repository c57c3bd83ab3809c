//! Pool configuration.

use std::time::Duration;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of pooled connections (idle and checked out).
    pub capacity: usize,
    /// Maximum time a checkout waits for a free slot.
    pub checkout_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            checkout_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

/// Builder for pool configuration.
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set the pool capacity. A capacity of zero is raised to one.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity.max(1);
        self
    }

    /// Set the checkout timeout.
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.config.checkout_timeout = timeout;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        self.config
    }
}
