/// Core abstractions shared by routing, replication and sessions
pub mod command;
pub mod connection;
pub mod executor;
pub mod fault;
pub mod pool;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::time::Duration;

use crate::config::{NodeConfig, PoolConfig};

/// One store endpoint with its pool settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
    pub pool: PoolSettings,
}

/// Per-node pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_total: usize,
    pub max_idle: usize,
    pub max_wait: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            max_wait: Duration::from_millis(1000),
        }
    }
}

impl Node {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{}:{}/0", host, port),
            host,
            port,
            password: None,
            database: 0,
            pool: PoolSettings::default(),
        }
    }

    /// Build a node from its configuration, falling back to the pool defaults
    pub fn from_config(config: &NodeConfig, defaults: &PoolConfig) -> Self {
        Self {
            id: config.id(),
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
            database: config.database,
            pool: PoolSettings {
                max_total: config.max_total.unwrap_or(defaults.max_total),
                max_idle: config.max_idle.unwrap_or(defaults.max_idle),
                max_wait: Duration::from_millis(
                    config.max_wait_ms.unwrap_or(defaults.max_wait_ms),
                ),
            },
        }
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// `host:port` for dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_from_config() {
        let mut config = NodeConfig::new("10.0.0.5", 6380);
        config.database = 3;
        config.max_total = Some(2);
        let node = Node::from_config(&config, &PoolConfig::default());

        assert_eq!(node.id, "10.0.0.5:6380/3");
        assert_eq!(node.address(), "10.0.0.5:6380");
        assert_eq!(node.pool.max_total, 2);
        assert_eq!(node.pool.max_idle, PoolConfig::default().max_idle);
    }
}
