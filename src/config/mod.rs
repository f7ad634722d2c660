/// Configuration management for shardis

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Default number of ring points per shard
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

/// Main shardis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection behaviour shared by every node
    #[serde(default)]
    pub client: ClientConfig,
    /// Hash ring configuration
    #[serde(default)]
    pub sharding: ShardingConfig,
    /// Default pool sizing, overridable per node
    #[serde(default)]
    pub pool: PoolConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Shards in ring order; each shard is a replication chain
    pub shards: Vec<ShardConfig>,
}

/// Client connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Reply read timeout in milliseconds; blocking commands ignore it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
    /// TCP keepalive interval in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_sec: Option<u64>,
}

/// Hash ring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Ring points per shard
    pub virtual_nodes: usize,
    /// Hash function used for ring points and shard keys
    pub hashing: HashAlgorithm,
    /// Route on the `{tag}` part of a shard key when present
    pub key_tags: bool,
}

/// Hash functions available for the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Fnv1a,
}

/// Connection pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum connections per node (borrowed + idle)
    pub max_total: usize,
    /// Maximum idle connections kept per node
    pub max_idle: usize,
    /// Maximum time to wait for a connection, in milliseconds
    pub max_wait_ms: u64,
}

/// One shard: an ordered replication chain, node 0 is the initial master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeConfig>,
}

/// One node of a shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub database: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            read_timeout_ms: Some(2000),
            keepalive_sec: Some(60),
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            hashing: HashAlgorithm::Md5,
            key_tags: true,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            max_wait_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            database: 0,
            max_total: None,
            max_idle: None,
            max_wait_ms: None,
        }
    }

    /// Identifier used for pools and logs: `host:port/db`
    pub fn id(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            sharding: ShardingConfig::default(),
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
            shards: vec![ShardConfig {
                name: None,
                nodes: vec![NodeConfig::new("127.0.0.1", 6379)],
            }],
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.client.read_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "read_timeout_ms must be greater than 0 when set".to_string(),
            ));
        }

        if self.sharding.virtual_nodes == 0 {
            return Err(ConfigError::ValidationError(
                "virtual_nodes must be greater than 0".to_string(),
            ));
        }

        validate_pool(self.pool.max_total, self.pool.max_idle, self.pool.max_wait_ms)?;

        if self.shards.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one shard is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (index, shard) in self.shards.iter().enumerate() {
            if shard.nodes.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "shard {} has no nodes",
                    index
                )));
            }

            for node in &shard.nodes {
                if node.host.trim().is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "shard {} has a node with an empty host",
                        index
                    )));
                }
                if node.port == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid port for node {}",
                        node.id()
                    )));
                }
                if !seen.insert(node.id()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Duplicate node: {}",
                        node.id()
                    )));
                }
                validate_pool(
                    node.max_total.unwrap_or(self.pool.max_total),
                    node.max_idle.unwrap_or(self.pool.max_idle),
                    node.max_wait_ms.unwrap_or(self.pool.max_wait_ms),
                )?;
            }
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Total number of configured nodes across all shards
    pub fn node_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.nodes.len()).sum()
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "sharded" => Config {
                shards: ["10.0.1.20", "10.0.1.21", "10.0.1.22"]
                    .iter()
                    .enumerate()
                    .map(|(i, host)| ShardConfig {
                        name: Some(format!("shard-{}", i)),
                        nodes: vec![NodeConfig::new(*host, 6379)],
                    })
                    .collect(),
                ..Default::default()
            },
            "replicated" => Config {
                shards: vec![ShardConfig {
                    name: Some("chain".to_string()),
                    nodes: vec![
                        NodeConfig::new("10.0.1.30", 6379),
                        NodeConfig::new("10.0.1.31", 6379),
                        NodeConfig::new("10.0.1.32", 6379),
                    ],
                }],
                ..Default::default()
            },
            _ => return Err(ConfigError::ValidationError(
                "Mode must be 'sharded' or 'replicated'".to_string(),
            )),
        };

        config.save_to_file(path)
    }
}

fn validate_pool(max_total: usize, max_idle: usize, max_wait_ms: u64) -> Result<(), ConfigError> {
    if max_total == 0 {
        return Err(ConfigError::ValidationError(
            "pool max_total must be greater than 0".to_string(),
        ));
    }
    if max_idle > max_total {
        return Err(ConfigError::ValidationError(
            "pool max_idle cannot exceed max_total".to_string(),
        ));
    }
    if max_wait_ms == 0 {
        return Err(ConfigError::ValidationError(
            "pool max_wait_ms must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
