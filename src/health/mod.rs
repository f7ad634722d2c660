/// Health checking for shard nodes
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::core::command::Command;
use crate::core::executor::NodeExecutor;
use crate::core::Node;
use crate::protocol::resp::RespValue;

/// Health status of a node
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy node
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Result of one check
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub node_id: String,
    pub status: HealthStatus,
    pub latency: Duration,
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform health check on a node
    async fn check_health(&self, node: &Node) -> HealthStatus;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Sends `PING` through the pooled executor and expects `PONG`
pub struct PingHealthChecker {
    executor: Arc<dyn NodeExecutor>,
    check_timeout: Duration,
}

impl PingHealthChecker {
    pub fn new(executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            executor,
            check_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, check_timeout: Duration) -> Self {
        self.check_timeout = check_timeout;
        self
    }
}

#[async_trait]
impl HealthChecker for PingHealthChecker {
    async fn check_health(&self, node: &Node) -> HealthStatus {
        match self.executor.execute_on(node, Command::new("PING")).await {
            Ok(RespValue::SimpleString(reply)) if reply == "PONG" => HealthStatus::Healthy,
            Ok(other) => HealthStatus::Unhealthy {
                reason: format!("Unexpected PING response: {:?}", other),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}

/// Generic health check manager
pub struct HealthCheckManager {
    checker: Box<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Box<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Perform health check with timeout
    pub async fn check_node_health(&self, node: &Node) -> NodeHealth {
        let started = Instant::now();
        let status = match timeout(self.checker.check_timeout(), self.checker.check_health(node)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };

        match &status {
            HealthStatus::Healthy => tracing::debug!("Node {} is healthy", node),
            HealthStatus::Unhealthy { reason } => {
                tracing::warn!("Node {} is unhealthy: {}", node, reason)
            }
            HealthStatus::Timeout => tracing::warn!("Health check timeout for node {}", node),
        }

        NodeHealth {
            node_id: node.id.clone(),
            status,
            latency: started.elapsed(),
        }
    }

    /// Check every node concurrently; results keep the input order
    pub async fn check_all(&self, nodes: &[Arc<Node>]) -> Vec<NodeHealth> {
        join_all(nodes.iter().map(|node| self.check_node_health(node))).await
    }
}
