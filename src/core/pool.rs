/// Per-node connection pool
///
/// Capacity is a semaphore whose permits travel with borrowed connections.
/// Idle connections hold no permit, so `max_total` bounds connections in use
/// while `max_idle` bounds connections kept around between borrows.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::core::connection::{Connector, PooledConnection};
use crate::core::Node;
use crate::error::{ShardisError, ShardisResult};

/// Counters reported by `NodePool::stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub created: u64,
    pub evicted: u64,
}

pub struct NodePool {
    node: Arc<Node>,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<PooledConnection>>,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl NodePool {
    pub fn new(node: Arc<Node>, connector: Arc<dyn Connector>) -> Self {
        let permits = Arc::new(Semaphore::new(node.pool.max_total));
        Self {
            node,
            connector,
            idle: Mutex::new(Vec::new()),
            permits,
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Borrow a connection, waiting up to the node's `max_wait` for capacity
    pub async fn borrow(&self) -> ShardisResult<PooledConnection> {
        let wait = self.node.pool.max_wait;
        let permit = match tokio::time::timeout(wait, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ShardisError::internal("connection pool closed")),
            Err(_) => {
                return Err(ShardisError::timeout(format!(
                    "borrow connection to {} after {:?}",
                    self.node, wait
                )))
            }
        };

        let reused = self.idle.lock().await.pop();
        let mut connection = match reused {
            Some(connection) => connection,
            // The permit drops with this scope if connecting fails
            None => self.open(false).await?,
        };
        connection.permit = Some(permit);
        debug!(node = %self.node, connection = connection.id(), "Borrowed connection");
        Ok(connection)
    }

    /// Return a healthy connection
    pub async fn release(&self, mut connection: PooledConnection) {
        connection.permit.take();
        if connection.is_dedicated() {
            connection.close().await;
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() < self.node.pool.max_idle {
            debug!(node = %self.node, connection = connection.id(), "Released connection");
            idle.push(connection);
        } else {
            drop(idle);
            debug!(node = %self.node, connection = connection.id(), "Idle set full, closing connection");
            connection.close().await;
        }
    }

    /// Discard a broken connection; it is never handed out again
    pub async fn evict(&self, connection: PooledConnection) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        warn!(
            node = %self.node,
            connection = connection.id(),
            commands = connection.commands_executed(),
            "Evicting connection"
        );
        connection.close().await;
    }

    /// Open a connection that lives outside the borrow/release cycle
    pub async fn open_dedicated(&self) -> ShardisResult<PooledConnection> {
        self.open(true).await
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.node.pool.max_total - self.permits.available_permits(),
            idle: self.idle.lock().await.len(),
            created: self.created.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    async fn open(&self, dedicated: bool) -> ShardisResult<PooledConnection> {
        let transport = self.connector.connect(&self.node).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(node = %self.node, connection = id, dedicated, "Opened connection");
        Ok(PooledConnection::new(id, self.node.clone(), transport, dedicated))
    }
}
