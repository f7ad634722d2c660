/// Connection seam between the topology layer and the wire protocol
///
/// The core never speaks the protocol itself. It asks a `Connector` for a
/// `Transport` per physical connection and wraps it in a `PooledConnection`
/// that remembers which node and pool slot it belongs to.
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;

use crate::core::command::Command;
use crate::core::Node;
use crate::error::ShardisResult;
use crate::protocol::resp::RespValue;

/// One physical, bidirectional protocol connection
#[async_trait]
pub trait Transport: Send {
    /// Write a command without waiting for its reply
    async fn send(&mut self, command: &Command) -> ShardisResult<()>;

    /// Read the next frame; never times out
    async fn read_frame(&mut self) -> ShardisResult<RespValue>;

    /// Send a command and read its reply; server error replies become `ShardisError::Data`
    async fn request(&mut self, command: &Command) -> ShardisResult<RespValue> {
        self.send(command).await?;
        self.read_frame().await?.into_result()
    }

    /// Shut the connection down
    async fn close(&mut self) {}
}

/// Opens transports to nodes
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &Node) -> ShardisResult<Box<dyn Transport>>;
}

/// A transport owned by a node pool (or dedicated to a subscription)
pub struct PooledConnection {
    id: u64,
    node: Arc<Node>,
    transport: Box<dyn Transport>,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
    dedicated: bool,
    created_at: Instant,
    commands: u64,
}

impl PooledConnection {
    pub(crate) fn new(
        id: u64,
        node: Arc<Node>,
        transport: Box<dyn Transport>,
        dedicated: bool,
    ) -> Self {
        Self {
            id,
            node,
            transport,
            permit: None,
            dedicated,
            created_at: Instant::now(),
            commands: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Dedicated connections never return to the idle set
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn commands_executed(&self) -> u64 {
        self.commands
    }

    pub async fn request(&mut self, command: &Command) -> ShardisResult<RespValue> {
        self.commands += 1;
        self.transport.request(command).await
    }

    pub async fn send(&mut self, command: &Command) -> ShardisResult<()> {
        self.commands += 1;
        self.transport.send(command).await
    }

    pub async fn read_frame(&mut self) -> ShardisResult<RespValue> {
        self.transport.read_frame().await
    }

    pub async fn close(mut self) {
        self.permit.take();
        self.transport.close().await;
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("node", &self.node.id)
            .field("dedicated", &self.dedicated)
            .field("commands", &self.commands)
            .finish()
    }
}
