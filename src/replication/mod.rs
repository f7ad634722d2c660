/// Master/replica chain per shard
///
/// The chain is a fixed node list plus a master index. Its logical order is
/// the list rotated to start at the master, and every node after the first
/// replicates from the node before it in that order.
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::command::Command;
use crate::core::executor::NodeExecutor;
use crate::core::Node;
use crate::error::{ShardisError, ShardisResult, TopologyError};

/// One replica-direction link, by index into the configured node list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaLink {
    /// Stop following anyone
    Detach { node: usize },
    /// `node` replicates from `master`
    ReplicateFrom { node: usize, master: usize },
}

impl ReplicaLink {
    pub fn node(&self) -> usize {
        match *self {
            ReplicaLink::Detach { node } | ReplicaLink::ReplicateFrom { node, .. } => node,
        }
    }
}

/// Links for a chain of `len` nodes rooted at `master`
pub fn plan_links(len: usize, master: usize) -> Vec<ReplicaLink> {
    if len == 0 {
        return Vec::new();
    }
    let mut links = Vec::with_capacity(len);
    links.push(ReplicaLink::Detach { node: master });
    for step in 1..len {
        links.push(ReplicaLink::ReplicateFrom {
            node: (master + step) % len,
            master: (master + step - 1) % len,
        });
    }
    links
}

pub struct ReplicationChain {
    name: String,
    nodes: Vec<Arc<Node>>,
    master_index: RwLock<usize>,
    executor: Arc<dyn NodeExecutor>,
}

impl ReplicationChain {
    pub fn new<S: Into<String>>(
        name: S,
        nodes: Vec<Arc<Node>>,
        executor: Arc<dyn NodeExecutor>,
    ) -> ShardisResult<Self> {
        if nodes.is_empty() {
            return Err(TopologyError::EmptyChain.into());
        }
        Ok(Self {
            name: name.into(),
            nodes,
            master_index: RwLock::new(0),
            executor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in configuration order
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub async fn master_index(&self) -> usize {
        *self.master_index.read().await
    }

    pub async fn master(&self) -> Arc<Node> {
        let index = self.master_index().await;
        self.nodes[index].clone()
    }

    /// Nodes in replication order, master first
    pub async fn current_order(&self) -> Vec<Arc<Node>> {
        let master = self.master_index().await;
        let len = self.nodes.len();
        (0..len)
            .map(|step| self.nodes[(master + step) % len].clone())
            .collect()
    }

    /// Make node `index` the master.
    ///
    /// With `rebuild` every link of the new order is issued while the write
    /// lock is held, and the new index is committed only once all of them
    /// succeeded. Without `rebuild` only the pointer moves.
    pub async fn promote_master(&self, index: usize, rebuild: bool) -> ShardisResult<Vec<ReplicaLink>> {
        let len = self.nodes.len();
        if index >= len {
            return Err(TopologyError::InvalidMasterIndex { index, len }.into());
        }

        let mut master_index = self.master_index.write().await;
        if !rebuild {
            *master_index = index;
            info!(chain = %self.name, master = %self.nodes[index], "Master pointer moved");
            return Ok(Vec::new());
        }

        let links = plan_links(len, index);
        for (applied, link) in links.iter().enumerate() {
            let node = &self.nodes[link.node()];
            let command = self.link_command(link);
            if let Err(source) = self.executor.execute_on(node, command.clone()).await {
                warn!(
                    chain = %self.name,
                    node = %node,
                    link = %command,
                    applied,
                    "Replication link failed, master unchanged"
                );
                return Err(TopologyError::LinkFailed {
                    node: node.id.clone(),
                    link: command.to_string(),
                    applied,
                    source: Box::new(source),
                }
                .into());
            }
        }

        *master_index = index;
        info!(chain = %self.name, master = %self.nodes[index], links = links.len(), "Master promoted");
        Ok(links)
    }

    /// Back to configuration order with node 0 as master
    pub async fn reset(&self) -> ShardisResult<Vec<ReplicaLink>> {
        self.promote_master(0, true).await
    }

    /// Protocol command realizing `link`
    pub fn link_command(&self, link: &ReplicaLink) -> Command {
        match *link {
            ReplicaLink::Detach { .. } => Command::new("REPLICAOF").arg("NO").arg("ONE"),
            ReplicaLink::ReplicateFrom { master, .. } => {
                let master = &self.nodes[master];
                Command::new("REPLICAOF")
                    .arg(&master.host)
                    .arg(master.port.to_string())
            }
        }
    }

    /// `node <- master` text for one link
    pub fn describe(&self, link: &ReplicaLink) -> String {
        match *link {
            ReplicaLink::Detach { node } => format!("{} (master)", self.nodes[node]),
            ReplicaLink::ReplicateFrom { node, master } => {
                format!("{} <- {}", self.nodes[node], self.nodes[master])
            }
        }
    }
}

impl fmt::Debug for ReplicationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationChain")
            .field("name", &self.name)
            .field("nodes", &self.nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>())
            .finish()
    }
}
