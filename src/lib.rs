//! Shardis - client-side sharding and replication topology for Redis-compatible stores
//!
//! Keys are spread over shards with a consistent hash ring. Each shard is a
//! master/replica chain whose master can be promoted at runtime. Stateful
//! command sequences (`WATCH`/`MULTI`/`EXEC`) keep one pooled connection per
//! execution context, and subscriptions run on dedicated connections.
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod protocol;
pub mod pubsub;
pub mod replication;
pub mod sharding;
pub mod utils;

use std::sync::Arc;
use tracing::info;

pub use crate::config::Config;
pub use crate::core::command::Command;
pub use crate::core::connection::{Connector, Transport};
pub use crate::core::executor::{Executor, NodeExecutor};
pub use crate::core::fault::{Disposition, FaultClass, FaultClassifier};
pub use crate::core::pool::PoolStats;
pub use crate::core::session::{ContextId, SessionHandle};
pub use crate::core::Node;
pub use crate::error::{ShardisError, ShardisResult, TopologyError};
pub use crate::health::NodeHealth;
pub use crate::protocol::resp::RespValue;
pub use crate::protocol::TcpConnector;
pub use crate::pubsub::{MessageHandler, SubscriptionHandle};
pub use crate::replication::{ReplicaLink, ReplicationChain};
pub use crate::sharding::ShardRouter;

use crate::health::{HealthCheckManager, PingHealthChecker};
use crate::pubsub::SubscriptionManager;

/// Sharded, replicated client over a shared set of node pools
pub struct ShardedClient {
    router: ShardRouter<Arc<ReplicationChain>>,
    executor: Arc<Executor>,
    subscriptions: SubscriptionManager,
}

impl ShardedClient {
    /// Build a client over `connector`; nothing is dialed until first use
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> ShardisResult<Self> {
        config.validate()?;

        let shard_nodes: Vec<Vec<Arc<Node>>> = config
            .shards
            .iter()
            .map(|shard| {
                shard
                    .nodes
                    .iter()
                    .map(|node| Arc::new(Node::from_config(node, &config.pool)))
                    .collect()
            })
            .collect();

        let executor = Arc::new(Executor::new(
            shard_nodes.iter().flatten().cloned(),
            connector,
        ));

        let chains = shard_nodes
            .into_iter()
            .zip(&config.shards)
            .enumerate()
            .map(|(index, (nodes, shard))| {
                let name = shard
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("shard-{}", index));
                ReplicationChain::new(name, nodes, executor.clone()).map(Arc::new)
            })
            .collect::<ShardisResult<Vec<_>>>()?;

        let router = ShardRouter::new(chains, &config.sharding)?;
        info!(
            shards = router.len(),
            nodes = config.node_count(),
            virtual_nodes = config.sharding.virtual_nodes,
            hashing = ?config.sharding.hashing,
            "Sharded client ready"
        );

        Ok(Self {
            router,
            executor,
            subscriptions: SubscriptionManager::new(),
        })
    }

    /// Build a client that speaks RESP over TCP
    pub fn connect(config: Config) -> ShardisResult<Self> {
        let connector = Arc::new(TcpConnector::from_config(&config.client));
        Self::new(config, connector)
    }

    /// A fresh execution context
    pub fn new_context(&self) -> ContextId {
        ContextId::next()
    }

    /// Current master of the shard owning `shard_key`
    pub async fn route<K: AsRef<[u8]>>(&self, shard_key: K) -> Arc<Node> {
        self.shard_for(shard_key).master().await
    }

    pub fn shard_for<K: AsRef<[u8]>>(&self, shard_key: K) -> &Arc<ReplicationChain> {
        self.router.route(shard_key.as_ref())
    }

    pub fn shards(&self) -> &[Arc<ReplicationChain>] {
        self.router.all()
    }

    pub fn shard(&self, index: usize) -> ShardisResult<&Arc<ReplicationChain>> {
        self.router.get(index).ok_or_else(|| {
            TopologyError::UnknownShard {
                index,
                len: self.router.len(),
            }
            .into()
        })
    }

    pub fn router(&self) -> &ShardRouter<Arc<ReplicationChain>> {
        &self.router
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Every node of every shard, in configuration order
    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.router
            .all()
            .iter()
            .flat_map(|chain| chain.nodes().iter().cloned())
            .collect()
    }

    /// Run `command` on the master owning `shard_key`, or on the context's pinned connection
    pub async fn execute<K: AsRef<[u8]>>(
        &self,
        context: ContextId,
        shard_key: K,
        command: Command,
    ) -> ShardisResult<RespValue> {
        let node = self.route(shard_key).await;
        self.executor.execute(context, &node, command).await
    }

    pub async fn promote_master(&self, shard: usize, index: usize) -> ShardisResult<Vec<ReplicaLink>> {
        self.shard(shard)?.promote_master(index, true).await
    }

    pub async fn reset_replication(&self, shard: usize) -> ShardisResult<Vec<ReplicaLink>> {
        self.shard(shard)?.reset().await
    }

    pub async fn current_replication_order(&self, shard: usize) -> ShardisResult<Vec<Arc<Node>>> {
        Ok(self.shard(shard)?.current_order().await)
    }

    /// Pin a connection to the master owning `shard_key`
    pub async fn begin_session<K: AsRef<[u8]>>(
        &self,
        context: ContextId,
        shard_key: K,
    ) -> ShardisResult<SessionHandle> {
        let node = self.route(shard_key).await;
        self.executor.begin_session(context, &node).await
    }

    /// Returns whether the session was still open
    pub async fn end_session(&self, handle: &SessionHandle) -> bool {
        self.executor.end_session(handle.context).await
    }

    /// `WATCH` keys that all live on one shard; opens a session when needed
    pub async fn watch<K: AsRef<[u8]>>(&self, context: ContextId, keys: &[K]) -> ShardisResult<RespValue> {
        let node = self.route_together("WATCH", keys).await?;
        self.executor.watch(context, &node, keys).await
    }

    /// `MULTI` on the shard owning `shard_key`; opens a session when needed
    pub async fn multi<K: AsRef<[u8]>>(&self, context: ContextId, shard_key: K) -> ShardisResult<RespValue> {
        let node = self.route(shard_key).await;
        self.executor.multi(context, &node).await
    }

    pub async fn exec(&self, context: ContextId) -> ShardisResult<RespValue> {
        let node = self.bound_node(context, "EXEC").await?;
        self.executor.exec(context, &node).await
    }

    pub async fn discard(&self, context: ContextId) -> ShardisResult<RespValue> {
        let node = self.bound_node(context, "DISCARD").await?;
        self.executor.discard(context, &node).await
    }

    pub async fn unwatch(&self, context: ContextId) -> ShardisResult<RespValue> {
        let node = self.bound_node(context, "UNWATCH").await?;
        self.executor.unwatch(context, &node).await
    }

    /// Subscribe on the shard owning the channels; they must all share it
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        handler: Arc<dyn MessageHandler>,
        channels: &[S],
    ) -> ShardisResult<SubscriptionHandle> {
        let keys: Vec<&[u8]> = channels.iter().map(|c| c.as_ref().as_bytes()).collect();
        let node = self.route_together("SUBSCRIBE", &keys).await?;
        let pool = self.executor.pool(&node)?;
        self.subscriptions.subscribe(pool, handler, channels).await
    }

    /// Pattern-subscribe on the shard owning the patterns; they must all share it
    pub async fn psubscribe<S: AsRef<str>>(
        &self,
        handler: Arc<dyn MessageHandler>,
        patterns: &[S],
    ) -> ShardisResult<SubscriptionHandle> {
        let keys: Vec<&[u8]> = patterns.iter().map(|p| p.as_ref().as_bytes()).collect();
        let node = self.route_together("PSUBSCRIBE", &keys).await?;
        let pool = self.executor.pool(&node)?;
        self.subscriptions.psubscribe(pool, handler, patterns).await
    }

    pub fn unsubscribe<S: AsRef<str>>(&self, handle: &SubscriptionHandle, channels: &[S]) -> ShardisResult<()> {
        handle.unsubscribe(channels)
    }

    pub fn punsubscribe<S: AsRef<str>>(&self, handle: &SubscriptionHandle, patterns: &[S]) -> ShardisResult<()> {
        handle.punsubscribe(patterns)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active_subscriptions()
    }

    /// PING every node
    pub async fn health_report(&self) -> Vec<NodeHealth> {
        let checker = PingHealthChecker::new(self.executor.clone());
        HealthCheckManager::new(Box::new(checker))
            .check_all(&self.all_nodes())
            .await
    }

    /// Pool counters per node, in configuration order
    pub async fn pool_stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats = Vec::new();
        for node in self.all_nodes() {
            if let Ok(pool) = self.executor.pool(&node) {
                stats.push((node.id.clone(), pool.stats().await));
            }
        }
        stats
    }

    /// Master of the one shard owning every name; names spread over shards are rejected
    async fn route_together<K: AsRef<[u8]>>(&self, command: &str, names: &[K]) -> ShardisResult<Arc<Node>> {
        let (first, rest) = names
            .split_first()
            .ok_or_else(|| ShardisError::session_state(format!("{} needs at least one name", command)))?;
        let shard = self.router.route_index(first.as_ref());
        if let Some(stray) = rest
            .iter()
            .find(|name| self.router.route_index(name.as_ref()) != shard)
        {
            return Err(ShardisError::session_state(format!(
                "{} names span shards: {} is not on shard {}",
                command,
                String::from_utf8_lossy(stray.as_ref()),
                shard
            )));
        }
        Ok(self.shard_for(first.as_ref()).master().await)
    }

    async fn bound_node(&self, context: ContextId, command: &str) -> ShardisResult<Arc<Node>> {
        self.executor
            .bound_node(context)
            .await
            .ok_or_else(|| ShardisError::session_state(format!("{} without an open session", command)))
    }
}
