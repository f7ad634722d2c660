/// Command execution over pooled or session-pinned connections
///
/// Every path runs the reply through the fault classifier: data errors keep
/// the connection, anything else evicts it and ends the session bound to it.
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::command::Command;
use crate::core::connection::{Connector, PooledConnection};
use crate::core::fault::{Disposition, FaultClassifier};
use crate::core::pool::NodePool;
use crate::core::session::{BoundSession, ContextId, SessionAffinity, SessionHandle, SessionPhase};
use crate::core::Node;
use crate::error::{ShardisError, ShardisResult};
use crate::protocol::resp::RespValue;

/// Runs a single command on a node with no session involved
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute_on(&self, node: &Node, command: Command) -> ShardisResult<RespValue>;
}

/// The stateful step a session command performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStep {
    Watch,
    Multi,
    Exec,
    Discard,
    Unwatch,
}

impl SessionStep {
    fn opens_session(self) -> bool {
        matches!(self, SessionStep::Watch | SessionStep::Multi)
    }

    fn is_terminal(self) -> bool {
        matches!(self, SessionStep::Exec | SessionStep::Discard | SessionStep::Unwatch)
    }

    fn check(self, phase: SessionPhase) -> ShardisResult<()> {
        let allowed = match self {
            SessionStep::Watch | SessionStep::Multi | SessionStep::Unwatch => {
                phase != SessionPhase::Queued
            }
            SessionStep::Exec | SessionStep::Discard => phase == SessionPhase::Queued,
        };
        if allowed {
            Ok(())
        } else {
            Err(ShardisError::session_state(format!(
                "{:?} is not allowed while the session is {:?}",
                self, phase
            )))
        }
    }

    fn next_phase(self) -> Option<SessionPhase> {
        match self {
            SessionStep::Watch => Some(SessionPhase::Watching),
            SessionStep::Multi => Some(SessionPhase::Queued),
            _ => None,
        }
    }
}

pub struct Executor {
    pools: FnvHashMap<String, Arc<NodePool>>,
    affinity: SessionAffinity,
}

impl Executor {
    pub fn new<I>(nodes: I, connector: Arc<dyn Connector>) -> Self
    where
        I: IntoIterator<Item = Arc<Node>>,
    {
        let pools = nodes
            .into_iter()
            .map(|node| {
                let id = node.id.clone();
                (id, Arc::new(NodePool::new(node, connector.clone())))
            })
            .collect();
        Self {
            pools,
            affinity: SessionAffinity::new(),
        }
    }

    pub fn pool(&self, node: &Node) -> ShardisResult<&Arc<NodePool>> {
        self.pools
            .get(&node.id)
            .ok_or_else(|| ShardisError::routing(format!("no pool for node {}", node.id)))
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<NodePool>> {
        self.pools.values()
    }

    pub fn affinity(&self) -> &SessionAffinity {
        &self.affinity
    }

    /// Node the context's session is pinned to
    pub async fn bound_node(&self, context: ContextId) -> Option<Arc<Node>> {
        self.affinity.resolve(context).await.map(|bound| bound.node)
    }

    /// Run `command` on `node`, on the context's pinned connection if it has one
    pub async fn execute(
        &self,
        context: ContextId,
        node: &Node,
        command: Command,
    ) -> ShardisResult<RespValue> {
        match self.affinity.resolve(context).await {
            Some(bound) => {
                ensure_same_node(context, &bound, node)?;
                self.execute_bound(context, &bound, &command).await
            }
            None => self.execute_pooled(node, &command).await,
        }
    }

    /// Borrow, run one command, then release or evict
    pub async fn execute_pooled(&self, node: &Node, command: &Command) -> ShardisResult<RespValue> {
        let pool = self.pool(node)?;
        let mut connection = pool.borrow().await?;
        let result = connection.request(command).await;
        Self::dispose(pool, connection, &result).await;
        result
    }

    async fn dispose(pool: &NodePool, connection: PooledConnection, result: &ShardisResult<RespValue>) {
        let disposition = match result {
            Ok(_) => Disposition::Release,
            Err(err) => FaultClassifier::classify(err).disposition(),
        };
        match disposition {
            Disposition::Release => pool.release(connection).await,
            Disposition::Evict => pool.evict(connection).await,
        }
    }

    async fn execute_bound(
        &self,
        context: ContextId,
        bound: &BoundSession,
        command: &Command,
    ) -> ShardisResult<RespValue> {
        let mut slot = bound.slot.lock().await;
        let connection = slot
            .connection
            .as_mut()
            .ok_or_else(|| ShardisError::session_state(format!("{} lost its connection", context)))?;

        let result = connection.request(command).await;
        if let Err(err) = &result {
            let class = FaultClassifier::classify(err);
            if class.clears_affinity() {
                let broken = slot.connection.take();
                drop(slot);
                warn!(context = %context, node = %bound.node, fault = %class, "Session connection failed");
                self.abandon_session(context, broken).await;
            }
        }
        result
    }

    /// Evict a broken session connection and clear the binding
    async fn abandon_session(&self, context: ContextId, broken: Option<PooledConnection>) {
        let leftover = self.affinity.end(context).await.and_then(|ended| ended.connection);
        for connection in broken.into_iter().chain(leftover) {
            match self.pool(connection.node()) {
                Ok(pool) => pool.evict(connection).await,
                Err(_) => connection.close().await,
            }
        }
    }

    /// Pin a connection to `node` for `context`
    pub async fn begin_session(&self, context: ContextId, node: &Node) -> ShardisResult<SessionHandle> {
        let pool = self.pool(node)?;
        self.affinity.begin(context, pool).await
    }

    /// End the context's session and return its connection to the pool.
    ///
    /// Queued or watched state is discarded first so the next borrower gets a
    /// clean connection. Returns whether the context was bound, including
    /// when a fault already took the connection away.
    pub async fn end_session(&self, context: ContextId) -> bool {
        let ended = match self.affinity.end(context).await {
            Some(ended) => ended,
            None => return false,
        };

        let mut connection = match ended.connection {
            Some(connection) => connection,
            None => return true,
        };
        let cleanup = match ended.phase {
            SessionPhase::Open => None,
            SessionPhase::Watching => Some(Command::new("UNWATCH")),
            SessionPhase::Queued => Some(Command::new("DISCARD")),
        };
        let result = match cleanup {
            Some(command) => connection.request(&command).await,
            None => Ok(RespValue::SimpleString("OK".to_string())),
        };

        match self.pool(connection.node()) {
            Ok(pool) => Self::dispose(pool, connection, &result).await,
            Err(_) => connection.close().await,
        }
        true
    }

    pub async fn watch<I, K>(&self, context: ContextId, node: &Node, keys: I) -> ShardisResult<RespValue>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let command = Command::new("WATCH").args(keys);
        if command.arguments().is_empty() {
            return Err(ShardisError::session_state("WATCH needs at least one key"));
        }
        self.session_command(context, node, command, SessionStep::Watch).await
    }

    pub async fn multi(&self, context: ContextId, node: &Node) -> ShardisResult<RespValue> {
        self.session_command(context, node, Command::new("MULTI"), SessionStep::Multi)
            .await
    }

    pub async fn exec(&self, context: ContextId, node: &Node) -> ShardisResult<RespValue> {
        self.session_command(context, node, Command::new("EXEC"), SessionStep::Exec)
            .await
    }

    pub async fn discard(&self, context: ContextId, node: &Node) -> ShardisResult<RespValue> {
        self.session_command(context, node, Command::new("DISCARD"), SessionStep::Discard)
            .await
    }

    pub async fn unwatch(&self, context: ContextId, node: &Node) -> ShardisResult<RespValue> {
        self.session_command(context, node, Command::new("UNWATCH"), SessionStep::Unwatch)
            .await
    }

    async fn session_command(
        &self,
        context: ContextId,
        node: &Node,
        command: Command,
        step: SessionStep,
    ) -> ShardisResult<RespValue> {
        let (bound, opened) = match self.affinity.resolve(context).await {
            Some(bound) => {
                ensure_same_node(context, &bound, node)?;
                (bound, false)
            }
            None if step.opens_session() => {
                self.begin_session(context, node).await?;
                let bound = self.affinity.resolve(context).await.ok_or_else(|| {
                    ShardisError::internal(format!("{} lost its session while opening it", context))
                })?;
                (bound, true)
            }
            None => {
                return Err(ShardisError::session_state(format!(
                    "{} without an open session",
                    command.name()
                )))
            }
        };

        let mut slot = bound.slot.lock().await;
        step.check(slot.phase)?;
        let connection = slot
            .connection
            .as_mut()
            .ok_or_else(|| ShardisError::session_state(format!("{} lost its connection", context)))?;

        let result = connection.request(&command).await;
        match &result {
            Ok(_) => {
                if let Some(phase) = step.next_phase() {
                    slot.phase = phase;
                }
            }
            Err(err) => {
                let class = FaultClassifier::classify(err);
                if class.clears_affinity() {
                    let broken = slot.connection.take();
                    drop(slot);
                    warn!(context = %context, node = %bound.node, fault = %class, "{} failed", command.name());
                    self.abandon_session(context, broken).await;
                    return result;
                }
            }
        }
        drop(slot);

        if step.is_terminal() || (opened && result.is_err()) {
            self.release_session(context).await;
        }
        debug!(context = %context, node = %bound.node, command = command.name(), "Session command done");
        result
    }

    /// Clear the binding and return a healthy connection to its pool
    async fn release_session(&self, context: ContextId) {
        if let Some(connection) = self.affinity.end(context).await.and_then(|ended| ended.connection) {
            match self.pool(connection.node()) {
                Ok(pool) => pool.release(connection).await,
                Err(_) => connection.close().await,
            }
        }
    }
}

#[async_trait]
impl NodeExecutor for Executor {
    async fn execute_on(&self, node: &Node, command: Command) -> ShardisResult<RespValue> {
        self.execute_pooled(node, &command).await
    }
}

fn ensure_same_node(context: ContextId, bound: &BoundSession, node: &Node) -> ShardisResult<()> {
    if bound.node.id == node.id {
        Ok(())
    } else {
        Err(ShardisError::session_state(format!(
            "{} is pinned to {} but the command routes to {}",
            context, bound.node, node
        )))
    }
}
