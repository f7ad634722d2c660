/// Session affinity for stateful command sequences
///
/// `WATCH` and `MULTI` only mean something on the connection that issued
/// them, so a session pins one pooled connection to an execution context
/// until a terminal command (or a fatal fault) ends it.
use fnv::FnvHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::core::connection::PooledConnection;
use crate::core::pool::NodePool;
use crate::core::Node;
use crate::error::{ShardisError, ShardisResult};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for one execution context (a task, a request, a handler)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a context id that has never been handed out before
    pub fn next() -> Self {
        ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ContextId {
    fn from(value: u64) -> Self {
        ContextId(value)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Server-side state the pinned connection is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Pinned explicitly, no server-side state yet
    Open,
    /// Keys are watched
    Watching,
    /// `MULTI` issued, commands are queued
    Queued,
}

/// The pinned connection; `None` once a fault has taken it away
#[derive(Debug)]
pub struct BoundConnection {
    pub connection: Option<PooledConnection>,
    pub phase: SessionPhase,
}

pub type BoundSlot = Arc<Mutex<BoundConnection>>;

/// What `resolve` hands back for a bound context
#[derive(Debug, Clone)]
pub struct BoundSession {
    pub node: Arc<Node>,
    pub slot: BoundSlot,
}

/// Connection and phase recovered from a session that just ended;
/// `connection` is `None` when a fault path already took it
#[derive(Debug)]
pub struct EndedSession {
    pub connection: Option<PooledConnection>,
    pub phase: SessionPhase,
}

/// Returned by `begin`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub context: ContextId,
    pub node_id: String,
}

/// Snapshot of one binding
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub context: ContextId,
    pub node_id: String,
    pub age: Duration,
}

struct Binding {
    node: Arc<Node>,
    slot: BoundSlot,
    created_at: Instant,
}

/// Affinity table from execution context to pinned connection
pub struct SessionAffinity {
    bindings: RwLock<FnvHashMap<ContextId, Binding>>,
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(FnvHashMap::default()),
        }
    }

    /// Pin a connection from `pool` to `context`
    pub async fn begin(&self, context: ContextId, pool: &NodePool) -> ShardisResult<SessionHandle> {
        if self.is_bound(context).await {
            return Err(already_bound(context));
        }

        let connection = pool.borrow().await?;

        let mut bindings = self.bindings.write().await;
        if bindings.contains_key(&context) {
            drop(bindings);
            pool.release(connection).await;
            return Err(already_bound(context));
        }

        let node = pool.node().clone();
        debug!(context = %context, node = %node, connection = connection.id(), "Session started");
        bindings.insert(
            context,
            Binding {
                node: node.clone(),
                slot: Arc::new(Mutex::new(BoundConnection {
                    connection: Some(connection),
                    phase: SessionPhase::Open,
                })),
                created_at: Instant::now(),
            },
        );

        Ok(SessionHandle {
            context,
            node_id: node.id.clone(),
        })
    }

    pub async fn is_bound(&self, context: ContextId) -> bool {
        self.bindings.read().await.contains_key(&context)
    }

    /// The pinned connection for `context`, or `None` to use the pool normally
    pub async fn resolve(&self, context: ContextId) -> Option<BoundSession> {
        self.bindings
            .read()
            .await
            .get(&context)
            .map(|binding| BoundSession {
                node: binding.node.clone(),
                slot: binding.slot.clone(),
            })
    }

    /// Clear the binding unconditionally.
    ///
    /// Returns `None` only when `context` was not bound, so calling this twice
    /// is a no-op the second time.
    pub async fn end(&self, context: ContextId) -> Option<EndedSession> {
        let binding = self.bindings.write().await.remove(&context)?;
        debug!(
            context = %context,
            node = %binding.node,
            age_ms = binding.created_at.elapsed().as_millis() as u64,
            "Session ended"
        );

        let mut slot = binding.slot.lock().await;
        Some(EndedSession {
            connection: slot.connection.take(),
            phase: slot.phase,
        })
    }

    pub async fn session(&self, context: ContextId) -> Option<SessionInfo> {
        self.bindings
            .read()
            .await
            .get(&context)
            .map(|binding| info(context, binding))
    }

    pub async fn session_count(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// All sessions pinned to one node
    pub async fn sessions_for_node(&self, node_id: &str) -> Vec<SessionInfo> {
        self.bindings
            .read()
            .await
            .iter()
            .filter(|(_, binding)| binding.node.id == node_id)
            .map(|(context, binding)| info(*context, binding))
            .collect()
    }
}

impl Default for SessionAffinity {
    fn default() -> Self {
        Self::new()
    }
}

fn info(context: ContextId, binding: &Binding) -> SessionInfo {
    SessionInfo {
        context,
        node_id: binding.node.id.clone(),
        age: binding.created_at.elapsed(),
    }
}

fn already_bound(context: ContextId) -> ShardisError {
    ShardisError::session_state(format!("{} already holds an open session", context))
}
