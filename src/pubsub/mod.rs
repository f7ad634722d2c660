/// Blocking subscriptions on dedicated connections
///
/// Each subscribe call opens its own connection and hands it to a listener
/// task. The caller waits until the server has acknowledged every requested
/// channel, then keeps a handle for adding or dropping channels.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::command::Command;
use crate::core::connection::PooledConnection;
use crate::core::pool::NodePool;
use crate::core::Node;
use crate::error::{ShardisError, ShardisResult};
use crate::protocol::resp::RespValue;
use crate::utils::generate_id;

/// Callbacks invoked from the listener task
#[allow(unused_variables)]
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, channel: &str, payload: &[u8]);

    fn on_pmessage(&self, pattern: &str, channel: &str, payload: &[u8]) {}

    fn on_subscribe(&self, channel: &str, subscribed: usize) {}

    fn on_unsubscribe(&self, channel: &str, subscribed: usize) {}

    fn on_psubscribe(&self, pattern: &str, subscribed: usize) {}

    fn on_punsubscribe(&self, pattern: &str, subscribed: usize) {}

    /// The listener stopped because of `error`
    fn on_error(&self, error: &ShardisError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionKind {
    Channels,
    Patterns,
}

impl SubscriptionKind {
    fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channels => "SUBSCRIBE",
            SubscriptionKind::Patterns => "PSUBSCRIBE",
        }
    }
}

/// Shared between a handle and its listener
#[derive(Debug, Default)]
struct ListenerState {
    active: AtomicBool,
    subscribed: AtomicUsize,
}

/// Starts subscriptions and counts the live ones
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    active: Arc<AtomicUsize>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `channels` on the pool's node
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        pool: &NodePool,
        handler: Arc<dyn MessageHandler>,
        channels: &[S],
    ) -> ShardisResult<SubscriptionHandle> {
        self.start(pool, handler, SubscriptionKind::Channels, channels)
            .await
    }

    /// Subscribe to `patterns` on the pool's node
    pub async fn psubscribe<S: AsRef<str>>(
        &self,
        pool: &NodePool,
        handler: Arc<dyn MessageHandler>,
        patterns: &[S],
    ) -> ShardisResult<SubscriptionHandle> {
        self.start(pool, handler, SubscriptionKind::Patterns, patterns)
            .await
    }

    /// Subscriptions whose listener is still running
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    async fn start<S: AsRef<str>>(
        &self,
        pool: &NodePool,
        handler: Arc<dyn MessageHandler>,
        kind: SubscriptionKind,
        names: &[S],
    ) -> ShardisResult<SubscriptionHandle> {
        if names.is_empty() {
            return Err(ShardisError::session_state(format!(
                "{} needs at least one name",
                kind.subscribe_command()
            )));
        }

        let mut connection = pool.open_dedicated().await?;
        let command = Command::new(kind.subscribe_command()).args(names.iter().map(|n| n.as_ref()));
        if let Err(e) = connection.send(&command).await {
            connection.close().await;
            return Err(e);
        }

        let id = generate_id("sub");
        let node = pool.node().clone();
        let (control, commands) = mpsc::unbounded_channel();
        let acks = Arc::new(Semaphore::new(0));
        let state = Arc::new(ListenerState {
            active: AtomicBool::new(true),
            subscribed: AtomicUsize::new(0),
        });

        self.active.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(listen(
            id.clone(),
            connection,
            handler,
            commands,
            acks.clone(),
            state.clone(),
            self.active.clone(),
        ));

        let mut handle = SubscriptionHandle {
            id,
            node,
            control,
            acks,
            state,
            task: Some(task),
        };
        handle.wait_for_acks(names.len()).await?;
        info!(
            subscription = %handle.id,
            node = %handle.node,
            subscribed = handle.subscribed_count(),
            "Subscription established"
        );
        Ok(handle)
    }
}

/// Caller side of a running subscription
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: String,
    node: Arc<Node>,
    control: mpsc::UnboundedSender<Command>,
    acks: Arc<Semaphore>,
    state: Arc<ListenerState>,
    task: Option<JoinHandle<ShardisResult<()>>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    /// Channels plus patterns the server last reported
    pub fn subscribed_count(&self) -> usize {
        self.state.subscribed.load(Ordering::Acquire)
    }

    /// Add channels and wait for their acknowledgements
    pub async fn subscribe<S: AsRef<str>>(&mut self, channels: &[S]) -> ShardisResult<()> {
        self.extend(SubscriptionKind::Channels, channels).await
    }

    /// Add patterns and wait for their acknowledgements
    pub async fn psubscribe<S: AsRef<str>>(&mut self, patterns: &[S]) -> ShardisResult<()> {
        self.extend(SubscriptionKind::Patterns, patterns).await
    }

    /// Drop channels (all of them when empty); the listener exits once nothing is left
    pub fn unsubscribe<S: AsRef<str>>(&self, channels: &[S]) -> ShardisResult<()> {
        self.send(Command::new("UNSUBSCRIBE").args(channels.iter().map(|c| c.as_ref())))
    }

    /// Drop patterns (all of them when empty)
    pub fn punsubscribe<S: AsRef<str>>(&self, patterns: &[S]) -> ShardisResult<()> {
        self.send(Command::new("PUNSUBSCRIBE").args(patterns.iter().map(|p| p.as_ref())))
    }

    /// Wait for the listener to finish and return how it ended
    pub async fn join(mut self) -> ShardisResult<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| ShardisError::internal(format!("subscription listener panicked: {}", e)))?,
            None => Ok(()),
        }
    }

    async fn extend<S: AsRef<str>>(&mut self, kind: SubscriptionKind, names: &[S]) -> ShardisResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.send(Command::new(kind.subscribe_command()).args(names.iter().map(|n| n.as_ref())))?;
        self.wait_for_acks(names.len()).await
    }

    fn send(&self, command: Command) -> ShardisResult<()> {
        debug!(subscription = %self.id, command = %command, "Sending subscription command");
        self.control
            .send(command)
            .map_err(|_| ShardisError::session_state("subscription is no longer active"))
    }

    /// Block until `count` acknowledgements arrived or the listener died
    async fn wait_for_acks(&mut self, count: usize) -> ShardisResult<()> {
        let count = u32::try_from(count)
            .map_err(|_| ShardisError::session_state("too many channels in one call"))?;
        match self.acks.acquire_many(count).await {
            Ok(permits) => {
                permits.forget();
                Ok(())
            }
            Err(_) => {
                // The listener closed the semaphore on its way out
                let outcome = match self.task.take() {
                    Some(task) => task.await.map_err(|e| {
                        ShardisError::internal(format!("subscription listener panicked: {}", e))
                    })?,
                    None => Ok(()),
                };
                Err(outcome.err().unwrap_or_else(|| {
                    ShardisError::protocol("subscription ended before it was acknowledged")
                }))
            }
        }
    }
}

enum Flow {
    Continue,
    Done,
}

async fn listen(
    id: String,
    mut connection: PooledConnection,
    handler: Arc<dyn MessageHandler>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    acks: Arc<Semaphore>,
    state: Arc<ListenerState>,
    active: Arc<AtomicUsize>,
) -> ShardisResult<()> {
    let result = loop {
        tokio::select! {
            frame = connection.read_frame() => {
                let flow = frame.and_then(|frame| dispatch(handler.as_ref(), frame, &acks, &state));
                match flow {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Done) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = connection.send(&command).await {
                        break Err(e);
                    }
                }
                // Every handle is gone
                None => break Ok(()),
            }
        }
    };

    state.active.store(false, Ordering::Release);
    if let Err(e) = &result {
        warn!(subscription = %id, error = %e, "Subscription listener failed");
        handler.on_error(e);
    }
    acks.close();
    active.fetch_sub(1, Ordering::Relaxed);
    connection.close().await;
    debug!(subscription = %id, "Subscription listener stopped");
    result
}

fn dispatch(
    handler: &dyn MessageHandler,
    frame: RespValue,
    acks: &Semaphore,
    state: &ListenerState,
) -> ShardisResult<Flow> {
    let items = match frame {
        RespValue::Array(Some(items)) => items,
        RespValue::Error(message) => return Err(ShardisError::data(message)),
        other => {
            return Err(ShardisError::protocol(format!(
                "unexpected frame on subscription connection: {:?}",
                other
            )))
        }
    };

    let kind = items.first().and_then(RespValue::as_str).unwrap_or_default();
    let text = |index: usize| items.get(index).and_then(RespValue::as_str).unwrap_or_default();
    let count = || {
        items
            .get(2)
            .and_then(RespValue::as_integer)
            .map(|n| n.max(0) as usize)
            .unwrap_or_default()
    };
    let payload = |index: usize| match items.get(index) {
        Some(RespValue::BulkString(Some(data))) => &data[..],
        _ => &[][..],
    };

    match kind.to_ascii_lowercase().as_str() {
        "message" => handler.on_message(text(1), payload(2)),
        "pmessage" => handler.on_pmessage(text(1), text(2), payload(3)),
        "subscribe" | "psubscribe" => {
            let subscribed = count();
            state.subscribed.store(subscribed, Ordering::Release);
            if kind.eq_ignore_ascii_case("subscribe") {
                handler.on_subscribe(text(1), subscribed);
            } else {
                handler.on_psubscribe(text(1), subscribed);
            }
            acks.add_permits(1);
        }
        "unsubscribe" | "punsubscribe" => {
            let subscribed = count();
            state.subscribed.store(subscribed, Ordering::Release);
            if kind.eq_ignore_ascii_case("unsubscribe") {
                handler.on_unsubscribe(text(1), subscribed);
            } else {
                handler.on_punsubscribe(text(1), subscribed);
            }
            if subscribed == 0 {
                return Ok(Flow::Done);
            }
        }
        "pong" => {}
        other => {
            return Err(ShardisError::protocol(format!(
                "unexpected subscription event `{}`",
                other
            )))
        }
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{test_node, MockConnector, MockFailure};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Message(String, String),
        PMessage(String, String, String),
        Subscribed(String, usize),
        Unsubscribed(String, usize),
        Error,
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<Event>>,
        notify: tokio::sync::Notify,
    }

    impl RecordingHandler {
        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
            self.notify.notify_one();
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MessageHandler for RecordingHandler {
        fn on_message(&self, channel: &str, payload: &[u8]) {
            self.record(Event::Message(
                channel.to_string(),
                String::from_utf8_lossy(payload).to_string(),
            ));
        }

        fn on_pmessage(&self, pattern: &str, channel: &str, payload: &[u8]) {
            self.record(Event::PMessage(
                pattern.to_string(),
                channel.to_string(),
                String::from_utf8_lossy(payload).to_string(),
            ));
        }

        fn on_subscribe(&self, channel: &str, subscribed: usize) {
            self.record(Event::Subscribed(channel.to_string(), subscribed));
        }

        fn on_unsubscribe(&self, channel: &str, subscribed: usize) {
            self.record(Event::Unsubscribed(channel.to_string(), subscribed));
        }

        fn on_error(&self, _error: &ShardisError) {
            self.record(Event::Error);
        }
    }

    fn message(channel: &str, payload: &str) -> RespValue {
        RespValue::Array(Some(vec![
            RespValue::bulk("message"),
            RespValue::bulk(channel),
            RespValue::bulk(payload),
        ]))
    }

    fn setup() -> (MockConnector, NodePool, Arc<RecordingHandler>) {
        let connector = MockConnector::new();
        let pool = NodePool::new(Arc::new(test_node("10.0.0.1")), connector.arc());
        (connector, pool, Arc::new(RecordingHandler::default()))
    }

    #[tokio::test]
    async fn test_handshake_waits_for_every_channel() {
        let (connector, pool, handler) = setup();
        let manager = SubscriptionManager::new();

        let handle = manager
            .subscribe(&pool, handler.clone(), &["news", "sports"])
            .await
            .unwrap();
        assert!(handle.is_active());
        assert_eq!(handle.subscribed_count(), 2);
        assert_eq!(manager.active_subscriptions(), 1);
        assert_eq!(
            handler.events(),
            vec![
                Event::Subscribed("news".to_string(), 1),
                Event::Subscribed("sports".to_string(), 2),
            ]
        );
        // Dedicated connections do not take pool capacity
        assert_eq!(pool.stats().await.active, 0);
        assert_eq!(connector.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_messages_reach_handler() {
        let (connector, pool, handler) = setup();
        let manager = SubscriptionManager::new();
        let _handle = manager.subscribe(&pool, handler.clone(), &["news"]).await.unwrap();

        connector.push(0, message("news", "hello"));
        connector.push(
            0,
            RespValue::Array(Some(vec![
                RespValue::bulk("pmessage"),
                RespValue::bulk("n*"),
                RespValue::bulk("news"),
                RespValue::bulk("again"),
            ])),
        );
        while handler.events().len() < 3 {
            handler.notify.notified().await;
        }

        let events = handler.events();
        assert_eq!(events[1], Event::Message("news".to_string(), "hello".to_string()));
        assert_eq!(
            events[2],
            Event::PMessage("n*".to_string(), "news".to_string(), "again".to_string())
        );
    }

    #[tokio::test]
    async fn test_listener_exits_when_nothing_is_left() {
        let (connector, pool, handler) = setup();
        let manager = SubscriptionManager::new();
        let mut handle = manager.subscribe(&pool, handler.clone(), &["a"]).await.unwrap();

        handle.subscribe(&["b"]).await.unwrap();
        assert_eq!(handle.subscribed_count(), 2);

        handle.unsubscribe(&["a"]).unwrap();
        handle.unsubscribe::<&str>(&[]).unwrap();
        handle.join().await.unwrap();

        assert!(handler
            .events()
            .ends_with(&[Event::Unsubscribed("b".to_string(), 0)]));
        assert_eq!(connector.closed_connections(), vec![0]);
        assert_eq!(manager.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_rejected_subscribe_reports_error() {
        let (connector, pool, handler) = setup();
        connector.fail_next("*", "SUBSCRIBE", MockFailure::Data("NOPERM no access".into()));

        let err = SubscriptionManager::new()
            .subscribe(&pool, handler.clone(), &["secret"])
            .await
            .unwrap_err();
        assert_eq!(err.data_code(), Some("NOPERM"));
        assert_eq!(handler.events(), vec![Event::Error]);
    }

    #[tokio::test]
    async fn test_connection_loss_stops_listener() {
        let (connector, pool, handler) = setup();
        let handle = SubscriptionManager::new()
            .subscribe(&pool, handler.clone(), &["news"])
            .await
            .unwrap();

        connector.disconnect(0);
        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, ShardisError::ConnectionFatal { .. }));
        assert_eq!(handler.events().last(), Some(&Event::Error));
    }

    #[tokio::test]
    async fn test_empty_subscribe_rejected() {
        let (connector, pool, handler) = setup();
        let err = SubscriptionManager::new()
            .subscribe::<&str>(&pool, handler, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ShardisError::SessionState { .. }));
        assert_eq!(connector.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_listener() {
        let (connector, pool, handler) = setup();
        let manager = SubscriptionManager::new();
        let handle = manager.subscribe(&pool, handler, &["news"]).await.unwrap();
        drop(handle);

        for _ in 0..100 {
            if manager.active_subscriptions() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(manager.active_subscriptions(), 0);
        assert_eq!(connector.closed_connections(), vec![0]);
    }
}
