//! In-memory connector used by unit tests.
//!
//! Every transport records the commands it receives, answers with canned
//! replies, and can be told to fail the next command fatally or with a
//! server error. Pub/sub acknowledgements are generated like a real server.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::core::command::Command;
use crate::core::connection::{Connector, Transport};
use crate::core::Node;
use crate::error::{ShardisError, ShardisResult};
use crate::protocol::resp::RespValue;

/// Failure injected into the next matching command
#[derive(Debug, Clone)]
pub(crate) enum MockFailure {
    Fatal,
    Data(String),
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCommand {
    pub connection: usize,
    pub node: String,
    pub command: Command,
}

#[derive(Default)]
struct MockState {
    opened: Vec<String>,
    closed: Vec<usize>,
    log: Vec<RecordedCommand>,
    failures: VecDeque<(String, String, MockFailure)>,
    inboxes: Vec<mpsc::UnboundedSender<Result<RespValue, ()>>>,
    refuse: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Fail the next `command` sent to `node` (`*` matches any node)
    pub fn fail_next(&self, node: &str, command: &str, failure: MockFailure) {
        self.state.lock().unwrap().failures.push_back((
            node.to_string(),
            command.to_ascii_uppercase(),
            failure,
        ));
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().unwrap().opened.len()
    }

    pub fn closed_connections(&self) -> Vec<usize> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().unwrap().log.clone()
    }

    /// Rendered commands sent to one node, in order
    pub fn commands_for(&self, node: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.node == node)
            .map(|c| c.command.to_string())
            .collect()
    }

    /// Deliver a server push frame to connection `index`
    pub fn push(&self, index: usize, frame: RespValue) {
        let state = self.state.lock().unwrap();
        let _ = state.inboxes[index].send(Ok(frame));
    }

    /// Make connection `index` fail its pending read
    pub fn disconnect(&self, index: usize) {
        let state = self.state.lock().unwrap();
        let _ = state.inboxes[index].send(Err(()));
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, node: &Node) -> ShardisResult<Box<dyn Transport>> {
        let mut state = self.state.lock().unwrap();
        if state.refuse {
            return Err(ShardisError::connection(
                node.id.clone(),
                io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let index = state.opened.len();
        state.opened.push(node.id.clone());
        state.inboxes.push(tx.clone());
        Ok(Box::new(MockTransport {
            index,
            node: node.id.clone(),
            state: self.state.clone(),
            outbox: tx,
            inbox: rx,
            channels: Vec::new(),
            patterns: Vec::new(),
            broken: false,
        }))
    }
}

struct MockTransport {
    index: usize,
    node: String,
    state: Arc<Mutex<MockState>>,
    outbox: mpsc::UnboundedSender<Result<RespValue, ()>>,
    inbox: mpsc::UnboundedReceiver<Result<RespValue, ()>>,
    channels: Vec<String>,
    patterns: Vec<String>,
    broken: bool,
}

impl MockTransport {
    fn broken_error(&self) -> ShardisError {
        ShardisError::connection(
            self.node.clone(),
            io::Error::new(io::ErrorKind::ConnectionReset, "mock connection reset"),
        )
    }

    fn take_failure(&self, command: &Command) -> Option<MockFailure> {
        let mut state = self.state.lock().unwrap();
        let position = state.failures.iter().position(|(node, name, _)| {
            (node == "*" || *node == self.node) && name == command.name()
        })?;
        state.failures.remove(position).map(|(_, _, failure)| failure)
    }

    fn reply(&self, frame: RespValue) {
        let _ = self.outbox.send(Ok(frame));
    }

    fn ack(&self, kind: &str, name: Option<&str>, count: usize) {
        self.reply(RespValue::Array(Some(vec![
            RespValue::bulk(kind),
            match name {
                Some(name) => RespValue::bulk(name),
                None => RespValue::BulkString(None),
            },
            RespValue::Integer(count as i64),
        ])));
    }

    fn total(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }

    fn unsubscribe(&mut self, command: &Command, patterns: bool) {
        let kind = if patterns { "punsubscribe" } else { "unsubscribe" };
        let requested: Vec<String> = command
            .arguments()
            .iter()
            .map(|a| String::from_utf8_lossy(a).to_string())
            .collect();
        let targets = if requested.is_empty() {
            if patterns { self.patterns.clone() } else { self.channels.clone() }
        } else {
            requested
        };
        if targets.is_empty() {
            self.ack(kind, None, self.total());
            return;
        }
        for name in targets {
            let list = if patterns { &mut self.patterns } else { &mut self.channels };
            list.retain(|existing| *existing != name);
            self.ack(kind, Some(&name), self.total());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, command: &Command) -> ShardisResult<()> {
        if self.broken {
            return Err(self.broken_error());
        }
        self.state.lock().unwrap().log.push(RecordedCommand {
            connection: self.index,
            node: self.node.clone(),
            command: command.clone(),
        });

        match self.take_failure(command) {
            Some(MockFailure::Fatal) => {
                self.broken = true;
                return Err(self.broken_error());
            }
            Some(MockFailure::Data(message)) => {
                self.reply(RespValue::Error(message));
                return Ok(());
            }
            None => {}
        }

        match command.name() {
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                let patterns = command.name() == "PSUBSCRIBE";
                for arg in command.arguments() {
                    let name = String::from_utf8_lossy(arg).to_string();
                    if patterns {
                        self.patterns.push(name.clone());
                        self.ack("psubscribe", Some(&name), self.total());
                    } else {
                        self.channels.push(name.clone());
                        self.ack("subscribe", Some(&name), self.total());
                    }
                }
            }
            "UNSUBSCRIBE" => self.unsubscribe(command, false),
            "PUNSUBSCRIBE" => self.unsubscribe(command, true),
            "PING" => self.reply(RespValue::SimpleString("PONG".to_string())),
            "MULTI" | "WATCH" | "UNWATCH" | "DISCARD" | "REPLICAOF" | "SET" | "SELECT"
            | "AUTH" => self.reply(RespValue::SimpleString("OK".to_string())),
            "EXEC" => self.reply(RespValue::Array(Some(Vec::new()))),
            "GET" => self.reply(RespValue::BulkString(None)),
            _ => self.reply(RespValue::SimpleString("QUEUED".to_string())),
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> ShardisResult<RespValue> {
        if self.broken {
            return Err(self.broken_error());
        }
        match self.inbox.recv().await {
            Some(Ok(frame)) => Ok(frame),
            _ => {
                self.broken = true;
                Err(self.broken_error())
            }
        }
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed.push(self.index);
    }
}

/// A node with small pool limits for tests
pub(crate) fn test_node(host: &str) -> Node {
    let mut node = Node::new(host, 6379);
    node.pool.max_total = 2;
    node.pool.max_idle = 2;
    node.pool.max_wait = std::time::Duration::from_millis(50);
    node
}
