/// RESP2 over TCP
///
/// The concrete protocol collaborator: `TcpConnector` dials nodes and
/// authenticates, `TcpTransport` frames commands and replies with the codec
/// in `resp`.
pub mod resp;

use async_trait::async_trait;
use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::core::command::Command;
use crate::core::connection::{Connector, Transport};
use crate::core::Node;
use crate::error::{ShardisError, ShardisResult};
use resp::{RespEncoder, RespParser, RespValue};

const READ_BUFFER_SIZE: usize = 8192;

/// Opens TCP connections to nodes
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout: None,
            keepalive: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: config.read_timeout_ms.map(Duration::from_millis),
            keepalive: config.keepalive_sec.map(Duration::from_secs),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    fn configure_stream(&self, stream: &TcpStream) -> Result<(), io::Error> {
        // Enable TCP_NODELAY for low latency
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, node: &Node) -> ShardisResult<Box<dyn Transport>> {
        let address = node.address();
        debug!("Connecting to node {}", node);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(address.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Network error connecting to node {}: {}", node, e);
                return Err(ShardisError::connection(node.id.clone(), e));
            }
            Err(_) => {
                debug!("Timeout connecting to node {}", node);
                return Err(ShardisError::connection(
                    node.id.clone(),
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ));
            }
        };

        if let Err(e) = self.configure_stream(&stream) {
            warn!("Failed to configure stream to {}: {}", node, e);
        }

        let mut transport = TcpTransport::new(stream, node.id.clone(), self.read_timeout);
        if let Some(password) = &node.password {
            transport.request(&Command::new("AUTH").arg(password)).await?;
        }
        if node.database != 0 {
            transport
                .request(&Command::new("SELECT").arg(node.database.to_string()))
                .await?;
        }

        debug!("Connected to node {}", node);
        Ok(Box::new(transport))
    }
}

/// A RESP connection over one TCP stream
pub struct TcpTransport {
    stream: TcpStream,
    buffer: BytesMut,
    write_buffer: BytesMut,
    node_id: String,
    read_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, node_id: String, read_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buffer: BytesMut::new(),
            node_id,
            read_timeout,
        }
    }

    fn fatal(&self, error: io::Error) -> ShardisError {
        ShardisError::connection(self.node_id.clone(), error)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, command: &Command) -> ShardisResult<()> {
        self.write_buffer.clear();
        RespEncoder::encode_command(&mut self.write_buffer, command);
        if let Err(e) = self.stream.write_all(&self.write_buffer).await {
            return Err(self.fatal(e));
        }
        Ok(())
    }

    // Bytes land in `buffer` before a frame is returned, so dropping this
    // future between reads loses nothing.
    async fn read_frame(&mut self) -> ShardisResult<RespValue> {
        loop {
            match RespParser::parse(&mut self.buffer) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(e) => return Err(ShardisError::protocol(e.to_string())),
            }

            match self.stream.read_buf(&mut self.buffer).await {
                Ok(0) => {
                    return Err(self.fatal(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    )))
                }
                Ok(_) => {}
                Err(e) => return Err(self.fatal(e)),
            }
        }
    }

    async fn request(&mut self, command: &Command) -> ShardisResult<RespValue> {
        self.send(command).await?;
        let reply = match self.read_timeout {
            Some(limit) if !command.is_blocking() => timeout(limit, self.read_frame())
                .await
                .map_err(|_| {
                    ShardisError::timeout(format!("reply to {} from {}", command.name(), self.node_id))
                })??,
            _ => self.read_frame().await?,
        };
        reply.into_result()
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serve one connection, answering every read with `reply`
    async fn serve(reply: &'static [u8]) -> Node {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if socket.write_all(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Node::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let node = serve(b"+PONG\r\n").await;
        let mut transport = TcpConnector::default().connect(&node).await.unwrap();

        let reply = transport.request(&Command::new("PING")).await.unwrap();
        assert_eq!(reply, RespValue::SimpleString("PONG".to_string()));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_server_error_is_data_error() {
        let node = serve(b"-ERR unknown command\r\n").await;
        let mut transport = TcpConnector::default().connect(&node).await.unwrap();

        let err = transport.request(&Command::new("NOPE")).await.unwrap_err();
        assert!(matches!(err, ShardisError::Data { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpConnector::default().connect(&Node::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(ShardisError::ConnectionFatal { .. })));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let connector =
            TcpConnector::new(Duration::from_secs(1)).with_read_timeout(Duration::from_millis(50));
        let mut transport = connector.connect(&Node::new("127.0.0.1", port)).await.unwrap();
        let err = transport.request(&Command::new("GET").arg("k")).await.unwrap_err();
        assert!(matches!(err, ShardisError::Timeout { .. }));
    }
}
