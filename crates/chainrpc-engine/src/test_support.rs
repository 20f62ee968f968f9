//! In-memory node for exercising the engine without sockets.
//!
//! `FakeNode` hands out a [`Connector`] backed by `tokio::io::duplex`. Each
//! successful connect yields a [`NodeConnection`] the test drives by hand:
//! read requests, answer them, push notifications, or drop it to simulate
//! a lost connection.

use crate::transport::{Connection, Connector, TransportError};
use async_trait::async_trait;
use chainrpc_config::{EngineConfig, DEFAULT_MAX_FRAME_BYTES};
use chainrpc_protocol::RequestId;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

const WAIT: Duration = Duration::from_secs(5);

/// Config with fast reconnects and no default call timeout
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.connection.endpoint = Some("tcp://fake-node:9944".into());
    config.reconnect.initial_delay_ms = 5;
    config.reconnect.max_delay_ms = 20;
    config.reconnect.max_attempts = Some(3);
    config.requests.default_timeout_seconds = None;
    config
}

struct MemoryConnector {
    refuse: AtomicBool,
    attempts: AtomicUsize,
    accepted: mpsc::UnboundedSender<NodeConnection>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "fake node refused connection",
            )));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(server);
        let node = NodeConnection {
            reader: FramedRead::new(read, LinesCodec::new()),
            writer: FramedWrite::new(write, LinesCodec::new()),
            received: Vec::new(),
        };
        if self.accepted.send(node).is_err() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "fake node dropped",
            )));
        }
        Ok(Connection::line_delimited(client, DEFAULT_MAX_FRAME_BYTES))
    }

    fn describe(&self) -> String {
        "memory://fake-node".into()
    }
}

pub struct FakeNode {
    connector: Arc<MemoryConnector>,
    accepted: Mutex<mpsc::UnboundedReceiver<NodeConnection>>,
}

impl FakeNode {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(MemoryConnector {
                refuse: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                accepted: tx,
            }),
            accepted: Mutex::new(rx),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.connector.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connection_attempts(&self) -> usize {
        self.connector.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the engine to open the next connection
    pub async fn accept(&self) -> NodeConnection {
        let mut accepted = self.accepted.lock().await;
        tokio::time::timeout(WAIT, accepted.recv())
            .await
            .expect("engine did not connect in time")
            .expect("connector dropped")
    }
}

impl Default for FakeNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Node side of one connection. Dropping it closes the connection.
pub struct NodeConnection {
    reader: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
    writer: FramedWrite<WriteHalf<DuplexStream>, LinesCodec>,
    received: Vec<Value>,
}

impl NodeConnection {
    /// Next request the engine wrote, parsed
    pub async fn next_request(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.reader.next())
            .await
            .expect("no request within timeout")
            .expect("connection closed")
            .expect("framing error");
        let request: Value = serde_json::from_str(&line).expect("request is not JSON");
        self.received.push(request.clone());
        request
    }

    /// Read the next request, assert its method, return its id and params
    pub async fn expect_request(&mut self, method: &str) -> (RequestId, Value) {
        let request = self.next_request().await;
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], method, "unexpected request {}", request);
        let id = request["id"].as_u64().expect("request id") as RequestId;
        (id, request["params"].clone())
    }

    /// Assert nothing is written for `within`
    pub async fn assert_no_request(&mut self, within: Duration) {
        if let Ok(Some(Ok(line))) = tokio::time::timeout(within, self.reader.next()).await {
            panic!("unexpected request: {}", line);
        }
    }

    pub async fn respond(&mut self, id: RequestId, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    pub async fn respond_error(&mut self, id: RequestId, code: i32, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }))
        .await;
    }

    pub async fn push(&mut self, method: &str, subscription: Value, result: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": {"subscription": subscription, "result": result}
        }))
        .await;
    }

    pub async fn push_error(&mut self, method: &str, subscription: Value, code: i32, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": {
                "subscription": subscription,
                "error": {"code": code, "message": message}
            }
        }))
        .await;
    }

    pub async fn send_raw(&mut self, frame: &str) {
        self.writer
            .send(frame.to_string())
            .await
            .expect("write to engine");
    }

    /// Every request read so far, in order
    pub fn received(&self) -> &[Value] {
        &self.received
    }

    async fn send(&mut self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }
}
