//! Connectors producing framed connections to a node.
//!
//! Socket transports carry one JSON document per line. WebSocket carries
//! one JSON document per text message.

use async_trait::async_trait;
use chainrpc_config::{ConnectionConfig, Endpoint};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One established connection, split into its outbound and inbound halves
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    /// Newline-delimited JSON over any byte stream.
    ///
    /// An inbound line longer than `max_frame_bytes` surfaces as
    /// [`TransportError::Codec`].
    pub fn line_delimited<S>(io: S, max_frame_bytes: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        let stream = FramedRead::new(read, LinesCodec::new_with_max_length(max_frame_bytes))
            .map(|line| line.map_err(TransportError::from));
        let sink = SinkExt::<String>::sink_map_err(
            FramedWrite::new(write, LinesCodec::new()),
            TransportError::from,
        );
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Human-readable target, used in logs
    fn describe(&self) -> String;
}

#[cfg(unix)]
pub struct UnixConnector {
    path: std::path::PathBuf,
    max_frame_bytes: usize,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<std::path::PathBuf>, max_frame_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_frame_bytes,
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let stream = tokio::net::UnixStream::connect(&self.path).await?;
        debug!(path = %self.path.display(), "Unix socket connected");
        Ok(Connection::line_delimited(stream, self.max_frame_bytes))
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

pub struct TcpConnector {
    addr: String,
    max_frame_bytes: usize,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, max_frame_bytes: usize) -> Self {
        Self {
            addr: addr.into(),
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let stream = tokio::net::TcpStream::connect(self.addr.as_str()).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "TCP connected");
        Ok(Connection::line_delimited(stream, self.max_frame_bytes))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

pub struct WsConnector {
    url: String,
    max_frame_bytes: usize,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, max_frame_bytes: usize) -> Self {
        Self {
            url: url.into(),
            max_frame_bytes,
        }
    }
}

fn ws_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::WebSocket(err.to_string())
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let config = WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_bytes))
            .max_frame_size(Some(self.max_frame_bytes));
        let (socket, _response) =
            tokio_tungstenite::connect_async_with_config(self.url.as_str(), Some(config), true)
                .await
                .map_err(ws_error)?;
        debug!(url = %self.url, "WebSocket connected");

        let (write, read) = socket.split();
        let sink = write
            .sink_map_err(ws_error)
            .with(|frame: String| future::ready(Ok::<_, TransportError>(Message::text(frame))));
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes.to_vec()).ok().map(Ok),
                // Ping/pong are answered by tungstenite; close ends the stream
                Ok(_) => None,
                Err(err) => Some(Err(ws_error(err))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Connector for a configured endpoint
pub fn connector_for(endpoint: &Endpoint, connection: &ConnectionConfig) -> Arc<dyn Connector> {
    let max = connection.max_frame_bytes;
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => Arc::new(UnixConnector::new(path.clone(), max)),
        #[cfg(not(unix))]
        Endpoint::Unix(path) => Arc::new(TcpConnector::new(path.display().to_string(), max)),
        Endpoint::Tcp(addr) => Arc::new(TcpConnector::new(addr.clone(), max)),
        Endpoint::WebSocket(url) => Arc::new(WsConnector::new(url.clone(), max)),
    }
}
