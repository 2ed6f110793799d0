//! Text-frame transports: WebSocket for real use, in-memory channels for
//! tests and embedding.

use futures_util::future::{self, BoxFuture};
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("connection closed")]
    Closed,

    #[error("connect failed: {0}")]
    Connect(String),
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Both halves of an open connection. Dropping it closes the connection.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections on demand; the provider calls it again after every
/// disconnect.
pub trait Transport: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Connection, TransportError>>;
}

/// Connects to a relay at `ws://host:port/<room>`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Connection, TransportError>> {
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
            log::debug!("websocket connected to {}", self.url);
            Ok(websocket_connection(ws))
        })
    }
}

/// Adapts an upgraded WebSocket to text frames. Binary, ping and pong
/// frames are skipped.
pub fn websocket_connection<S>(ws: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws.split();
    let sink = write
        .sink_map_err(TransportError::from)
        .with(|text: String| future::ready(Ok::<_, TransportError>(Message::text(text))));
    let stream = read.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(_) => None,
            Err(e) => Some(Err(TransportError::from(e))),
        })
    });
    Connection {
        sink: Box::pin(sink),
        stream: stream.boxed(),
    }
}

fn channel_connection(
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
) -> Connection {
    let sink = futures_util::sink::unfold(tx, |tx, text: String| async move {
        tx.send(text).map_err(|_| TransportError::Closed)?;
        Ok::<_, TransportError>(tx)
    });
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|text| (Ok(text), rx))
    });
    Connection {
        sink: Box::pin(sink),
        stream: stream.boxed(),
    }
}

/// Two connected in-memory endpoints.
pub fn pair() -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (channel_connection(a_tx, b_rx), channel_connection(b_tx, a_rx))
}

/// In-memory transport whose server halves arrive at a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    incoming: mpsc::UnboundedSender<Connection>,
    reachable: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<Connection>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: tx,
                reachable: Arc::new(AtomicBool::new(true)),
            },
            MemoryListener { incoming: rx },
        )
    }

    /// While unreachable every connect attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Connection, TransportError>> {
        Box::pin(async move {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("unreachable".into()));
            }
            let (client, server) = pair();
            self.incoming
                .send(server)
                .map_err(|_| TransportError::Connect("listener dropped".into()))?;
            Ok(client)
        })
    }
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_carries_frames_both_ways() {
        let (mut a, mut b) = pair();
        a.sink.send("ping".to_string()).await.unwrap();
        assert_eq!(b.stream.next().await.unwrap().unwrap(), "ping");
        b.sink.send("pong".to_string()).await.unwrap();
        assert_eq!(a.stream.next().await.unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_drop_ends_peer_stream() {
        let (a, mut b) = pair();
        drop(a);
        assert!(b.stream.next().await.is_none());
        assert!(matches!(
            b.sink.send("late".to_string()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_memory_transport_reachability() {
        let (transport, mut listener) = MemoryTransport::new();
        let mut client = transport.connect().await.unwrap();
        let mut server = listener.accept().await.unwrap();
        client.sink.send("hello".to_string()).await.unwrap();
        assert_eq!(server.stream.next().await.unwrap().unwrap(), "hello");

        transport.set_reachable(false);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Connect(_))
        ));
    }
}
