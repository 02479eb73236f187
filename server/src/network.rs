//! WebSocket front end: accept loop, handshake and frame mapping

use crate::context::AppContext;
use crate::error::{ServerError, TransportError};
use crate::session::run_session;
use crate::transport::{Connection, Inbound};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};

/// Upper bound on sending a close frame to a peer that may have stalled.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Outbound half of an accepted WebSocket.
pub struct WsConnection {
    peer: SocketAddr,
    sink: Mutex<WsSink>,
}

impl WsConnection {
    pub fn new(peer: SocketAddr, sink: WsSink) -> Self {
        Self {
            peer,
            sink: Mutex::new(sink),
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(transport_error)
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        self.send_message(Message::Text(text)).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.send_message(Message::Ping(Vec::new())).await
    }

    async fn close(&self) {
        let closed = timeout(CLOSE_TIMEOUT, async {
            self.sink.lock().await.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => debug!("Closed connection to {}", self.peer),
            Ok(Err(e)) => debug!("Close to {} failed: {}", self.peer, e),
            Err(_) => debug!("Close to {} timed out", self.peer),
        }
    }
}

fn transport_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Io(other.to_string()),
    }
}

/// Maps a received frame onto what the session cares about.
pub fn inbound_frame(frame: Result<Message, WsError>) -> Result<Inbound, TransportError> {
    match frame.map_err(transport_error)? {
        Message::Text(text) => Ok(Inbound::Text(text)),
        Message::Binary(bytes) => Ok(Inbound::Text(String::from_utf8_lossy(&bytes).into_owned())),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(Inbound::Activity),
        Message::Close(_) => Ok(Inbound::Close),
    }
}

/// Accepts WebSocket clients and runs one session per connection.
pub struct NetworkServer {
    listener: TcpListener,
    ctx: Arc<AppContext>,
}

impl NetworkServer {
    /// Binds the listener. The context must already be started.
    pub async fn bind(addr: &str, ctx: Arc<AppContext>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Only returns on a listener failure the OS will not
    /// recover from; transient accept errors are logged and retried.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        handle_connection(ctx, stream, peer).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

async fn handle_connection(ctx: Arc<AppContext>, stream: TcpStream, peer: SocketAddr) {
    let websocket = match timeout(ctx.config.handshake_timeout, accept_async(stream)).await {
        Ok(Ok(websocket)) => websocket,
        Ok(Err(e)) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake with {} timed out", peer);
            return;
        }
    };
    debug!("Accepted WebSocket connection from {}", peer);

    let (sink, stream) = websocket.split();
    let connection: Arc<dyn Connection> = Arc::new(WsConnection::new(peer, sink));
    let inbound = stream.map(inbound_frame);

    let reason = run_session(ctx, connection, inbound).await;
    debug!("Connection from {} finished: {}", peer, reason);
}
