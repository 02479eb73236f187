//! WebSocket client for the canvas protocol

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ClientPacket, Pixel, Region, ServerPacket};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid packet: {0}")]
    Packet(#[from] serde_json::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("no packet within {0:?}")]
    Timeout(Duration),
}

/// A connected canvas client.
pub struct GridClient {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

impl GridClient {
    /// Connects to `server`, given as `host:port` or a full `ws://` URL.
    pub async fn connect(server: &str) -> Result<Self, ClientError> {
        let url = if server.starts_with("ws://") || server.starts_with("wss://") {
            server.to_string()
        } else {
            format!("ws://{}", server)
        };
        let (websocket, _) = connect_async(url.as_str()).await?;
        info!("Connected to {}", url);

        let (sink, stream) = websocket.split();
        Ok(Self { sink, stream })
    }

    pub async fn place_pixel(&mut self, x: i64, y: i64, color: i64) -> Result<(), ClientError> {
        let packet = ClientPacket::Update(Pixel::new(x, y, color));
        self.send_raw(packet.to_json()?).await
    }

    /// Requests the inclusive rectangle `(x1, y1)..=(x2, y2)`. The answer
    /// arrives as a `BATCH_UPDATE` among the live packets.
    pub async fn fetch_region(
        &mut self,
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
    ) -> Result<(), ClientError> {
        let packet = ClientPacket::Fetch(Region { x1, y1, x2, y2 });
        self.send_raw(packet.to_json()?).await
    }

    pub async fn request_config(&mut self) -> Result<(), ClientError> {
        self.send_raw(ClientPacket::Config.to_json()?).await
    }

    /// Sends an arbitrary text frame.
    pub async fn send_raw(&mut self, text: String) -> Result<(), ClientError> {
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Next packet from the server. Control frames are skipped.
    pub async fn next_packet(&mut self) -> Result<ServerPacket, ClientError> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => return Err(ClientError::Closed),
            };
            match message {
                Message::Text(text) => return Ok(ServerPacket::from_json(&text)?),
                Message::Close(_) => return Err(ClientError::Closed),
                Message::Binary(_) => warn!("Ignoring binary frame"),
                other => debug!("Skipping frame: {:?}", other),
            }
        }
    }

    pub async fn next_packet_timeout(
        &mut self,
        limit: Duration,
    ) -> Result<ServerPacket, ClientError> {
        match tokio::time::timeout(limit, self.next_packet()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(limit)),
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.sink.close().await?;
        Ok(())
    }
}
