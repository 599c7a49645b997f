//! Worker-side WebSocket client.
//!
//! Connects to `/ws/agents/{id}`, decodes [`ServerMessage`] frames and sends
//! [`AgentMessage`] frames. Used by the `mothership agent` demo worker and by
//! the server's end-to-end tests.

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::protocol::{AgentMessage, ServerMessage, TaskReport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct AgentClient {
    tx: SplitSink<WsStream, Message>,
    rx: SplitStream<WsStream>,
}

impl AgentClient {
    /// Open a connection to `url`, e.g. `ws://127.0.0.1:8080/ws/agents/<id>`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        debug!(%url, "agent client connected");
        let (tx, rx) = ws_stream.split();
        Ok(Self { tx, rx })
    }

    pub async fn send(&mut self, message: &AgentMessage) -> Result<(), ClientError> {
        let json = message.to_json()?;
        self.tx.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        self.send(&AgentMessage::Heartbeat {
            timestamp: Some(Utc::now()),
        })
        .await
    }

    pub async fn report(&mut self, report: TaskReport) -> Result<(), ClientError> {
        self.send(&AgentMessage::TaskRequest(report)).await
    }

    /// Next server frame. Control frames are skipped; `None` once the socket
    /// is closed.
    pub async fn next(&mut self) -> Option<Result<ServerMessage, ClientError>> {
        loop {
            match self.rx.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).map_err(ClientError::from));
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.tx.close().await?;
        Ok(())
    }
}
