//! WebSocket transport for the signaling channel

use super::channel::{SignalingConnector, SignalingLink};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects to a ws:// or wss:// relay
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }

    /// Sender task: forwards outbound text frames to the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        // Channel dropped: close the socket so the relay sees us leave
        let _ = write.close().await;
        debug!("Sender task terminated");
    }

    /// Receiver task: forwards inbound text frames until the socket closes
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<String>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if tx.send(text).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<SignalingLink> {
        let (ws_stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect to {}: {}", endpoint, e)))?;

        let (write, read) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, outbound_rx));
        tokio::spawn(Self::receiver_task(read, inbound_tx));

        Ok(SignalingLink { outbound, inbound })
    }
}
