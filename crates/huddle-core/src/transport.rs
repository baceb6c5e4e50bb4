//! Signaling transport: an ordered, bidirectional text channel to the relay.
//!
//! Reconnection is not attempted. Once the channel reports closure the
//! session keeps its established media connections and stops negotiating.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::errors::TransportError;
use crate::signaling::SignalingMessage;

/// What the transport delivers to the core, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed,
    Error(String),
}

/// Write half of a signaling channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<String>,
}

impl SignalingSender {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message for delivery. Fails instead of dropping silently when
    /// the channel is already gone.
    pub fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let text = message.encode()?;
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

/// A connected signaling channel.
pub struct SignalingChannel {
    pub sender: SignalingSender,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, endpoint: &Url) -> Result<SignalingChannel, TransportError>;
}

/// WebSocket signaling over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, endpoint: &Url) -> Result<SignalingChannel, TransportError> {
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::info!(url = %endpoint, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (reader_done_tx, mut reader_done_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = out_rx.recv() => {
                        let Some(text) = next else { break };
                        if let Err(e) = ws_write.send(Message::Text(text)).await {
                            tracing::warn!("signaling write failed: {e}");
                            break;
                        }
                    }
                    _ = &mut reader_done_rx => break,
                }
            }
            // Dropping the receiver flips every SignalingSender to closed.
            out_rx.close();
            let _ = ws_write.close().await;
            tracing::debug!("signaling writer stopped");
        });

        tokio::spawn(async move {
            let mut terminal = TransportEvent::Closed;
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(TransportEvent::Message(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::info!("signaling websocket closed by peer: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        terminal = TransportEvent::Error(e.to_string());
                        break;
                    }
                }
            }
            let _ = event_tx.send(terminal);
            let _ = reader_done_tx.send(());
        });

        Ok(SignalingChannel {
            sender: SignalingSender::new(out_tx),
            events: event_rx,
        })
    }
}
