//! Client side of the signaling channel: one WebSocket, split into a writer
//! pump fed by an unbounded channel and a reader pump that decodes frames.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{ClientEvent, ServerEvent};

pub struct SignalingClient {
    tx: UnboundedSender<ClientEvent>,
    rx: UnboundedReceiver<ServerEvent>,
}

impl SignalingClient {
    /// Connects and authenticates in one step; the credential rides in the
    /// upgrade request, mirroring the server's connect-time gate.
    pub async fn connect(url: &str, token: &str) -> Result<Self> {
        let url = format!("{}/?token={}", url.trim_end_matches('/'), token);
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<ServerEvent>();

        tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                if let Message::Text(text) = msg {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if incoming_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "unrecognized frame ignored"),
                    }
                }
            }
        });

        Ok(Self {
            tx: outgoing_tx,
            rx: incoming_rx,
        })
    }

    /// Clone of the outgoing channel, handed to the mesh so link handshakes
    /// can emit without going through the client loop.
    pub fn sender(&self) -> UnboundedSender<ClientEvent> {
        self.tx.clone()
    }

    pub fn send(&self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::Signaling("signaling connection closed".into()))
    }

    /// `None` once the server side has gone away.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}
