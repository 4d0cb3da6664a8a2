//! WebSocket front of the room coordinator. Each connection is verified
//! during the upgrade, then gets a reader loop feeding the coordinator and
//! a writer pump draining its session channel.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::IdentityVerifier;
use crate::coordinator::{ArtifactStore, Coordinator};
use crate::error::{Error, Result};
use crate::protocol::{ClientEvent, ServerEvent};

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct SignalServer {
    coordinator: Arc<Mutex<Coordinator>>,
    verifier: Arc<dyn IdentityVerifier>,
}

impl SignalServer {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            coordinator: Arc::new(Mutex::new(Coordinator::new(artifacts))),
            verifier,
        }
    }

    /// Shared handle, e.g. for an HTTP layer that wants room introspection.
    pub fn coordinator(&self) -> Arc<Mutex<Coordinator>> {
        self.coordinator.clone()
    }

    pub async fn run(&self, bind: &str) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| Error::Other(e.into()))?;
        info!(%bind, "signaling server listening");
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let coordinator = self.coordinator.clone();
            let verifier = self.verifier.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, coordinator, verifier).await {
                    debug!(%addr, error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    coordinator: Arc<Mutex<Coordinator>>,
    verifier: Arc<dyn IdentityVerifier>,
) -> Result<()> {
    // The credential rides in the upgrade request's query string; grab it
    // during the handshake callback.
    let token_slot = Arc::new(StdMutex::new(None::<String>));
    let slot = token_slot.clone();
    let mut ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        *slot.lock().unwrap() = req.uri().query().and_then(token_from_query);
        Ok(resp)
    })
    .await?;

    let token = token_slot.lock().unwrap().take();
    let identity = match token {
        Some(token) => match verifier.verify(&token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "credential rejected, closing connection");
                let _ = ws.close(None).await;
                return Ok(());
            }
        },
        None => {
            warn!("no credential presented, closing connection");
            let _ = ws.close(None).await;
            return Ok(());
        }
    };

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let id = coordinator.lock().await.connect(identity.email, tx);

    let writer = tokio::spawn(async move {
        let mut ping_interval = time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = read.next().await {
        if let Message::Text(text) = msg {
            match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => coordinator.lock().await.handle(id, event).await,
                Err(e) => debug!(%id, error = %e, "malformed frame ignored"),
            }
        }
    }

    // Transport-level disconnect drives the same teardown as an explicit
    // leave, plus session removal.
    coordinator.lock().await.disconnect(id).await;
    writer.abort();
    Ok(())
}

fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_extracted_from_query() {
        assert_eq!(
            token_from_query("token=abc.def.ghi"),
            Some("abc.def.ghi".to_owned())
        );
        assert_eq!(
            token_from_query("foo=1&token=xyz&bar=2"),
            Some("xyz".to_owned())
        );
        assert_eq!(token_from_query("foo=1"), None);
    }
}
