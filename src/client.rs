//! Participant runner: joins a room, then pumps signaling events and
//! transport callbacks into the mesh until the connection ends or the room
//! rejects us.

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::link::LinkFactory;
use crate::mesh::{MeshEvent, PeerMesh};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::signaling::SignalingClient;

pub struct ClientConfig {
    pub url: String,
    pub token: String,
    pub room: String,
    /// The caller's own verified identity. Needed before the join ack
    /// arrives: roster announcements precede it, and initiator selection
    /// compares identities.
    pub email: String,
}

/// Runs one call session to completion. Returns an error for a rejected
/// join or auth failure; a clean server disconnect returns `Ok`.
pub async fn run(
    config: ClientConfig,
    factory: Arc<dyn LinkFactory>,
    events: UnboundedSender<MeshEvent>,
) -> Result<()> {
    let mut signaling = SignalingClient::connect(&config.url, &config.token).await?;
    let (mesh, mut link_rx) = PeerMesh::new(
        config.email.clone(),
        factory,
        signaling.sender(),
        events.clone(),
    );

    signaling.send(ClientEvent::RoomJoin {
        room: config.room.clone(),
    })?;

    let result = loop {
        tokio::select! {
            server_event = signaling.recv() => {
                match server_event {
                    Some(event) => {
                        if let Err(e) = dispatch(&mesh, event).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                }
            }
            Some(link_event) = link_rx.recv() => {
                mesh.handle_link_event(link_event).await;
            }
        }
    };

    mesh.leave().await;
    result
}

async fn dispatch(mesh: &Arc<PeerMesh>, event: ServerEvent) -> Result<()> {
    match event {
        ServerEvent::RoomJoined { email, room } => {
            info!(%email, %room, "joined room");
        }
        ServerEvent::RoomJoinError { message } => {
            return Err(Error::Signaling(message));
        }
        ServerEvent::UserJoin { email, id } => {
            mesh.handle_user_join(id, email).await;
        }
        ServerEvent::UserLeft { id } => {
            mesh.handle_user_left(id).await;
        }
        ServerEvent::IncomingCall { from, offer } => {
            mesh.handle_incoming_call(from, offer).await;
        }
        ServerEvent::CallAccepted { from, answer } => {
            mesh.handle_call_accepted(from, answer).await;
        }
        ServerEvent::NegoNeeded { from, offer } => {
            mesh.handle_nego_incoming(from, offer).await;
        }
        ServerEvent::NegoFinal { from, answer } => {
            mesh.handle_nego_final(from, answer).await;
        }
        ServerEvent::IceCandidate { from, candidate } => {
            mesh.handle_remote_candidate(from, candidate).await;
        }
        ServerEvent::ClearNotes => {
            warn!("room emptied upstream; shared notes cleared");
        }
    }
    Ok(())
}
