//! Room membership bookkeeping and signaling relay.
//!
//! The coordinator owns the session and room registries outright; every
//! mutation goes through a method on [`Coordinator`] and completes without
//! suspension, so concurrent connections observe each room's member set
//! atomically. Offer/answer/candidate payloads pass through untouched.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{ClientEvent, ConnId, ServerEvent};

/// Purges room-scoped stored artifacts (uploaded files, shared notes) once a
/// room has fully emptied. Shared with the HTTP layer so the disconnect path
/// never has to fake a request.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn purge_room(&self, room: &str) -> Result<()>;
}

/// For deployments without a storage backend attached.
pub struct NoopArtifactStore;

#[async_trait]
impl ArtifactStore for NoopArtifactStore {
    async fn purge_room(&self, _room: &str) -> Result<()> {
        Ok(())
    }
}

struct Session {
    email: String,
    room: Option<String>,
    tx: UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct Room {
    members: HashSet<ConnId>,
}

pub struct Coordinator {
    sessions: HashMap<ConnId, Session>,
    rooms: HashMap<String, Room>,
    /// Keys of rooms that were active once and have fully emptied. A retired
    /// key can never be joined again; callers must pick a fresh one.
    retired: HashSet<String>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl Coordinator {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            retired: HashSet::new(),
            artifacts,
        }
    }

    /// Registers a verified connection and mints its id.
    pub fn connect(&mut self, email: String, tx: UnboundedSender<ServerEvent>) -> ConnId {
        let id = Uuid::new_v4();
        info!(%id, %email, "session connected");
        self.sessions.insert(
            id,
            Session {
                email,
                room: None,
                tx,
            },
        );
        id
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_members(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |r| r.members.len())
    }

    pub fn is_active(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Handles one inbound event from an authenticated connection.
    pub async fn handle(&mut self, from: ConnId, event: ClientEvent) {
        match event {
            ClientEvent::RoomJoin { room } => self.join(from, room).await,
            ClientEvent::RoomLeave => self.leave_room(from).await,
            ClientEvent::Call { to, offer } => {
                self.relay(from, to, |from| ServerEvent::IncomingCall { from, offer });
            }
            ClientEvent::CallAccepted { to, answer } => {
                self.relay(from, to, |from| ServerEvent::CallAccepted { from, answer });
            }
            ClientEvent::NegoNeeded { to, offer } => {
                self.relay(from, to, |from| ServerEvent::NegoNeeded { from, offer });
            }
            ClientEvent::NegoDone { to, answer } => {
                self.relay(from, to, |from| ServerEvent::NegoFinal { from, answer });
            }
            ClientEvent::IceCandidate { to, candidate } => {
                self.relay(from, to, |from| ServerEvent::IceCandidate { from, candidate });
            }
        }
    }

    async fn join(&mut self, id: ConnId, room_key: String) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let email = session.email.clone();

        // Same identity must not occupy a room twice, even from another tab.
        if let Some(room) = self.rooms.get(&room_key) {
            let occupied = room.members.iter().any(|member| {
                self.sessions
                    .get(member)
                    .is_some_and(|s| s.email == email)
            });
            if occupied {
                self.send(
                    id,
                    ServerEvent::RoomJoinError {
                        message: "You are already in this room.".into(),
                    },
                );
                return;
            }
        } else if self.retired.contains(&room_key) {
            // An emptied room stays dead; a cached key must not resurrect it.
            self.send(
                id,
                ServerEvent::RoomJoinError {
                    message: "No active meeting found for this room code. \
                              Please create a new room."
                        .into(),
                },
            );
            return;
        }

        // Joining from inside another room counts as leaving it first.
        if self
            .sessions
            .get(&id)
            .and_then(|s| s.room.as_ref())
            .is_some()
        {
            self.leave_room(id).await;
        }

        let room = self.rooms.entry(room_key.clone()).or_default();
        let existing: Vec<ConnId> = room.members.iter().copied().collect();
        room.members.insert(id);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.room = Some(room_key.clone());
        }

        // Existing members learn of the newcomer first, then the newcomer is
        // seeded with the full roster, one event per member, then acked.
        for member in &existing {
            self.send(
                *member,
                ServerEvent::UserJoin {
                    email: email.clone(),
                    id,
                },
            );
        }
        for member in &existing {
            if let Some(peer) = self.sessions.get(member) {
                let peer_email = peer.email.clone();
                self.send(
                    id,
                    ServerEvent::UserJoin {
                        email: peer_email,
                        id: *member,
                    },
                );
            }
        }
        self.send(
            id,
            ServerEvent::RoomJoined {
                email: email.clone(),
                room: room_key.clone(),
            },
        );
        info!(%id, %email, room = %room_key, "joined room");
    }

    /// Pass-through relay. Unicast when `to` is given, room broadcast
    /// otherwise; never echoes to the sender; unknown targets are dropped.
    fn relay<F>(&self, from: ConnId, to: Option<ConnId>, build: F)
    where
        F: FnOnce(ConnId) -> ServerEvent,
    {
        match to {
            Some(target) => {
                if target == from {
                    return;
                }
                self.send(target, build(from));
            }
            None => {
                let Some(room_key) = self.sessions.get(&from).and_then(|s| s.room.clone())
                else {
                    debug!(%from, "relay without target or room, dropped");
                    return;
                };
                let event = build(from);
                if let Some(room) = self.rooms.get(&room_key) {
                    for member in &room.members {
                        if *member != from {
                            self.send(*member, event.clone());
                        }
                    }
                }
            }
        }
    }

    /// Removes the connection from its current room, announcing the
    /// departure and tearing the room down if it is now empty. In-memory
    /// cleanup always completes; only the artifact purge may fail, and a
    /// failure there is logged and dropped.
    async fn leave_room(&mut self, id: ConnId) {
        let Some(room_key) = self
            .sessions
            .get_mut(&id)
            .and_then(|s| s.room.take())
        else {
            return;
        };

        let mut emptied = false;
        let mut remaining = Vec::new();
        if let Some(room) = self.rooms.get_mut(&room_key) {
            room.members.remove(&id);
            emptied = room.members.is_empty();
            remaining = room.members.iter().copied().collect::<Vec<ConnId>>();
        }
        for member in &remaining {
            self.send(*member, ServerEvent::UserLeft { id });
        }

        if emptied {
            self.rooms.remove(&room_key);
            self.retired.insert(room_key.clone());
            info!(room = %room_key, "room emptied, tearing down");
            // Paired with the purge so the notes pane resets with the room.
            // With the last member gone there is nobody left to hear it.
            for member in &remaining {
                self.send(*member, ServerEvent::ClearNotes);
            }
            if let Err(e) = self.artifacts.purge_room(&room_key).await {
                warn!(room = %room_key, error = %e, "artifact purge failed");
            }
        }
    }

    /// Transport-level disconnect: leave the current room, then drop the
    /// session entirely.
    pub async fn disconnect(&mut self, id: ConnId) {
        self.leave_room(id).await;
        if let Some(session) = self.sessions.remove(&id) {
            info!(%id, email = %session.email, "session disconnected");
        }
    }

    fn send(&self, id: ConnId, event: ServerEvent) {
        if let Some(session) = self.sessions.get(&id) {
            // Delivery is fire-and-forget; a closed channel means the
            // connection is already going away.
            let _ = session.tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct RecordingStore {
        purged: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                purged: Mutex::new(Vec::new()),
            })
        }

        fn purged(&self) -> Vec<String> {
            self.purged.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ArtifactStore for RecordingStore {
        async fn purge_room(&self, room: &str) -> Result<()> {
            self.purged.lock().unwrap().push(room.to_owned());
            Ok(())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ArtifactStore for FailingStore {
        async fn purge_room(&self, _room: &str) -> Result<()> {
            Err(crate::error::Error::Signaling("storage unreachable".into()))
        }
    }

    fn connect(
        coord: &mut Coordinator,
        email: &str,
    ) -> (ConnId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (coord.connect(email.to_owned(), tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn first_join_creates_room_and_acks() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (alice, mut rx) = connect(&mut coord, "alice@example.com");

        coord.handle(alice, ClientEvent::RoomJoin { room: "A1B2C".into() }).await;

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![ServerEvent::RoomJoined {
                email: "alice@example.com".into(),
                room: "A1B2C".into(),
            }]
        );
        assert_eq!(coord.room_members("A1B2C"), 1);
    }

    #[tokio::test]
    async fn second_join_announces_both_ways() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (alice, mut alice_rx) = connect(&mut coord, "alice@example.com");
        let (bob, mut bob_rx) = connect(&mut coord, "bob@example.com");

        coord.handle(alice, ClientEvent::RoomJoin { room: "A1B2C".into() }).await;
        drain(&mut alice_rx);
        coord.handle(bob, ClientEvent::RoomJoin { room: "A1B2C".into() }).await;

        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerEvent::UserJoin {
                email: "bob@example.com".into(),
                id: bob,
            }]
        );
        let bob_events = drain(&mut bob_rx);
        assert_eq!(
            bob_events,
            vec![
                ServerEvent::UserJoin {
                    email: "alice@example.com".into(),
                    id: alice,
                },
                ServerEvent::RoomJoined {
                    email: "bob@example.com".into(),
                    room: "A1B2C".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn same_identity_cannot_double_occupy() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (tab_one, _rx1) = connect(&mut coord, "alice@example.com");
        let (tab_two, mut rx2) = connect(&mut coord, "alice@example.com");

        coord.handle(tab_one, ClientEvent::RoomJoin { room: "R".into() }).await;
        coord.handle(tab_two, ClientEvent::RoomJoin { room: "R".into() }).await;

        let events = drain(&mut rx2);
        assert!(matches!(events[..], [ServerEvent::RoomJoinError { .. }]));
        assert_eq!(coord.room_members("R"), 1);
    }

    #[tokio::test]
    async fn emptied_room_key_is_not_resurrected() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (alice, _rx) = connect(&mut coord, "alice@example.com");
        coord.handle(alice, ClientEvent::RoomJoin { room: "A1B2C".into() }).await;
        coord.disconnect(alice).await;
        assert!(!coord.is_active("A1B2C"));

        let (carol, mut carol_rx) = connect(&mut coord, "carol@example.com");
        coord.handle(carol, ClientEvent::RoomJoin { room: "A1B2C".into() }).await;

        let events = drain(&mut carol_rx);
        assert!(matches!(events[..], [ServerEvent::RoomJoinError { .. }]));
        assert!(!coord.is_active("A1B2C"));
    }

    #[tokio::test]
    async fn last_member_disconnect_purges_exactly_once() {
        let store = RecordingStore::new();
        let mut coord = Coordinator::new(store.clone());
        let (alice, _a) = connect(&mut coord, "alice@example.com");
        let (bob, _b) = connect(&mut coord, "bob@example.com");
        coord.handle(alice, ClientEvent::RoomJoin { room: "A1B2C".into() }).await;
        coord.handle(bob, ClientEvent::RoomJoin { room: "A1B2C".into() }).await;

        coord.disconnect(alice).await;
        assert!(store.purged().is_empty());
        coord.disconnect(bob).await;
        assert_eq!(store.purged(), vec!["A1B2C".to_owned()]);
        assert!(!coord.is_active("A1B2C"));
        assert_eq!(coord.session_count(), 0);
    }

    #[tokio::test]
    async fn purge_failure_does_not_block_cleanup() {
        let mut coord = Coordinator::new(Arc::new(FailingStore));
        let (alice, _rx) = connect(&mut coord, "alice@example.com");
        coord.handle(alice, ClientEvent::RoomJoin { room: "R".into() }).await;
        coord.disconnect(alice).await;
        assert!(!coord.is_active("R"));
        assert_eq!(coord.session_count(), 0);
    }

    #[tokio::test]
    async fn departure_notifies_remaining_members() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (alice, mut alice_rx) = connect(&mut coord, "alice@example.com");
        let (bob, _b) = connect(&mut coord, "bob@example.com");
        coord.handle(alice, ClientEvent::RoomJoin { room: "R".into() }).await;
        coord.handle(bob, ClientEvent::RoomJoin { room: "R".into() }).await;
        drain(&mut alice_rx);

        coord.disconnect(bob).await;
        assert_eq!(drain(&mut alice_rx), vec![ServerEvent::UserLeft { id: bob }]);
        assert_eq!(coord.room_members("R"), 1);
    }

    #[tokio::test]
    async fn broadcast_relay_excludes_sender() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (alice, mut alice_rx) = connect(&mut coord, "alice@example.com");
        let (bob, mut bob_rx) = connect(&mut coord, "bob@example.com");
        coord.handle(alice, ClientEvent::RoomJoin { room: "R".into() }).await;
        coord.handle(bob, ClientEvent::RoomJoin { room: "R".into() }).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        coord
            .handle(
                alice,
                ClientEvent::Call {
                    to: None,
                    offer: "sdp-offer".into(),
                },
            )
            .await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEvent::IncomingCall {
                from: alice,
                offer: "sdp-offer".into(),
            }]
        );
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn unicast_relay_reaches_only_target() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (alice, mut alice_rx) = connect(&mut coord, "alice@example.com");
        let (bob, mut bob_rx) = connect(&mut coord, "bob@example.com");
        let (carol, mut carol_rx) = connect(&mut coord, "carol@example.com");
        for id in [alice, bob, carol] {
            coord.handle(id, ClientEvent::RoomJoin { room: "R".into() }).await;
        }
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        drain(&mut carol_rx);

        coord
            .handle(
                alice,
                ClientEvent::IceCandidate {
                    to: Some(bob),
                    candidate: "cand".into(),
                },
            )
            .await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEvent::IceCandidate {
                from: alice,
                candidate: "cand".into(),
            }]
        );
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn relay_to_unknown_target_is_dropped() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (alice, mut alice_rx) = connect(&mut coord, "alice@example.com");
        coord.handle(alice, ClientEvent::RoomJoin { room: "R".into() }).await;
        drain(&mut alice_rx);

        coord
            .handle(
                alice,
                ClientEvent::Call {
                    to: Some(Uuid::new_v4()),
                    offer: "sdp".into(),
                },
            )
            .await;
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn room_leave_keeps_session_usable() {
        let mut coord = Coordinator::new(Arc::new(NoopArtifactStore));
        let (alice, mut rx) = connect(&mut coord, "alice@example.com");
        coord.handle(alice, ClientEvent::RoomJoin { room: "R1".into() }).await;
        coord.handle(alice, ClientEvent::RoomLeave).await;
        assert!(!coord.is_active("R1"));
        drain(&mut rx);

        coord.handle(alice, ClientEvent::RoomJoin { room: "R2".into() }).await;
        let events = drain(&mut rx);
        assert!(matches!(events[..], [ServerEvent::RoomJoined { .. }]));
    }
}
