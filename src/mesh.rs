//! The per-participant mesh coordinator: one [`PeerLink`] per remote, each
//! driven by its own state machine, none blocking another.
//!
//! The collection lock covers only insert/lookup/remove; every transport
//! await happens outside it. Handshake continuations re-check that their
//! link is still the registered one before applying results, so a departure
//! racing an in-flight offer cannot touch a recycled connection.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::link::{LinkEvent, LinkFactory, LinkState, PeerLink, RemoteSource};
use crate::protocol::{ClientEvent, ConnId};

/// Candidates held for a peer we have not built a link for yet. Anything
/// beyond this for a single peer is dropped; a real handshake produces far
/// fewer.
const MAX_QUEUED_CANDIDATES: usize = 64;

/// Surfaced to the embedding layer (UI, recorder, ...).
#[derive(Clone)]
pub enum MeshEvent {
    RemoteMedia {
        peer: ConnId,
        source: Arc<dyn RemoteSource>,
    },
    LinkStable {
        peer: ConnId,
    },
    PeerGone {
        peer: ConnId,
    },
    /// The call attempt toward one peer failed (media acquisition, offer
    /// generation). Other links are unaffected.
    CallFailed {
        peer: ConnId,
        reason: String,
    },
}

pub struct PeerMesh {
    local_email: String,
    links: Mutex<HashMap<ConnId, Arc<PeerLink>>>,
    /// Candidates that arrived before any link existed for their sender.
    orphan_candidates: Mutex<HashMap<ConnId, Vec<String>>>,
    factory: Arc<dyn LinkFactory>,
    link_events: UnboundedSender<LinkEvent>,
    outbound: UnboundedSender<ClientEvent>,
    events: UnboundedSender<MeshEvent>,
}

impl PeerMesh {
    /// The returned receiver carries transport callbacks (local candidates,
    /// renegotiation triggers, inbound media); the embedding loop feeds them
    /// back into [`PeerMesh::handle_link_event`].
    pub fn new(
        local_email: String,
        factory: Arc<dyn LinkFactory>,
        outbound: UnboundedSender<ClientEvent>,
        events: UnboundedSender<MeshEvent>,
    ) -> (Arc<Self>, UnboundedReceiver<LinkEvent>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                local_email,
                links: Mutex::new(HashMap::new()),
                orphan_candidates: Mutex::new(HashMap::new()),
                factory,
                link_events: link_tx,
                outbound,
                events,
            }),
            link_rx,
        )
    }

    pub async fn link_count(&self) -> usize {
        self.links.lock().await.len()
    }

    pub async fn link_state(&self, peer: ConnId) -> Option<LinkState> {
        let link = self.links.lock().await.get(&peer).cloned();
        match link {
            Some(link) => Some(link.state().await),
            None => None,
        }
    }

    /// A member announcement: either the roster seed received on join, or a
    /// newcomer arriving later. Exactly one link per remote either way.
    pub async fn handle_user_join(self: &Arc<Self>, peer: ConnId, email: String) {
        let (link, created) = match self.create_if_absent(peer).await {
            Ok(v) => v,
            Err(e) => {
                self.call_failed(peer, e.to_string());
                return;
            }
        };
        link.set_email(email.clone()).await;
        if !created {
            // The peer's offer outran the announcement; the link is already
            // answering it.
            return;
        }
        if !self.initiates_toward(&email) {
            // The other side out-ranks us and will send the offer.
            return;
        }
        let mesh = Arc::clone(self);
        tokio::spawn(async move {
            mesh.initiate_call(link).await;
        });
    }

    /// Initial offer from a remote. Creates the link on demand: the offer
    /// may legitimately arrive before `user:join` has been processed.
    pub async fn handle_incoming_call(&self, from: ConnId, offer: String) {
        let (link, _) = match self.create_if_absent(from).await {
            Ok(v) => v,
            Err(e) => {
                self.call_failed(from, e.to_string());
                return;
            }
        };
        link.mark_offer_received().await;
        let answer = match link.transport().create_answer(&offer).await {
            Ok(a) => a,
            Err(e) => {
                warn!(peer = %from, error = %e, "answer generation failed");
                return;
            }
        };
        if !self.is_current(from, &link).await {
            debug!(peer = %from, "peer departed mid-answer, result discarded");
            return;
        }
        link.mark_answered().await;
        link.flush_candidates().await;
        let _ = self.outbound.send(ClientEvent::CallAccepted {
            to: Some(from),
            answer,
        });
        let _ = self.events.send(MeshEvent::LinkStable { peer: from });
    }

    /// Remote answer to our initial offer. A duplicate or delayed answer on
    /// an already-stable link is absorbed without effect.
    pub async fn handle_call_accepted(&self, from: ConnId, answer: String) {
        let Some(link) = self.links.lock().await.get(&from).cloned() else {
            debug!(peer = %from, "answer for unknown link, dropped");
            return;
        };
        if let Err(e) = link.transport().apply_answer(&answer).await {
            warn!(peer = %from, error = %e, "applying answer failed");
            return;
        }
        link.mark_answer_applied().await;
        link.flush_candidates().await;
        let _ = self.events.send(MeshEvent::LinkStable { peer: from });
    }

    /// Renegotiation offer from the remote, on the existing link only.
    pub async fn handle_nego_incoming(&self, from: ConnId, offer: String) {
        let Some(link) = self.links.lock().await.get(&from).cloned() else {
            debug!(peer = %from, "renegotiation offer for unknown link, dropped");
            return;
        };
        let answer = match link.transport().create_answer(&offer).await {
            Ok(a) => a,
            Err(e) => {
                warn!(peer = %from, error = %e, "renegotiation answer failed");
                return;
            }
        };
        if !self.is_current(from, &link).await {
            return;
        }
        let _ = self.outbound.send(ClientEvent::NegoDone {
            to: Some(from),
            answer,
        });
    }

    pub async fn handle_nego_final(&self, from: ConnId, answer: String) {
        let Some(link) = self.links.lock().await.get(&from).cloned() else {
            return;
        };
        if let Err(e) = link.transport().apply_answer(&answer).await {
            warn!(peer = %from, error = %e, "applying renegotiation answer failed");
        }
    }

    /// Remote ICE candidate. Queued when the link does not exist yet or has
    /// no remote description; queued candidates are flushed once it does.
    pub async fn handle_remote_candidate(&self, from: ConnId, candidate: String) {
        let link = self.links.lock().await.get(&from).cloned();
        match link {
            Some(link) => {
                if link.transport().has_remote_description().await {
                    if let Err(e) = link.transport().add_remote_candidate(&candidate).await {
                        warn!(peer = %from, error = %e, "candidate rejected");
                    }
                } else {
                    link.queue_candidate(candidate).await;
                }
            }
            None => {
                let mut orphans = self.orphan_candidates.lock().await;
                let queue = orphans.entry(from).or_default();
                if queue.len() < MAX_QUEUED_CANDIDATES {
                    queue.push(candidate);
                } else {
                    warn!(peer = %from, "orphan candidate queue full, dropping");
                }
            }
        }
    }

    /// Departure notification; a no-op for unknown ids.
    pub async fn handle_user_left(&self, peer: ConnId) {
        self.orphan_candidates.lock().await.remove(&peer);
        let removed = self.links.lock().await.remove(&peer);
        if let Some(link) = removed {
            link.shutdown().await;
            let _ = self.events.send(MeshEvent::PeerGone { peer });
        }
    }

    /// Events pushed up by the transports themselves.
    pub async fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate { peer, candidate } => {
                let _ = self.outbound.send(ClientEvent::IceCandidate {
                    to: Some(peer),
                    candidate,
                });
            }
            LinkEvent::NegotiationNeeded { peer } => self.renegotiate(peer).await,
            LinkEvent::RemoteMedia { peer, source } => {
                let link = self.links.lock().await.get(&peer).cloned();
                let Some(link) = link else {
                    debug!(peer = %peer, "media from unknown link, dropped");
                    return;
                };
                if link.attach_remote_media(source.clone()).await {
                    let _ = self.events.send(MeshEvent::RemoteMedia { peer, source });
                }
            }
        }
    }

    /// Local leave: every link is torn down even if individual teardowns
    /// fail, then the coordinator is told.
    pub async fn leave(&self) {
        let links: Vec<Arc<PeerLink>> = self.links.lock().await.drain().map(|(_, l)| l).collect();
        for link in links {
            link.shutdown().await;
        }
        self.orphan_candidates.lock().await.clear();
        let _ = self.outbound.send(ClientEvent::RoomLeave);
    }

    /// Sole insertion path for the link collection. Returns the existing
    /// link when the remote is already known, so racing discovery paths can
    /// never produce a duplicate connection.
    async fn create_if_absent(&self, peer: ConnId) -> Result<(Arc<PeerLink>, bool)> {
        if let Some(link) = self.links.lock().await.get(&peer) {
            return Ok((Arc::clone(link), false));
        }
        let transport = self.factory.create(peer, self.link_events.clone()).await?;
        let mut links = self.links.lock().await;
        if let Some(link) = links.get(&peer) {
            // Lost a create race; discard the spare transport.
            let spare = Arc::clone(&transport);
            tokio::spawn(async move {
                let _ = spare.close().await;
            });
            return Ok((Arc::clone(link), false));
        }
        let link = Arc::new(PeerLink::new(peer, None, transport));
        if let Some(orphans) = self.orphan_candidates.lock().await.remove(&peer) {
            for candidate in orphans {
                link.queue_candidate(candidate).await;
            }
        }
        links.insert(peer, Arc::clone(&link));
        Ok((link, true))
    }

    async fn initiate_call(&self, link: Arc<PeerLink>) {
        let peer = link.remote;
        let offer = match link.transport().create_offer().await {
            Ok(o) => o,
            Err(e) => {
                self.call_failed(peer, e.to_string());
                return;
            }
        };
        if !self.is_current(peer, &link).await {
            debug!(peer = %peer, "peer departed mid-offer, result discarded");
            return;
        }
        link.mark_offer_sent().await;
        let _ = self.outbound.send(ClientEvent::Call {
            to: Some(peer),
            offer,
        });
    }

    /// Transport asked for renegotiation. Only honored on a stable link:
    /// this is also what keeps the initial `add_track` trigger from racing
    /// the first offer/answer exchange.
    async fn renegotiate(&self, peer: ConnId) {
        let Some(link) = self.links.lock().await.get(&peer).cloned() else {
            return;
        };
        if link.state().await != LinkState::Stable {
            return;
        }
        let offer = match link.transport().create_offer().await {
            Ok(o) => o,
            Err(e) => {
                warn!(peer = %peer, error = %e, "renegotiation offer failed");
                return;
            }
        };
        if !self.is_current(peer, &link).await {
            return;
        }
        let _ = self.outbound.send(ClientEvent::NegoNeeded {
            to: Some(peer),
            offer,
        });
    }

    /// Mutual offers would deadlock a symmetric mesh, so the pair member
    /// with the smaller identity initiates and the other answers. Identities
    /// are unique within a room (duplicate occupancy is rejected upstream).
    fn initiates_toward(&self, remote_email: &str) -> bool {
        self.local_email.as_str() < remote_email
    }

    /// True while `link` is still the registered link for `peer`. Guards
    /// async continuations against applying results to a torn-down or
    /// replaced connection.
    async fn is_current(&self, peer: ConnId, link: &Arc<PeerLink>) -> bool {
        self.links
            .lock()
            .await
            .get(&peer)
            .is_some_and(|current| Arc::ptr_eq(current, link))
    }

    fn call_failed(&self, peer: ConnId, reason: String) {
        warn!(peer = %peer, %reason, "call attempt failed");
        let _ = self.events.send(MeshEvent::CallFailed { peer, reason });
    }
}
