//! One peer link per remote participant: the signaling state machine, the
//! transport seam it drives, and the events the transport pushes back.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::ConnId;

/// Signaling progress of a single link. Renegotiation re-runs the
/// offer/answer exchange without leaving `Stable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    OfferSent,
    OfferReceived,
    Stable,
}

impl LinkState {
    /// Local side issued the initial offer.
    fn offer_sent(self) -> Self {
        debug_assert_eq!(self, LinkState::New, "offer sent twice");
        match self {
            LinkState::New => LinkState::OfferSent,
            other => other,
        }
    }

    /// Remote offer arrived before we initiated anything.
    fn offer_received(self) -> Self {
        debug_assert_eq!(self, LinkState::New, "offer received out of order");
        match self {
            LinkState::New => LinkState::OfferReceived,
            other => other,
        }
    }

    /// Local answer went out; the exchange is complete from our side.
    fn answered(self) -> Self {
        debug_assert_eq!(self, LinkState::OfferReceived, "answered without an offer");
        match self {
            LinkState::OfferReceived => LinkState::Stable,
            other => other,
        }
    }

    /// Remote answer applied. Duplicate or delayed answers land on an
    /// already-stable link and stay there.
    fn answer_applied(self) -> Self {
        match self {
            LinkState::OfferSent | LinkState::Stable => LinkState::Stable,
            other => {
                debug_assert!(false, "answer applied in {:?}", other);
                other
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Opaque handle to inbound media, surfaced to the embedding layer as soon
/// as the transport produces it. `as_any` lets the embedder recover the
/// transport-specific handle (an RTP track, in production).
pub trait RemoteSource: Send + Sync {
    fn kind(&self) -> MediaKind;
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The underlying peer connection, reduced to the operations the mesh
/// drives. Production wraps an `RTCPeerConnection`; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    /// Applies the remote offer and produces the local answer.
    async fn create_answer(&self, offer: &str) -> Result<String>;
    /// Applies the remote answer. Must be a no-op if the connection is
    /// already stable.
    async fn apply_answer(&self, answer: &str) -> Result<()>;
    async fn add_remote_candidate(&self, candidate: &str) -> Result<()>;
    async fn has_remote_description(&self) -> bool;
    async fn close(&self) -> Result<()>;
}

/// Pushed by the transport layer into the mesh's event loop.
pub enum LinkEvent {
    LocalCandidate { peer: ConnId, candidate: String },
    NegotiationNeeded { peer: ConnId },
    RemoteMedia { peer: ConnId, source: Arc<dyn RemoteSource> },
}

/// Builds transports, attaching the current local track set and wiring the
/// connection's callbacks to the given event channel.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(
        &self,
        peer: ConnId,
        events: UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}

pub struct PeerLink {
    pub remote: ConnId,
    /// Verified identity of the remote. Unknown when the link was seeded by
    /// an offer that outran the `user:join` announcement.
    email: Mutex<Option<String>>,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<LinkState>,
    pending_candidates: Mutex<Vec<String>>,
    remote_media: Mutex<Option<Arc<dyn RemoteSource>>>,
}

impl PeerLink {
    pub fn new(remote: ConnId, email: Option<String>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            remote,
            email: Mutex::new(email),
            transport,
            state: Mutex::new(LinkState::New),
            pending_candidates: Mutex::new(Vec::new()),
            remote_media: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub async fn email(&self) -> Option<String> {
        self.email.lock().await.clone()
    }

    pub async fn set_email(&self, email: String) {
        *self.email.lock().await = Some(email);
    }

    pub async fn state(&self) -> LinkState {
        *self.state.lock().await
    }

    pub async fn mark_offer_sent(&self) {
        let mut state = self.state.lock().await;
        *state = state.offer_sent();
    }

    pub async fn mark_offer_received(&self) {
        let mut state = self.state.lock().await;
        *state = state.offer_received();
    }

    pub async fn mark_answered(&self) {
        let mut state = self.state.lock().await;
        *state = state.answered();
    }

    pub async fn mark_answer_applied(&self) {
        let mut state = self.state.lock().await;
        *state = state.answer_applied();
    }

    /// Holds a candidate that arrived before the remote description was in
    /// place; it will be flushed, not dropped.
    pub async fn queue_candidate(&self, candidate: String) {
        self.pending_candidates.lock().await.push(candidate);
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }

    /// Applies every queued candidate now that the remote description is
    /// set. Individual rejections are logged and swallowed; candidate
    /// application is best-effort.
    pub async fn flush_candidates(&self) {
        let pending: Vec<String> = self.pending_candidates.lock().await.drain(..).collect();
        for candidate in pending {
            if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
                warn!(peer = %self.remote, error = %e, "queued candidate rejected");
            }
        }
    }

    /// First inbound media wins; later tracks of the same connection do not
    /// replace the surfaced handle.
    pub async fn attach_remote_media(&self, source: Arc<dyn RemoteSource>) -> bool {
        let mut media = self.remote_media.lock().await;
        if media.is_some() {
            debug!(peer = %self.remote, "additional remote track ignored");
            return false;
        }
        *media = Some(source);
        true
    }

    pub async fn has_remote_media(&self) -> bool {
        self.remote_media.lock().await.is_some()
    }

    /// Closes the transport and discards queued candidates. Safe to call
    /// with a handshake still in flight; the mesh discards stale results.
    pub async fn shutdown(&self) {
        self.pending_candidates.lock().await.clear();
        if let Err(e) = self.transport.close().await {
            warn!(peer = %self.remote, error = %e, "transport close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_side_reaches_stable() {
        let state = LinkState::New.offer_sent().answer_applied();
        assert_eq!(state, LinkState::Stable);
    }

    #[test]
    fn callee_side_reaches_stable() {
        let state = LinkState::New.offer_received().answered();
        assert_eq!(state, LinkState::Stable);
    }

    #[test]
    fn duplicate_answer_on_stable_is_a_no_op() {
        let state = LinkState::Stable.answer_applied();
        assert_eq!(state, LinkState::Stable);
    }
}
