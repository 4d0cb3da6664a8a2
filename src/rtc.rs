//! `webrtc`-crate implementation of the link seams: one `RTCPeerConnection`
//! per remote, built with the current local track set attached and its
//! callbacks wired into the mesh's link-event channel.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::link::{LinkEvent, LinkFactory, MediaKind, PeerTransport, RemoteSource};
use crate::media::LocalMediaSource;
use crate::protocol::ConnId;

/// Inbound media handle backed by a remote RTP track.
pub struct RtpSource {
    track: Arc<TrackRemote>,
}

impl RtpSource {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }

    pub fn track(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl RemoteSource for RtpSource {
    fn kind(&self) -> MediaKind {
        match self.track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct RtcFactory {
    api: API,
    config: RTCConfiguration,
    media: Arc<dyn LocalMediaSource>,
}

impl RtcFactory {
    pub fn new(media: Arc<dyn LocalMediaSource>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_owned(),
                    "stun:global.stun.twilio.com:3478".to_owned(),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        Ok(Self { api, config, media })
    }
}

#[async_trait]
impl LinkFactory for RtcFactory {
    async fn create(
        &self,
        peer: ConnId,
        events: UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        // The same local tracks go to every link; the source is acquired
        // once, not per peer.
        for track in self.media.tracks()? {
            pc.add_track(track).await?;
        }

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => {
                            let _ = tx.send(LinkEvent::LocalCandidate {
                                peer,
                                candidate: json,
                            });
                        }
                        Err(e) => warn!(%peer, error = %e, "candidate serialization failed"),
                    },
                    Err(e) => warn!(%peer, error = %e, "candidate conversion failed"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::NegotiationNeeded { peer });
            })
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let source: Arc<dyn RemoteSource> = Arc::new(RtpSource::new(track));
                    let _ = tx.send(LinkEvent::RemoteMedia { peer, source });
                })
            },
        ));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            Box::pin(async move {
                debug!(%peer, %state, "peer connection state changed");
            })
        }));

        Ok(Arc::new(RtcLink { pc }))
    }
}

pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcLink {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_string(&offer)?)
    }

    async fn create_answer(&self, offer: &str) -> Result<String> {
        let offer: RTCSessionDescription = serde_json::from_str(offer)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_string(&answer)?)
    }

    async fn apply_answer(&self, answer: &str) -> Result<()> {
        // Duplicate or delayed answers land after the exchange completed.
        if self.pc.signaling_state() == RTCSignalingState::Stable {
            return Ok(());
        }
        let answer: RTCSessionDescription = serde_json::from_str(answer)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
