//! Wire contract for the signaling channel.
//!
//! Frames are JSON text messages, internally tagged with the event name.
//! Offers, answers and ICE candidates are opaque strings relayed verbatim;
//! the server never looks inside them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque per-connection identifier, minted by the server at accept time.
pub type ConnId = Uuid;

/// Events a participant sends to the room coordinator.
///
/// The relay events address either a single peer (`to`) or, when `to` is
/// absent, every other member of the sender's current room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin { room: String },

    #[serde(rename = "room:leave")]
    RoomLeave,

    #[serde(rename = "room:call")]
    Call {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnId>,
        offer: String,
    },

    #[serde(rename = "room:call:accepted")]
    CallAccepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnId>,
        answer: String,
    },

    #[serde(rename = "room:peer:nego:needed")]
    NegoNeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnId>,
        offer: String,
    },

    #[serde(rename = "room:peer:nego:done")]
    NegoDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnId>,
        answer: String,
    },

    #[serde(rename = "room:ice:candidate")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnId>,
        candidate: String,
    },
}

/// Events the coordinator sends to a participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Join succeeded; echoed to the joiner only.
    #[serde(rename = "room:join")]
    RoomJoined { email: String, room: String },

    /// Join rejected; sent to the caller only, nothing else changes.
    #[serde(rename = "room:join:error")]
    RoomJoinError { message: String },

    /// A member is present: broadcast for a newcomer, and replayed once per
    /// existing member to seed the newcomer's mesh.
    #[serde(rename = "user:join")]
    UserJoin { email: String, id: ConnId },

    #[serde(rename = "user:left")]
    UserLeft { id: ConnId },

    #[serde(rename = "room:incoming:call")]
    IncomingCall { from: ConnId, offer: String },

    #[serde(rename = "room:call:accepted")]
    CallAccepted { from: ConnId, answer: String },

    #[serde(rename = "room:peer:nego:needed")]
    NegoNeeded { from: ConnId, offer: String },

    #[serde(rename = "room:peer:nego:final")]
    NegoFinal { from: ConnId, answer: String },

    #[serde(rename = "room:ice:candidate")]
    IceCandidate { from: ConnId, candidate: String },

    /// Room fully emptied; instructs remaining UIs to drop ephemeral shared
    /// state (notes pane).
    #[serde(rename = "clear:notes")]
    ClearNotes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_uses_wire_names() {
        let json = serde_json::to_string(&ClientEvent::RoomJoin {
            room: "A1B2C".into(),
        })
        .unwrap();
        assert!(json.contains(r#""event":"room:join""#), "{json}");
    }

    #[test]
    fn relay_omits_absent_target() {
        let json = serde_json::to_string(&ClientEvent::Call {
            to: None,
            offer: "sdp".into(),
        })
        .unwrap();
        assert!(!json.contains("to"), "{json}");
    }

    #[test]
    fn unicast_round_trips() {
        let ev = ClientEvent::IceCandidate {
            to: Some(Uuid::new_v4()),
            candidate: "cand".into(),
        };
        let back: ClientEvent =
            serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn clear_notes_is_a_bare_event() {
        let json = serde_json::to_string(&ServerEvent::ClearNotes).unwrap();
        assert_eq!(json, r#"{"event":"clear:notes"}"#);
    }
}
