//! Mesh-topology video call plumbing: a room coordinator that verifies,
//! admits and relays, and a per-participant mesh manager that drives one
//! peer connection per remote through its offer/answer/ICE lifecycle.
//!
//! The coordinator never inspects signaling payloads; the mesh never talks
//! to the network except through the signaling channel and its transports.

pub mod auth;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod link;
pub mod media;
pub mod mesh;
pub mod protocol;
pub mod rtc;
pub mod server;
pub mod signaling;

pub use error::{Error, Result};
