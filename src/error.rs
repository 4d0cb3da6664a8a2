use std::fmt;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug)]
pub enum Error {
    /// Credential rejected at connect time; the connection is closed.
    Auth(String),
    /// Signaling-channel protocol violation or send failure.
    Signaling(String),
    /// No capture device, or the device refused our config.
    Media(String),
    WebSocket(WsError),
    WebRTC(WebRTCError),
    Other(anyhow::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Auth(msg) => write!(f, "authentication failed: {}", msg),
            Error::Signaling(msg) => write!(f, "signaling error: {}", msg),
            Error::Media(msg) => write!(f, "media error: {}", msg),
            Error::WebSocket(e) => write!(f, "websocket error: {}", e),
            Error::WebRTC(e) => write!(f, "webrtc error: {}", e),
            Error::Other(e) => write!(f, "error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Error::WebSocket(err)
    }
}

impl From<WebRTCError> for Error {
    fn from(err: WebRTCError) -> Self {
        Error::WebRTC(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Signaling(format!("malformed frame: {}", err))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
