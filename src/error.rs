use thiserror::Error;

/// Errors surfaced by the capture, session and display layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("session already open, close it first")]
    AlreadyOpen,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("malformed signaling envelope: {0}")]
    Envelope(String),

    #[error("peer connection error: {0}")]
    Peer(#[from] webrtc::Error),

    #[error("peer rejected the session: {0}")]
    PeerRejected(String),

    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("capture device {0} could not be opened")]
    DeviceOpen(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("malformed annotation payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
