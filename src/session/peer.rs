//! Seams between the session state machine and the peer-connection stack

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use super::envelope::SignalingEnvelope;
use crate::capture::Frame;
use crate::error::Result;

/// Non-blocking accessor for the freshest outbound frame
pub type FrameReader = Arc<dyn Fn() -> Option<Frame> + Send + Sync>;

/// Non-blocking sink for raw inbound annotation payloads
pub type DetectionWriter = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Connection state as reported by the peer stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// One peer connection carrying the outbound video track and the annotation channel.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create and apply the local offer. Waits for ICE gathering, at most `gather_timeout`,
    /// and returns whatever candidates were collected by then.
    async fn create_offer(&self, gather_timeout: Duration) -> Result<SignalingEnvelope>;

    async fn apply_answer(&self, answer: SignalingEnvelope) -> Result<()>;

    fn state(&self) -> watch::Receiver<PeerState>;

    /// Tear down the connection, track and data channel.
    async fn close(&self) -> Result<()>;
}

/// Builds peer connections wired to the capture and render channels.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        frames: FrameReader,
        detections: DetectionWriter,
    ) -> Result<Arc<dyn PeerLink>>;
}
