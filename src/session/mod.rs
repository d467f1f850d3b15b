//! Outbound detection session: offer/answer exchange over a broker, then
//! liveness monitoring of the peer connection until it fails or is closed.

pub mod datachannel;
pub mod envelope;
pub mod ice;
pub mod mqtt;
pub mod peer;
pub mod rtc;
pub mod state;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub use datachannel::DataChannelBridge;
pub use envelope::{SdpKind, SignalingEnvelope};
pub use mqtt::MqttTransport;
pub use peer::{DetectionWriter, FrameReader, PeerConnector, PeerLink, PeerState};
pub use rtc::RtcConnector;
pub use state::{SessionState, SessionStatus, StatusSink};
pub use transport::{MemoryBroker, SignalingTransport};

use crate::error::{Error, Result};
use crate::SessionConfig;

/// Owns one peer connection at a time and drives it through
/// `Idle -> Starting -> AwaitingAnswer -> Connected`, ending in `Failed` or `Closed`.
///
/// `open` and `close` are synchronous and may be called from any thread; the
/// negotiation itself runs on the runtime behind `handle`.
pub struct SignalingSession {
    inner: Arc<Inner>,
}

struct Control {
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn SignalingTransport>,
    connector: Arc<dyn PeerConnector>,
    status: StatusSink,
    handle: Handle,
    state: watch::Sender<SessionState>,
    control: Mutex<Control>,
    /// Peer owned by the run of the given generation. Whoever takes it closes it.
    peer: Mutex<Option<(u64, Arc<dyn PeerLink>)>>,
    last_error: Mutex<Option<String>>,
    /// Negotiation runs and peer teardowns
    tasks: TaskTracker,
}

impl SignalingSession {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn SignalingTransport>,
        connector: Arc<dyn PeerConnector>,
        status: StatusSink,
        handle: Handle,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                connector,
                status,
                handle,
                state,
                control: Mutex::new(Control {
                    generation: 0,
                    cancel: CancellationToken::new(),
                }),
                peer: Mutex::new(None),
                last_error: Mutex::new(None),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Start negotiating in the background. Fails with [`Error::AlreadyOpen`]
    /// while a previous session is still starting, awaiting its answer or connected.
    pub fn open(&self, frames: FrameReader, detections: DetectionWriter) -> Result<()> {
        let inner = &self.inner;
        let (generation, cancel) = {
            let mut control = inner.control.lock();
            if inner.state.borrow().is_active() {
                return Err(Error::AlreadyOpen);
            }
            control.generation += 1;
            control.cancel = CancellationToken::new();
            inner.state.send_replace(SessionState::Starting);
            (control.generation, control.cancel.clone())
        };

        *inner.last_error.lock() = None;
        (inner.status)(SessionStatus::Starting);
        info!("Opening detection session #{}", generation);

        inner.tasks.spawn_on(
            Arc::clone(inner).run(generation, cancel, frames, detections),
            &inner.handle,
        );
        Ok(())
    }

    /// Cancel any in-flight wait and tear down the peer connection.
    /// Idempotent; at most one teardown runs per connection.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.control.lock().cancel.cancel();

        let peer = inner.peer.lock().take();
        if let Some((generation, peer)) = peer {
            inner.tasks.spawn_on(release(generation, peer), &inner.handle);
        }

        if inner.transition(None, SessionState::Closed) {
            info!("Detection session closed");
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Tracker of everything this session spawned. Closing it and awaiting
    /// `wait()` after [`close`](Self::close) lets the peer shut down gracefully
    /// before the runtime goes away.
    pub fn tasks(&self) -> TaskTracker {
        self.inner.tasks.clone()
    }

    /// Reason the last session ended in `Failed`, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    /// Apply `next` if the state machine allows it and, when `generation` is
    /// given, only if no newer session has been opened since.
    fn transition(&self, generation: Option<u64>, next: SessionState) -> bool {
        {
            let control = self.control.lock();
            if generation.is_some_and(|g| g != control.generation) {
                return false;
            }
            let current = *self.state.borrow();
            if !current.can_transition_to(next) {
                debug!("Ignoring session transition {:?} -> {:?}", current, next);
                return false;
            }
            self.state.send_replace(next);
        }
        (self.status)(next.status());
        true
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
        frames: FrameReader,
        detections: DetectionWriter,
    ) {
        match self.negotiate(generation, &cancel, frames, detections).await {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => {
                error!("Detection session failed: {}", e);
                *self.last_error.lock() = Some(e.to_string());
                self.transition(Some(generation), SessionState::Failed);
            }
        }

        let peer = {
            let mut slot = self.peer.lock();
            match slot.as_ref() {
                Some((owner, _)) if *owner == generation => slot.take(),
                _ => None,
            }
        };
        if let Some((generation, peer)) = peer {
            release(generation, peer).await;
        }
    }

    async fn negotiate(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        frames: FrameReader,
        detections: DetectionWriter,
    ) -> Result<()> {
        let peer = self.connector.connect(frames, detections).await?;
        let adopted = {
            let mut slot = self.peer.lock();
            if cancel.is_cancelled() {
                false
            } else {
                *slot = Some((generation, Arc::clone(&peer)));
                true
            }
        };
        if !adopted {
            // close() ran while connecting and found nothing to release
            release(generation, peer).await;
            return Err(Error::Cancelled);
        }

        let offer = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            offer = peer.create_offer(self.config.gather_timeout()) => offer?,
        };

        // Subscribe before publishing so a fast answer is not missed
        let answers = self.transport.subscribe(&self.config.answer_topic()).await?;
        self.transport
            .publish(&self.config.offer_topic(), offer.to_payload()?)
            .await?;
        info!("Offer published to {}", self.config.offer_topic());

        if !self.transition(Some(generation), SessionState::AwaitingAnswer) {
            return Err(Error::Cancelled);
        }

        let mut peer_state = peer.state();
        let period = self.config.liveness_interval();
        let payload = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            state = watch_peer(&mut peer_state, period) => {
                return Err(Error::PeerRejected(format!("peer connection {} before answer", state)));
            }
            received = tokio::time::timeout(self.config.answer_timeout(), answers.recv_async()) => {
                match received {
                    Ok(Ok(payload)) => payload,
                    Ok(Err(_)) => return Err(Error::Transport("answer subscription closed".into())),
                    Err(_) => return Err(Error::Timeout("answer")),
                }
            }
        };
        drop(answers);

        let answer = SignalingEnvelope::parse(&payload, SdpKind::Answer)?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            applied = peer.apply_answer(answer) => applied?,
        }

        if !self.transition(Some(generation), SessionState::Connected) {
            return Err(Error::Cancelled);
        }
        info!("Answer applied, detection session connected");

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            state = watch_peer(&mut peer_state, period) => match state {
                PeerState::Closed => {
                    info!("Peer closed the connection");
                    self.transition(Some(generation), SessionState::Closed);
                    Ok(())
                }
                other => Err(Error::PeerRejected(format!("peer connection {}", other))),
            },
        }
    }
}

/// Resolves once the peer reports `Failed` or `Closed`, checked every `period`.
async fn watch_peer(state: &mut watch::Receiver<PeerState>, period: Duration) -> PeerState {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let current = *state.borrow_and_update();
        if matches!(current, PeerState::Failed | PeerState::Closed) {
            return current;
        }
    }
}

async fn release(generation: u64, peer: Arc<dyn PeerLink>) {
    match peer.close().await {
        Ok(()) => debug!("Peer connection of session #{} released", generation),
        Err(e) => warn!("Closing peer connection of session #{}: {}", generation, e),
    }
}
