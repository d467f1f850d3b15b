//! webrtc-rs implementation of the peer seams

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::datachannel::DataChannelBridge;
use super::envelope::SignalingEnvelope;
use super::peer::{DetectionWriter, FrameReader, PeerConnector, PeerLink, PeerState};
use crate::error::{Error, Result};
use crate::media::track::VIDEO_CLOCK_RATE;
use crate::media::{H264Encoder, KeyframeRequest, MediaTrackAdapter};
use crate::{MediaConfig, SessionConfig};

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Builds real peer connections: one H.264 track fed by the capture path and
/// one negotiated data channel feeding the render path.
pub struct RtcConnector {
    session: SessionConfig,
    media: MediaConfig,
}

impl RtcConnector {
    pub fn new(session: SessionConfig, media: MediaConfig) -> Self {
        Self { session, media }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.session.ice_servers.iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    #[instrument(skip_all)]
    async fn connect(
        &self,
        frames: FrameReader,
        detections: DetectionWriter,
    ) -> Result<Arc<dyn PeerLink>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.rtc_configuration()).await?);

        let (state_tx, state_rx) = watch::channel(PeerState::New);
        let keyframes = KeyframeRequest::new();
        let on_connect = keyframes.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let next = match s {
                RTCPeerConnectionState::New => Some(PeerState::New),
                RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
                RTCPeerConnectionState::Connected => Some(PeerState::Connected),
                RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
                RTCPeerConnectionState::Failed => Some(PeerState::Failed),
                RTCPeerConnectionState::Closed => Some(PeerState::Closed),
                _ => None,
            };
            if let Some(next) = next {
                info!("Peer connection state: {}", next);
                // Whatever was encoded before the peer joined is gone
                if next == PeerState::Connected {
                    on_connect.request();
                }
                let _ = state_tx.send(next);
            }
            Box::pin(async {})
        }));

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_string(),
                rtcp_feedback: vec![],
            },
            self.media.track_id.clone(),
            self.media.stream_id.clone(),
        ));

        let link = RtcLink {
            pc: Arc::clone(&pc),
            state: state_rx,
            pump: CancellationToken::new(),
        };

        // Anything failing past this point must not leak the half-built connection.
        if let Err(e) = link
            .wire(track, keyframes, frames, detections, &self.media, &self.session)
            .await
        {
            let _ = link.close().await;
            return Err(e);
        }

        Ok(Arc::new(link))
    }
}

/// PLI or FIR: the receiver cannot decode until the next IDR.
fn wants_keyframe(packets: &[Box<dyn RtcpPacket + Send + Sync>]) -> bool {
    packets.iter().any(|p| {
        let p = p.as_any();
        p.is::<PictureLossIndication>() || p.is::<FullIntraRequest>()
    })
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    state: watch::Receiver<PeerState>,
    pump: CancellationToken,
}

impl RtcLink {
    async fn wire(
        &self,
        track: Arc<TrackLocalStaticSample>,
        keyframes: KeyframeRequest,
        frames: FrameReader,
        detections: DetectionWriter,
        media: &MediaConfig,
        session: &SessionConfig,
    ) -> Result<()> {
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be drained for the interceptors to work
        let cancel = self.pump.clone();
        let on_loss = keyframes.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let packets = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = sender.read(&mut buf) => match res {
                        Ok((packets, _)) => packets,
                        Err(_) => break,
                    },
                };
                if wants_keyframe(&packets) {
                    debug!("Receiver reported picture loss");
                    on_loss.request();
                }
            }
        });

        let adapter = MediaTrackAdapter::new(frames, media);
        let encoder = H264Encoder::with_keyframe_interval(media.keyframe_interval);
        tokio::spawn(adapter.pump(track, Box::new(encoder), keyframes, self.pump.clone()));

        let channel = self
            .pc
            .create_data_channel(&session.data_channel_label, None)
            .await?;
        DataChannelBridge::new(detections).attach(&channel);
        info!("Data channel '{}' created", session.data_channel_label);

        Ok(())
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self, gather_timeout: Duration) -> Result<SignalingEnvelope> {
        let offer = self.pc.create_offer(None).await?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;

        if tokio::time::timeout(gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "ICE gathering incomplete after {:?}, sending partial candidates",
                gather_timeout
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::PeerRejected("local description unavailable".into()))?;
        debug!("Local offer ready ({} bytes)", local.sdp.len());

        Ok(SignalingEnvelope::offer(local.sdp))
    }

    async fn apply_answer(&self, answer: SignalingEnvelope) -> Result<()> {
        let desc = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| Error::PeerRejected(format!("invalid answer: {}", e)))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::PeerRejected(format!("remote description rejected: {}", e)))
    }

    fn state(&self) -> watch::Receiver<PeerState> {
        self.state.clone()
    }

    async fn close(&self) -> Result<()> {
        self.pump.cancel();
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtcp::receiver_report::ReceiverReport;

    #[test]
    fn picture_loss_asks_for_keyframe() {
        let pli: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![
            Box::new(ReceiverReport::default()),
            Box::new(PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: 2,
            }),
        ];
        assert!(wants_keyframe(&pli));

        let fir: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![Box::new(FullIntraRequest::default())];
        assert!(wants_keyframe(&fir));

        let reports: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![Box::new(ReceiverReport::default())];
        assert!(!wants_keyframe(&reports));
    }
}
