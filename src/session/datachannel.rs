//! Inbound annotation channel: forwards raw payloads to the render path

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use super::peer::DetectionWriter;

/// Pushes every message verbatim into the inbound latest-value channel.
/// Decoding is left to the renderer, so a burst of messages never queues up here.
pub struct DataChannelBridge {
    sink: DetectionWriter,
    ready: AtomicBool,
    received: AtomicU64,
}

impl DataChannelBridge {
    pub fn new(sink: DetectionWriter) -> Arc<Self> {
        Arc::new(Self {
            sink,
            ready: AtomicBool::new(false),
            received: AtomicU64::new(0),
        })
    }

    pub fn on_open(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn on_close(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn on_message(&self, payload: Bytes) {
        self.received.fetch_add(1, Ordering::Relaxed);
        (self.sink)(payload);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Register this bridge as the handler set of `channel`.
    pub fn attach(self: &Arc<Self>, channel: &Arc<RTCDataChannel>) {
        let label = channel.label().to_string();

        let bridge = Arc::clone(self);
        let open_label = label.clone();
        channel.on_open(Box::new(move || {
            bridge.on_open();
            info!("DataChannel '{}' open", open_label);
            Box::pin(async {})
        }));

        let bridge = Arc::clone(self);
        channel.on_close(Box::new(move || {
            bridge.on_close();
            debug!("DataChannel '{}' closed", label);
            Box::pin(async {})
        }));

        let bridge = Arc::clone(self);
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            debug!(
                "DataChannel message: {} bytes (text: {})",
                msg.data.len(),
                msg.is_string
            );
            bridge.on_message(msg.data);
            Box::pin(async {})
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::LatestValueChannel;

    #[test]
    fn burst_keeps_only_freshest_payload() {
        let inbound = Arc::new(LatestValueChannel::new());
        let bridge = DataChannelBridge::new(inbound.writer());

        for i in 0..10 {
            bridge.on_message(Bytes::from(format!("{{\"detections\":[],\"seq\":{}}}", i)));
        }

        assert_eq!(bridge.received(), 10);
        assert_eq!(
            inbound.try_get(),
            Some(Bytes::from_static(br#"{"detections":[],"seq":9}"#))
        );
        assert!(inbound.try_get().is_none());
    }

    #[test]
    fn open_and_close_toggle_readiness() {
        let bridge = DataChannelBridge::new(Arc::new(|_| {}));
        assert!(!bridge.is_ready());
        bridge.on_open();
        assert!(bridge.is_ready());
        bridge.on_close();
        assert!(!bridge.is_ready());
    }

    #[test]
    fn payload_is_forwarded_verbatim() {
        let inbound = Arc::new(LatestValueChannel::new());
        let bridge = DataChannelBridge::new(inbound.writer());
        let garbage = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
        bridge.on_message(garbage.clone());
        assert_eq!(inbound.try_get(), Some(garbage));
    }
}
