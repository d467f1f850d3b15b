//! Outbound media: H.264 encoding and the paced video track

pub mod encoder;
pub mod track;

pub use encoder::{H264Encoder, KeyframeRequest, VideoEncoder};
pub use track::{MediaClock, MediaTrackAdapter, RtpTimeline, TimedFrame};
