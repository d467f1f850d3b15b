//! H.264 encoding for the outbound track

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;
use tracing::{debug, info};

use crate::capture::decoder::rgb_to_i420;
use crate::error::{Error, Result};

/// Turns packed RGB24 pictures into an encoded elementary stream.
pub trait VideoEncoder: Send {
    /// `Ok(None)` when the encoder skipped the picture.
    fn encode(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Option<Bytes>>;

    fn force_keyframe(&mut self);
}

/// Default distance between IDR frames when nobody asks for one sooner
pub const DEFAULT_KEYFRAME_INTERVAL: u64 = 50;

/// Shared flag asking the encoder side for an IDR on its next picture.
///
/// Raised when the peer connects and on receiver picture-loss reports.
#[derive(Debug, Clone, Default)]
pub struct KeyframeRequest(Arc<AtomicBool>);

impl KeyframeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once per raised request.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

struct Session {
    encoder: Encoder,
    width: u32,
    height: u32,
}

/// openh264 encoder producing Annex B NAL units; re-created on resolution change.
///
/// openh264 only emits an IDR on its own at start-up and on scene changes, so
/// one is forced every `keyframe_interval` pictures and whenever requested.
pub struct H264Encoder {
    session: Option<Session>,
    frame_count: u64,
    keyframe_interval: u64,
    since_keyframe: u64,
    keyframe_pending: bool,
}

impl Default for H264Encoder {
    fn default() -> Self {
        Self::with_keyframe_interval(DEFAULT_KEYFRAME_INTERVAL)
    }
}

impl H264Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyframe_interval(frames: u64) -> Self {
        Self {
            session: None,
            frame_count: 0,
            keyframe_interval: frames.max(1),
            since_keyframe: 0,
            keyframe_pending: false,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn session(&mut self, width: u32, height: u32) -> Result<&mut Session> {
        let stale = !matches!(&self.session, Some(s) if s.width == width && s.height == height);
        if stale {
            let encoder = Encoder::new()
                .map_err(|e| Error::Encoder(format!("failed to create encoder: {}", e)))?;
            info!("H.264 encoder configured for {}x{}", width, height);
            // A fresh encoder opens with an IDR
            self.keyframe_pending = false;
            self.since_keyframe = 0;
            self.session = Some(Session {
                encoder,
                width,
                height,
            });
        }
        self.session
            .as_mut()
            .ok_or_else(|| Error::Encoder("encoder unavailable".into()))
    }
}

impl VideoEncoder for H264Encoder {
    fn encode(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Option<Bytes>> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(Error::Encoder(format!(
                "invalid frame size: expected {} bytes, got {}",
                expected,
                rgb.len()
            )));
        }

        // 4:2:0 needs even dimensions
        let (even_w, even_h) = (width & !1, height & !1);
        if even_w == 0 || even_h == 0 {
            return Err(Error::Encoder(format!("frame {}x{} too small", width, height)));
        }
        let cropped;
        let rgb = if (even_w, even_h) == (width, height) {
            rgb
        } else {
            cropped = crop_rgb(rgb, width, even_w, even_h);
            &cropped[..]
        };

        let yuv = rgb_to_i420(rgb, even_w, even_h);
        let buffer = YUVBuffer::from_vec(yuv, even_w as usize, even_h as usize);

        let fresh = !matches!(&self.session, Some(s) if s.width == even_w && s.height == even_h);
        let force = !fresh
            && (self.keyframe_pending || self.since_keyframe + 1 >= self.keyframe_interval);
        let (frame_type, data) = {
            let session = self.session(even_w, even_h)?;
            if force {
                session.encoder.force_intra_frame();
            }
            let bitstream = session
                .encoder
                .encode(&buffer)
                .map_err(|e| Error::Encoder(format!("encoding failed: {}", e)))?;
            (bitstream.frame_type(), bitstream.to_vec())
        };

        // Forcing is repeated until an IDR actually comes out
        if matches!(frame_type, FrameType::IDR) {
            self.keyframe_pending = false;
            self.since_keyframe = 0;
        } else {
            self.keyframe_pending |= force;
            self.since_keyframe += 1;
        }

        if matches!(frame_type, FrameType::Skip) {
            debug!("Encoder skipped frame");
            return Ok(None);
        }

        self.frame_count += 1;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(data)))
    }

    fn force_keyframe(&mut self) {
        self.keyframe_pending = true;
    }
}

fn crop_rgb(rgb: &[u8], width: u32, new_w: u32, new_h: u32) -> Vec<u8> {
    let stride = width as usize * 3;
    let row = new_w as usize * 3;
    let mut out = Vec::with_capacity(row * new_h as usize);
    for y in 0..new_h as usize {
        out.extend_from_slice(&rgb[y * stride..y * stride + row]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_drops_last_column_and_row() {
        // 3x3 image, pixel value = index
        let rgb: Vec<u8> = (0..9).flat_map(|i| [i, i, i]).collect();
        let out = crop_rgb(&rgb, 3, 2, 2);
        assert_eq!(out, vec![0, 0, 0, 1, 1, 1, 3, 3, 3, 4, 4, 4]);
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let mut encoder = H264Encoder::new();
        assert!(encoder.encode(&[0u8; 10], 4, 4).is_err());
    }

    /// Indices of the pictures carrying an IDR slice (NAL type 5).
    fn idr_pictures(stream: &[Option<Bytes>]) -> Vec<usize> {
        stream
            .iter()
            .enumerate()
            .filter(|(_, data)| {
                data.as_ref().map_or(false, |d| {
                    d.windows(4)
                        .any(|w| w[..3] == [0, 0, 1] && w[3] & 0x1f == 5)
                })
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Mostly static scene with a little sensor noise
    fn still_scene(n: usize) -> Vec<u8> {
        (0..64 * 48 * 3)
            .map(|i| 100 + ((i + n) % 3) as u8)
            .collect()
    }

    #[test]
    fn static_scene_gets_periodic_keyframes() {
        let mut encoder = H264Encoder::with_keyframe_interval(30);
        let stream: Vec<_> = (0..120)
            .map(|n| encoder.encode(&still_scene(n), 64, 48).unwrap())
            .collect();

        let idr = idr_pictures(&stream);
        assert_eq!(idr.first(), Some(&0));
        assert!(idr.len() >= 4, "IDR pictures: {:?}", idr);
        assert!(idr.windows(2).all(|w| w[1] - w[0] <= 30), "IDR pictures: {:?}", idr);
    }

    #[test]
    fn requested_keyframe_arrives_on_next_picture() {
        let mut encoder = H264Encoder::with_keyframe_interval(1000);
        let mut stream: Vec<_> = (0..5)
            .map(|n| encoder.encode(&still_scene(n), 64, 48).unwrap())
            .collect();
        assert_eq!(idr_pictures(&stream), vec![0]);

        encoder.force_keyframe();
        stream.push(encoder.encode(&still_scene(5), 64, 48).unwrap());
        stream.push(encoder.encode(&still_scene(6), 64, 48).unwrap());
        assert_eq!(idr_pictures(&stream), vec![0, 5]);
    }

    #[test]
    fn keyframe_request_is_taken_once() {
        let request = KeyframeRequest::new();
        assert!(!request.take());
        request.clone().request();
        assert!(request.take());
        assert!(!request.take());
    }

    #[test]
    fn encodes_annex_b_stream() {
        let mut encoder = H264Encoder::new();
        let rgb = vec![128u8; 64 * 48 * 3];
        let data = encoder.encode(&rgb, 64, 48).unwrap().expect("first frame is a keyframe");
        assert!(data.starts_with(&[0, 0, 0, 1]) || data.starts_with(&[0, 0, 1]));
        assert_eq!(encoder.frame_count(), 1);
    }
}
