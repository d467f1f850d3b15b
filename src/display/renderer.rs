//! Per-tick composition of the camera frame and the latest annotation payload

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::RgbImage;
use tracing::{debug, instrument, warn};

use super::detection::decode_batch;
use super::overlay::{self, OverlayBox, OverlayStyle};
use crate::capture::decoder::to_packed;
use crate::capture::{Frame, FrameData, PixelFormat};
use crate::error::{Error, Result};
use crate::pipeline::LatestValueChannel;

/// Where pictures end up. Implemented by the GPU surface.
pub trait RenderSurface {
    /// Replace the displayed picture. Textures are reused if the layout matches.
    fn set_texture_data(
        &mut self,
        data: &FrameData,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<()>;

    /// Drop all textures; the next paint shows an empty view.
    fn clear(&mut self);

    fn resize(&mut self, width: u32, height: u32);

    fn paint(&mut self) -> Result<()>;
}

pub struct Renderer<S> {
    surface: S,
    inbound: Arc<LatestValueChannel<Bytes>>,
    style: OverlayStyle,
}

impl<S: RenderSurface> Renderer<S> {
    pub fn new(surface: S, inbound: Arc<LatestValueChannel<Bytes>>, style: OverlayStyle) -> Self {
        Self {
            surface,
            inbound,
            style,
        }
    }

    /// Upload `frame`, with boxes drawn in if an annotation payload arrived
    /// since the last tick. Returns the number of boxes drawn.
    #[instrument(skip_all, fields(seq = frame.meta.sequence))]
    pub fn render_frame(&mut self, frame: &Frame) -> Result<usize> {
        let boxes = match self.inbound.try_get() {
            Some(payload) => self.plan_overlay(&payload),
            None => Vec::new(),
        };

        let (width, height) = (frame.width(), frame.height());
        if boxes.is_empty() {
            self.surface
                .set_texture_data(&frame.data, width, height, frame.format())?;
            return Ok(0);
        }

        // Boxes are drawn on the CPU, so planar frames become packed RGB here
        let order = match frame.format() {
            PixelFormat::Bgr24 => PixelFormat::Bgr24,
            _ => PixelFormat::Rgb24,
        };
        let mut image = RgbImage::from_raw(width, height, to_packed(frame, order))
            .ok_or_else(|| Error::InvalidFrame(format!("{}x{} buffer too short", width, height)))?;
        overlay::rasterize(&mut image, &boxes, &self.style, order);

        let data = FrameData::Packed(Bytes::from(image.into_raw()));
        self.surface.set_texture_data(&data, width, height, order)?;
        Ok(boxes.len())
    }

    fn plan_overlay(&self, payload: &[u8]) -> Vec<OverlayBox> {
        match decode_batch(payload) {
            Ok(detections) => {
                debug!("Annotation payload with {} detections", detections.len());
                overlay::plan(&detections, &self.style)
            }
            Err(e) => {
                warn!("Dropping annotation payload: {}", e);
                Vec::new()
            }
        }
    }

    pub fn paint(&mut self) -> Result<()> {
        let start = Instant::now();
        self.surface.paint()?;
        metrics::histogram!("render_time_us").record(start.elapsed().as_micros() as f64);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.surface.clear();
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface.resize(width, height);
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::overlay::{ALERT_COLOR, NORMAL_COLOR};

    #[derive(Default)]
    struct RecordingSurface {
        uploads: Vec<(Vec<u8>, u32, u32, PixelFormat)>,
        clears: usize,
    }

    impl RenderSurface for RecordingSurface {
        fn set_texture_data(
            &mut self,
            data: &FrameData,
            width: u32,
            height: u32,
            format: PixelFormat,
        ) -> Result<()> {
            let bytes = match data {
                FrameData::Packed(b) => b.to_vec(),
                FrameData::Planar { y, .. } => y.to_vec(),
            };
            self.uploads.push((bytes, width, height, format));
            Ok(())
        }

        fn clear(&mut self) {
            self.clears += 1;
        }

        fn resize(&mut self, _width: u32, _height: u32) {}

        fn paint(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn renderer() -> (Renderer<RecordingSurface>, Arc<LatestValueChannel<Bytes>>) {
        let inbound = Arc::new(LatestValueChannel::new());
        let style = OverlayStyle::new("cavity", 3, 20.0);
        (
            Renderer::new(RecordingSurface::default(), Arc::clone(&inbound), style),
            inbound,
        )
    }

    fn black_frame(format: PixelFormat) -> Frame {
        Frame::packed(vec![0u8; 64 * 64 * 3], 64, 64, format, 1).unwrap()
    }

    fn pixel(upload: &(Vec<u8>, u32, u32, PixelFormat), x: u32, y: u32) -> [u8; 3] {
        let i = ((y * upload.1 + x) * 3) as usize;
        [upload.0[i], upload.0[i + 1], upload.0[i + 2]]
    }

    #[test]
    fn highlighted_detection_draws_one_alert_box() {
        let (mut renderer, inbound) = renderer();
        inbound.put(Bytes::from_static(
            br#"{"detections":[{"bbox":[10,10,50,50],"class_name":"Cavity","confidence":0.91}]}"#,
        ));

        let drawn = renderer.render_frame(&black_frame(PixelFormat::Rgb24)).unwrap();
        assert_eq!(drawn, 1);

        let upload = &renderer.surface().uploads[0];
        assert_eq!(upload.3, PixelFormat::Rgb24);
        assert_eq!(pixel(upload, 10, 30), ALERT_COLOR);
        assert_eq!(pixel(upload, 50, 30), ALERT_COLOR);
        assert_eq!(pixel(upload, 30, 30), [0, 0, 0]);
    }

    #[test]
    fn label_is_drawn_above_the_box_by_default() {
        let (mut renderer, inbound) = renderer();
        inbound.put(Bytes::from_static(
            br#"{"detections":[{"bbox":[10,30,60,44],"class_name":"Cavity","confidence":0.91,"object_id":3}]}"#,
        ));
        renderer.render_frame(&black_frame(PixelFormat::Rgb24)).unwrap();

        let upload = &renderer.surface().uploads[0];
        let lit = |rows: std::ops::Range<u32>, on: fn([u8; 3]) -> bool| {
            rows.flat_map(|y| (0..64).map(move |x| (x, y)))
                .filter(|&(x, y)| on(pixel(upload, x, y)))
                .count()
        };
        // class and confidence in the box color, over the label background
        assert!(lit(0..30, |p| p[0] > 200 && p[1] == 0) > 0);
        // object id in white below the box
        assert!(lit(45..64, |p| p.iter().all(|c| *c > 200)) > 0);
    }

    #[test]
    fn malformed_bbox_renders_plain_frame() {
        let (mut renderer, inbound) = renderer();
        inbound.put(Bytes::from_static(br#"{"detections":[{"bbox":"bad"}]}"#));

        let frame = black_frame(PixelFormat::Bgr24);
        assert_eq!(renderer.render_frame(&frame).unwrap(), 0);

        let upload = &renderer.surface().uploads[0];
        assert!(upload.0.iter().all(|b| *b == 0));
        assert_eq!(upload.3, PixelFormat::Bgr24);
    }

    #[test]
    fn undecodable_payload_still_renders_frame() {
        let (mut renderer, inbound) = renderer();
        inbound.put(Bytes::from_static(b"\x00\x01 not json"));
        assert_eq!(renderer.render_frame(&black_frame(PixelFormat::Rgb24)).unwrap(), 0);
        assert_eq!(renderer.surface().uploads.len(), 1);
    }

    #[test]
    fn overlay_only_applies_to_the_tick_it_arrived_on() {
        let (mut renderer, inbound) = renderer();
        inbound.put(Bytes::from_static(
            br#"{"detections":[{"bbox":[1,1,20,20],"class_name":"tooth","confidence":0.5}]}"#,
        ));
        let frame = black_frame(PixelFormat::Rgb24);
        assert_eq!(renderer.render_frame(&frame).unwrap(), 1);
        assert_eq!(pixel(&renderer.surface().uploads[0], 1, 5), NORMAL_COLOR);

        assert_eq!(renderer.render_frame(&frame).unwrap(), 0);
        assert_eq!(pixel(&renderer.surface().uploads[1], 1, 5), [0, 0, 0]);
    }

    #[test]
    fn planar_frame_with_overlay_is_uploaded_packed() {
        let (mut renderer, inbound) = renderer();
        let frame = Frame::planar(vec![0u8; 16], vec![128u8; 4], vec![128u8; 4], 4, 4, 3).unwrap();

        renderer.render_frame(&frame).unwrap();
        assert_eq!(renderer.surface().uploads[0].3, PixelFormat::Yuv420p);

        inbound.put(Bytes::from_static(br#"{"detections":[{"bbox":[0,0,3,3]}]}"#));
        renderer.render_frame(&frame).unwrap();
        let upload = &renderer.surface().uploads[1];
        assert_eq!(upload.3, PixelFormat::Rgb24);
        assert_eq!(upload.0.len(), 4 * 4 * 3);
    }

    #[test]
    fn clear_is_forwarded() {
        let (mut renderer, _) = renderer();
        renderer.clear();
        assert_eq!(renderer.surface().clears, 1);
    }
}
