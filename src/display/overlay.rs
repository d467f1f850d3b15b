//! Detection overlay: box planning and CPU rasterization into the frame

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{info, warn};

use super::detection::Detection;
use crate::capture::PixelFormat;
use crate::error::{Error, Result};
use crate::OverlayConfig;

pub const ALERT_COLOR: [u8; 3] = [255, 0, 0];
pub const NORMAL_COLOR: [u8; 3] = [0, 255, 0];
const ID_COLOR: [u8; 3] = [255, 255, 255];
const LABEL_BACKGROUND: [u8; 3] = [0, 0, 0];

/// Label font used unless `overlay.font_path` points elsewhere
static BUNDLED_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans.ttf");

/// A box ready to draw, colors in RGB order.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub color: [u8; 3],
    pub label: String,
    pub id_label: Option<String>,
}

pub struct OverlayStyle {
    highlight: String,
    thickness: u32,
    scale: PxScale,
    font: Option<FontArc>,
}

impl OverlayStyle {
    pub fn new(highlight: &str, thickness: u32, label_scale: f32) -> Self {
        Self {
            highlight: highlight.to_lowercase(),
            thickness: thickness.max(1),
            scale: PxScale::from(label_scale),
            font: bundled_font(),
        }
    }

    /// Boxes only, no text.
    pub fn without_labels(mut self) -> Self {
        self.font = None;
        self
    }

    pub fn from_config(config: &OverlayConfig) -> Result<Self> {
        let mut style = Self::new(
            &config.highlight_class,
            config.box_thickness,
            config.label_scale,
        );
        if let Some(path) = &config.font_path {
            style.font = Some(load_font(path)?);
            info!("Overlay labels use font {}", path.display());
        }
        Ok(style)
    }

    /// Classes containing the highlight word, ignoring case, get the alert color.
    pub fn is_highlighted(&self, class_name: &str) -> bool {
        !self.highlight.is_empty() && class_name.to_lowercase().contains(&self.highlight)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }
}

fn bundled_font() -> Option<FontArc> {
    match FontArc::try_from_slice(BUNDLED_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!("Bundled label font unusable, drawing boxes only: {}", e);
            None
        }
    }
}

fn load_font(path: &Path) -> Result<FontArc> {
    let bytes = std::fs::read(path)?;
    FontArc::try_from_vec(bytes)
        .map_err(|e| Error::Render(format!("invalid font {}: {}", path.display(), e)))
}

pub fn plan(detections: &[Detection], style: &OverlayStyle) -> Vec<OverlayBox> {
    detections
        .iter()
        .map(|det| {
            let [ax, ay, bx, by] = det.bbox;
            OverlayBox {
                x1: ax.min(bx),
                y1: ay.min(by),
                x2: ax.max(bx),
                y2: ay.max(by),
                color: if style.is_highlighted(&det.class_name) {
                    ALERT_COLOR
                } else {
                    NORMAL_COLOR
                },
                label: format!("{} {:.2}", det.class_name, det.confidence),
                id_label: det.object_id.map(|id| format!("ID:{}", id)),
            }
        })
        .collect()
}

/// Draw `boxes` into a packed 3-channel image whose channel order is `order`.
pub fn rasterize(image: &mut RgbImage, boxes: &[OverlayBox], style: &OverlayStyle, order: PixelFormat) {
    let paint = |c: [u8; 3]| match order {
        PixelFormat::Bgr24 => Rgb([c[2], c[1], c[0]]),
        _ => Rgb(c),
    };

    // Borders pushed past the edge stay invisible but keep line lengths bounded
    let margin = style.thickness as i32;
    let (max_x, max_y) = (image.width() as i32 + margin, image.height() as i32 + margin);
    let clamp_x = |x: i32| x.clamp(-margin, max_x);
    let clamp_y = |y: i32| y.clamp(-margin, max_y);

    for b in boxes {
        let color = paint(b.color);
        let (x1, y1) = (clamp_x(b.x1), clamp_y(b.y1));
        let (x2, y2) = (clamp_x(b.x2), clamp_y(b.y2));
        let w = (x2 - x1 + 1) as u32;
        let h = (y2 - y1 + 1) as u32;
        for t in 0..style.thickness {
            let (iw, ih) = (w.saturating_sub(2 * t), h.saturating_sub(2 * t));
            if iw == 0 || ih == 0 {
                break;
            }
            let rect = Rect::at(x1 + t as i32, y1 + t as i32).of_size(iw, ih);
            draw_hollow_rect_mut(image, rect, color);
        }

        let Some(font) = &style.font else { continue };

        let (tw, th) = text_size(style.scale, font, &b.label);
        if tw > 0 && th > 0 {
            let top = y1.saturating_sub(th as i32 + 8);
            draw_filled_rect_mut(
                image,
                Rect::at(x1, top).of_size(tw + 4, th + 6),
                paint(LABEL_BACKGROUND),
            );
            draw_text_mut(image, color, x1 + 2, top + 3, style.scale, font, &b.label);
        }

        if let Some(id) = &b.id_label {
            draw_text_mut(
                image,
                paint(ID_COLOR),
                x1,
                y2 + 5,
                PxScale::from(style.scale.y * 0.85),
                font,
                id,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(class_name: &str, bbox: [i32; 4]) -> Detection {
        Detection {
            object_id: None,
            bbox,
            class_name: class_name.into(),
            confidence: 0.5,
        }
    }

    #[test]
    fn highlight_matches_substring_ignoring_case() {
        let style = OverlayStyle::new("cavity", 3, 20.0);
        let boxes = plan(
            &[
                detection("Cavity", [0, 0, 4, 4]),
                detection("deep_CAVITY", [0, 0, 4, 4]),
                detection("plaque", [0, 0, 4, 4]),
            ],
            &style,
        );
        let colors: Vec<_> = boxes.iter().map(|b| b.color).collect();
        assert_eq!(colors, vec![ALERT_COLOR, ALERT_COLOR, NORMAL_COLOR]);
        assert_eq!(boxes[0].label, "Cavity 0.50");
    }

    #[test]
    fn reversed_corners_are_normalized() {
        let style = OverlayStyle::new("cavity", 3, 20.0);
        let boxes = plan(&[detection("x", [50, 40, 10, 20])], &style);
        assert_eq!((boxes[0].x1, boxes[0].y1, boxes[0].x2, boxes[0].y2), (10, 20, 50, 40));
    }

    #[test]
    fn object_id_becomes_label() {
        let style = OverlayStyle::new("cavity", 3, 20.0);
        let mut det = detection("x", [0, 0, 1, 1]);
        det.object_id = Some(12);
        assert_eq!(plan(&[det], &style)[0].id_label.as_deref(), Some("ID:12"));
    }

    #[test]
    fn box_border_is_drawn_with_thickness() {
        let style = OverlayStyle::new("cavity", 3, 20.0);
        let mut image = RgbImage::new(64, 64);
        let boxes = plan(&[detection("cavity", [10, 10, 50, 50])], &style);
        rasterize(&mut image, &boxes, &style, PixelFormat::Rgb24);

        for inset in 0..3 {
            assert_eq!(image.get_pixel(10 + inset, 30).0, ALERT_COLOR);
        }
        assert_eq!(image.get_pixel(13, 30).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(30, 30).0, [0, 0, 0]);
    }

    #[test]
    fn bgr_frames_get_swapped_colors() {
        let style = OverlayStyle::new("cavity", 1, 20.0);
        let mut image = RgbImage::new(16, 16);
        let boxes = plan(&[detection("cavity", [2, 2, 8, 8])], &style);
        rasterize(&mut image, &boxes, &style, PixelFormat::Bgr24);
        assert_eq!(image.get_pixel(2, 2).0, [0, 0, 255]);
    }

    #[test]
    fn tiny_and_offscreen_boxes_do_not_panic() {
        let style = OverlayStyle::new("cavity", 3, 20.0);
        let mut image = RgbImage::new(8, 8);
        let boxes = plan(
            &[
                detection("a", [3, 3, 3, 3]),
                detection("b", [-20, -20, -10, -10]),
                detection("c", [100, 100, 200, 200]),
            ],
            &style,
        );
        rasterize(&mut image, &boxes, &style, PixelFormat::Rgb24);
        assert_eq!(image.get_pixel(3, 3).0, NORMAL_COLOR);
    }

    #[test]
    fn extreme_coordinates_with_labels_do_not_overflow() {
        let style = OverlayStyle::new("cavity", 3, 20.0);
        assert!(style.has_font());
        let mut image = RgbImage::new(16, 16);
        let mut det = detection("cavity", [i32::MIN, i32::MIN, i32::MAX, i32::MAX]);
        det.object_id = Some(i64::MAX);
        let boxes = plan(&[det], &style);
        rasterize(&mut image, &boxes, &style, PixelFormat::Rgb24);
        assert_eq!(image.get_pixel(8, 8).0, [0, 0, 0]);
    }

    #[test]
    fn boxes_without_labels_leave_surroundings_untouched() {
        let style = OverlayStyle::new("cavity", 1, 20.0).without_labels();
        let mut image = RgbImage::new(32, 32);
        let boxes = plan(&[detection("cavity", [4, 20, 12, 24])], &style);
        rasterize(&mut image, &boxes, &style, PixelFormat::Rgb24);
        assert!(image.rows().take(20).flatten().all(|p| p.0 == [0, 0, 0]));
    }
}
