//! Pixel decoding and colorspace conversion helpers

use zune_jpeg::JpegDecoder;

use super::frame::{Frame, FrameData, PixelFormat};
use crate::error::{Error, Result};

/// Decode an MJPEG buffer to packed RGB24. Returns `(pixels, width, height)`.
pub fn decode_mjpeg(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let mut decoder = JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| Error::Capture(format!("MJPEG decode failed: {:?}", e)))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| Error::Capture("MJPEG decoder reported no dimensions".into()))?;
    Ok((pixels, width as u32, height as u32))
}

/// Split packed YUYV (4:2:2) into I420 planes, averaging chroma of row pairs.
pub fn yuyv_to_i420(data: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let (w, h) = (width as usize, height as usize);
    if data.len() < w * h * 2 {
        return Err(Error::Capture(format!(
            "YUYV buffer too short: {} < {}",
            data.len(),
            w * h * 2
        )));
    }

    let (cw, ch) = (w / 2, h / 2);
    let mut y = vec![0u8; w * h];
    let mut u = vec![0u8; cw * ch];
    let mut v = vec![0u8; cw * ch];

    for row in 0..h {
        let src = &data[row * w * 2..(row + 1) * w * 2];
        for (i, px) in src.chunks_exact(2).enumerate() {
            y[row * w + i] = px[0];
        }
    }

    for crow in 0..ch {
        let top = &data[(crow * 2) * w * 2..];
        let bottom = &data[(crow * 2 + 1) * w * 2..];
        for ccol in 0..cw {
            let idx = ccol * 4;
            u[crow * cw + ccol] = ((top[idx + 1] as u16 + bottom[idx + 1] as u16) / 2) as u8;
            v[crow * cw + ccol] = ((top[idx + 3] as u16 + bottom[idx + 3] as u16) / 2) as u8;
        }
    }

    Ok((y, u, v))
}

/// Swap the first and third channel of every packed pixel (RGB <-> BGR).
pub fn swap_red_blue(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    out
}

/// Full-range 4:2:0 to packed RGB24, same matrix the display shader uses.
pub fn i420_to_rgb(y: &[u8], u: &[u8], v: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let cw = (w / 2).max(1);
    let mut rgb = Vec::with_capacity(w * h * 3);

    for row in 0..h {
        for col in 0..w {
            let ci = ((row / 2) * cw + col / 2).min(u.len().saturating_sub(1));
            let yf = y[row * w + col] as f32 / 255.0;
            let uf = u.get(ci).copied().unwrap_or(128) as f32 / 255.0 - 0.5;
            let vf = v.get(ci).copied().unwrap_or(128) as f32 / 255.0 - 0.5;

            let r = yf + 1.140 * vf;
            let g = yf - 0.395 * uf - 0.581 * vf;
            let b = yf + 2.032 * uf;

            rgb.push((r.clamp(0.0, 1.0) * 255.0).round() as u8);
            rgb.push((g.clamp(0.0, 1.0) * 255.0).round() as u8);
            rgb.push((b.clamp(0.0, 1.0) * 255.0).round() as u8);
        }
    }

    rgb
}

/// Convert RGB24 to contiguous I420 (BT.601) for the encoder.
pub fn rgb_to_i420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    // YUV420: Y plane (w*h) + U plane (w/2 * h/2) + V plane (w/2 * h/2)
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let rgb_idx = (y * w + x) * 3;
            let r = rgb[rgb_idx] as i32;
            let g = rgb[rgb_idx + 1] as i32;
            let b = rgb[rgb_idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            // Subsample U and V (2x2 blocks)
            if y % 2 == 0 && x % 2 == 0 && x / 2 < w / 2 && y / 2 < h / 2 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

/// Normalize any frame to packed pixels in the requested channel order.
pub fn to_packed(frame: &Frame, order: PixelFormat) -> Vec<u8> {
    match (&frame.data, frame.format()) {
        (FrameData::Packed(data), format) if format == order => data.to_vec(),
        (FrameData::Packed(data), _) => swap_red_blue(data),
        (FrameData::Planar { y, u, v }, _) => {
            let rgb = i420_to_rgb(y, u, v, frame.width(), frame.height());
            if order == PixelFormat::Bgr24 {
                swap_red_blue(&rgb)
            } else {
                rgb
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_is_involution() {
        let px = vec![1, 2, 3, 4, 5, 6];
        assert_eq!(swap_red_blue(&px), vec![3, 2, 1, 6, 5, 4]);
        assert_eq!(swap_red_blue(&swap_red_blue(&px)), px);
    }

    #[test]
    fn yuyv_planes_have_expected_sizes() {
        let data = vec![128u8; 4 * 2 * 2];
        let (y, u, v) = yuyv_to_i420(&data, 4, 2).unwrap();
        assert_eq!((y.len(), u.len(), v.len()), (8, 2, 2));
    }

    #[test]
    fn yuyv_rejects_short_buffer() {
        assert!(yuyv_to_i420(&[0u8; 3], 4, 2).is_err());
    }

    #[test]
    fn neutral_chroma_is_gray() {
        let y = vec![128u8; 4];
        let u = vec![128u8; 1];
        let v = vec![128u8; 1];
        let rgb = i420_to_rgb(&y, &u, &v, 2, 2);
        assert_eq!(rgb.len(), 12);
        for px in rgb.chunks_exact(3) {
            assert!(px.iter().all(|&c| (127..=129).contains(&c)), "{:?}", px);
        }
    }

    #[test]
    fn rgb_to_i420_size() {
        let rgb = vec![128u8; 640 * 480 * 3];
        let yuv = rgb_to_i420(&rgb, 640, 480);
        assert_eq!(yuv.len(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn to_packed_reorders_channels() {
        let frame = Frame::packed(vec![10, 20, 30], 1, 1, PixelFormat::Bgr24, 0).unwrap();
        assert_eq!(to_packed(&frame, PixelFormat::Rgb24), vec![30, 20, 10]);
        assert_eq!(to_packed(&frame, PixelFormat::Bgr24), vec![10, 20, 30]);
    }
}
