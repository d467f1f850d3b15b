use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: FrameData,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Pixel storage: one packed plane or three 4:2:0 planes.
#[derive(Clone)]
pub enum FrameData {
    Packed(Bytes),
    Planar { y: Bytes, u: Bytes, v: Bytes },
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats understood by the render and media paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    /// Three planes: Y at full resolution, U and V at half resolution.
    Yuv420p,
}

impl PixelFormat {
    pub fn is_planar(self) -> bool {
        matches!(self, PixelFormat::Yuv420p)
    }
}

impl Frame {
    /// Packed 3-channel frame. Fails if `data` is not `width * height * 3` bytes.
    pub fn packed(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self> {
        if format.is_planar() {
            return Err(Error::InvalidFrame(format!(
                "{:?} is not a packed format",
                format
            )));
        }
        let data = data.into();
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "{:?} {}x{} needs {} bytes, got {}",
                format,
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self::from_parts(
            FrameData::Packed(data),
            width,
            height,
            format,
            sequence,
        ))
    }

    /// Planar 4:2:0 frame. Chroma planes are `(width / 2) * (height / 2)`.
    pub fn planar(
        y: impl Into<Bytes>,
        u: impl Into<Bytes>,
        v: impl Into<Bytes>,
        width: u32,
        height: u32,
        sequence: u64,
    ) -> Result<Self> {
        let (y, u, v) = (y.into(), u.into(), v.into());
        let luma = width as usize * height as usize;
        let chroma = (width / 2) as usize * (height / 2) as usize;
        if y.len() != luma || u.len() != chroma || v.len() != chroma {
            return Err(Error::InvalidFrame(format!(
                "Yuv420p {}x{} plane sizes {}/{}/{} (expected {}/{}/{})",
                width,
                height,
                y.len(),
                u.len(),
                v.len(),
                luma,
                chroma,
                chroma
            )));
        }
        Ok(Self::from_parts(
            FrameData::Planar { y, u, v },
            width,
            height,
            PixelFormat::Yuv420p,
            sequence,
        ))
    }

    /// All-black packed frame, used when the capture path is starved.
    pub fn blank(width: u32, height: u32) -> Self {
        let data = Bytes::from(vec![0u8; width as usize * height as usize * 3]);
        Self::from_parts(FrameData::Packed(data), width, height, PixelFormat::Bgr24, 0)
    }

    fn from_parts(
        data: FrameData,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("age", &self.timestamp.elapsed())
            .finish()
    }
}
