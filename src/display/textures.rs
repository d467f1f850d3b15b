//! Texture lifecycle for the render surface, independent of the GPU backend

use crate::capture::{FrameData, PixelFormat};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneFormat {
    /// 4 bytes per texel; packed frames are expanded to this
    Rgba8,
    /// Single 8-bit channel, one per YUV plane
    R8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDesc {
    pub width: u32,
    pub height: u32,
    pub format: PlaneFormat,
}

/// Geometry and color model of the textures currently allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Layout {
    pub fn planes(&self) -> Vec<PlaneDesc> {
        match self.format {
            PixelFormat::Yuv420p => {
                let luma = PlaneDesc {
                    width: self.width,
                    height: self.height,
                    format: PlaneFormat::R8,
                };
                let chroma = PlaneDesc {
                    width: self.width / 2,
                    height: self.height / 2,
                    format: PlaneFormat::R8,
                };
                vec![luma, chroma, chroma]
            }
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => vec![PlaneDesc {
                width: self.width,
                height: self.height,
                format: PlaneFormat::Rgba8,
            }],
        }
    }
}

/// Backend that owns the actual texture objects.
pub trait TextureAllocator {
    type Texture;

    fn create(&mut self, desc: PlaneDesc) -> Self::Texture;

    /// `data` is tightly packed for `desc`
    fn write(&mut self, texture: &Self::Texture, desc: PlaneDesc, data: &[u8]);

    fn release(&mut self, texture: Self::Texture);
}

/// The textures backing the current picture. Uploads with the same layout
/// reuse them; a layout change releases every previous texture first.
pub struct TextureSet<T> {
    layout: Option<Layout>,
    planes: Vec<T>,
}

impl<T> Default for TextureSet<T> {
    fn default() -> Self {
        Self {
            layout: None,
            planes: Vec::new(),
        }
    }
}

impl<T> TextureSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(&self) -> Option<Layout> {
        self.layout
    }

    pub fn planes(&self) -> &[T] {
        &self.planes
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    /// Upload one picture. Returns `true` when the textures were (re)allocated.
    /// A zero-sized picture is ignored.
    pub fn upload<A>(
        &mut self,
        alloc: &mut A,
        data: &FrameData,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<bool>
    where
        A: TextureAllocator<Texture = T>,
    {
        if width == 0 || height == 0 {
            return Ok(false);
        }
        let layout = Layout {
            width,
            height,
            format,
        };
        let contents = plane_contents(data, layout)?;

        let reallocated = self.layout != Some(layout);
        if reallocated {
            self.clear(alloc);
            self.planes = layout
                .planes()
                .into_iter()
                .map(|desc| alloc.create(desc))
                .collect();
            self.layout = Some(layout);
        }

        for ((texture, desc), bytes) in self.planes.iter().zip(layout.planes()).zip(&contents) {
            alloc.write(texture, desc, bytes);
        }
        Ok(reallocated)
    }

    /// Release every texture and forget the layout.
    pub fn clear<A>(&mut self, alloc: &mut A)
    where
        A: TextureAllocator<Texture = T>,
    {
        for texture in self.planes.drain(..) {
            alloc.release(texture);
        }
        self.layout = None;
    }
}

/// Validate `data` against `layout` and produce the bytes for each plane.
fn plane_contents(data: &FrameData, layout: Layout) -> Result<Vec<Vec<u8>>> {
    let Layout {
        width,
        height,
        format,
    } = layout;
    let luma = width as usize * height as usize;

    match (data, format) {
        (FrameData::Packed(bytes), PixelFormat::Rgb24 | PixelFormat::Bgr24) => {
            if bytes.len() != luma * 3 {
                return Err(Error::InvalidFrame(format!(
                    "packed {}x{} needs {} bytes, got {}",
                    width,
                    height,
                    luma * 3,
                    bytes.len()
                )));
            }
            Ok(vec![expand_rgba(bytes)])
        }
        (FrameData::Planar { y, u, v }, PixelFormat::Yuv420p) => {
            if width < 2 || height < 2 {
                return Err(Error::InvalidFrame(format!(
                    "planar {}x{} is too small for 4:2:0",
                    width, height
                )));
            }
            let chroma = (width / 2) as usize * (height / 2) as usize;
            if y.len() != luma || u.len() != chroma || v.len() != chroma {
                return Err(Error::InvalidFrame(format!(
                    "plane sizes {}/{}/{} do not match {}x{} 4:2:0",
                    y.len(),
                    u.len(),
                    v.len(),
                    width,
                    height
                )));
            }
            Ok(vec![y.to_vec(), u.to_vec(), v.to_vec()])
        }
        (_, format) => Err(Error::InvalidFrame(format!(
            "buffer layout does not match {:?}",
            format
        ))),
    }
}

/// 3-channel to 4-channel with opaque alpha. Channel order is left to the shader.
pub fn expand_rgba(packed: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(packed.len() / 3 * 4);
    for px in packed.chunks_exact(3) {
        rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
    }
    rgba
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[derive(Default)]
    struct CountingAllocator {
        next_id: u32,
        live: Vec<u32>,
        created: Vec<PlaneDesc>,
        released: Vec<u32>,
        writes: usize,
    }

    impl TextureAllocator for CountingAllocator {
        type Texture = u32;

        fn create(&mut self, desc: PlaneDesc) -> u32 {
            self.next_id += 1;
            self.live.push(self.next_id);
            self.created.push(desc);
            self.next_id
        }

        fn write(&mut self, texture: &u32, desc: PlaneDesc, data: &[u8]) {
            assert!(self.live.contains(texture), "write to released texture");
            let bpp = if desc.format == PlaneFormat::Rgba8 { 4 } else { 1 };
            assert_eq!(data.len(), (desc.width * desc.height) as usize * bpp);
            self.writes += 1;
        }

        fn release(&mut self, texture: u32) {
            assert!(self.live.contains(&texture), "double release");
            self.live.retain(|t| *t != texture);
            self.released.push(texture);
        }
    }

    fn packed(w: u32, h: u32) -> FrameData {
        FrameData::Packed(Bytes::from(vec![0u8; (w * h * 3) as usize]))
    }

    fn planar(w: u32, h: u32) -> FrameData {
        let c = ((w / 2) * (h / 2)) as usize;
        FrameData::Planar {
            y: Bytes::from(vec![0u8; (w * h) as usize]),
            u: Bytes::from(vec![128u8; c]),
            v: Bytes::from(vec![128u8; c]),
        }
    }

    #[test]
    fn same_layout_reuses_textures() {
        let mut alloc = CountingAllocator::default();
        let mut set = TextureSet::new();
        assert!(set.upload(&mut alloc, &packed(4, 4), 4, 4, PixelFormat::Bgr24).unwrap());
        assert!(!set.upload(&mut alloc, &packed(4, 4), 4, 4, PixelFormat::Bgr24).unwrap());
        assert_eq!(alloc.created.len(), 1);
        assert_eq!(alloc.writes, 2);
    }

    #[test]
    fn format_switch_releases_previous_textures_first() {
        let mut alloc = CountingAllocator::default();
        let mut set = TextureSet::new();

        set.upload(&mut alloc, &planar(4, 4), 4, 4, PixelFormat::Yuv420p).unwrap();
        assert_eq!(alloc.live.len(), 3);
        assert_eq!(alloc.created[1], PlaneDesc { width: 2, height: 2, format: PlaneFormat::R8 });

        set.upload(&mut alloc, &packed(4, 4), 4, 4, PixelFormat::Rgb24).unwrap();
        assert_eq!(alloc.released, vec![1, 2, 3]);
        assert_eq!(alloc.live, vec![4]);

        set.upload(&mut alloc, &planar(4, 4), 4, 4, PixelFormat::Yuv420p).unwrap();
        assert_eq!(alloc.released, vec![1, 2, 3, 4]);
        assert_eq!(alloc.live.len(), 3);
    }

    #[test]
    fn clear_releases_everything_and_resets_layout() {
        let mut alloc = CountingAllocator::default();
        let mut set = TextureSet::new();
        set.upload(&mut alloc, &planar(4, 4), 4, 4, PixelFormat::Yuv420p).unwrap();

        set.clear(&mut alloc);
        assert!(set.is_empty());
        assert_eq!(set.layout(), None);
        assert!(alloc.live.is_empty());

        // idempotent
        set.clear(&mut alloc);
        assert_eq!(alloc.released.len(), 3);
    }

    #[test]
    fn mismatched_planes_are_rejected_without_touching_textures() {
        let mut alloc = CountingAllocator::default();
        let mut set = TextureSet::new();
        set.upload(&mut alloc, &packed(4, 4), 4, 4, PixelFormat::Rgb24).unwrap();

        let bad = FrameData::Planar {
            y: Bytes::from(vec![0u8; 16]),
            u: Bytes::from(vec![0u8; 3]),
            v: Bytes::from(vec![0u8; 4]),
        };
        assert!(set.upload(&mut alloc, &bad, 4, 4, PixelFormat::Yuv420p).is_err());
        assert!(set.upload(&mut alloc, &packed(4, 4), 4, 4, PixelFormat::Yuv420p).is_err());
        assert_eq!(alloc.live.len(), 1);
        assert_eq!(set.layout().map(|l| l.format), Some(PixelFormat::Rgb24));
    }

    #[test]
    fn zero_sized_picture_is_ignored() {
        let mut alloc = CountingAllocator::default();
        let mut set = TextureSet::new();
        set.upload(&mut alloc, &packed(4, 4), 4, 4, PixelFormat::Rgb24).unwrap();

        assert!(!set.upload(&mut alloc, &packed(4, 4), 0, 4, PixelFormat::Rgb24).unwrap());
        assert_eq!(alloc.writes, 1);
        assert_eq!(alloc.live.len(), 1);
    }

    #[test]
    fn rgba_expansion_keeps_channel_order() {
        assert_eq!(expand_rgba(&[1, 2, 3, 4, 5, 6]), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }
}
