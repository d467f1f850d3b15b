pub mod detection;
pub mod gpu;
pub mod overlay;
pub mod renderer;
pub mod scale;
pub mod textures;
pub mod window;

pub use detection::{decode_batch, Detection};
pub use gpu::GpuSurface;
pub use overlay::{OverlayBox, OverlayStyle};
pub use renderer::{RenderSurface, Renderer};
pub use scale::aspect_scale;
pub use window::{UiEvent, Viewer, ViewerParts};
