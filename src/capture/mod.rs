pub mod capture_loop;
pub mod decoder;
pub mod frame;
pub mod source;
pub mod v4l2;

pub use capture_loop::{CaptureLoop, CaptureState};
pub use frame::{Frame, FrameData, FrameMetadata, PixelFormat};
pub use source::{DeviceInfo, FrameSource};
pub use v4l2::V4l2Source;
