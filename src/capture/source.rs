use serde::{Deserialize, Serialize};

use super::frame::Frame;
use crate::error::Result;

/// Enumerated capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
}

/// Blocking frame producer owned by the capture loop.
///
/// All calls may block and must be callable from a background thread.
/// `close` releases the device and is a no-op when nothing is open.
pub trait FrameSource: Send {
    /// Open device `index`, releasing any previously open device first.
    fn open(&mut self, index: u32) -> Result<()>;

    /// Next frame. `Ok(None)` is a transient miss, not an error.
    fn read(&mut self) -> Result<Option<Frame>>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn list_devices(&self) -> Vec<DeviceInfo>;
}
