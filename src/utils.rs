use tracing::{debug, info};
use v4l::{capability::Flags, context, Device};

use crate::capture::DeviceInfo;
use crate::error::{Error, Result};

/// Enumerate V4L2 nodes that can capture video
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices: Vec<DeviceInfo> = context::enum_devices()
        .into_iter()
        .filter_map(|node| {
            let index = node.index();
            let dev = Device::new(index).ok()?;
            let caps = dev.query_caps().ok()?;
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                debug!("Skipping /dev/video{}: no capture capability", index);
                return None;
            }
            let name = node
                .name()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("Camera {}", index));
            Some(DeviceInfo {
                index: index as u32,
                name,
            })
        })
        .collect();

    devices.sort_by_key(|d| d.index);
    devices
}

/// Auto-detect the first usable capture device
pub fn auto_detect_device() -> Result<DeviceInfo> {
    info!("Auto-detecting capture devices...");

    let device = list_devices()
        .into_iter()
        .next()
        .ok_or_else(|| Error::DeviceOpen("no suitable capture device found".into()))?;

    info!("Found capture device: {} ({})", device.index, device.name);
    Ok(device)
}
