//! V4L2 frame source with memory-mapped buffers

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder;
use super::frame::{Frame, PixelFormat};
use super::source::{DeviceInfo, FrameSource};
use crate::error::{Error, Result};
use crate::{utils, CaptureConfig};

/// Wire format negotiated with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Mjpeg,
    Yuyv,
}

impl WireFormat {
    fn fourcc(self) -> FourCC {
        match self {
            WireFormat::Mjpeg => FourCC::new(b"MJPG"),
            WireFormat::Yuyv => FourCC::new(b"YUYV"),
        }
    }
}

struct OpenDevice {
    // Field order matters: the stream must drop before the device.
    stream: MmapStream<'static>,
    _device: Device,
    wire: WireFormat,
    width: u32,
    height: u32,
}

/// V4L2 capture device; decodes MJPEG to RGB24 and YUYV to planar 4:2:0.
pub struct V4l2Source {
    config: CaptureConfig,
    open: Option<OpenDevice>,
    sequence: u64,
}

impl V4l2Source {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            open: None,
            sequence: 0,
        }
    }

    fn negotiate(device: &Device, config: &CaptureConfig) -> Result<(WireFormat, u32, u32)> {
        for wire in [WireFormat::Mjpeg, WireFormat::Yuyv] {
            let mut fmt = device.format()?;
            fmt.width = config.width;
            fmt.height = config.height;
            fmt.fourcc = wire.fourcc();

            let actual = device.set_format(&fmt)?;
            if actual.fourcc == wire.fourcc() {
                return Ok((wire, actual.width, actual.height));
            }
            debug!("Device refused {:?}, got {}", wire, actual.fourcc);
        }
        Err(Error::Capture("device supports neither MJPEG nor YUYV".into()))
    }
}

impl FrameSource for V4l2Source {
    #[instrument(skip(self))]
    fn open(&mut self, index: u32) -> Result<()> {
        self.close();

        let device = Device::new(index as usize)
            .map_err(|e| Error::DeviceOpen(format!("/dev/video{}: {}", index, e)))?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::DeviceOpen(format!(
                "/dev/video{} doesn't support video capture",
                index
            )));
        }

        let (wire, width, height) = Self::negotiate(&device, &self.config)?;
        if let Err(e) = device.set_params(&Parameters::with_fps(self.config.fps)) {
            warn!("Could not set {} fps: {}", self.config.fps, e);
        }

        let stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, self.config.buffer_count)?;
        info!(
            "Capture stream started: {:?} {}x{} with {} buffers",
            wire, width, height, self.config.buffer_count
        );

        self.open = Some(OpenDevice {
            stream,
            _device: device,
            wire,
            width,
            height,
        });
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| Error::Capture("device is not open".into()))?;

        let (buf, meta) = match open.stream.next() {
            Ok(next) => next,
            Err(e) => {
                debug!("Dequeue failed: {}", e);
                return Ok(None);
            }
        };
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = &buf[..used];
        self.sequence += 1;

        let frame = match open.wire {
            WireFormat::Mjpeg => match decoder::decode_mjpeg(payload) {
                Ok((rgb, w, h)) => Frame::packed(rgb, w, h, PixelFormat::Rgb24, self.sequence),
                Err(e) => {
                    debug!("Dropping undecodable frame: {}", e);
                    return Ok(None);
                }
            },
            WireFormat::Yuyv => {
                let (y, u, v) = decoder::yuyv_to_i420(payload, open.width, open.height)?;
                Frame::planar(
                    Bytes::from(y),
                    Bytes::from(u),
                    Bytes::from(v),
                    open.width,
                    open.height,
                    self.sequence,
                )
            }
        };

        frame.map(Some)
    }

    fn close(&mut self) {
        if let Some(open) = self.open.take() {
            drop(open);
            info!("Capture device released");
        }
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn list_devices(&self) -> Vec<DeviceInfo> {
        utils::list_devices()
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.close();
    }
}
