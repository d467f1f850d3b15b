pub mod capture;
pub mod display;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod session;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat};
pub use error::{Error, Result};
pub use session::ice::IceServer;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub overlay: OverlayConfig,
    pub media: MediaConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// `None` picks the first detected capture device
    pub device_index: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    /// Sleep after a missed read before retrying
    pub read_backoff_ms: u64,
    pub join_timeout_ms: u64,
    /// Frames queued towards the render thread before new ones are dropped
    pub render_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Detections whose class contains this (case-insensitive) are drawn in the alert color
    pub highlight_class: String,
    /// TTF/OTF font for labels, replacing the bundled DejaVu Sans
    pub font_path: Option<PathBuf>,
    pub box_thickness: u32,
    pub label_scale: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub fps: u32,
    /// Pictures between forced IDR frames
    pub keyframe_interval: u64,
    pub blank_width: u32,
    pub blank_height: u32,
    pub track_id: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Offers go to `{prefix}/offer`, answers are read from `{prefix}/answer`
    pub topic_prefix: String,
    pub answer_timeout_secs: u64,
    pub gather_timeout_secs: u64,
    pub liveness_interval_ms: u64,
    pub data_channel_label: String,
    pub ice_servers: Vec<IceServer>,
    /// Base URL of an HTTP service publishing extra ICE server entries
    pub ice_config_url: Option<String>,
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub keep_alive_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            width: 640,
            height: 480,
            fps: 30,
            buffer_count: 4,
            read_backoff_ms: 1,
            join_timeout_ms: 1000,
            render_queue: 2,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            title: "Periscope".into(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            highlight_class: "cavity".into(),
            font_path: None,
            box_thickness: 3,
            label_scale: 20.0,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            fps: 25,
            keyframe_interval: 50,
            blank_width: 640,
            blank_height: 480,
            track_id: "video0".into(),
            stream_id: "periscope".into(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "user/periscope".into(),
            answer_timeout_secs: 25,
            gather_timeout_secs: 5,
            liveness_interval_ms: 1500,
            data_channel_label: "pos".into(),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ice_config_url: None,
            broker: BrokerConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.emqx.io".into(),
            port: 8883,
            tls: true,
            keep_alive_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn offer_topic(&self) -> String {
        format!("{}/offer", self.topic_prefix)
    }

    pub fn answer_topic(&self) -> String {
        format!("{}/answer", self.topic_prefix)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.gather_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(1))
    }
}

impl MediaConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

impl Config {
    /// Defaults, then an optional TOML file, then `PERISCOPE_*` environment overrides
    /// (`__` separates nested keys, e.g. `PERISCOPE_SESSION__TOPIC_PREFIX`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("PERISCOPE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}
