use std::{fmt, time::Duration};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::frame::VideoFramePixelFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
        })
    }
}

/// Library or hardware module an encoder runs on. Hardware modules double as
/// the first half of a device context key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecModule {
    #[default]
    Default,
    OpenH264,
    Nvenc,
    Qsv,
    Xma,
}

impl CodecModule {
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Nvenc | Self::Qsv | Self::Xma)
    }

    /// Short tag used in worker thread names.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Default | Self::OpenH264 => "SW",
            Self::Nvenc => "NV",
            Self::Qsv => "QSV",
            Self::Xma => "XMA",
        }
    }
}

impl fmt::Display for CodecModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::OpenH264 => "openh264",
            Self::Nvenc => "nvenc",
            Self::Qsv => "qsv",
            Self::Xma => "xma",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFrameIntervalType {
    Time,
    #[default]
    Frame,
}

/// Read-only description of one video track, as produced by the configuration
/// layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    #[serde(default)]
    pub id: u32,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: VideoFramePixelFormat,
    /// Nominal framerate. Non-positive when unknown.
    #[serde(default)]
    pub framerate: f64,
    /// Fallback used when the nominal framerate is unknown.
    #[serde(default)]
    pub estimated_framerate: f64,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    #[serde(default)]
    pub key_frame_interval_type: KeyFrameIntervalType,
    /// Milliseconds for [`KeyFrameIntervalType::Time`], frames otherwise.
    #[serde(default)]
    pub key_frame_interval: u32,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub codec_module: CodecModule,
    #[serde(default)]
    pub codec_device_id: u32,
}

fn default_pixel_format() -> VideoFramePixelFormat {
    VideoFramePixelFormat::I420
}

impl TrackConfig {
    /// Framerate used for every timing derivation.
    pub fn timing_framerate(&self) -> f64 {
        if self.framerate > 0.0 {
            self.framerate
        } else {
            self.estimated_framerate
        }
    }

    /// Forced keyframe period under the time-based policy. `None` when the
    /// policy is frame-based or the interval is zero.
    pub fn key_frame_period(&self) -> Option<Duration> {
        match self.key_frame_interval_type {
            KeyFrameIntervalType::Time if self.key_frame_interval > 0 => Some(
                Duration::from_millis(self.key_frame_interval as u64),
            ),
            _ => None,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.timing_framerate() > 0.0) {
            return Err(format!(
                "track #{} has no usable framerate (nominal {}, estimated {})",
                self.id, self.framerate, self.estimated_framerate
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "track #{} has an empty picture ({}x{})",
                self.id, self.width, self.height
            ));
        }
        if self.bitrate == 0 {
            return Err(format!("track #{} has a zero bitrate", self.id));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TrackConfigBuilder {
    id: u32,
    codec: Option<VideoCodec>,

    /// Picture size in pixels.
    resolution: Option<(u32, u32)>,
    pixel_format: Option<VideoFramePixelFormat>,

    framerate: Option<f64>,
    estimated_framerate: Option<f64>,

    /// Target bitrate. (bps)
    bitrate: Option<u64>,

    key_frame_interval_type: KeyFrameIntervalType,
    key_frame_interval: u32,

    preset: Option<String>,

    codec_module: CodecModule,
    codec_device_id: u32,
}

impl TrackConfigBuilder {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn codec(mut self, codec: VideoCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    pub fn pixel_format(mut self, pixel_format: VideoFramePixelFormat) -> Self {
        self.pixel_format = Some(pixel_format);
        self
    }

    pub fn framerate(mut self, framerate: f64) -> Self {
        self.framerate = Some(framerate);
        self
    }

    pub fn estimated_framerate(mut self, framerate: f64) -> Self {
        self.estimated_framerate = Some(framerate);
        self
    }

    pub fn bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn key_frame_interval_by_time(mut self, interval_ms: u32) -> Self {
        self.key_frame_interval_type = KeyFrameIntervalType::Time;
        self.key_frame_interval = interval_ms;
        self
    }

    pub fn key_frame_interval_by_frame(mut self, frames: u32) -> Self {
        self.key_frame_interval_type = KeyFrameIntervalType::Frame;
        self.key_frame_interval = frames;
        self
    }

    pub fn preset(mut self, preset: &str) -> Self {
        self.preset = Some(preset.to_string());
        self
    }

    pub fn device(mut self, module: CodecModule, device_id: u32) -> Self {
        self.codec_module = module;
        self.codec_device_id = device_id;
        self
    }

    pub fn build(self) -> Result<TrackConfig> {
        let Some(codec) = self.codec else {
            bail!("track #{} has no codec", self.id);
        };
        let Some((width, height)) = self.resolution else {
            bail!("track #{} has no resolution", self.id);
        };

        let track = TrackConfig {
            id: self.id,
            codec,
            width,
            height,
            pixel_format: self.pixel_format.unwrap_or(VideoFramePixelFormat::I420),
            framerate: self.framerate.unwrap_or(0.),
            estimated_framerate: self.estimated_framerate.unwrap_or(0.),
            bitrate: self.bitrate.unwrap_or(2_000_000),
            key_frame_interval_type: self.key_frame_interval_type,
            key_frame_interval: self.key_frame_interval,
            preset: self.preset,
            codec_module: self.codec_module,
            codec_device_id: self.codec_device_id,
        };

        if let Err(reason) = track.validate() {
            bail!(reason);
        }
        Ok(track)
    }
}
