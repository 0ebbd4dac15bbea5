//! The codec library an encoder backend drives.
//!
//! The surface mirrors how encoding libraries expose themselves: look an
//! encoder up by name, allocate a context for it, attach a device and a frame
//! pool, apply parameters, open it, then push frames and pull packets.

#[cfg(feature = "nvenc")]
pub mod nvenc;
pub mod openh264;

use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::{
    device::{DeviceContext, HwFramePool},
    frame::{BitstreamFormat, PacketType, VideoFrameBuffer, VideoFramePixelFormat},
    params::CodecParams,
    track::{CodecModule, VideoCodec},
};

/// Static description of an encoder a library provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    pub name: &'static str,
    pub long_name: &'static str,
    pub codec: VideoCodec,
    pub module: CodecModule,
    pub bitstream_format: BitstreamFormat,
    pub packet_type: PacketType,
    /// Native picture format of the codec.
    pub pixel_format: VideoFramePixelFormat,
    /// Formats accepted from callers.
    pub input_formats: &'static [VideoFramePixelFormat],
}

impl CodecDescriptor {
    pub fn is_hardware(&self) -> bool {
        self.module.is_hardware()
    }

    pub fn accepts(&self, format: VideoFramePixelFormat) -> bool {
        self.input_formats.contains(&format)
    }
}

/// Bitstream produced by a codec context, before the encoder tags it.
#[derive(Debug, Clone)]
pub struct CodecPacket {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("{0} is not supported")]
    Unsupported(String),
    #[error("invalid value for {option}: {value}")]
    InvalidParameter { option: &'static str, value: String },
    #[error("{call} failed: {message}")]
    Driver { call: &'static str, message: String },
    #[error("codec context is not open")]
    Closed,
}

/// Frames must match the size a context was opened at and carry every row
/// their stride implies. A new size needs a new context.
pub fn check_frame(frame: &VideoFrameBuffer, params: &CodecParams) -> Result<(), CodecError> {
    if frame.width != params.width as usize || frame.height != params.height as usize {
        return Err(CodecError::InvalidParameter {
            option: "frame size",
            value: format!(
                "{}, opened at {}x{}",
                frame.resolution(),
                params.width,
                params.height
            ),
        });
    }
    if frame.line_stride < frame.width {
        return Err(CodecError::InvalidParameter {
            option: "line_stride",
            value: format!("{} for width {}", frame.line_stride, frame.width),
        });
    }
    if frame.data.len() < frame.expected_len() {
        return Err(CodecError::InvalidParameter {
            option: "frame",
            value: format!("{} bytes, expected {}", frame.data.len(), frame.expected_len()),
        });
    }
    Ok(())
}

pub trait CodecLibrary: Send + Sync {
    fn find_encoder_by_name(&self, name: &str) -> Option<CodecDescriptor>;

    /// Returns `None` when the library cannot allocate a context.
    fn alloc_context(&self, codec: &CodecDescriptor) -> Option<Box<dyn CodecContext>>;
}

/// One allocated encoder instance inside a library. Dropping it releases
/// everything it holds.
pub trait CodecContext: Send {
    fn set_hw_device(&mut self, device: Arc<DeviceContext>) -> Result<(), CodecError>;

    fn set_params(&mut self, params: &CodecParams) -> Result<(), CodecError>;

    fn set_hw_frames(&mut self, pool: &HwFramePool) -> Result<(), CodecError>;

    fn open(&mut self) -> Result<(), CodecError>;

    /// Submit a picture. `None` starts draining buffered pictures.
    fn send_frame(
        &mut self,
        frame: Option<&VideoFrameBuffer>,
        force_keyframe: bool,
    ) -> Result<(), CodecError>;

    /// Next finished packet, or `None` when more input is needed.
    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError>;
}

/// The set of encoders available to this process, searched in order.
pub struct CodecRegistry {
    libraries: Vec<Arc<dyn CodecLibrary>>,
}

impl CodecRegistry {
    pub fn new(libraries: Vec<Arc<dyn CodecLibrary>>) -> Self {
        Self { libraries }
    }

    fn library_for(&self, name: &str) -> Option<&Arc<dyn CodecLibrary>> {
        self.libraries
            .iter()
            .find(|library| library.find_encoder_by_name(name).is_some())
    }
}

impl CodecLibrary for CodecRegistry {
    fn find_encoder_by_name(&self, name: &str) -> Option<CodecDescriptor> {
        self.libraries
            .iter()
            .find_map(|library| library.find_encoder_by_name(name))
    }

    fn alloc_context(&self, codec: &CodecDescriptor) -> Option<Box<dyn CodecContext>> {
        self.library_for(codec.name)?.alloc_context(codec)
    }
}

static SYSTEM_LIBRARY: Lazy<Arc<CodecRegistry>> = Lazy::new(|| {
    #[allow(unused_mut)]
    let mut libraries: Vec<Arc<dyn CodecLibrary>> = vec![Arc::new(openh264::OpenH264Library)];
    #[cfg(feature = "nvenc")]
    libraries.push(Arc::new(nvenc::NvencLibrary));
    Arc::new(CodecRegistry::new(libraries))
});

/// Every encoder compiled into this build.
pub fn system_library() -> Arc<dyn CodecLibrary> {
    SYSTEM_LIBRARY.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_library_finds_openh264() {
        let library = system_library();
        let codec = library.find_encoder_by_name("libopenh264").unwrap();
        assert_eq!(codec.codec, VideoCodec::H264);
        assert!(!codec.is_hardware());
        assert!(library.alloc_context(&codec).is_some());
    }

    fn opened_at(width: u32, height: u32) -> CodecParams {
        let track = crate::track::TrackConfigBuilder::new()
            .codec(VideoCodec::H264)
            .resolution(width, height)
            .framerate(30.)
            .build()
            .unwrap();
        CodecParams::derive(&track, &openh264::OPENH264_DESCRIPTOR)
    }

    fn gray(width: usize, height: usize) -> VideoFrameBuffer {
        VideoFrameBuffer::i420(width, height, 0, Bytes::from(vec![128u8; width * height * 3 / 2]))
    }

    #[test]
    fn frames_must_match_the_opened_size() {
        let params = opened_at(128, 96);
        assert!(check_frame(&gray(128, 96), &params).is_ok());

        let err = check_frame(&gray(320, 240), &params).unwrap_err();
        assert!(matches!(err, CodecError::InvalidParameter { option: "frame size", .. }));
    }

    #[test]
    fn short_strides_and_buffers_are_rejected() {
        let params = opened_at(128, 96);

        let zero_stride = VideoFrameBuffer {
            line_stride: 0,
            data: Bytes::new(),
            ..gray(128, 96)
        };
        let err = check_frame(&zero_stride, &params).unwrap_err();
        assert!(matches!(err, CodecError::InvalidParameter { option: "line_stride", .. }));

        let truncated = VideoFrameBuffer {
            data: Bytes::from(vec![0u8; 128 * 96]),
            ..gray(128, 96)
        };
        let err = check_frame(&truncated, &params).unwrap_err();
        assert!(matches!(err, CodecError::InvalidParameter { option: "frame", .. }));

        let padded = VideoFrameBuffer {
            line_stride: 160,
            data: Bytes::from(vec![0u8; 160 * 96 * 3 / 2]),
            ..gray(128, 96)
        };
        assert!(check_frame(&padded, &params).is_ok());
    }

    #[test]
    fn unknown_names_are_not_found() {
        assert!(system_library().find_encoder_by_name("hevc_magic").is_none());
    }
}
