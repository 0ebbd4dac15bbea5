pub mod hardware;
pub mod software;

use std::{collections::VecDeque, sync::Arc};

use crate::{
    codec::{self, CodecContext, CodecDescriptor, CodecError, CodecLibrary},
    device::DeviceContextManager,
    error::ConfigureError,
    frame::{EncodedPacket, VideoFrameBuffer},
    params::CodecParams,
    track::{CodecModule, TrackConfig, VideoCodec},
};

pub use self::hardware::HardwareEncoder;
pub use self::software::SoftwareEncoder;

#[enum_delegate::register]
pub trait EncoderBackendImpl {
    /// Bring the codec up for `track`. On error nothing stays allocated.
    fn configure(&mut self, track: &TrackConfig) -> Result<(), ConfigureError>;

    fn send_frame(
        &mut self,
        frame: &VideoFrameBuffer,
        flags: EncoderFrameFlags,
    ) -> Result<(), CodecError>;

    /// Next packet in submission order, or `None` until more input arrives.
    fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, CodecError>;

    /// Ask the codec to give up every picture it is still holding.
    fn flush(&mut self) -> Result<(), CodecError>;

    fn codec(&self) -> Option<&CodecDescriptor>;
    fn params(&self) -> Option<&CodecParams>;

    /// Release the codec and every device resource. Safe to call repeatedly.
    fn shutdown(&mut self);
}

#[enum_delegate::implement(EncoderBackendImpl)]
pub enum EncoderBackend {
    Software(SoftwareEncoder),
    Hardware(HardwareEncoder),
}

impl EncoderBackend {
    /// Pick the backend and encoder name a track asks for.
    pub fn for_track(track: &TrackConfig, services: &EncoderServices) -> Self {
        let name = encoder_name(track.codec_module, track.codec);
        if track.codec_module.is_hardware() {
            EncoderBackend::Hardware(HardwareEncoder::new(name, services))
        } else {
            EncoderBackend::Software(SoftwareEncoder::new(name, services))
        }
    }

    /// Encoder name this backend resolves at configure time.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            EncoderBackend::Software(encoder) => encoder.name(),
            EncoderBackend::Hardware(encoder) => encoder.name(),
        }
    }
}

pub fn encoder_name(module: CodecModule, codec: VideoCodec) -> &'static str {
    match (module, codec) {
        (CodecModule::Default | CodecModule::OpenH264, VideoCodec::H264) => "libopenh264",
        (CodecModule::Default | CodecModule::OpenH264, VideoCodec::H265) => "libx265",
        (CodecModule::Nvenc, VideoCodec::H264) => "h264_nvenc",
        (CodecModule::Nvenc, VideoCodec::H265) => "hevc_nvenc",
        (CodecModule::Qsv, VideoCodec::H264) => "h264_qsv",
        (CodecModule::Qsv, VideoCodec::H265) => "hevc_qsv",
        (CodecModule::Xma, VideoCodec::H264) => "h264_xma",
        (CodecModule::Xma, VideoCodec::H265) => "hevc_xma",
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct EncoderFrameFlags {
    pub force_keyframe: bool,
}

/// Shared services every backend is built against.
#[derive(Clone)]
pub struct EncoderServices {
    pub codecs: Arc<dyn CodecLibrary>,
    pub devices: Arc<DeviceContextManager>,
}

impl EncoderServices {
    pub fn new(codecs: Arc<dyn CodecLibrary>, devices: Arc<DeviceContextManager>) -> Self {
        Self { codecs, devices }
    }

    /// Codecs compiled into this build and the process-wide device registry.
    pub fn system() -> Self {
        Self::new(codec::system_library(), DeviceContextManager::global().clone())
    }
}

/// Steps 1 and 2 of every configure: look the encoder up and allocate a context.
fn resolve(
    codecs: &dyn CodecLibrary,
    name: &str,
    track: &TrackConfig,
) -> Result<(CodecDescriptor, Box<dyn CodecContext>), ConfigureError> {
    let descriptor =
        codecs
            .find_encoder_by_name(name)
            .ok_or_else(|| ConfigureError::CodecNotFound {
                codec: name.to_string(),
            })?;

    if descriptor.codec != track.codec {
        return Err(ConfigureError::InvalidTrack {
            codec: name.to_string(),
            reason: format!("{name} encodes {}, track is {}", descriptor.codec, track.codec),
        });
    }

    let context =
        codecs
            .alloc_context(&descriptor)
            .ok_or_else(|| ConfigureError::ContextAllocationFailed {
                codec: name.to_string(),
            })?;

    Ok((descriptor, context))
}

fn check_track(name: &str, track: &TrackConfig) -> Result<(), ConfigureError> {
    track
        .validate()
        .map_err(|reason| ConfigureError::InvalidTrack {
            codec: name.to_string(),
            reason,
        })
}

/// An opened codec context together with what it was opened with.
struct CodecSession {
    descriptor: CodecDescriptor,
    context: Box<dyn CodecContext>,
    params: CodecParams,
    sent: u64,
    /// `(pts, submission index)` of frames the codec has not emitted yet.
    in_flight: VecDeque<(i64, u64)>,
}

impl CodecSession {
    fn new(descriptor: CodecDescriptor, context: Box<dyn CodecContext>, params: CodecParams) -> Self {
        Self {
            descriptor,
            context,
            params,
            sent: 0,
            in_flight: VecDeque::new(),
        }
    }

    fn send(&mut self, frame: &VideoFrameBuffer, flags: EncoderFrameFlags) -> Result<(), CodecError> {
        codec::check_frame(frame, &self.params)?;
        self.context.send_frame(Some(frame), flags.force_keyframe)?;
        self.in_flight.push_back((frame.pts, self.sent));
        self.sent += 1;
        Ok(())
    }

    /// Index of the frame a packet came from. Packets leave in submission
    /// order, so frames queued ahead of the match were dropped by the codec.
    fn source_index(&mut self, pts: i64) -> u64 {
        match self.in_flight.iter().position(|(sent_pts, _)| *sent_pts == pts) {
            Some(position) => {
                let (_, index) = self.in_flight[position];
                self.in_flight.drain(..=position);
                index
            }
            None => self.sent.saturating_sub(1),
        }
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.context.send_frame(None, false)
    }

    fn receive(&mut self) -> Result<Option<EncodedPacket>, CodecError> {
        let Some(packet) = self.context.receive_packet()? else {
            return Ok(None);
        };

        let submission_index = self.source_index(packet.pts);
        Ok(Some(EncodedPacket {
            bitstream_format: self.descriptor.bitstream_format,
            packet_type: self.descriptor.packet_type,
            pts: packet.pts,
            dts: packet.dts,
            keyframe: packet.keyframe,
            submission_index,
            data: packet.data,
        }))
    }
}
