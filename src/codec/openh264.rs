use std::{collections::VecDeque, sync::Arc};

use anyhow::Context;
use bytes::Bytes;
use openh264::{
    encoder::{Encoder, EncoderConfig, RateControlMode},
    formats::YUVSource,
    OpenH264API, Timestamp,
};

use crate::{
    annexb,
    device::{DeviceContext, HwFramePool},
    frame::{BitstreamFormat, PacketType, VideoFrameBuffer, VideoFramePixelFormat},
    params::CodecParams,
    track::{CodecModule, VideoCodec},
};

use super::{check_frame, CodecContext, CodecDescriptor, CodecError, CodecLibrary, CodecPacket};

pub const OPENH264_DESCRIPTOR: CodecDescriptor = CodecDescriptor {
    name: "libopenh264",
    long_name: "OpenH264 H.264 / AVC",
    codec: VideoCodec::H264,
    module: CodecModule::OpenH264,
    bitstream_format: BitstreamFormat::H264AnnexB,
    packet_type: PacketType::Nalu,
    pixel_format: VideoFramePixelFormat::I420,
    input_formats: &[VideoFramePixelFormat::I420],
};

/// Software H.264 through Cisco's OpenH264, built from source.
pub struct OpenH264Library;

impl CodecLibrary for OpenH264Library {
    fn find_encoder_by_name(&self, name: &str) -> Option<CodecDescriptor> {
        (name == OPENH264_DESCRIPTOR.name).then_some(OPENH264_DESCRIPTOR)
    }

    fn alloc_context(&self, codec: &CodecDescriptor) -> Option<Box<dyn CodecContext>> {
        (codec.name == OPENH264_DESCRIPTOR.name)
            .then(|| Box::new(OpenH264Context::default()) as Box<dyn CodecContext>)
    }
}

#[derive(Default)]
struct OpenH264Context {
    params: Option<CodecParams>,
    encoder: Option<Encoder>,
    pending: VecDeque<CodecPacket>,
    frames_since_keyframe: u32,
}

/// Borrowed view of an I420 frame in the layout OpenH264 reads.
struct I420View<'a>(&'a VideoFrameBuffer);

impl YUVSource for I420View<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.0.width, self.0.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        let stride = self.0.line_stride;
        (stride, stride >> 1, stride >> 1)
    }

    fn y(&self) -> &[u8] {
        self.0.y()
    }

    fn u(&self) -> &[u8] {
        self.0.u()
    }

    fn v(&self) -> &[u8] {
        self.0.v()
    }
}

fn driver_error(call: &'static str, err: anyhow::Error) -> CodecError {
    CodecError::Driver {
        call,
        message: format!("{err:#}"),
    }
}

impl OpenH264Context {
    fn build_encoder(params: &CodecParams) -> anyhow::Result<Encoder> {
        let config = EncoderConfig::new()
            .set_bitrate_bps(params.bit_rate.min(u32::MAX as u64) as u32)
            .max_frame_rate(params.framerate.as_f64() as f32)
            .rate_control_mode(RateControlMode::Bitrate)
            .enable_skip_frame(false);

        let api = OpenH264API::from_source();
        Encoder::with_api_config(api, config).context("failed to create OpenH264 encoder")
    }

    fn encode(&mut self, frame: &VideoFrameBuffer, force_keyframe: bool) -> anyhow::Result<()> {
        let (Some(params), Some(encoder)) = (self.params.as_ref(), self.encoder.as_mut()) else {
            anyhow::bail!("encoder is not open");
        };

        // OpenH264 has no GOP length of its own in this API; request intra
        // pictures at GOP boundaries instead.
        let keyframe = force_keyframe || self.frames_since_keyframe >= params.gop_size;
        if keyframe {
            unsafe { encoder.raw_api().force_intra_frame(true) };
            self.frames_since_keyframe = 0;
        }
        self.frames_since_keyframe += 1;

        let millis = pts_to_millis(frame.pts, params);
        let bitstream = encoder
            .encode_at(&I420View(frame), Timestamp::from_millis(millis))
            .context("failed to encode frame")?;

        let data = bitstream.to_vec();
        if !data.is_empty() {
            self.pending.push_back(CodecPacket {
                keyframe: annexb::is_keyframe(VideoCodec::H264, &data),
                data: Bytes::from(data),
                pts: frame.pts,
                dts: frame.pts,
            });
        }
        Ok(())
    }
}

/// Frame pts are in the codec time base.
fn pts_to_millis(pts: i64, params: &CodecParams) -> u64 {
    let tb = params.time_base;
    (pts.max(0) as i128 * tb.num as i128 * 1000 / tb.den.max(1) as i128) as u64
}

impl CodecContext for OpenH264Context {
    fn set_hw_device(&mut self, _device: Arc<DeviceContext>) -> Result<(), CodecError> {
        Err(CodecError::Unsupported("hardware devices on libopenh264".into()))
    }

    fn set_params(&mut self, params: &CodecParams) -> Result<(), CodecError> {
        if !OPENH264_DESCRIPTOR.accepts(params.sw_format) {
            return Err(CodecError::InvalidParameter {
                option: "pix_fmt",
                value: format!("{:?}", params.sw_format),
            });
        }
        if params.width % 2 != 0 || params.height % 2 != 0 {
            return Err(CodecError::InvalidParameter {
                option: "size",
                value: format!("{}x{}", params.width, params.height),
            });
        }
        self.params = Some(params.clone());
        Ok(())
    }

    fn set_hw_frames(&mut self, _pool: &HwFramePool) -> Result<(), CodecError> {
        Err(CodecError::Unsupported("hardware frames on libopenh264".into()))
    }

    fn open(&mut self) -> Result<(), CodecError> {
        let params = self.params.as_ref().ok_or(CodecError::InvalidParameter {
            option: "params",
            value: "unset".into(),
        })?;
        let encoder = Self::build_encoder(params).map_err(|err| driver_error("open", err))?;
        self.encoder = Some(encoder);
        // First picture is always a keyframe.
        self.frames_since_keyframe = params.gop_size;
        Ok(())
    }

    fn send_frame(
        &mut self,
        frame: Option<&VideoFrameBuffer>,
        force_keyframe: bool,
    ) -> Result<(), CodecError> {
        if self.encoder.is_none() {
            return Err(CodecError::Closed);
        }
        // OpenH264 never holds pictures back, so there is nothing to drain.
        let Some(frame) = frame else {
            return Ok(());
        };
        if frame.pix_fmt != VideoFramePixelFormat::I420 {
            return Err(CodecError::InvalidParameter {
                option: "pix_fmt",
                value: format!("{:?}", frame.pix_fmt),
            });
        }
        if let Some(params) = self.params.as_ref() {
            check_frame(frame, params)?;
        }

        self.encode(frame, force_keyframe)
            .map_err(|err| driver_error("encode_at", err))
    }

    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError> {
        Ok(self.pending.pop_front())
    }
}
