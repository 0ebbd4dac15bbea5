use std::{collections::VecDeque, ffi::c_void, ptr, sync::Arc};

use bytes::Bytes;
use tracing::{debug, trace};

use nvidia_sys::{
    guids::{NV_ENC_CODEC, NV_ENC_PRESET},
    nvencodeapi as sys,
};

use crate::{
    device::{DeviceContext, DeviceHandle, FramePoolDesc, HwFramePool},
    frame::{BitstreamFormat, PacketType, VideoFrameBuffer, VideoFramePixelFormat},
    params::{CodecParams, EncoderPreset},
    track::{CodecModule, VideoCodec},
};

use super::{check_frame, CodecContext, CodecDescriptor, CodecError, CodecLibrary, CodecPacket};

const INPUT_FORMATS: &[VideoFramePixelFormat] =
    &[VideoFramePixelFormat::I420, VideoFramePixelFormat::NV12];

pub const H264_NVENC: CodecDescriptor = CodecDescriptor {
    name: "h264_nvenc",
    long_name: "NVIDIA NVENC H.264 encoder",
    codec: VideoCodec::H264,
    module: CodecModule::Nvenc,
    bitstream_format: BitstreamFormat::H264AnnexB,
    packet_type: PacketType::Nalu,
    pixel_format: VideoFramePixelFormat::Cuda,
    input_formats: INPUT_FORMATS,
};

pub const HEVC_NVENC: CodecDescriptor = CodecDescriptor {
    name: "hevc_nvenc",
    long_name: "NVIDIA NVENC hevc encoder",
    codec: VideoCodec::H265,
    module: CodecModule::Nvenc,
    bitstream_format: BitstreamFormat::H265AnnexB,
    packet_type: PacketType::Nalu,
    pixel_format: VideoFramePixelFormat::Cuda,
    input_formats: INPUT_FORMATS,
};

pub struct NvencLibrary;

impl CodecLibrary for NvencLibrary {
    fn find_encoder_by_name(&self, name: &str) -> Option<CodecDescriptor> {
        [H264_NVENC, HEVC_NVENC]
            .into_iter()
            .find(|codec| codec.name == name)
    }

    fn alloc_context(&self, codec: &CodecDescriptor) -> Option<Box<dyn CodecContext>> {
        self.find_encoder_by_name(codec.name)
            .map(|codec| Box::new(NvencContext::new(codec)) as Box<dyn CodecContext>)
    }
}

trait NvencErrorCode {
    fn ok(self) -> std::result::Result<(), NvencError>;
}

#[derive(thiserror::Error, Debug)]
#[error("NVENC error {code:?}")]
pub struct NvencError {
    code: sys::NVENCSTATUS,
}

impl NvencErrorCode for sys::NVENCSTATUS {
    fn ok(self) -> std::result::Result<(), NvencError> {
        match self {
            sys::NVENCSTATUS::NV_ENC_SUCCESS => Ok(()),
            code => Err(NvencError { code }),
        }
    }
}

type Result<T> = std::result::Result<T, NvencError>;

fn driver(call: &'static str) -> impl FnOnce(NvencError) -> CodecError {
    move |err| CodecError::Driver {
        call,
        message: err.to_string(),
    }
}

/// Fails with NV_ENC_ERR_INVALID_PTR if the driver left out an entry point we
/// call.
fn make_encode_api() -> Result<sys::NV_ENCODE_API_FUNCTION_LIST> {
    let mut api = sys::NV_ENCODE_API_FUNCTION_LIST {
        version: sys::NV_ENCODE_API_FUNCTION_LIST_VER,
        ..Default::default()
    };
    unsafe {
        sys::NvEncodeAPICreateInstance(&mut api).ok()?;
    }

    (|| -> Option<()> {
        api.nvEncOpenEncodeSessionEx?;
        api.nvEncGetEncodeGUIDCount?;
        api.nvEncGetEncodeGUIDs?;
        api.nvEncGetEncodePresetConfigEx?;
        api.nvEncInitializeEncoder?;
        api.nvEncCreateInputBuffer?;
        api.nvEncDestroyInputBuffer?;
        api.nvEncCreateBitstreamBuffer?;
        api.nvEncDestroyBitstreamBuffer?;
        api.nvEncLockInputBuffer?;
        api.nvEncUnlockInputBuffer?;
        api.nvEncEncodePicture?;
        api.nvEncLockBitstream?;
        api.nvEncUnlockBitstream?;
        api.nvEncDestroyEncoder?;
        Some(())
    })()
    .ok_or(NvencError {
        code: sys::NVENCSTATUS::NV_ENC_ERR_INVALID_PTR,
    })?;

    Ok(api)
}

fn codec_guid(codec: VideoCodec) -> sys::GUID {
    match codec {
        VideoCodec::H264 => NV_ENC_CODEC::H264,
        VideoCodec::H265 => NV_ENC_CODEC::HEVC,
    }
}

fn preset_guid(preset: EncoderPreset) -> sys::GUID {
    match preset {
        EncoderPreset::P1 => NV_ENC_PRESET::P1,
        EncoderPreset::P2 => NV_ENC_PRESET::P2,
        EncoderPreset::P3 => NV_ENC_PRESET::P3,
        EncoderPreset::P4 => NV_ENC_PRESET::P4,
        EncoderPreset::P5 => NV_ENC_PRESET::P5,
        EncoderPreset::P6 => NV_ENC_PRESET::P6,
        EncoderPreset::P7 => NV_ENC_PRESET::P7,
    }
}

fn buffer_format(format: VideoFramePixelFormat) -> Option<sys::NV_ENC_BUFFER_FORMAT> {
    match format {
        VideoFramePixelFormat::I420 => Some(sys::NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_IYUV),
        VideoFramePixelFormat::NV12 => Some(sys::NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_NV12),
        _ => None,
    }
}

/// An NVENC session on a CUDA context. The device context outlives the
/// session because the session holds a reference to it.
struct EncodeSession {
    api: sys::NV_ENCODE_API_FUNCTION_LIST,
    encoder_ptr: *mut c_void,
    input_buffers: Vec<sys::NV_ENC_INPUT_PTR>,
    bitstream_buffer: sys::NV_ENC_OUTPUT_PTR,
    _device: Arc<DeviceContext>,
}

// The session is only ever driven from the one thread that owns the codec
// context at a time.
unsafe impl Send for EncodeSession {}

impl EncodeSession {
    fn open(device: Arc<DeviceContext>) -> std::result::Result<Self, CodecError> {
        let cuda = match device.handle() {
            DeviceHandle::Cuda(cuda) => cuda.as_ptr(),
            DeviceHandle::Virtual => {
                return Err(CodecError::Unsupported(format!(
                    "NVENC on device {} without a CUDA context",
                    device.key()
                )))
            }
        };
        let api = make_encode_api().map_err(driver("NvEncodeAPICreateInstance"))?;

        let mut params = sys::NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS {
            version: sys::NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER,
            apiVersion: sys::NVENCAPI_VERSION,
            deviceType: sys::NV_ENC_DEVICE_TYPE::NV_ENC_DEVICE_TYPE_CUDA,
            device: cuda.cast(),
            ..Default::default()
        };

        let encoder_ptr = unsafe {
            let mut enc: *mut c_void = ptr::null_mut();
            api.nvEncOpenEncodeSessionEx.unwrap_unchecked()(&mut params, &mut enc)
                .ok()
                .map_err(driver("nvEncOpenEncodeSessionEx"))?;
            enc
        };
        debug!(device = %device.key(), ?encoder_ptr, "opened NVENC session");

        Ok(Self {
            api,
            encoder_ptr,
            input_buffers: Vec::new(),
            bitstream_buffer: ptr::null_mut(),
            _device: device,
        })
    }

    fn codec_guids(&self) -> Result<Vec<sys::GUID>> {
        let mut count = 0;
        unsafe {
            self.api.nvEncGetEncodeGUIDCount.unwrap_unchecked()(self.encoder_ptr, &mut count)
                .ok()?;
        };

        let mut guids = Vec::with_capacity(count as usize);
        let mut out_count = 0;
        unsafe {
            self.api.nvEncGetEncodeGUIDs.unwrap_unchecked()(
                self.encoder_ptr,
                guids.as_mut_ptr(),
                count,
                &mut out_count,
            )
            .ok()?;
            guids.set_len(out_count as _);
        }

        Ok(guids)
    }

    fn initialize(&mut self, codec: VideoCodec, params: &CodecParams) -> Result<()> {
        let encode_guid = codec_guid(codec);
        let preset_guid = preset_guid(params.preset);
        let tuning = sys::NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_ULTRA_LOW_LATENCY;

        let mut preset = sys::NV_ENC_PRESET_CONFIG {
            version: sys::NV_ENC_PRESET_CONFIG_VER,
            presetCfg: sys::NV_ENC_CONFIG {
                version: sys::NV_ENC_CONFIG_VER,
                ..Default::default()
            },
            ..Default::default()
        };
        unsafe {
            self.api.nvEncGetEncodePresetConfigEx.unwrap_unchecked()(
                self.encoder_ptr,
                encode_guid,
                preset_guid,
                tuning,
                &mut preset,
            )
            .ok()?;
        }

        let mut config = preset.presetCfg;
        config.version = sys::NV_ENC_CONFIG_VER;
        config.gopLength = params.gop_size;
        config.frameIntervalP = (params.max_b_frames + 1) as _;
        config.rcParams.rateControlMode = sys::NV_ENC_PARAMS_RC_MODE::NV_ENC_PARAMS_RC_CBR;
        config.rcParams.averageBitRate = params.bit_rate.min(u32::MAX as u64) as u32;
        config.rcParams.maxBitRate = params.rc_max_rate.min(u32::MAX as u64) as u32;
        config.rcParams.vbvBufferSize = params.rc_buffer_size.min(u32::MAX as u64) as u32;
        unsafe {
            match codec {
                VideoCodec::H264 => config.encodeCodecConfig.h264Config.idrPeriod = params.gop_size,
                VideoCodec::H265 => config.encodeCodecConfig.hevcConfig.idrPeriod = params.gop_size,
            }
        }

        let mut init = sys::NV_ENC_INITIALIZE_PARAMS {
            version: sys::NV_ENC_INITIALIZE_PARAMS_VER,
            encodeGUID: encode_guid,
            presetGUID: preset_guid,
            tuningInfo: tuning,
            encodeWidth: params.width,
            encodeHeight: params.height,
            darWidth: params.width * params.sample_aspect_ratio.num as u32,
            darHeight: params.height * params.sample_aspect_ratio.den as u32,
            frameRateNum: params.framerate.num as u32,
            frameRateDen: params.framerate.den as u32,
            enablePTD: 1,
            encodeConfig: &mut config,
            maxEncodeWidth: params.width,
            maxEncodeHeight: params.height,
            ..Default::default()
        };
        unsafe {
            self.api.nvEncInitializeEncoder.unwrap_unchecked()(self.encoder_ptr, &mut init).ok()?;
        }
        Ok(())
    }

    fn allocate_buffers(&mut self, desc: &FramePoolDesc, format: sys::NV_ENC_BUFFER_FORMAT) -> Result<()> {
        for _ in 0..desc.surfaces {
            let mut input = sys::NV_ENC_CREATE_INPUT_BUFFER {
                version: sys::NV_ENC_CREATE_INPUT_BUFFER_VER,
                width: desc.width,
                height: desc.height,
                bufferFmt: format,
                ..Default::default()
            };
            unsafe {
                self.api.nvEncCreateInputBuffer.unwrap_unchecked()(self.encoder_ptr, &mut input)
                    .ok()?;
            }
            self.input_buffers.push(input.inputBuffer);
        }

        let mut bitstream = sys::NV_ENC_CREATE_BITSTREAM_BUFFER {
            version: sys::NV_ENC_CREATE_BITSTREAM_BUFFER_VER,
            ..Default::default()
        };
        unsafe {
            self.api.nvEncCreateBitstreamBuffer.unwrap_unchecked()(self.encoder_ptr, &mut bitstream)
                .ok()?;
        }
        self.bitstream_buffer = bitstream.bitstreamBuffer;
        Ok(())
    }

    /// Copy a frame into an input surface, row by row to honor both pitches.
    fn upload(&self, slot: usize, frame: &VideoFrameBuffer) -> Result<()> {
        let input = self.input_buffers[slot];
        let mut lock = sys::NV_ENC_LOCK_INPUT_BUFFER {
            version: sys::NV_ENC_LOCK_INPUT_BUFFER_VER,
            inputBuffer: input,
            ..Default::default()
        };
        unsafe {
            self.api.nvEncLockInputBuffer.unwrap_unchecked()(self.encoder_ptr, &mut lock).ok()?;
        }

        let pitch = lock.pitch as usize;
        let dst = lock.bufferDataPtr.cast::<u8>();
        let (w, h, stride) = (frame.width, frame.height, frame.line_stride);
        let copy_plane = |src: &[u8], src_stride: usize, dst_offset: usize, dst_pitch: usize, row_len: usize, rows: usize| {
            for row in 0..rows {
                let from = &src[row * src_stride..row * src_stride + row_len];
                unsafe {
                    ptr::copy_nonoverlapping(
                        from.as_ptr(),
                        dst.add(dst_offset + row * dst_pitch),
                        row_len,
                    );
                }
            }
        };

        copy_plane(frame.y(), stride, 0, pitch, w, h);
        match frame.pix_fmt {
            VideoFramePixelFormat::NV12 => copy_plane(frame.u(), stride, pitch * h, pitch, w, h / 2),
            _ => {
                let chroma_pitch = pitch / 2;
                let u_offset = pitch * h;
                let v_offset = u_offset + chroma_pitch * (h / 2);
                copy_plane(frame.u(), stride / 2, u_offset, chroma_pitch, w / 2, h / 2);
                copy_plane(frame.v(), stride / 2, v_offset, chroma_pitch, w / 2, h / 2);
            }
        }

        unsafe {
            self.api.nvEncUnlockInputBuffer.unwrap_unchecked()(self.encoder_ptr, input).ok()?;
        }
        Ok(())
    }

    fn encode(&mut self, pic: &mut sys::NV_ENC_PIC_PARAMS) -> Result<bool> {
        pic.version = sys::NV_ENC_PIC_PARAMS_VER;
        pic.outputBitstream = self.bitstream_buffer;
        let status = unsafe { self.api.nvEncEncodePicture.unwrap_unchecked()(self.encoder_ptr, pic) };
        match status {
            sys::NVENCSTATUS::NV_ENC_ERR_NEED_MORE_INPUT => Ok(false),
            status => status.ok().map(|_| true),
        }
    }

    fn read_bitstream(&self) -> Result<(Bytes, u64, bool)> {
        let mut lock = sys::NV_ENC_LOCK_BITSTREAM {
            version: sys::NV_ENC_LOCK_BITSTREAM_VER,
            outputBitstream: self.bitstream_buffer,
            ..Default::default()
        };
        unsafe {
            self.api.nvEncLockBitstream.unwrap_unchecked()(self.encoder_ptr, &mut lock).ok()?;
        }

        let data = unsafe {
            std::slice::from_raw_parts(
                lock.bitstreamBufferPtr.cast::<u8>(),
                lock.bitstreamSizeInBytes as usize,
            )
        };
        let data = Bytes::copy_from_slice(data);
        let keyframe = matches!(
            lock.pictureType,
            sys::NV_ENC_PIC_TYPE::NV_ENC_PIC_TYPE_IDR | sys::NV_ENC_PIC_TYPE::NV_ENC_PIC_TYPE_I
        );

        unsafe {
            self.api.nvEncUnlockBitstream.unwrap_unchecked()(self.encoder_ptr, self.bitstream_buffer)
                .ok()?;
        }
        Ok((data, lock.outputTimeStamp, keyframe))
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        unsafe {
            for &input in &self.input_buffers {
                let _ = self.api.nvEncDestroyInputBuffer.unwrap_unchecked()(self.encoder_ptr, input);
            }
            if !self.bitstream_buffer.is_null() {
                let _ = self.api.nvEncDestroyBitstreamBuffer.unwrap_unchecked()(
                    self.encoder_ptr,
                    self.bitstream_buffer,
                );
            }
            let _ = self.api.nvEncDestroyEncoder.unwrap_unchecked()(self.encoder_ptr);
        }
    }
}

struct NvencContext {
    codec: CodecDescriptor,
    session: Option<EncodeSession>,
    params: Option<CodecParams>,
    pool: Option<(FramePoolDesc, sys::NV_ENC_BUFFER_FORMAT)>,
    opened: bool,
    next_slot: usize,
    pending: VecDeque<CodecPacket>,
}

impl NvencContext {
    fn new(codec: CodecDescriptor) -> Self {
        Self {
            codec,
            session: None,
            params: None,
            pool: None,
            opened: false,
            next_slot: 0,
            pending: VecDeque::new(),
        }
    }

    fn collect(&mut self) -> std::result::Result<(), CodecError> {
        let Some(session) = self.session.as_ref() else {
            return Err(CodecError::Closed);
        };
        let (data, pts, keyframe) = session
            .read_bitstream()
            .map_err(driver("nvEncLockBitstream"))?;
        if !data.is_empty() {
            trace!(len = data.len(), pts, keyframe, "NVENC packet");
            self.pending.push_back(CodecPacket {
                data,
                pts: pts as i64,
                dts: pts as i64,
                keyframe,
            });
        }
        Ok(())
    }
}

impl CodecContext for NvencContext {
    fn set_hw_device(&mut self, device: Arc<DeviceContext>) -> std::result::Result<(), CodecError> {
        let session = EncodeSession::open(device)?;
        let supported = session
            .codec_guids()
            .map_err(driver("nvEncGetEncodeGUIDs"))?
            .contains(&codec_guid(self.codec.codec));
        if !supported {
            return Err(CodecError::Unsupported(format!(
                "{} on this GPU",
                self.codec.codec
            )));
        }
        self.session = Some(session);
        Ok(())
    }

    fn set_params(&mut self, params: &CodecParams) -> std::result::Result<(), CodecError> {
        if params.pixel_format != self.codec.pixel_format {
            return Err(CodecError::InvalidParameter {
                option: "pix_fmt",
                value: format!("{:?}", params.pixel_format),
            });
        }
        if params.framerate.num <= 0 {
            return Err(CodecError::InvalidParameter {
                option: "framerate",
                value: params.framerate.to_string(),
            });
        }
        self.params = Some(params.clone());
        Ok(())
    }

    fn set_hw_frames(&mut self, pool: &HwFramePool) -> std::result::Result<(), CodecError> {
        if self.session.is_none() {
            return Err(CodecError::Unsupported("hw frames without a device".into()));
        }
        let format = buffer_format(pool.desc().sw_format).ok_or_else(|| {
            CodecError::InvalidParameter {
                option: "sw_format",
                value: format!("{:?}", pool.desc().sw_format),
            }
        })?;
        self.pool = Some((*pool.desc(), format));
        Ok(())
    }

    fn open(&mut self) -> std::result::Result<(), CodecError> {
        let (Some(session), Some(params)) = (self.session.as_mut(), self.params.as_ref()) else {
            return Err(CodecError::Closed);
        };
        let Some((desc, format)) = self.pool else {
            return Err(CodecError::Unsupported("NVENC without a hw frames context".into()));
        };

        session
            .initialize(self.codec.codec, params)
            .map_err(driver("nvEncInitializeEncoder"))?;
        // Surfaces need an initialized session.
        session
            .allocate_buffers(&desc, format)
            .map_err(driver("nvEncCreateInputBuffer"))?;

        self.opened = true;
        Ok(())
    }

    fn send_frame(
        &mut self,
        frame: Option<&VideoFrameBuffer>,
        force_keyframe: bool,
    ) -> std::result::Result<(), CodecError> {
        if !self.opened {
            return Err(CodecError::Closed);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(CodecError::Closed);
        };

        let Some(frame) = frame else {
            let mut eos = sys::NV_ENC_PIC_PARAMS {
                encodePicFlags: sys::NV_ENC_PIC_FLAGS::NV_ENC_PIC_FLAG_EOS as u32,
                ..Default::default()
            };
            session.encode(&mut eos).map_err(driver("nvEncEncodePicture"))?;
            return Ok(());
        };

        let format = buffer_format(frame.pix_fmt).ok_or_else(|| CodecError::InvalidParameter {
            option: "pix_fmt",
            value: format!("{:?}", frame.pix_fmt),
        })?;
        // Input surfaces are sized for the opened resolution.
        if let Some(params) = self.params.as_ref() {
            check_frame(frame, params)?;
        }

        let slot = self.next_slot;
        self.next_slot = (slot + 1) % session.input_buffers.len().max(1);
        session.upload(slot, frame).map_err(driver("nvEncLockInputBuffer"))?;

        let mut flags = 0u32;
        if force_keyframe {
            flags |= sys::NV_ENC_PIC_FLAGS::NV_ENC_PIC_FLAG_FORCEIDR as u32
                | sys::NV_ENC_PIC_FLAGS::NV_ENC_PIC_FLAG_OUTPUT_SPSPPS as u32;
        }
        let mut pic = sys::NV_ENC_PIC_PARAMS {
            inputWidth: frame.width as u32,
            inputHeight: frame.height as u32,
            inputPitch: frame.line_stride as u32,
            encodePicFlags: flags,
            inputTimeStamp: frame.pts.max(0) as u64,
            inputBuffer: session.input_buffers[slot],
            bufferFmt: format,
            pictureStruct: sys::NV_ENC_PIC_STRUCT::NV_ENC_PIC_STRUCT_FRAME,
            ..Default::default()
        };

        if session.encode(&mut pic).map_err(driver("nvEncEncodePicture"))? {
            self.collect()?;
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> std::result::Result<Option<CodecPacket>, CodecError> {
        Ok(self.pending.pop_front())
    }
}
