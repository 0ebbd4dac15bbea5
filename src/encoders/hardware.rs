use std::sync::Arc;

use tracing::{error, info};

use crate::{
    codec::{CodecDescriptor, CodecError, CodecLibrary},
    device::{DeviceContext, DeviceContextManager, DeviceError, FramePoolDesc, HwFramePool},
    error::ConfigureError,
    frame::{EncodedPacket, VideoFrameBuffer},
    params::CodecParams,
    track::TrackConfig,
};

use super::{check_track, resolve, CodecSession, EncoderBackendImpl, EncoderFrameFlags, EncoderServices};

/// Resources a hardware encoder holds while configured. Field order is drop
/// order: the codec goes first, then its frame pool, then the device.
struct HardwareSession {
    codec: CodecSession,
    frames: HwFramePool,
    device: Arc<DeviceContext>,
}

/// An encoder running on a GPU or other accelerator, bound to one device
/// context from the registry.
pub struct HardwareEncoder {
    name: &'static str,
    codecs: Arc<dyn CodecLibrary>,
    devices: Arc<DeviceContextManager>,
    session: Option<HardwareSession>,
}

impl HardwareEncoder {
    pub fn new(name: &'static str, services: &EncoderServices) -> Self {
        Self {
            name,
            codecs: services.codecs.clone(),
            devices: services.devices.clone(),
            session: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn device_context(&self) -> Option<&Arc<DeviceContext>> {
        self.session.as_ref().map(|session| &session.device)
    }

    pub fn frame_pool(&self) -> Option<&HwFramePool> {
        self.session.as_ref().map(|session| &session.frames)
    }

    fn open(&self, track: &TrackConfig) -> Result<HardwareSession, ConfigureError> {
        let codec = self.name.to_string();
        check_track(self.name, track)?;
        let (descriptor, mut context) = resolve(self.codecs.as_ref(), self.name, track)?;

        let module = descriptor.module;
        let device_id = track.codec_device_id;
        let device_unavailable = |source: DeviceError| ConfigureError::DeviceContextUnavailable {
            codec: codec.clone(),
            module,
            device_id,
            source,
        };
        let device = self
            .devices
            .acquire(module, device_id)
            .map_err(&device_unavailable)?;
        context
            .set_hw_device(device.clone())
            .map_err(|err| device_unavailable(DeviceError::Bind(err)))?;

        let params = CodecParams::derive(track, &descriptor);
        context
            .set_params(&params)
            .map_err(|source| ConfigureError::ParametersRejected {
                codec: codec.clone(),
                source,
            })?;

        let frames = HwFramePool::new(&device, &descriptor, FramePoolDesc::for_params(&params))
            .and_then(|frames| context.set_hw_frames(&frames).map(|_| frames))
            .map_err(|source| ConfigureError::FrameContextBindingFailed {
                codec: codec.clone(),
                module,
                device_id,
                source,
            })?;

        context
            .open()
            .map_err(|source| ConfigureError::CodecOpenFailed {
                codec: codec.clone(),
                source,
            })?;

        Ok(HardwareSession {
            codec: CodecSession::new(descriptor, context, params),
            frames,
            device,
        })
    }

    fn codec_session(&mut self) -> Result<&mut CodecSession, CodecError> {
        self.session
            .as_mut()
            .map(|session| &mut session.codec)
            .ok_or(CodecError::Closed)
    }
}

impl EncoderBackendImpl for HardwareEncoder {
    fn configure(&mut self, track: &TrackConfig) -> Result<(), ConfigureError> {
        if self.session.is_some() {
            return Err(ConfigureError::AlreadyConfigured {
                codec: self.name.to_string(),
            });
        }

        let session = self.open(track).inspect_err(|err| {
            error!(track = track.id, codec = self.name, "{err}");
        })?;
        let params = &session.codec.params;
        info!(
            track = track.id,
            codec = self.name,
            device = %session.device.key(),
            device_name = session.device.name(),
            resolution = %format_args!("{}x{}", params.width, params.height),
            framerate = %params.framerate,
            gop = params.gop_size,
            bitrate = params.bit_rate,
            options = ?params.options(),
            "hardware encoder configured"
        );
        self.session = Some(session);
        Ok(())
    }

    fn send_frame(
        &mut self,
        frame: &VideoFrameBuffer,
        flags: EncoderFrameFlags,
    ) -> Result<(), CodecError> {
        self.codec_session()?.send(frame, flags)
    }

    fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, CodecError> {
        self.codec_session()?.receive()
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.codec_session()?.flush()
    }

    fn codec(&self) -> Option<&CodecDescriptor> {
        self.session.as_ref().map(|session| &session.codec.descriptor)
    }

    fn params(&self) -> Option<&CodecParams> {
        self.session.as_ref().map(|session| &session.codec.params)
    }

    fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            let device = session.device.key();
            drop(session);
            info!(codec = self.name, %device, "hardware encoder shut down");
        }
    }
}
