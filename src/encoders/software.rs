use std::sync::Arc;

use tracing::{error, info};

use crate::{
    codec::{CodecDescriptor, CodecError, CodecLibrary},
    error::ConfigureError,
    frame::{EncodedPacket, VideoFrameBuffer},
    params::CodecParams,
    track::TrackConfig,
};

use super::{check_track, resolve, CodecSession, EncoderBackendImpl, EncoderFrameFlags, EncoderServices};

/// A CPU encoder. No device context, no frame pool.
pub struct SoftwareEncoder {
    name: &'static str,
    codecs: Arc<dyn CodecLibrary>,
    session: Option<CodecSession>,
}

impl SoftwareEncoder {
    pub fn new(name: &'static str, services: &EncoderServices) -> Self {
        Self {
            name,
            codecs: services.codecs.clone(),
            session: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn open(&self, track: &TrackConfig) -> Result<CodecSession, ConfigureError> {
        check_track(self.name, track)?;
        let (descriptor, mut context) = resolve(self.codecs.as_ref(), self.name, track)?;

        let params = CodecParams::derive(track, &descriptor);
        context
            .set_params(&params)
            .map_err(|source| ConfigureError::ParametersRejected {
                codec: self.name.to_string(),
                source,
            })?;

        context
            .open()
            .map_err(|source| ConfigureError::CodecOpenFailed {
                codec: self.name.to_string(),
                source,
            })?;

        Ok(CodecSession::new(descriptor, context, params))
    }
}

impl EncoderBackendImpl for SoftwareEncoder {
    fn configure(&mut self, track: &TrackConfig) -> Result<(), ConfigureError> {
        if self.session.is_some() {
            return Err(ConfigureError::AlreadyConfigured {
                codec: self.name.to_string(),
            });
        }

        let session = self.open(track).inspect_err(|err| {
            error!(track = track.id, codec = self.name, "{err}");
        })?;
        info!(
            track = track.id,
            codec = self.name,
            resolution = %format_args!("{}x{}", track.width, track.height),
            framerate = %session.params.framerate,
            gop = session.params.gop_size,
            bitrate = session.params.bit_rate,
            "software encoder configured"
        );
        self.session = Some(session);
        Ok(())
    }

    fn send_frame(
        &mut self,
        frame: &VideoFrameBuffer,
        flags: EncoderFrameFlags,
    ) -> Result<(), CodecError> {
        self.session.as_mut().ok_or(CodecError::Closed)?.send(frame, flags)
    }

    fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, CodecError> {
        self.session.as_mut().ok_or(CodecError::Closed)?.receive()
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.session.as_mut().ok_or(CodecError::Closed)?.flush()
    }

    fn codec(&self) -> Option<&CodecDescriptor> {
        self.session.as_ref().map(|session| &session.descriptor)
    }

    fn params(&self) -> Option<&CodecParams> {
        self.session.as_ref().map(|session| &session.params)
    }

    fn shutdown(&mut self) {
        if self.session.take().is_some() {
            info!(codec = self.name, "software encoder shut down");
        }
    }
}
