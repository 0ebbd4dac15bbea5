use crate::{codec::CodecError, device::DeviceError, frame::VideoFrameBuffer, track::CodecModule};

/// Why an encoder could not be brought up. Nothing is left running or
/// allocated when one of these is returned.
#[derive(thiserror::Error, Debug)]
pub enum ConfigureError {
    #[error("could not find encoder {codec}")]
    CodecNotFound { codec: String },

    #[error("could not allocate codec context for {codec}")]
    ContextAllocationFailed { codec: String },

    #[error("could not get {module} device context #{device_id} for {codec}")]
    DeviceContextUnavailable {
        codec: String,
        module: CodecModule,
        device_id: u32,
        #[source]
        source: DeviceError,
    },

    #[error("could not set codec parameters for {codec}")]
    ParametersRejected {
        codec: String,
        #[source]
        source: CodecError,
    },

    #[error("could not set hw frames context for {codec} on {module} device #{device_id}")]
    FrameContextBindingFailed {
        codec: String,
        module: CodecModule,
        device_id: u32,
        #[source]
        source: CodecError,
    },

    #[error("could not open codec {codec}")]
    CodecOpenFailed {
        codec: String,
        #[source]
        source: CodecError,
    },

    #[error("failed to start encoder thread for {codec}")]
    ThreadStartFailed {
        codec: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{codec} is already configured")]
    AlreadyConfigured { codec: String },

    #[error("invalid track for {codec}: {reason}")]
    InvalidTrack { codec: String, reason: String },
}

impl ConfigureError {
    /// Codec name the failure is about.
    pub fn codec(&self) -> &str {
        match self {
            Self::CodecNotFound { codec }
            | Self::ContextAllocationFailed { codec }
            | Self::DeviceContextUnavailable { codec, .. }
            | Self::ParametersRejected { codec, .. }
            | Self::FrameContextBindingFailed { codec, .. }
            | Self::CodecOpenFailed { codec, .. }
            | Self::ThreadStartFailed { codec, .. }
            | Self::AlreadyConfigured { codec }
            | Self::InvalidTrack { codec, .. } => codec,
        }
    }
}

/// A runtime failure that stopped an encode pipeline.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{codec} failed to encode frame #{frame_index}: {message}")]
pub struct EncodeError {
    pub codec: String,
    pub frame_index: u64,
    pub message: String,
}

/// A frame the pipeline did not take. The frame is handed back.
#[derive(thiserror::Error, Debug)]
pub enum SubmitError {
    #[error("input queue is full")]
    QueueFull(VideoFrameBuffer),
    #[error("encoder is not running")]
    NotRunning(VideoFrameBuffer),
}

impl SubmitError {
    /// Only a full queue is worth retrying.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::QueueFull(_))
    }

    pub fn into_frame(self) -> VideoFrameBuffer {
        match self {
            Self::QueueFull(frame) | Self::NotRunning(frame) => frame,
        }
    }
}
