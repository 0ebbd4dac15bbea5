//! Per-track video encoders backed by hardware or software codecs, each
//! driven by its own worker thread.

pub mod annexb;
pub mod codec;
pub mod device;
pub mod encoders;
pub mod error;
pub mod frame;
pub mod keyframe;
pub mod params;
pub mod pipeline;
pub mod timing_stats;
pub mod track;

pub use encoders::{EncoderBackend, EncoderBackendImpl, EncoderFrameFlags, EncoderServices};
pub use error::{ConfigureError, EncodeError, SubmitError};
pub use frame::{EncodedPacket, VideoFrameBuffer};
pub use pipeline::{EncodePipeline, PipelineSettings, PipelineStatus};
pub use track::{TrackConfig, TrackConfigBuilder};
