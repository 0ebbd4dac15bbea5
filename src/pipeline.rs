use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
    codec::{CodecDescriptor, CodecError},
    encoders::{EncoderBackend, EncoderBackendImpl, EncoderFrameFlags},
    error::{ConfigureError, EncodeError, SubmitError},
    frame::{EncodedPacket, VideoFrameBuffer},
    keyframe::ForceKeyframeTimer,
    params::CodecParams,
    timing_stats::TimingStats,
    track::TrackConfig,
};

pub const DEFAULT_INPUT_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Raw frames buffered ahead of the encoder before `push_frame` blocks.
    pub input_queue_capacity: usize,
    /// Stack size of the worker thread in bytes. The platform default when unset.
    pub worker_stack_size: Option<usize>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            input_queue_capacity: DEFAULT_INPUT_QUEUE_CAPACITY,
            worker_stack_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Not configured yet.
    Idle,
    Running,
    /// Stopped by `shutdown`/`finish`, or the worker ran out of input.
    Finished,
    Failed(EncodeError),
}

#[derive(Default)]
struct Shared {
    alive: AtomicBool,
    failure: Mutex<Option<EncodeError>>,
}

/// One encoder instance driven by its own worker thread.
///
/// Frames go in through a bounded queue and come out as packets, in
/// submission order, on an unbounded queue the caller drains.
pub struct EncodePipeline {
    id: Uuid,
    settings: PipelineSettings,
    encoder_name: &'static str,

    backend: Option<EncoderBackend>,
    codec: Option<CodecDescriptor>,
    params: Option<CodecParams>,

    input: Option<mpsc::Sender<VideoFrameBuffer>>,
    output: Option<mpsc::UnboundedReceiver<EncodedPacket>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl EncodePipeline {
    pub fn new(backend: EncoderBackend, settings: PipelineSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            encoder_name: backend.encoder_name(),
            backend: Some(backend),
            codec: None,
            params: None,
            input: None,
            output: None,
            worker: None,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn codec(&self) -> Option<&CodecDescriptor> {
        self.codec.as_ref()
    }

    pub fn params(&self) -> Option<&CodecParams> {
        self.params.as_ref()
    }

    /// Configure the backend and start the worker. A pipeline can be
    /// configured once; a failed configure may be retried.
    pub fn configure(&mut self, track: &TrackConfig) -> Result<(), ConfigureError> {
        let Some(mut backend) = self.backend.take() else {
            return Err(ConfigureError::AlreadyConfigured {
                codec: self.encoder_name.to_string(),
            });
        };
        if let Err(err) = backend.configure(track) {
            self.backend = Some(backend);
            return Err(err);
        }

        let (Some(codec), Some(params)) = (backend.codec().cloned(), backend.params().cloned())
        else {
            backend.shutdown();
            return Err(ConfigureError::CodecOpenFailed {
                codec: self.encoder_name.to_string(),
                source: CodecError::Closed,
            });
        };

        let timer = params.keyframe_period.map(ForceKeyframeTimer::start);
        let (input_tx, input_rx) = mpsc::channel(self.settings.input_queue_capacity.max(1));
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            codec_name: codec.name,
            backend,
            input: input_rx,
            output: output_tx,
            shared: self.shared.clone(),
            timer,
            stats: TimingStats::new(format!("{} {}", codec.name, self.id)),
        };

        self.shared.alive.store(true, Ordering::Release);
        let span = info_span!("encoder", pipeline = %self.id, track = track.id, codec = codec.name);
        let mut builder = thread::Builder::new().name(format!(
            "Enc{}{}",
            codec.codec.to_string().to_uppercase(),
            codec.module.tag()
        ));
        if let Some(stack_size) = self.settings.worker_stack_size {
            builder = builder.stack_size(stack_size);
        }
        let spawned = builder.spawn(move || span.in_scope(|| worker.run()));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                // The closure, and the backend inside it, are gone already.
                self.shared.alive.store(false, Ordering::Release);
                error!(pipeline = %self.id, codec = codec.name, %source, "failed to start encoder thread");
                return Err(ConfigureError::ThreadStartFailed {
                    codec: codec.name.to_string(),
                    source,
                });
            }
        };

        info!(pipeline = %self.id, codec = codec.name, "encode pipeline running");
        self.codec = Some(codec);
        self.params = Some(params);
        self.input = Some(input_tx);
        self.output = Some(output_rx);
        self.worker = Some(handle);
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PipelineStatus {
        if let Some(failure) = self.shared.failure.lock().clone() {
            return PipelineStatus::Failed(failure);
        }
        if self.codec.is_none() {
            PipelineStatus::Idle
        } else if self.is_alive() {
            PipelineStatus::Running
        } else {
            PipelineStatus::Finished
        }
    }

    fn running_input(&self) -> Option<&mpsc::Sender<VideoFrameBuffer>> {
        self.input.as_ref().filter(|_| self.is_alive())
    }

    /// Queue a frame, blocking while the input queue is full. Must not be
    /// called from inside an async runtime; use [`Self::push_frame_async`]
    /// there.
    pub fn push_frame(&self, frame: VideoFrameBuffer) -> Result<(), SubmitError> {
        let Some(input) = self.running_input() else {
            return Err(SubmitError::NotRunning(frame));
        };
        input
            .blocking_send(frame)
            .map_err(|err| SubmitError::NotRunning(err.0))
    }

    pub fn try_push_frame(&self, frame: VideoFrameBuffer) -> Result<(), SubmitError> {
        let Some(input) = self.running_input() else {
            return Err(SubmitError::NotRunning(frame));
        };
        input.try_send(frame).map_err(|err| match err {
            TrySendError::Full(frame) => SubmitError::QueueFull(frame),
            TrySendError::Closed(frame) => SubmitError::NotRunning(frame),
        })
    }

    pub async fn push_frame_async(&self, frame: VideoFrameBuffer) -> Result<(), SubmitError> {
        let Some(input) = self.running_input() else {
            return Err(SubmitError::NotRunning(frame));
        };
        input
            .send(frame)
            .await
            .map_err(|err| SubmitError::NotRunning(err.0))
    }

    /// Next packet if one is ready.
    pub fn pop_packet(&mut self) -> Option<EncodedPacket> {
        self.output.as_mut()?.try_recv().ok()
    }

    /// Wait for the next packet. `None` once the worker has exited and every
    /// packet has been taken.
    pub fn blocking_recv_packet(&mut self) -> Option<EncodedPacket> {
        self.output.as_mut()?.blocking_recv()
    }

    pub async fn recv_packet(&mut self) -> Option<EncodedPacket> {
        self.output.as_mut()?.recv().await
    }

    /// Stop now. Frames still queued are dropped; packets already produced
    /// stay available.
    pub fn shutdown(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        self.input = None;
        self.join();
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }
    }

    /// Stop after every queued frame is encoded and the codec is flushed.
    pub fn finish(&mut self) {
        self.input = None;
        self.join();
    }

    fn join(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.join().is_err() {
            error!(pipeline = %self.id, "encoder thread panicked");
            let mut failure = self.shared.failure.lock();
            if failure.is_none() {
                *failure = Some(EncodeError {
                    codec: self.encoder_name.to_string(),
                    frame_index: 0,
                    message: "encoder thread panicked".into(),
                });
            }
            self.shared.alive.store(false, Ordering::Release);
        }
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    codec_name: &'static str,
    backend: EncoderBackend,
    input: mpsc::Receiver<VideoFrameBuffer>,
    output: mpsc::UnboundedSender<EncodedPacket>,
    shared: Arc<Shared>,
    timer: Option<ForceKeyframeTimer>,
    stats: TimingStats,
}

impl Worker {
    fn run(mut self) {
        info!("encoder thread started");
        let mut frame_index = 0u64;

        let result = loop {
            let Some(frame) = self.input.blocking_recv() else {
                // Input closed. Only a finish drains the codec.
                if self.shared.alive.load(Ordering::Acquire) {
                    break self.drain(frame_index);
                }
                break Ok(());
            };
            if !self.shared.alive.load(Ordering::Acquire) {
                break Ok(());
            }

            let flags = EncoderFrameFlags {
                force_keyframe: self.timer.as_mut().is_some_and(|timer| timer.has_elapsed()),
            };
            if flags.force_keyframe {
                debug!(frame_index, pts = frame.pts, "forcing keyframe");
            }

            self.stats.start("encode");
            let result = contain_panic(|| {
                self.backend.send_frame(&frame, flags)?;
                self.forward()
            });
            self.stats.end("encode");
            self.stats.tick();

            if let Err(err) = result {
                break Err(self.failure(frame_index, err));
            }
            frame_index += 1;
        };

        // The failure has to be visible before liveness drops.
        if let Err(failure) = result {
            error!(%failure, "encoder stopped");
            *self.shared.failure.lock() = Some(failure);
        }
        self.shared.alive.store(false, Ordering::Release);
        self.input.close();
        self.backend.shutdown();
        info!(frames = frame_index, "encoder thread exited");
    }

    fn drain(&mut self, frame_index: u64) -> Result<(), EncodeError> {
        contain_panic(|| {
            self.backend.flush()?;
            self.forward()
        })
        .map_err(|err| self.failure(frame_index, err))
    }

    fn forward(&mut self) -> Result<(), CodecError> {
        while let Some(packet) = self.backend.receive_packet()? {
            self.stats
                .track("bits/frame", (packet.data.len() * 8).min(u32::MAX as usize) as u32, "b");
            if self.output.send(packet).is_err() {
                warn!("packet receiver is gone, dropping packet");
            }
        }
        Ok(())
    }

    fn failure(&self, frame_index: u64, err: CodecError) -> EncodeError {
        EncodeError {
            codec: self.codec_name.to_string(),
            frame_index,
            message: err.to_string(),
        }
    }
}

/// Run a codec step, turning a panic inside the codec into an error so the
/// worker can record it and release the backend.
fn contain_panic(step: impl FnOnce() -> Result<(), CodecError>) -> Result<(), CodecError> {
    panic::catch_unwind(AssertUnwindSafe(step)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        Err(CodecError::Driver {
            call: "encode",
            message: format!("codec panicked: {message}"),
        })
    })
}
