#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;

use hwtranscoder::{
    codec::{CodecContext, CodecDescriptor, CodecError, CodecLibrary, CodecPacket},
    device::{
        DeviceContext, DeviceContextFactory, DeviceContextManager, DeviceError, DeviceHandle,
        DeviceKey, HwFramePool,
    },
    frame::{BitstreamFormat, PacketType, VideoFrameBuffer, VideoFramePixelFormat},
    params::CodecParams,
    track::{CodecModule, TrackConfigBuilder, VideoCodec},
    EncoderServices,
};

const INPUT_FORMATS: &[VideoFramePixelFormat] =
    &[VideoFramePixelFormat::I420, VideoFramePixelFormat::NV12];

pub const FAKE_H264_NVENC: CodecDescriptor = CodecDescriptor {
    name: "h264_nvenc",
    long_name: "emulated NVENC H.264",
    codec: VideoCodec::H264,
    module: CodecModule::Nvenc,
    bitstream_format: BitstreamFormat::H264AnnexB,
    packet_type: PacketType::Nalu,
    pixel_format: VideoFramePixelFormat::Cuda,
    input_formats: INPUT_FORMATS,
};

pub const FAKE_HEVC_NVENC: CodecDescriptor = CodecDescriptor {
    name: "hevc_nvenc",
    long_name: "emulated NVENC hevc",
    codec: VideoCodec::H265,
    module: CodecModule::Nvenc,
    bitstream_format: BitstreamFormat::H265AnnexB,
    packet_type: PacketType::Nalu,
    pixel_format: VideoFramePixelFormat::Cuda,
    input_formats: INPUT_FORMATS,
};

pub const FAKE_SOFTWARE: CodecDescriptor = CodecDescriptor {
    name: "libfake",
    long_name: "emulated software H.264",
    codec: VideoCodec::H264,
    module: CodecModule::OpenH264,
    bitstream_format: BitstreamFormat::H264AnnexB,
    packet_type: PacketType::Nalu,
    pixel_format: VideoFramePixelFormat::I420,
    input_formats: &[VideoFramePixelFormat::I420],
};

/// Configure step a fake context should fail at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Alloc,
    SetDevice,
    SetParams,
    SetFrames,
    Open,
}

/// What fake contexts observed, shared with the test.
#[derive(Default)]
pub struct Probe {
    pub live_contexts: AtomicUsize,
    pub allocated: AtomicUsize,
    pub sent: Mutex<Vec<i64>>,
    pub forced: Mutex<Vec<i64>>,
    pub params: Mutex<Option<CodecParams>>,
    pub flushes: AtomicUsize,
}

impl Probe {
    pub fn live(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct FakeLibrary {
    pub probe: Arc<Probe>,
    fail_at: Option<Step>,
    buffering: usize,
    fail_on_frame: Option<usize>,
    panic_on_frame: Option<usize>,
    encode_delay: Duration,
}

impl FakeLibrary {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(Probe::default()),
            fail_at: None,
            buffering: 0,
            fail_on_frame: None,
            panic_on_frame: None,
            encode_delay: Duration::ZERO,
        }
    }

    pub fn fail_at(mut self, step: Step) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Hold this many pictures back before emitting, like a lookahead.
    pub fn buffering(mut self, frames: usize) -> Self {
        self.buffering = frames;
        self
    }

    /// Fail the send of the n-th frame (0-based).
    pub fn fail_on_frame(mut self, index: usize) -> Self {
        self.fail_on_frame = Some(index);
        self
    }

    /// Panic while sending the n-th frame, as an out-of-bounds copy would.
    pub fn panic_on_frame(mut self, index: usize) -> Self {
        self.panic_on_frame = Some(index);
        self
    }

    pub fn encode_delay(mut self, delay: Duration) -> Self {
        self.encode_delay = delay;
        self
    }
}

impl CodecLibrary for FakeLibrary {
    fn find_encoder_by_name(&self, name: &str) -> Option<CodecDescriptor> {
        [FAKE_H264_NVENC, FAKE_HEVC_NVENC, FAKE_SOFTWARE]
            .into_iter()
            .find(|codec| codec.name == name)
    }

    fn alloc_context(&self, codec: &CodecDescriptor) -> Option<Box<dyn CodecContext>> {
        if self.fail_at == Some(Step::Alloc) {
            return None;
        }
        self.probe.allocated.fetch_add(1, Ordering::SeqCst);
        self.probe.live_contexts.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(FakeContext {
            library: self.clone(),
            codec: codec.clone(),
            device: None,
            opened: false,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            frames: 0,
        }))
    }
}

struct FakeContext {
    library: FakeLibrary,
    codec: CodecDescriptor,
    device: Option<Arc<DeviceContext>>,
    opened: bool,
    held: VecDeque<CodecPacket>,
    ready: VecDeque<CodecPacket>,
    frames: usize,
}

impl FakeContext {
    fn fail(&self, step: Step) -> Result<(), CodecError> {
        if self.library.fail_at == Some(step) {
            return Err(CodecError::Driver {
                call: "fake",
                message: format!("injected failure at {step:?}"),
            });
        }
        Ok(())
    }
}

impl Drop for FakeContext {
    fn drop(&mut self) {
        self.library.probe.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CodecContext for FakeContext {
    fn set_hw_device(&mut self, device: Arc<DeviceContext>) -> Result<(), CodecError> {
        self.fail(Step::SetDevice)?;
        self.device = Some(device);
        Ok(())
    }

    fn set_params(&mut self, params: &CodecParams) -> Result<(), CodecError> {
        self.fail(Step::SetParams)?;
        *self.library.probe.params.lock() = Some(params.clone());
        Ok(())
    }

    fn set_hw_frames(&mut self, pool: &HwFramePool) -> Result<(), CodecError> {
        self.fail(Step::SetFrames)?;
        assert_eq!(pool.desc().hw_format, self.codec.pixel_format);
        Ok(())
    }

    fn open(&mut self) -> Result<(), CodecError> {
        self.fail(Step::Open)?;
        self.opened = true;
        Ok(())
    }

    fn send_frame(
        &mut self,
        frame: Option<&VideoFrameBuffer>,
        force_keyframe: bool,
    ) -> Result<(), CodecError> {
        if !self.opened {
            return Err(CodecError::Closed);
        }
        let Some(frame) = frame else {
            self.library.probe.flushes.fetch_add(1, Ordering::SeqCst);
            self.ready.extend(self.held.drain(..));
            return Ok(());
        };

        if self.library.fail_on_frame == Some(self.frames) {
            return Err(CodecError::Driver {
                call: "fake",
                message: format!("injected failure on frame {}", self.frames),
            });
        }
        if self.library.panic_on_frame == Some(self.frames) {
            panic!("range end index {} out of range for slice of length 16", self.frames * 64);
        }
        if !self.library.encode_delay.is_zero() {
            thread::sleep(self.library.encode_delay);
        }

        self.library.probe.sent.lock().push(frame.pts);
        if force_keyframe {
            self.library.probe.forced.lock().push(frame.pts);
        }
        self.held.push_back(CodecPacket {
            data: Bytes::copy_from_slice(&frame.pts.to_le_bytes()),
            pts: frame.pts,
            dts: frame.pts,
            keyframe: force_keyframe || self.frames == 0,
        });
        self.frames += 1;

        while self.held.len() > self.library.buffering {
            if let Some(packet) = self.held.pop_front() {
                self.ready.push_back(packet);
            }
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<CodecPacket>, CodecError> {
        Ok(self.ready.pop_front())
    }
}

/// Devices 0..count exist on NVENC and QSV.
pub struct FakeDeviceFactory {
    pub count: u32,
    pub created: Arc<AtomicUsize>,
}

impl DeviceContextFactory for FakeDeviceFactory {
    fn create(&self, key: DeviceKey) -> Result<DeviceContext, DeviceError> {
        if !matches!(key.module, CodecModule::Nvenc | CodecModule::Qsv) {
            return Err(DeviceError::Unsupported(key.module));
        }
        if key.device_index >= self.count {
            return Err(DeviceError::NoSuchDevice {
                index: key.device_index,
                count: self.count,
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceContext::new(
            key,
            format!("emulated GPU {}", key.device_index),
            DeviceHandle::Virtual,
        ))
    }
}

pub struct Harness {
    pub library: FakeLibrary,
    pub devices: Arc<DeviceContextManager>,
    pub devices_created: Arc<AtomicUsize>,
    pub services: EncoderServices,
}

pub fn harness(library: FakeLibrary) -> Harness {
    let created = Arc::new(AtomicUsize::new(0));
    let devices = Arc::new(DeviceContextManager::new(Box::new(FakeDeviceFactory {
        count: 2,
        created: created.clone(),
    })));
    let services = EncoderServices::new(Arc::new(library.clone()), devices.clone());
    Harness {
        library,
        devices,
        devices_created: created,
        services,
    }
}

pub fn nvenc_track(codec: VideoCodec) -> TrackConfigBuilder {
    TrackConfigBuilder::new()
        .codec(codec)
        .resolution(64, 48)
        .framerate(30.)
        .bitrate(2_000_000)
        .device(CodecModule::Nvenc, 0)
}

pub fn frame(pts: i64) -> VideoFrameBuffer {
    VideoFrameBuffer::i420(64, 48, pts, Bytes::from(vec![16u8; 64 * 48 * 3 / 2]))
}

pub fn pts_of(packet: &hwtranscoder::EncodedPacket) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&packet.data[..8]);
    i64::from_le_bytes(bytes)
}

pub fn nvenc_key(index: u32) -> DeviceKey {
    DeviceKey {
        module: CodecModule::Nvenc,
        device_index: index,
    }
}
