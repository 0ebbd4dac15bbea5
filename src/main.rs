use std::{env, io::IsTerminal, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::Deserialize;
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
    signal,
    task::block_in_place,
    time,
};
use tracing::{info, warn};

use hwtranscoder::{
    frame::VideoFramePixelFormat, track::VideoCodec, EncodePipeline, EncoderBackend,
    EncoderServices, PipelineSettings, PipelineStatus, SubmitError, TrackConfig,
    TrackConfigBuilder, VideoFrameBuffer,
};

/// One encode run: a track, how to drive it, and where the elementary
/// stream goes.
#[derive(Deserialize)]
struct RunConfig {
    track: TrackConfig,
    #[serde(default)]
    pipeline: PipelineSettings,
    #[serde(default = "default_frames")]
    frames: u64,
    /// Push frames at the track framerate instead of as fast as possible.
    #[serde(default)]
    paced: bool,
    #[serde(default = "default_output")]
    output: PathBuf,
}

fn default_frames() -> u64 {
    300
}

fn default_output() -> PathBuf {
    PathBuf::from("out.h264")
}

/// 320x240 OpenH264 track, one forced keyframe a second.
fn default_config() -> Result<RunConfig> {
    let track = TrackConfigBuilder::new()
        .codec(VideoCodec::H264)
        .resolution(320, 240)
        .framerate(30.)
        .bitrate(500_000)
        .key_frame_interval_by_time(1000)
        .build()?;

    Ok(RunConfig {
        track,
        pipeline: PipelineSettings::default(),
        frames: default_frames(),
        paced: true,
        output: default_output(),
    })
}

fn init_tracing() {
    let ansi_enabled = env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

/// Diagonal luma ramp that scrolls one pixel per frame, neutral chroma.
fn test_pattern(width: usize, height: usize, index: u64, pts: i64) -> VideoFrameBuffer {
    let shift = index as usize;
    let mut data = Vec::with_capacity(width * height * 3 / 2);
    data.extend((0..height).flat_map(|y| (0..width).map(move |x| ((x + y + shift) & 0xff) as u8)));
    data.resize(width * height * 3 / 2, 128);
    VideoFrameBuffer::i420(width, height, pts, Bytes::from(data))
}

#[derive(Default)]
struct Written {
    packets: u64,
    keyframes: u64,
    bytes: u64,
}

async fn write_ready(
    pipeline: &mut EncodePipeline,
    output: &mut BufWriter<File>,
    written: &mut Written,
) -> Result<()> {
    while let Some(packet) = pipeline.pop_packet() {
        output.write_all(&packet.data).await?;
        written.packets += 1;
        written.keyframes += packet.keyframe as u64;
        written.bytes += packet.data.len() as u64;
    }
    Ok(())
}

async fn produce(
    pipeline: &mut EncodePipeline,
    config: &RunConfig,
    output: &mut BufWriter<File>,
    written: &mut Written,
) -> Result<()> {
    let ticks_per_frame = pipeline.params().map_or(1, |params| params.ticks_per_frame);
    let (width, height) = (config.track.width as usize, config.track.height as usize);

    let mut ticker = time::interval(Duration::from_secs_f64(
        1. / config.track.timing_framerate(),
    ));
    for index in 0..config.frames {
        if config.paced {
            ticker.tick().await;
        }

        let frame = test_pattern(width, height, index, index as i64 * ticks_per_frame);
        match pipeline.push_frame_async(frame).await {
            Ok(()) => {}
            Err(SubmitError::NotRunning(_)) => {
                warn!(index, "encoder stopped before all frames were pushed");
                break;
            }
            Err(err) => return Err(err.into()),
        }
        write_ready(pipeline, output, written).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = match env::args().nth(1) {
        Some(path) => {
            let raw = fs::read_to_string(&path)
                .await
                .with_context(|| format!("couldn't read {path}"))?;
            serde_json::from_str::<RunConfig>(&raw).context("invalid run config")?
        }
        None => default_config()?,
    };
    if config.track.pixel_format != VideoFramePixelFormat::I420 {
        bail!("the test pattern source only produces i420 frames");
    }

    let services = EncoderServices::system();
    let backend = EncoderBackend::for_track(&config.track, &services);
    let mut pipeline = EncodePipeline::new(backend, config.pipeline.clone());
    pipeline.configure(&config.track)?;
    info!(pipeline = %pipeline.id(), output = %config.output.display(), "encoding");

    let mut output = BufWriter::new(
        File::create(&config.output)
            .await
            .with_context(|| format!("couldn't create {}", config.output.display()))?,
    );
    let mut written = Written::default();

    let interrupted = tokio::select! {
        result = produce(&mut pipeline, &config, &mut output, &mut written) => {
            result?;
            false
        }
        _ = signal::ctrl_c() => true,
    };

    if interrupted {
        warn!("interrupted, dropping queued frames");
        block_in_place(|| pipeline.shutdown());
    } else {
        block_in_place(|| pipeline.finish());
    }
    write_ready(&mut pipeline, &mut output, &mut written).await?;
    output.flush().await?;

    info!(
        packets = written.packets,
        keyframes = written.keyframes,
        bytes = written.bytes,
        "done"
    );

    match pipeline.status() {
        PipelineStatus::Failed(err) => Err(err.into()),
        _ => Ok(()),
    }
}
