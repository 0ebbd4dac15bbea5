mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use common::{frame, harness, nvenc_key, nvenc_track, pts_of, FakeLibrary};
use hwtranscoder::{
    codec::CodecError, frame::BitstreamFormat, track::VideoCodec, ConfigureError,
    EncodePipeline, EncoderBackend, EncoderBackendImpl, PipelineSettings, PipelineStatus,
    SubmitError, TrackConfig, VideoFrameBuffer,
};

fn pipeline(h: &common::Harness, track: &TrackConfig, settings: PipelineSettings) -> EncodePipeline {
    let mut pipeline = EncodePipeline::new(EncoderBackend::for_track(track, &h.services), settings);
    pipeline.configure(track).unwrap();
    pipeline
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn status_follows_the_lifecycle() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264).build().unwrap();

    let mut pipeline = EncodePipeline::new(
        EncoderBackend::for_track(&track, &h.services),
        PipelineSettings::default(),
    );
    assert_eq!(pipeline.status(), PipelineStatus::Idle);
    assert!(pipeline.codec().is_none());

    pipeline.configure(&track).unwrap();
    assert_eq!(pipeline.status(), PipelineStatus::Running);
    assert!(pipeline.is_alive());
    assert_eq!(pipeline.codec().unwrap().name, "h264_nvenc");

    pipeline.finish();
    assert_eq!(pipeline.status(), PipelineStatus::Finished);
    assert!(!pipeline.is_alive());
    assert_eq!(h.library.probe.live(), 0);
}

#[test]
fn configure_twice_is_rejected() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    let err = pipeline.configure(&track).unwrap_err();
    assert!(matches!(err, ConfigureError::AlreadyConfigured { .. }));
}

#[test]
fn packets_keep_submission_order_through_a_buffering_codec() {
    let h = harness(FakeLibrary::new().buffering(3));
    let track = nvenc_track(VideoCodec::H265).build().unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    for pts in 0..20 {
        pipeline.push_frame(frame(pts * 2)).unwrap();
    }
    pipeline.finish();

    let mut packets = Vec::new();
    while let Some(packet) = pipeline.pop_packet() {
        packets.push(packet);
    }

    let pts: Vec<i64> = packets.iter().map(pts_of).collect();
    assert_eq!(pts, (0..20).map(|p| p * 2).collect::<Vec<_>>());
    // Each packet names the frame it encodes, even with pictures held back.
    for packet in &packets {
        assert_eq!(packet.submission_index as i64 * 2, pts_of(packet));
    }
    assert!(packets
        .iter()
        .all(|p| p.bitstream_format == BitstreamFormat::H265AnnexB));
    assert!(packets[0].keyframe);
    assert_eq!(h.library.probe.flushes.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn submission_index_matches_frame_without_buffering() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    for pts in 0..8 {
        pipeline.push_frame(frame(pts)).unwrap();
    }
    pipeline.finish();

    let mut index = 0;
    while let Some(packet) = pipeline.blocking_recv_packet() {
        assert_eq!(packet.submission_index, index);
        assert_eq!(packet.pts, index as i64);
        index += 1;
    }
    assert_eq!(index, 8);
}

#[test]
fn codec_error_stops_the_pipeline() {
    let h = harness(FakeLibrary::new().fail_on_frame(5));
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    for pts in 0..10 {
        if let Err(err) = pipeline.push_frame(frame(pts)) {
            assert!(!err.is_retriable());
            break;
        }
    }
    assert!(wait_until(Duration::from_secs(2), || !pipeline.is_alive()));

    let PipelineStatus::Failed(failure) = pipeline.status() else {
        panic!("expected a failure, got {:?}", pipeline.status());
    };
    assert_eq!(failure.codec, "h264_nvenc");
    assert_eq!(failure.frame_index, 5);
    assert!(failure.message.contains("injected"));

    // Packets produced before the failure are still delivered.
    let mut delivered = Vec::new();
    while let Some(packet) = pipeline.pop_packet() {
        delivered.push(pts_of(&packet));
    }
    assert_eq!(delivered, vec![0, 1, 2, 3, 4]);

    let err = pipeline.try_push_frame(frame(99)).unwrap_err();
    assert!(matches!(err, SubmitError::NotRunning(_)));
    assert_eq!(err.into_frame().pts, 99);

    pipeline.finish();
    assert_eq!(h.library.probe.live(), 0);
}

#[test]
fn codec_panic_is_reported_as_a_failure() {
    let h = harness(FakeLibrary::new().panic_on_frame(3));
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    for pts in 0..6 {
        if pipeline.push_frame(frame(pts)).is_err() {
            break;
        }
    }
    assert!(wait_until(Duration::from_secs(2), || !pipeline.is_alive()));

    let PipelineStatus::Failed(failure) = pipeline.status() else {
        panic!("expected a failure, got {:?}", pipeline.status());
    };
    assert_eq!(failure.frame_index, 3);
    assert!(failure.message.contains("panicked"), "{}", failure.message);

    pipeline.finish();
    assert_eq!(h.library.probe.live(), 0);
    assert_eq!(h.devices.references(nvenc_key(0)), 0);
}

#[test]
fn worker_spawn_failure_releases_the_backend() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = EncodePipeline::new(
        EncoderBackend::for_track(&track, &h.services),
        PipelineSettings {
            // No platform can map a stack this large.
            worker_stack_size: Some(usize::MAX / 2),
            ..Default::default()
        },
    );

    let err = pipeline.configure(&track).unwrap_err();
    assert!(matches!(err, ConfigureError::ThreadStartFailed { .. }), "{err}");
    assert_eq!(err.codec(), "h264_nvenc");

    assert_eq!(h.library.probe.allocated.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.library.probe.live(), 0);
    assert_eq!(h.devices.references(nvenc_key(0)), 0);
    assert!(!pipeline.is_alive());
    assert_eq!(pipeline.status(), PipelineStatus::Idle);
    assert!(matches!(
        pipeline.try_push_frame(frame(0)),
        Err(SubmitError::NotRunning(_))
    ));
}

#[test]
fn frames_of_another_size_stop_the_pipeline() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    pipeline.push_frame(frame(0)).unwrap();
    pipeline
        .push_frame(VideoFrameBuffer::i420(
            128,
            96,
            1,
            Bytes::from(vec![16u8; 128 * 96 * 3 / 2]),
        ))
        .unwrap();
    pipeline.finish();

    let PipelineStatus::Failed(failure) = pipeline.status() else {
        panic!("expected a failure, got {:?}", pipeline.status());
    };
    assert_eq!(failure.frame_index, 1);
    assert!(failure.message.contains("frame size"), "{}", failure.message);
    assert_eq!(*h.library.probe.sent.lock(), vec![0]);
}

#[test]
fn frames_with_short_strides_never_reach_the_codec() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut backend = EncoderBackend::for_track(&track, &h.services);
    backend.configure(&track).unwrap();

    let zero_stride = VideoFrameBuffer {
        line_stride: 0,
        data: Bytes::new(),
        ..frame(0)
    };
    let err = backend
        .send_frame(&zero_stride, Default::default())
        .unwrap_err();
    assert!(matches!(err, CodecError::InvalidParameter { option: "line_stride", .. }));
    assert!(h.library.probe.sent.lock().is_empty());

    backend.send_frame(&frame(1), Default::default()).unwrap();
    assert_eq!(backend.receive_packet().unwrap().unwrap().submission_index, 0);
}

#[test]
fn full_input_queue_pushes_back() {
    let h = harness(FakeLibrary::new().encode_delay(Duration::from_millis(100)));
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = pipeline(
        &h,
        &track,
        PipelineSettings {
            input_queue_capacity: 2,
            ..Default::default()
        },
    );

    let mut accepted = 0;
    let rejected = loop {
        match pipeline.try_push_frame(frame(accepted)) {
            Ok(()) => accepted += 1,
            Err(err) => break err,
        }
        assert!(accepted <= 3, "queue never filled");
    };

    assert!(rejected.is_retriable());
    assert_eq!(rejected.into_frame().pts, accepted);
    assert!(accepted >= 2);

    pipeline.shutdown();
}

#[test]
fn time_policy_forces_keyframes_on_the_timer() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264)
        .key_frame_interval_by_time(50)
        .build()
        .unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    for pts in 0..30 {
        pipeline.push_frame(frame(pts)).unwrap();
        thread::sleep(Duration::from_millis(10));
    }
    pipeline.finish();

    let forced = h.library.probe.forced.lock().clone();
    assert!(forced.len() >= 2, "forced keyframes: {forced:?}");
    assert!(forced.len() < 30);

    let mut keyframes = Vec::new();
    while let Some(packet) = pipeline.pop_packet() {
        if packet.keyframe {
            keyframes.push(packet.pts);
        }
    }
    assert!(forced.iter().all(|pts| keyframes.contains(pts)));
}

#[test]
fn frame_policy_never_forces_keyframes() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264)
        .key_frame_interval_by_frame(10)
        .build()
        .unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    for pts in 0..20 {
        pipeline.push_frame(frame(pts)).unwrap();
    }
    pipeline.finish();

    assert!(h.library.probe.forced.lock().is_empty());
}

#[test]
fn shutdown_drops_queued_frames_and_is_idempotent() {
    let h = harness(FakeLibrary::new().encode_delay(Duration::from_millis(30)));
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    for pts in 0..10 {
        pipeline.push_frame(frame(pts)).unwrap();
    }
    pipeline.shutdown();

    let sent = h.library.probe.sent.lock().len();
    assert!(sent < 10, "all {sent} frames were encoded");
    assert_eq!(h.library.probe.flushes.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(pipeline.status(), PipelineStatus::Finished);
    assert_eq!(h.library.probe.live(), 0);

    pipeline.shutdown();
    assert!(matches!(
        pipeline.push_frame(frame(10)),
        Err(SubmitError::NotRunning(_))
    ));
}

#[test]
fn dropping_the_pipeline_releases_the_device() {
    let h = harness(FakeLibrary::new());
    let track = nvenc_track(VideoCodec::H264).build().unwrap();

    let pipeline = pipeline(&h, &track, PipelineSettings::default());
    assert!(h.devices.references(common::nvenc_key(0)) > 0);
    drop(pipeline);

    assert_eq!(h.devices.references(common::nvenc_key(0)), 0);
    assert_eq!(h.library.probe.live(), 0);
}

#[tokio::test]
async fn async_push_and_receive() {
    let h = harness(FakeLibrary::new().buffering(1));
    let track = nvenc_track(VideoCodec::H264).build().unwrap();
    let mut pipeline = pipeline(&h, &track, PipelineSettings::default());

    for pts in 0..4 {
        pipeline.push_frame_async(frame(pts)).await.unwrap();
    }
    let first = pipeline.recv_packet().await.unwrap();
    assert_eq!(pts_of(&first), 0);

    pipeline.finish();
    let mut rest = Vec::new();
    while let Some(packet) = pipeline.recv_packet().await {
        rest.push(pts_of(&packet));
    }
    assert_eq!(rest, vec![1, 2, 3]);
}

#[test]
fn pipeline_settings_deserialize_with_defaults() {
    let settings: PipelineSettings = serde_json::from_str("{}").unwrap();
    assert_eq!(settings.input_queue_capacity, 16);
    assert_eq!(settings.worker_stack_size, None);

    let settings: PipelineSettings =
        serde_json::from_str(r#"{ "input_queue_capacity": 4 }"#).unwrap();
    assert_eq!(settings.input_queue_capacity, 4);
}
