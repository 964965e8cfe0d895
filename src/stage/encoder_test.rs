use futures::StreamExt;

use super::*;
use crate::{
    mock::{self, MockEngine, MockHw},
    stage::{PacketStage, UserFrameStream},
    stream::PartialStreamParameters,
};

fn user_frames(
    handle: &EngineHandle,
    params: &StreamParameters,
    batches: usize,
) -> FrameStage {
    let partial = PartialStreamParameters {
        media_type: Some(params.media_type),
        ..Default::default()
    };
    FrameStage::User(UserFrameStream::mono(
        handle,
        partial,
        mock::frame_batches(params, batches, 2).boxed(),
        false,
    ))
}

fn both() -> EncoderOptions {
    EncoderOptions {
        video: Some(EncoderConfig::new("vp9")),
        audio: Some(EncoderConfig::new("opus")),
    }
}

#[test]
fn test_config_follows_input_where_unset() {
    let input = mock::audio_stream();
    let settings = EncoderConfig {
        channels: 1,
        ..EncoderConfig::new("opus")
    }
    .settings(&input);
    assert_eq!(settings.sample_rate, 48000);
    assert_eq!(settings.channels, 1);
    // a different channel count cannot keep the input layout
    assert_eq!(settings.channel_layout, 0);
    assert_eq!(settings.time_base, Rational::MICROS);

    let video = EncoderConfig::new("vp9").settings(&mock::video_stream());
    assert_eq!((video.width, video.height), (320, 240));
    assert!(video.format.is_empty());
}

#[tokio::test]
async fn test_software_parameters_known_at_open() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let upstream = user_frames(&handle, &mock::audio_stream(), 3);
    let mut encoder = Encoder::open(&handle, upstream, both(), false).await.unwrap();

    let streams = encoder.streams().await.unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].codec, "opus");
    assert!(streams[0].extradata.is_some());

    let packets: Vec<_> = mock::drain(&mut encoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(packets.len(), 6);
    assert!(packets.iter().all(|p| p.stream_index == 0 && !p.packet.is_ptr()));
}

#[tokio::test]
async fn test_audio_adapter_uses_encoder_frame_size() {
    let engine = MockEngine::new(vec![]).with_encoder_frame_size(960);
    let handle = mock::handle(&engine);
    let upstream = user_frames(&handle, &mock::audio_stream(), 1);
    let mut encoder = Encoder::open(&handle, upstream, both(), true).await.unwrap();
    mock::drain(&mut encoder).await.unwrap();

    let specs = engine.counters.filter_specs.lock().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].description, "aresample");
    assert_eq!(specs[0].frame_size, 960);
    assert_eq!(specs[0].output.time_base, Some(Rational::new(1, 48000)));
}

#[tokio::test]
async fn test_video_adapter_scales_to_configured_size() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let upstream = user_frames(&handle, &mock::video_stream(), 1);
    let options = EncoderOptions {
        video: Some(EncoderConfig {
            width: 160,
            height: 120,
            ..EncoderConfig::new("vp9")
        }),
        audio: None,
    };
    let mut encoder = Encoder::open(&handle, upstream, options, false).await.unwrap();
    let streams = encoder.streams().await.unwrap();
    assert_eq!((streams[0].width, streams[0].height), (160, 120));
    assert_eq!(streams[0].format, "yuv420p");
    mock::drain(&mut encoder).await.unwrap();

    let specs = engine.counters.filter_specs.lock().unwrap();
    assert_eq!(specs[0].description, "scale=160:120");
    assert_eq!(specs[0].output.width, 160);
}

#[tokio::test]
async fn test_unconfigured_media_type_is_dropped() {
    let engine = MockEngine::new(vec![mock::video_stream(), mock::audio_stream()]).with_packets(3);
    let handle = mock::handle(&engine);
    let upstream = FrameStage::Decoder(
        crate::stage::Decoder::open(
            &handle,
            PacketStage::Demuxer(crate::stage::Demuxer::open(&handle, mock::input(), true).await.unwrap()),
            true,
        )
        .await
        .unwrap(),
    );
    let options = EncoderOptions {
        video: None,
        audio: Some(EncoderConfig::new("opus")),
    };
    let mut encoder = Encoder::open(&handle, upstream, options, false).await.unwrap();
    let streams = encoder.streams().await.unwrap();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].is_audio());

    let packets: Vec<_> = mock::drain(&mut encoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(packets.len(), 3);
    assert!(packets.iter().all(|p| p.stream_index == 0));
    assert_eq!(engine.counters.encoders.get(), 0);
}

#[tokio::test]
async fn test_hardware_parameters_arrive_with_first_chunk() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle_with_hw(&engine, MockHw::new(&engine));
    let upstream = user_frames(&handle, &mock::video_stream(), 4);
    let mut encoder = Encoder::open(&handle, upstream, both(), false).await.unwrap();
    assert_eq!(engine.counters.hw_codecs.get(), 1);

    let streams = encoder.streams().await.unwrap();
    assert_eq!(streams[0].codec, "vp9");
    assert_eq!(streams[0].extradata.as_deref(), Some(&b"hw"[..]));
    assert_eq!(streams[0].time_base, Rational::MICROS);

    // batches read ahead for the parameters are not lost
    let packets: Vec<_> = mock::drain(&mut encoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(packets.len(), 8);
    let pts: Vec<_> = packets
        .iter()
        .map(|p| match &p.packet {
            Packet::Value(data) => data.pts.unwrap(),
            Packet::Ptr(_) => panic!("value packets expected"),
        })
        .collect();
    assert_eq!(pts, (0..8).map(|i| i * mock::PACKET_STEP).collect::<Vec<_>>());
    assert!(engine.counters.max_hw_queue.load(std::sync::atomic::Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_silent_hardware_encoder_falls_back_to_configured_parameters() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle_with_hw(&engine, MockHw::new(&engine));
    let partial = PartialStreamParameters {
        media_type: Some(crate::stream::MediaType::Video),
        width: Some(640),
        height: Some(360),
        ..Default::default()
    };
    let upstream = FrameStage::User(UserFrameStream::mono(
        &handle,
        partial,
        futures::stream::empty().boxed(),
        false,
    ));
    let mut encoder = Encoder::open(&handle, upstream, both(), false).await.unwrap();
    let streams = encoder.streams().await.unwrap();
    assert_eq!(streams[0].codec, "vp9");
    assert_eq!((streams[0].width, streams[0].height), (640, 360));
    assert!(encoder.next_batch().await.unwrap().is_none());
}

#[tokio::test]
async fn test_flush_marker_passes_through() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let params = mock::audio_stream();
    let frames = vec![
        Ok(vec![StreamFrame::new(0, mock::frame_for(&params, Some(0)))]),
        Ok(Vec::new()),
        Ok(vec![StreamFrame::new(0, mock::frame_for(&params, Some(10)))]),
    ];
    let upstream = FrameStage::User(UserFrameStream::new(
        &handle,
        vec![PartialStreamParameters::default()],
        futures::stream::iter(frames).boxed(),
        false,
    ));
    let mut encoder = Encoder::open(&handle, upstream, both(), false).await.unwrap();
    let batches = mock::drain(&mut encoder).await.unwrap();
    let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![1, 0, 1]);
}

#[tokio::test]
async fn test_eof_finalises_adapter_before_encoder() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let (video, audio) = (mock::video_stream(), mock::audio_stream());
    let frames = vec![Ok(vec![
        StreamFrame::new(0, mock::frame_for(&video, Some(0))),
        StreamFrame::new(1, mock::frame_for(&audio, Some(0))),
    ])];
    let upstream = FrameStage::User(UserFrameStream::new(
        &handle,
        vec![PartialStreamParameters::default(); 2],
        futures::stream::iter(frames).boxed(),
        false,
    ));
    let mut encoder = Encoder::open(&handle, upstream, both(), false).await.unwrap();

    let packets: Vec<_> = mock::drain(&mut encoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(packets.len(), 2);
    assert_eq!(
        engine.counters.fins.lock().unwrap().as_slice(),
        &["filter", "encoder", "filter", "encoder"]
    );
}
