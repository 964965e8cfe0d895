use super::*;
use crate::{
    command::SeekCommand,
    mock::{self, MockEngine, MockHw},
    stage::Demuxer,
    stream::MediaType,
};

async fn demux(handle: &EngineHandle) -> PacketStage {
    PacketStage::Demuxer(Demuxer::open(handle, mock::input(), true).await.unwrap())
}

#[tokio::test]
async fn test_software_decode_drains_at_eof() {
    let engine = MockEngine::new(vec![mock::video_stream(), mock::audio_stream()]).with_packets(4);
    let handle = mock::handle(&engine);
    let mut decoder = Decoder::open(&handle, demux(&handle).await, false).await.unwrap();

    let frames: Vec<_> = mock::drain(&mut decoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(frames.len(), 8);
    for index in 0..2 {
        let pts: Vec<_> = frames
            .iter()
            .filter(|f| f.stream_index == index)
            .map(|f| mock::pts_of(&f.frame).unwrap())
            .collect();
        assert_eq!(pts, vec![0, 40_000, 80_000, 120_000]);
    }
    assert!(frames.iter().all(|f| matches!(f.frame, Frame::Value(_))));
    assert_eq!(engine.counters.decoders.get(), 0);
}

#[tokio::test]
async fn test_pointer_mode_frames() {
    let engine = MockEngine::new(vec![mock::audio_stream()]).with_packets(3);
    let handle = mock::handle(&engine);
    let mut decoder = Decoder::open(&handle, demux(&handle).await, true).await.unwrap();
    assert!(decoder.ptr());

    let frames: Vec<_> = mock::drain(&mut decoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| matches!(f.frame, Frame::Ptr(_))));
    assert_eq!(engine.counters.ptrs.get(), 3);
    drop(frames);
    assert_eq!(engine.counters.ptrs.get(), 0);
}

#[tokio::test]
async fn test_non_av_substreams_are_dropped() {
    let engine = MockEngine::new(vec![mock::data_stream(), mock::video_stream()]).with_packets(3);
    let handle = mock::handle(&engine);
    let mut decoder = Decoder::open(&handle, demux(&handle).await, false).await.unwrap();

    // parameters still describe every input substream
    let streams = decoder.streams().await.unwrap();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0].media_type, MediaType::Other);
    assert_eq!(engine.counters.decoders.get(), 1);

    let frames: Vec<_> = mock::drain(&mut decoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.stream_index == 1));
}

#[tokio::test]
async fn test_hardware_for_video_software_for_audio() {
    let engine = MockEngine::new(vec![mock::video_stream(), mock::audio_stream()]).with_packets(5);
    let handle = mock::handle_with_hw(&engine, MockHw::new(&engine));
    let mut decoder = Decoder::open(&handle, demux(&handle).await, false).await.unwrap();
    assert_eq!(engine.counters.hw_codecs.get(), 1);
    assert_eq!(engine.counters.decoders.get(), 1);

    let frames: Vec<_> = mock::drain(&mut decoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(frames.len(), 10);
    for f in &frames {
        assert_eq!(f.frame.is_native(), f.stream_index == 0);
    }
}

#[tokio::test]
async fn test_rejected_hardware_falls_back_to_software() {
    let engine = MockEngine::new(vec![mock::video_stream()]).with_packets(2);
    let handle = mock::handle_with_hw(&engine, MockHw::new(&engine).rejecting());
    let mut decoder = Decoder::open(&handle, demux(&handle).await, false).await.unwrap();
    assert_eq!(engine.counters.hw_codecs.get(), 0);
    assert_eq!(engine.counters.decoders.get(), 1);

    let frames: Vec<_> = mock::drain(&mut decoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| !f.frame.is_native()));
}

#[tokio::test]
async fn test_hardware_preference_can_be_disabled() {
    let engine = MockEngine::new(vec![mock::video_stream()]).with_packets(2);
    let handle = mock::handle_with_hw(&engine, MockHw::new(&engine)).with_config(
        crate::config::PipelineConfig {
            prefer_hardware: false,
            ..Default::default()
        },
    );
    let _decoder = Decoder::open(&handle, demux(&handle).await, false).await.unwrap();
    assert_eq!(engine.counters.hw_codecs.get(), 0);
    assert_eq!(engine.counters.decoders.get(), 1);
}

#[tokio::test]
async fn test_no_backend_is_a_config_error() {
    let engine = MockEngine::new(vec![mock::audio_stream(), mock::video_stream()]).failing_decoders();
    let handle = mock::handle_with_hw(&engine, MockHw::new(&engine));
    // video would find hardware, audio has nowhere to go
    let err = Decoder::open(&handle, demux(&handle).await, false).await.err();
    assert!(matches!(err, Some(Error::BackendConfig { stream: 0, .. })));
    assert_eq!(engine.counters.open_resources(), 0);
}

#[tokio::test]
async fn test_error_is_latched_after_pending_frames() {
    let engine = MockEngine::new(vec![mock::video_stream()]).failing_decode_after(3);
    let handle = mock::handle(&engine);
    let mut decoder = Decoder::open(&handle, demux(&handle).await, false).await.unwrap();

    let first = decoder.next_batch().await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert!(matches!(decoder.next_batch().await, Err(Error::Stream(_))));
    assert!(decoder.next_batch().await.unwrap().is_none());
    assert_eq!(engine.counters.open_resources(), 1, "only the demuxer is left");
}

#[tokio::test]
async fn test_hardware_output_precedes_seek_marker() {
    let engine = MockEngine::new(vec![mock::video_stream()]).with_packets(10);
    let handle = mock::handle_with_hw(&engine, MockHw::new(&engine));
    let mut decoder = Decoder::open(&handle, demux(&handle).await, false).await.unwrap();

    let first = decoder.next_batch().await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(mock::pts_of(&first[0].frame), Some(0));

    let results = decoder
        .send_commands(vec![Command::Seek(SeekCommand::to_seconds(0.2))])
        .await;
    assert!(results[0].success);

    // frames still queued in the device come out ahead of the marker
    let queued = decoder.next_batch().await.unwrap().unwrap();
    let pts: Vec<_> = queued.iter().map(|f| mock::pts_of(&f.frame).unwrap()).collect();
    assert_eq!(pts, vec![40_000, 80_000, 120_000]);
    assert!(decoder.next_batch().await.unwrap().unwrap().is_empty());

    let rest: Vec<_> = mock::drain(&mut decoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(rest.len(), 5);
    assert_eq!(mock::pts_of(&rest[0].frame), Some(200_000));
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let engine = MockEngine::new(vec![mock::video_stream()]);
    let handle = mock::handle(&engine);
    let mut decoder = Decoder::open(&handle, demux(&handle).await, false).await.unwrap();
    decoder.teardown();
    decoder.teardown();
    assert_eq!(engine.counters.decoders.get(), 0);
    assert!(decoder.next_batch().await.unwrap().is_none());
    drop(decoder);
    assert_eq!(engine.counters.open_resources(), 0);
}

#[tokio::test]
async fn test_user_packets_decode() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let packets = (0..3)
        .map(|i| {
            Ok(vec![StreamPacket::new(
                0,
                crate::packet::PacketData {
                    data: bytes::Bytes::from_static(b"abc"),
                    pts: Some(i * 1000),
                    ..Default::default()
                },
            )])
        })
        .collect::<Vec<Result<_>>>();
    let upstream = PacketStage::User(crate::stage::UserPacketStream::new(
        &handle,
        vec![mock::audio_stream()],
        Box::pin(futures::stream::iter(packets)),
        false,
    ));
    let mut decoder = Decoder::open(&handle, upstream, false).await.unwrap();
    let frames: Vec<_> = mock::drain(&mut decoder).await.unwrap().into_iter().flatten().collect();
    assert_eq!(frames.len(), 3);
}
