use futures::StreamExt;

use super::*;
use crate::{
    mock::{self, MockEngine, MockHw},
    stage::{Decoder, Demuxer, PacketStage, UserFrameStream},
    stream::{PartialStreamParameters, Rational, StreamParameters},
};

fn options(sample_rate: u32) -> PlayOptions {
    PlayOptions {
        sample_rate,
        channels: None,
    }
}

fn frames_of(handle: &EngineHandle, params: &StreamParameters, batches: usize) -> FrameStage {
    FrameStage::User(UserFrameStream::mono(
        handle,
        PartialStreamParameters::default(),
        mock::frame_batches(params, batches, 1).boxed(),
        false,
    ))
}

#[tokio::test]
async fn test_audio_is_resampled_to_planar_float() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let params = StreamParameters {
        sample_rate: 44100,
        ..mock::audio_stream()
    };
    let mut stage = PlayNormalizer::open(&handle, frames_of(&handle, &params, 3), options(48000), false)
        .await
        .unwrap();

    let streams = stage.streams().await.unwrap();
    assert_eq!(streams[0].format, "fltp");
    assert_eq!(streams[0].sample_rate, 48000);
    assert_eq!(streams[0].time_base, Rational::new(1, 48000));

    let out: Vec<_> = mock::drain(&mut stage).await.unwrap().into_iter().flatten().collect();
    assert_eq!(out.len(), 3);
    for f in &out {
        let format = mock::format_of(&f.frame);
        assert_eq!(format.format, "fltp");
        assert_eq!(format.sample_rate, 48000);
        assert_eq!(format.channels, 2);
    }

    let specs = engine.counters.filter_specs.lock().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].description, "aresample");
}

#[tokio::test]
async fn test_channel_override_resets_layout() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let play = PlayOptions {
        sample_rate: 48000,
        channels: Some(1),
    };
    let mut stage = PlayNormalizer::open(&handle, frames_of(&handle, &mock::audio_stream(), 1), play, false)
        .await
        .unwrap();
    let streams = stage.streams().await.unwrap();
    assert_eq!((streams[0].channels, streams[0].channel_layout), (1, 0));

    let out: Vec<_> = mock::drain(&mut stage).await.unwrap().into_iter().flatten().collect();
    assert_eq!(mock::format_of(&out[0].frame).channels, 1);
}

#[tokio::test]
async fn test_matching_audio_passes_through() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let params = StreamParameters {
        format: "fltp".to_string(),
        ..mock::audio_stream()
    };
    let mut stage = PlayNormalizer::open(&handle, frames_of(&handle, &params, 2), options(48000), false)
        .await
        .unwrap();
    let out: Vec<_> = mock::drain(&mut stage).await.unwrap().into_iter().flatten().collect();
    assert_eq!(out.len(), 2);
    assert!(engine.counters.filter_specs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_engine_video_becomes_rgba() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let mut stage = PlayNormalizer::open(&handle, frames_of(&handle, &mock::video_stream(), 2), options(48000), true)
        .await
        .unwrap();
    assert_eq!(stage.streams().await.unwrap()[0].format, "rgba");

    let out: Vec<_> = mock::drain(&mut stage).await.unwrap().into_iter().flatten().collect();
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|f| matches!(f.frame, Frame::Ptr(_))));
    assert!(out.iter().all(|f| mock::format_of(&f.frame).format == "rgba"));
    assert_eq!(engine.counters.filter_specs.lock().unwrap()[0].description, "null");
}

#[tokio::test]
async fn test_hardware_video_is_untouched() {
    let engine = MockEngine::new(vec![mock::video_stream()]).with_packets(4);
    let handle = mock::handle_with_hw(&engine, MockHw::new(&engine));
    let demuxer = Demuxer::open(&handle, mock::input(), true).await.unwrap();
    let decoder = Decoder::open(&handle, PacketStage::Demuxer(demuxer), true).await.unwrap();
    let mut stage = PlayNormalizer::open(&handle, FrameStage::Decoder(decoder), options(48000), false)
        .await
        .unwrap();

    let out: Vec<_> = mock::drain(&mut stage).await.unwrap().into_iter().flatten().collect();
    assert_eq!(out.len(), 4);
    assert!(out.iter().all(|f| f.frame.is_native()));
    assert!(engine.counters.filter_specs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_zero_sample_rate_is_rejected() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let res = PlayNormalizer::open(&handle, frames_of(&handle, &mock::audio_stream(), 1), options(0), false).await;
    assert!(matches!(res.err(), Some(Error::Build(_))));
}

#[tokio::test]
async fn test_error_follows_frames_already_converted() {
    let engine = MockEngine::new(vec![]).failing_filter(MediaType::Audio);
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
    let mut stage = PlayNormalizer::open(&handle, upstream, options(48000), false)
        .await
        .unwrap();

    let first = stage.next_batch().await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(mock::format_of(&first[0].frame).format, "rgba");
    assert!(matches!(stage.next_batch().await, Err(Error::Stream(_))));
    assert_eq!(engine.counters.filters.get(), 0);
    assert!(stage.next_batch().await.unwrap().is_none());
}

#[tokio::test]
async fn test_marker_keeps_conversion_graphs_open() {
    let engine = MockEngine::new(vec![]);
    let handle = mock::handle(&engine);
    let params = StreamParameters {
        sample_rate: 44100,
        ..mock::audio_stream()
    };
    let frames = vec![
        Ok(vec![Frame::Value(mock::frame_for(&params, Some(0)))]),
        Ok(Vec::new()),
        Ok(vec![Frame::Value(mock::frame_for(&params, Some(1)))]),
    ];
    let upstream = FrameStage::User(UserFrameStream::mono(
        &handle,
        PartialStreamParameters::default(),
        futures::stream::iter(frames).boxed(),
        false,
    ));
    let mut stage = PlayNormalizer::open(&handle, upstream, options(48000), false)
        .await
        .unwrap();

    let sizes: Vec<_> = mock::drain(&mut stage).await.unwrap().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![1, 0, 1]);
    assert_eq!(engine.counters.filter_specs.lock().unwrap().len(), 1);
    assert_eq!(engine.counters.fins.lock().unwrap().as_slice(), &["filter"]);
}
