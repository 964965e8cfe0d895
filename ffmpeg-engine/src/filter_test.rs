use avchain::frame::{FrameData, Plane};
use bytes::Bytes;

use super::*;

fn gray(pts: i64) -> Frame {
    Frame::Value(FrameData {
        media_type: MediaType::Video,
        format: "gray".to_string(),
        width: 4,
        height: 4,
        planes: vec![Plane {
            data: Bytes::from(vec![128u8; 16]),
            linesize: 4,
        }],
        pts: Some(pts),
        time_base: Some(Rational::new(1, 25)),
        ..Default::default()
    })
}

#[test]
fn test_scales_and_converts_video() {
    crate::init().unwrap();
    let spec = FilterSpec {
        description: "scale=2:2".to_string(),
        input: FrameFormat {
            media_type: MediaType::Video,
            ..Default::default()
        },
        output: FrameFormat {
            media_type: MediaType::Video,
            format: "yuv420p".to_string(),
            time_base: Some(Rational::MICROS),
            ..Default::default()
        },
        frame_size: 0,
    };
    let mut graph = AvFilterGraph::new(&spec).unwrap();
    let mut frames = graph.filter(vec![gray(0), gray(1)], false, false).unwrap();
    frames.extend(graph.filter(Vec::new(), true, false).unwrap());
    assert_eq!(frames.len(), 2);
    let Frame::Value(last) = &frames[1] else {
        panic!("expected value frame");
    };
    assert_eq!((last.width, last.height), (2, 2));
    assert_eq!(last.format, "yuv420p");
    assert_eq!(last.pts, Some(40_000));
    assert_eq!(last.time_base, Some(Rational::MICROS));
}

#[test]
fn test_audio_sink_honours_frame_size() {
    crate::init().unwrap();
    let spec = FilterSpec {
        description: String::new(),
        input: FrameFormat {
            media_type: MediaType::Audio,
            ..Default::default()
        },
        output: FrameFormat {
            media_type: MediaType::Audio,
            format: "fltp".to_string(),
            ..Default::default()
        },
        frame_size: 4,
    };
    let input = Frame::Value(FrameData {
        media_type: MediaType::Audio,
        format: "s16".to_string(),
        sample_rate: 8000,
        channels: 1,
        channel_layout: 4,
        nb_samples: 10,
        planes: vec![Plane {
            data: Bytes::from(vec![0u8; 20]),
            linesize: 20,
        }],
        pts: Some(0),
        time_base: Some(Rational::new(1, 8000)),
        ..Default::default()
    });
    let mut graph = AvFilterGraph::new(&spec).unwrap();
    let frames = graph.filter(vec![input], true, false).unwrap();
    let sizes: Vec<u32> = frames
        .iter()
        .map(|f| match f {
            Frame::Value(d) => d.nb_samples,
            _ => 0,
        })
        .collect();
    assert_eq!(&sizes[..2], &[4, 4]);
    assert!(sizes.iter().sum::<u32>() >= 10);
    assert!(frames.iter().all(|f| matches!(f, Frame::Value(d) if d.format == "fltp")));
}

#[test]
fn test_empty_flush_without_frames() {
    let spec = FilterSpec {
        description: "null".to_string(),
        input: FrameFormat {
            media_type: MediaType::Video,
            ..Default::default()
        },
        output: FrameFormat::default(),
        frame_size: 0,
    };
    let mut graph = AvFilterGraph::new(&spec).unwrap();
    assert!(graph.filter(Vec::new(), true, true).unwrap().is_empty());
}
