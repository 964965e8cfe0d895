//! FFmpeg-backed engine for `avchain` pipelines.

use std::sync::Arc;

use avchain::{
    engine::{
        DemuxContext, Engine, EncoderSettings, EngineHandle, FilterGraph, FilterSpec, MuxContext,
        MuxSettings, SoftwareDecoder, SoftwareEncoder, WriteSink,
    },
    frame::{FrameData, FrameFormat, FramePtr},
    input::InputFile,
    packet::{PacketData, PacketPtr},
    stream::StreamParameters,
};

pub mod decoder;
pub mod encoder;
pub mod filter;
pub mod frame;
pub mod hw;
pub mod input;
mod io;
pub mod output;
pub mod packet;
pub mod scaler;
pub mod stream;

use crate::{
    decoder::Decoder,
    encoder::{Encoder, find_encoder},
    filter::AvFilterGraph,
    frame::RawFrame,
    hw::FfmpegHw,
    input::AvInput,
    output::AvOutput,
    packet::RawPacket,
};

/// Registers FFmpeg components. Safe to call more than once.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegEngine;

impl Engine for FfmpegEngine {
    fn open_demuxer(&self, name: &str, input: InputFile) -> anyhow::Result<Box<dyn DemuxContext>> {
        Ok(Box::new(AvInput::new(name, input)?))
    }

    fn open_decoder(&self, params: &StreamParameters) -> anyhow::Result<Box<dyn SoftwareDecoder>> {
        Ok(Box::new(Decoder::new(params, None)?))
    }

    fn open_encoder(&self, settings: &EncoderSettings) -> anyhow::Result<Box<dyn SoftwareEncoder>> {
        let codec = find_encoder(&settings.codec)?;
        Ok(Box::new(Encoder::new(settings, codec)?))
    }

    fn open_filter(&self, spec: &FilterSpec) -> anyhow::Result<Box<dyn FilterGraph>> {
        Ok(Box::new(AvFilterGraph::new(spec)?))
    }

    fn open_muxer(&self, settings: &MuxSettings, sink: WriteSink) -> anyhow::Result<Box<dyn MuxContext>> {
        Ok(Box::new(AvOutput::new(settings, sink)?))
    }

    fn frame_to_ptr(&self, frame: FrameData) -> anyhow::Result<FramePtr> {
        Ok(FramePtr::new(RawFrame::from_data(&frame)?))
    }

    fn frame_from_ptr(&self, frame: &FramePtr) -> anyhow::Result<FrameData> {
        raw_frame(frame)?.to_data()
    }

    fn ptr_frame_format(&self, frame: &FramePtr) -> anyhow::Result<FrameFormat> {
        Ok(raw_frame(frame)?.frame_format())
    }

    fn packet_to_ptr(&self, packet: PacketData) -> anyhow::Result<PacketPtr> {
        Ok(PacketPtr::new(RawPacket::from_data(&packet)))
    }

    fn packet_from_ptr(&self, packet: &PacketPtr) -> anyhow::Result<PacketData> {
        packet
            .downcast_ref::<RawPacket>()
            .map(RawPacket::to_data)
            .ok_or_else(|| anyhow::anyhow!("packet pointer was not created by this engine"))
    }
}

fn raw_frame(frame: &FramePtr) -> anyhow::Result<&RawFrame> {
    frame
        .downcast_ref::<RawFrame>()
        .ok_or_else(|| anyhow::anyhow!("frame pointer was not created by this engine"))
}

/// Initializes FFmpeg and returns a handle with hardware codecs enabled.
pub fn handle() -> anyhow::Result<EngineHandle> {
    init()?;
    Ok(EngineHandle::new(Arc::new(FfmpegEngine)).with_hw(Arc::new(FfmpegHw)))
}
