//! Seam between the pipeline and the codec/container engine.
//!
//! All contexts are owned boxes; dropping one releases the engine resource.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    config::PipelineConfig,
    frame::{Frame, FrameData, FrameFormat, FramePtr},
    hw::HwCodecService,
    input::InputFile,
    packet::{Packet, PacketData, PacketPtr, StreamPacket},
    stream::{MediaType, Rational, StreamParameters},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    /// Nothing available yet, try again.
    Again,
    Eof,
}

#[derive(Debug)]
pub struct ReadOutcome {
    pub packets: Vec<StreamPacket>,
    pub status: ReadStatus,
}

pub trait DemuxContext: Send {
    fn streams(&self) -> Vec<StreamParameters>;

    /// Reads packets until roughly `limit` bytes have been produced.
    fn read_packets(&mut self, limit: usize, ptr: bool) -> anyhow::Result<ReadOutcome>;

    /// Backward-biased seek. Timestamps are in `stream`'s time base, or
    /// microseconds when no stream is given.
    fn seek(&mut self, stream: Option<usize>, min: i64, ts: i64, max: i64) -> anyhow::Result<()>;
}

pub trait SoftwareDecoder: Send {
    /// Feeds `packets` and collects every frame that is ready. With `fin` the
    /// decoder is drained.
    fn decode(&mut self, packets: Vec<Packet>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Frame>>;

    /// Drops buffered state, e.g. reference frames, after a seek.
    fn flush_buffers(&mut self);
}

/// Fully resolved encoder configuration for one substream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EncoderSettings {
    pub media_type: MediaType,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Pixel or sample format; empty lets the encoder choose.
    pub format: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub channel_layout: u64,
    pub bit_rate: u64,
    pub frame_rate: Option<Rational>,
    pub time_base: Rational,
    pub options: BTreeMap<String, String>,
}

impl EncoderSettings {
    /// Parameters a muxer can use when the encoder never reported its own.
    pub fn fallback_parameters(&self) -> StreamParameters {
        StreamParameters {
            codec: self.codec.clone(),
            media_type: self.media_type,
            format: self.format.clone(),
            width: self.width,
            height: self.height,
            sample_rate: self.sample_rate,
            channels: self.channels,
            channel_layout: self.channel_layout,
            bit_rate: self.bit_rate,
            frame_rate: self.frame_rate,
            time_base: Rational::MICROS,
            ..Default::default()
        }
    }
}

pub trait SoftwareEncoder: Send {
    /// Negotiated output parameters, known once the encoder is open.
    fn parameters(&self) -> StreamParameters;

    /// Samples per audio frame the encoder expects, 0 when variable.
    fn frame_size(&self) -> u32;

    fn encode(&mut self, frames: Vec<Frame>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Packet>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub description: String,
    pub input: FrameFormat,
    pub output: FrameFormat,
    /// Fixed output frame size for audio sinks, 0 for none.
    pub frame_size: u32,
}

pub trait FilterGraph: Send {
    fn filter(&mut self, frames: Vec<Frame>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Frame>>;
}

/// One write issued by a muxer. Positions may repeat in random-access mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub position: u64,
    pub data: Bytes,
}

pub type WriteSink = tokio::sync::mpsc::UnboundedSender<FileWrite>;

#[derive(Debug, Clone)]
pub struct MuxSettings {
    pub name: String,
    pub format: String,
    pub random_access: bool,
    pub streams: Vec<StreamParameters>,
}

pub trait MuxContext: Send {
    fn write_packets(&mut self, packets: Vec<StreamPacket>) -> anyhow::Result<()>;

    fn write_trailer(&mut self) -> anyhow::Result<()>;
}

pub trait Engine: Send + Sync {
    fn open_demuxer(&self, name: &str, input: InputFile) -> anyhow::Result<Box<dyn DemuxContext>>;

    fn open_decoder(&self, params: &StreamParameters) -> anyhow::Result<Box<dyn SoftwareDecoder>>;

    fn open_encoder(&self, settings: &EncoderSettings) -> anyhow::Result<Box<dyn SoftwareEncoder>>;

    fn open_filter(&self, spec: &FilterSpec) -> anyhow::Result<Box<dyn FilterGraph>>;

    /// Opens a muxer and writes the container header through `sink`.
    fn open_muxer(&self, settings: &MuxSettings, sink: WriteSink) -> anyhow::Result<Box<dyn MuxContext>>;

    fn frame_to_ptr(&self, frame: FrameData) -> anyhow::Result<FramePtr>;

    fn frame_from_ptr(&self, frame: &FramePtr) -> anyhow::Result<FrameData>;

    fn ptr_frame_format(&self, frame: &FramePtr) -> anyhow::Result<FrameFormat>;

    fn packet_to_ptr(&self, packet: PacketData) -> anyhow::Result<PacketPtr>;

    fn packet_from_ptr(&self, packet: &PacketPtr) -> anyhow::Result<PacketData>;

    /// Shape of any frame this engine or a hardware codec produced.
    fn frame_format(&self, frame: &Frame) -> anyhow::Result<FrameFormat> {
        match frame {
            Frame::Native(native) => Ok(native.frame_format()),
            Frame::Value(data) => Ok(data.frame_format()),
            Frame::Ptr(ptr) => self.ptr_frame_format(ptr),
        }
    }
}

/// Creates an engine instance scoped to a single codec.
pub type EngineFactory = Arc<dyn Fn(&str) -> anyhow::Result<Arc<dyn Engine>> + Send + Sync>;

/// Everything a pipeline build session shares: the engine, the optional
/// hardware service, configuration, the synthetic name allocator and the
/// cancellation token.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn Engine>,
    hw: Option<Arc<dyn HwCodecService>>,
    factory: Option<EngineFactory>,
    names: Arc<AtomicU64>,
    cancel: CancellationToken,
    config: Arc<PipelineConfig>,
}

impl EngineHandle {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            hw: None,
            factory: None,
            names: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            config: Arc::new(crate::config::config().clone()),
        }
    }

    pub fn with_hw(mut self, hw: Arc<dyn HwCodecService>) -> Self {
        self.hw = Some(hw);
        self
    }

    pub fn with_engine_factory(mut self, factory: EngineFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn hw(&self) -> Option<&Arc<dyn HwCodecService>> {
        if self.config.prefer_hardware {
            self.hw.as_ref()
        } else {
            None
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Engine for a software codec: a scoped instance when a factory is set.
    pub fn codec_engine(&self, codec: &str) -> anyhow::Result<Arc<dyn Engine>> {
        match &self.factory {
            Some(factory) => factory(codec),
            None => Ok(self.engine.clone()),
        }
    }

    /// Allocates a name unique within this session, e.g. `3.in`.
    pub fn next_name(&self, suffix: &str) -> String {
        let n = self.names.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", n, suffix)
    }

    /// Stops every stage built from this handle at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn check_cancelled(&self) -> crate::Result<()> {
        if self.cancel.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
