//! In-memory engine and hardware codec service for stage tests.
//!
//! Every resource the mock hands out is tracked by a [`Gauge`], so tests can
//! assert that teardown released everything.

use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use futures::{future::BoxFuture, Stream, StreamExt};

use crate::{
    config::PipelineConfig,
    engine::{
        DemuxContext, EncoderSettings, Engine, EngineHandle, FileWrite, FilterGraph, FilterSpec,
        MuxContext, MuxSettings, ReadOutcome, ReadStatus, SoftwareDecoder, SoftwareEncoder,
        WriteSink,
    },
    frame::{Frame, FrameData, FrameFormat, FramePtr, NativeFrame, Plane},
    hw::{DecodedFrame, EncodedChunk, HwCodecService, HwDecoder, HwEncoder, HwQueue, HwSink},
    input::InputFile,
    packet::{Packet, PacketData, PacketPtr, StreamPacket},
    stage::Transformer,
    stream::{MediaType, Rational, StreamParameters},
};

pub const PACKET_BYTES: usize = 16;
/// Spacing of mock packet timestamps, in microseconds.
pub const PACKET_STEP: i64 = 40_000;

#[derive(Clone, Default)]
pub struct Gauge(Arc<AtomicIsize>);

impl Gauge {
    pub fn get(&self) -> isize {
        self.0.load(Ordering::SeqCst)
    }

    fn track(&self) -> Tracked {
        self.0.fetch_add(1, Ordering::SeqCst);
        Tracked(self.clone())
    }
}

pub struct Tracked(Gauge);

impl Drop for Tracked {
    fn drop(&mut self) {
        (self.0).0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct Counters {
    pub ptrs: Gauge,
    pub native: Gauge,
    pub demuxers: Gauge,
    pub decoders: Gauge,
    pub encoders: Gauge,
    pub filters: Gauge,
    pub muxers: Gauge,
    pub hw_codecs: Gauge,
    pub flush_buffers: AtomicUsize,
    pub max_hw_queue: AtomicUsize,
    pub hw_submitted: AtomicUsize,
    pub seeks: Mutex<Vec<(Option<usize>, i64, i64, i64)>>,
    pub filter_specs: Mutex<Vec<FilterSpec>>,
    /// `"filter"` or `"encoder"`, once per call made with `fin`.
    pub fins: Mutex<Vec<&'static str>>,
}

impl Counters {
    /// Engine and hardware resources still alive.
    pub fn open_resources(&self) -> isize {
        self.demuxers.get()
            + self.decoders.get()
            + self.encoders.get()
            + self.filters.get()
            + self.muxers.get()
            + self.hw_codecs.get()
    }
}

pub fn video_stream() -> StreamParameters {
    StreamParameters {
        codec: "vp8".to_string(),
        media_type: MediaType::Video,
        format: "yuv420p".to_string(),
        width: 320,
        height: 240,
        time_base: Rational::MICROS,
        ..Default::default()
    }
}

pub fn audio_stream() -> StreamParameters {
    StreamParameters {
        codec: "opus".to_string(),
        media_type: MediaType::Audio,
        format: "s16".to_string(),
        sample_rate: 48000,
        channels: 2,
        channel_layout: 3,
        time_base: Rational::MICROS,
        ..Default::default()
    }
}

pub fn data_stream() -> StreamParameters {
    StreamParameters {
        codec: "bin_data".to_string(),
        media_type: MediaType::Other,
        time_base: Rational::MICROS,
        ..Default::default()
    }
}

pub fn frame_for(params: &StreamParameters, pts: Option<i64>) -> FrameData {
    let (nb_samples, plane) = match params.media_type {
        MediaType::Audio => (1024, (1024 * 2 * params.channels) as usize),
        _ => (0, (params.width * params.height) as usize),
    };
    FrameData {
        media_type: params.media_type,
        format: params.format.clone(),
        width: params.width,
        height: params.height,
        sample_rate: params.sample_rate,
        channels: params.channels,
        channel_layout: params.channel_layout,
        nb_samples,
        planes: vec![Plane {
            data: Bytes::from(vec![0u8; plane.min(64)]),
            linesize: params.width as usize,
        }],
        pts,
        time_base: Some(params.time_base),
        key: true,
    }
}

struct MockPacket {
    data: PacketData,
    _live: Tracked,
}

struct MockFrame {
    data: FrameData,
    _live: Tracked,
}

fn packet_data(packet: &Packet) -> anyhow::Result<PacketData> {
    match packet {
        Packet::Value(data) => Ok(data.clone()),
        Packet::Ptr(ptr) => ptr
            .downcast_ref::<MockPacket>()
            .map(|p| p.data.clone())
            .ok_or_else(|| anyhow::anyhow!("foreign packet pointer")),
    }
}

fn frame_data(frame: &Frame) -> anyhow::Result<FrameData> {
    match frame {
        Frame::Value(data) => Ok(data.clone()),
        Frame::Ptr(ptr) => ptr
            .downcast_ref::<MockFrame>()
            .map(|f| f.data.clone())
            .ok_or_else(|| anyhow::anyhow!("foreign frame pointer")),
        Frame::Native(native) => native.to_frame_data(),
    }
}

#[derive(Clone)]
pub struct MockEngine {
    pub counters: Arc<Counters>,
    streams: Vec<StreamParameters>,
    packets_per_stream: usize,
    fail_decode_after: Option<usize>,
    fail_decoders: bool,
    fail_seek: bool,
    fail_filter: Option<MediaType>,
    fail_mux_after: Option<usize>,
    encoder_frame_size: u32,
}

impl MockEngine {
    pub fn new(streams: Vec<StreamParameters>) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            streams,
            packets_per_stream: 10,
            fail_decode_after: None,
            fail_decoders: false,
            fail_seek: false,
            fail_filter: None,
            fail_mux_after: None,
            encoder_frame_size: 0,
        }
    }

    pub fn with_packets(mut self, n: usize) -> Self {
        self.packets_per_stream = n;
        self
    }

    /// Software decoders fail once they have decoded `n` packets.
    pub fn failing_decode_after(mut self, n: usize) -> Self {
        self.fail_decode_after = Some(n);
        self
    }

    pub fn failing_decoders(mut self) -> Self {
        self.fail_decoders = true;
        self
    }

    pub fn failing_seek(mut self) -> Self {
        self.fail_seek = true;
        self
    }

    /// Filter graphs producing `media_type` fail on every frame.
    pub fn failing_filter(mut self, media_type: MediaType) -> Self {
        self.fail_filter = Some(media_type);
        self
    }

    /// Muxers fail once they have written `n` packets.
    pub fn failing_mux_after(mut self, n: usize) -> Self {
        self.fail_mux_after = Some(n);
        self
    }

    pub fn with_encoder_frame_size(mut self, frame_size: u32) -> Self {
        self.encoder_frame_size = frame_size;
        self
    }

    fn wrap_frame(&self, data: FrameData, ptr: bool) -> anyhow::Result<Frame> {
        if ptr {
            Ok(Frame::Ptr(self.frame_to_ptr(data)?))
        } else {
            Ok(Frame::Value(data))
        }
    }
}

/// Handle with a small demux chunk so containers take several pulls.
pub fn handle(engine: &MockEngine) -> EngineHandle {
    let _ = env_logger::builder().is_test(true).try_init();
    EngineHandle::new(Arc::new(engine.clone())).with_config(PipelineConfig {
        demux_chunk_size: 2 * PACKET_BYTES,
        ..Default::default()
    })
}

pub fn handle_with_hw(engine: &MockEngine, hw: MockHw) -> EngineHandle {
    handle(engine).with_hw(Arc::new(hw))
}

/// Pulls `stage` to the end, collecting every batch including markers.
pub async fn drain<T: Transformer>(stage: &mut T) -> crate::Result<Vec<Vec<T::Item>>> {
    let mut batches = Vec::new();
    while let Some(batch) = stage.next_batch().await? {
        batches.push(batch);
    }
    Ok(batches)
}

pub fn input() -> InputFile {
    InputFile::from(vec![0u8; 64])
}

struct MockDemux {
    engine: MockEngine,
    next: usize,
    _live: Tracked,
}

impl MockDemux {
    fn total(&self) -> usize {
        self.engine.packets_per_stream * self.engine.streams.len()
    }
}

impl DemuxContext for MockDemux {
    fn streams(&self) -> Vec<StreamParameters> {
        self.engine.streams.clone()
    }

    fn read_packets(&mut self, limit: usize, ptr: bool) -> anyhow::Result<ReadOutcome> {
        let mut packets = Vec::new();
        let mut bytes = 0;
        while bytes < limit && self.next < self.total() {
            let nb = self.engine.streams.len();
            let (n, stream) = (self.next / nb, self.next % nb);
            let data = PacketData {
                data: Bytes::from(vec![stream as u8; PACKET_BYTES]),
                pts: Some(n as i64 * PACKET_STEP),
                dts: Some(n as i64 * PACKET_STEP),
                duration: PACKET_STEP,
                key: n % 5 == 0,
                time_base: Rational::MICROS,
            };
            let packet = if ptr {
                Packet::Ptr(self.engine.packet_to_ptr(data)?)
            } else {
                Packet::Value(data)
            };
            packets.push(StreamPacket::new(stream, packet));
            bytes += PACKET_BYTES;
            self.next += 1;
        }
        let status = if self.next >= self.total() {
            ReadStatus::Eof
        } else {
            ReadStatus::Ok
        };
        Ok(ReadOutcome { packets, status })
    }

    fn seek(&mut self, stream: Option<usize>, min: i64, ts: i64, max: i64) -> anyhow::Result<()> {
        if self.engine.fail_seek {
            anyhow::bail!("seek not supported");
        }
        self.engine.counters.seeks.lock().unwrap().push((stream, min, ts, max));
        let n = (ts.max(0) / PACKET_STEP) as usize;
        self.next = (n * self.engine.streams.len()).min(self.total());
        Ok(())
    }
}

struct MockDecoder {
    engine: MockEngine,
    params: StreamParameters,
    decoded: usize,
    // one frame of reorder delay
    held: Option<FrameData>,
    _live: Tracked,
}

impl SoftwareDecoder for MockDecoder {
    fn decode(&mut self, packets: Vec<Packet>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Frame>> {
        let mut out = Vec::new();
        for packet in packets {
            if self.engine.fail_decode_after.is_some_and(|n| self.decoded >= n) {
                anyhow::bail!("corrupt packet");
            }
            let data = packet_data(&packet)?;
            self.decoded += 1;
            let frame = frame_for(&self.params, data.pts);
            if let Some(held) = self.held.replace(frame) {
                out.push(self.engine.wrap_frame(held, ptr)?);
            }
        }
        if fin {
            if let Some(held) = self.held.take() {
                out.push(self.engine.wrap_frame(held, ptr)?);
            }
        }
        Ok(out)
    }

    fn flush_buffers(&mut self) {
        self.held = None;
        self.engine.counters.flush_buffers.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockEncoder {
    engine: MockEngine,
    params: StreamParameters,
    _live: Tracked,
}

impl SoftwareEncoder for MockEncoder {
    fn parameters(&self) -> StreamParameters {
        self.params.clone()
    }

    fn frame_size(&self) -> u32 {
        self.params.frame_size
    }

    fn encode(&mut self, frames: Vec<Frame>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Packet>> {
        if fin {
            self.engine.counters.fins.lock().unwrap().push("encoder");
        }
        frames
            .iter()
            .map(|frame| {
                let data = frame_data(frame)?;
                let packet = PacketData {
                    data: Bytes::from(vec![0xE0; 8]),
                    pts: data.pts,
                    dts: data.pts,
                    duration: 0,
                    key: true,
                    time_base: Rational::MICROS,
                };
                if ptr {
                    Ok(Packet::Ptr(self.engine.packet_to_ptr(packet)?))
                } else {
                    Ok(Packet::Value(packet))
                }
            })
            .collect()
    }
}

struct MockFilter {
    engine: MockEngine,
    output: FrameFormat,
    _live: Tracked,
}

impl FilterGraph for MockFilter {
    fn filter(&mut self, frames: Vec<Frame>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Frame>> {
        if fin {
            self.engine.counters.fins.lock().unwrap().push("filter");
        }
        if !frames.is_empty() && self.engine.fail_filter == Some(self.output.media_type) {
            anyhow::bail!("{:?} graph failed", self.output.media_type);
        }
        frames
            .iter()
            .map(|frame| {
                let mut data = frame_data(frame)?;
                data.media_type = self.output.media_type;
                data.format = self.output.format.clone();
                data.width = self.output.width;
                data.height = self.output.height;
                data.sample_rate = self.output.sample_rate;
                data.channels = self.output.channels;
                data.channel_layout = self.output.channel_layout;
                data.time_base = self.output.time_base;
                self.engine.wrap_frame(data, ptr)
            })
            .collect()
    }
}

struct MockMuxer {
    sink: WriteSink,
    random_access: bool,
    position: u64,
    written: usize,
    fail_after: Option<usize>,
    _live: Tracked,
}

impl MockMuxer {
    fn write(&mut self, data: &[u8]) {
        let _ = self.sink.send(FileWrite {
            position: self.position,
            data: Bytes::copy_from_slice(data),
        });
        self.position += data.len() as u64;
    }
}

impl MuxContext for MockMuxer {
    fn write_packets(&mut self, packets: Vec<StreamPacket>) -> anyhow::Result<()> {
        for packet in packets {
            if self.fail_after.is_some_and(|n| self.written >= n) {
                anyhow::bail!("disk full");
            }
            let data = packet_data(&packet.packet)?;
            self.write(&data.data);
            self.written += 1;
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> anyhow::Result<()> {
        self.write(b"TRL");
        if self.random_access {
            let _ = self.sink.send(FileWrite {
                position: 0,
                data: Bytes::from_static(b"HDR"),
            });
        }
        Ok(())
    }
}

impl Engine for MockEngine {
    fn open_demuxer(&self, _name: &str, _input: InputFile) -> anyhow::Result<Box<dyn DemuxContext>> {
        Ok(Box::new(MockDemux {
            engine: self.clone(),
            next: 0,
            _live: self.counters.demuxers.track(),
        }))
    }

    fn open_decoder(&self, params: &StreamParameters) -> anyhow::Result<Box<dyn SoftwareDecoder>> {
        if self.fail_decoders {
            anyhow::bail!("no decoder for {}", params.codec);
        }
        Ok(Box::new(MockDecoder {
            engine: self.clone(),
            params: params.clone(),
            decoded: 0,
            held: None,
            _live: self.counters.decoders.track(),
        }))
    }

    fn open_encoder(&self, settings: &EncoderSettings) -> anyhow::Result<Box<dyn SoftwareEncoder>> {
        let mut params = settings.fallback_parameters();
        if settings.media_type == MediaType::Audio {
            params.frame_size = self.encoder_frame_size;
        }
        params.extradata = Some(Bytes::from_static(b"mock"));
        Ok(Box::new(MockEncoder {
            engine: self.clone(),
            params,
            _live: self.counters.encoders.track(),
        }))
    }

    fn open_filter(&self, spec: &FilterSpec) -> anyhow::Result<Box<dyn FilterGraph>> {
        self.counters.filter_specs.lock().unwrap().push(spec.clone());
        Ok(Box::new(MockFilter {
            engine: self.clone(),
            output: spec.output.clone(),
            _live: self.counters.filters.track(),
        }))
    }

    fn open_muxer(&self, settings: &MuxSettings, sink: WriteSink) -> anyhow::Result<Box<dyn MuxContext>> {
        let mut muxer = MockMuxer {
            sink,
            random_access: settings.random_access,
            position: 0,
            written: 0,
            fail_after: self.fail_mux_after,
            _live: self.counters.muxers.track(),
        };
        muxer.write(b"HDR");
        Ok(Box::new(muxer))
    }

    fn frame_to_ptr(&self, frame: FrameData) -> anyhow::Result<FramePtr> {
        Ok(FramePtr::new(MockFrame {
            data: frame,
            _live: self.counters.ptrs.track(),
        }))
    }

    fn frame_from_ptr(&self, frame: &FramePtr) -> anyhow::Result<FrameData> {
        frame
            .downcast_ref::<MockFrame>()
            .map(|f| f.data.clone())
            .ok_or_else(|| anyhow::anyhow!("foreign frame pointer"))
    }

    fn ptr_frame_format(&self, frame: &FramePtr) -> anyhow::Result<FrameFormat> {
        Ok(self.frame_from_ptr(frame)?.frame_format())
    }

    fn packet_to_ptr(&self, packet: PacketData) -> anyhow::Result<PacketPtr> {
        Ok(PacketPtr::new(MockPacket {
            data: packet,
            _live: self.counters.ptrs.track(),
        }))
    }

    fn packet_from_ptr(&self, packet: &PacketPtr) -> anyhow::Result<PacketData> {
        packet
            .downcast_ref::<MockPacket>()
            .map(|p| p.data.clone())
            .ok_or_else(|| anyhow::anyhow!("foreign packet pointer"))
    }
}

pub struct MockNativeFrame {
    format: FrameFormat,
    pts: Option<i64>,
    broken: bool,
    _live: Tracked,
}

/// A native frame whose bridge to engine layout fails.
pub fn broken_native_frame(engine: &MockEngine, params: &StreamParameters) -> Frame {
    Frame::Native(Box::new(MockNativeFrame {
        format: frame_for(params, None).frame_format(),
        pts: None,
        broken: true,
        _live: engine.counters.native.track(),
    }))
}

impl NativeFrame for MockNativeFrame {
    fn frame_format(&self) -> FrameFormat {
        self.format.clone()
    }

    fn pts(&self) -> Option<i64> {
        self.pts
    }

    fn to_frame_data(&self) -> anyhow::Result<FrameData> {
        if self.broken {
            anyhow::bail!("device lost");
        }
        let params = StreamParameters {
            media_type: self.format.media_type,
            format: self.format.format.clone(),
            width: self.format.width,
            height: self.format.height,
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
            channel_layout: self.format.channel_layout,
            time_base: self.format.time_base.unwrap_or_default(),
            ..Default::default()
        };
        Ok(frame_for(&params, self.pts))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hardware service that accepts video only.
#[derive(Clone)]
pub struct MockHw {
    counters: Arc<Counters>,
    reject: Arc<AtomicBool>,
}

impl MockHw {
    pub fn new(engine: &MockEngine) -> Self {
        Self {
            counters: engine.counters.clone(),
            reject: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Configuration fails instead of reporting "unsupported".
    pub fn rejecting(self) -> Self {
        self.reject.store(true, Ordering::SeqCst);
        self
    }
}

struct MockHwCodec<I, O> {
    counters: Arc<Counters>,
    queue: VecDeque<I>,
    sink: HwSink<O>,
    convert: Box<dyn FnMut(I) -> anyhow::Result<O> + Send>,
    _live: Tracked,
}

impl<I: Send, O: Send> MockHwCodec<I, O> {
    fn submit(&mut self, unit: I) {
        self.queue.push_back(unit);
        self.counters.hw_submitted.fetch_add(1, Ordering::SeqCst);
        self.counters
            .max_hw_queue
            .fetch_max(self.queue.len(), Ordering::SeqCst);
    }

    fn process_one(&mut self) {
        if let Some(unit) = self.queue.pop_front() {
            match (self.convert)(unit) {
                Ok(out) => self.sink.output(out),
                Err(e) => self.sink.error(e),
            }
        }
    }
}

impl<I: Send, O: Send> HwQueue for MockHwCodec<I, O> {
    fn queue_size(&self) -> usize {
        self.queue.len()
    }

    fn dequeued(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.process_one();
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            while !self.queue.is_empty() {
                self.process_one();
            }
            Ok(())
        })
    }
}

impl HwDecoder for MockHwCodec<Packet, DecodedFrame> {
    fn decode(&mut self, packet: Packet) -> anyhow::Result<()> {
        self.submit(packet);
        Ok(())
    }
}

impl HwEncoder for MockHwCodec<Frame, EncodedChunk> {
    fn encode(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.submit(frame);
        Ok(())
    }
}

impl HwCodecService for MockHw {
    fn open_decoder<'a>(
        &'a self,
        params: &'a StreamParameters,
        sink: HwSink<DecodedFrame>,
    ) -> BoxFuture<'a, anyhow::Result<Option<Box<dyn HwDecoder>>>> {
        Box::pin(async move {
            if !params.is_video() {
                return Ok(None);
            }
            if self.reject.load(Ordering::SeqCst) {
                anyhow::bail!("device busy");
            }
            let counters = self.counters.clone();
            let format = FrameFormat {
                media_type: MediaType::Video,
                format: "nv12".to_string(),
                width: params.width,
                height: params.height,
                time_base: Some(params.time_base),
                ..Default::default()
            };
            let convert = move |packet: Packet| -> anyhow::Result<DecodedFrame> {
                let data = packet_data(&packet)?;
                Ok(Box::new(MockNativeFrame {
                    format: format.clone(),
                    pts: data.pts,
                    broken: false,
                    _live: counters.native.track(),
                }))
            };
            let decoder: Box<dyn HwDecoder> = Box::new(MockHwCodec {
                counters: self.counters.clone(),
                queue: VecDeque::new(),
                sink,
                convert: Box::new(convert),
                _live: self.counters.hw_codecs.track(),
            });
            Ok(Some(decoder))
        })
    }

    fn open_encoder<'a>(
        &'a self,
        settings: &'a EncoderSettings,
        sink: HwSink<EncodedChunk>,
    ) -> BoxFuture<'a, anyhow::Result<Option<Box<dyn HwEncoder>>>> {
        Box::pin(async move {
            if settings.media_type != MediaType::Video {
                return Ok(None);
            }
            if self.reject.load(Ordering::SeqCst) {
                anyhow::bail!("device busy");
            }
            let mut params = Some(StreamParameters {
                codec: settings.codec.clone(),
                media_type: MediaType::Video,
                width: settings.width,
                height: settings.height,
                extradata: Some(Bytes::from_static(b"hw")),
                ..Default::default()
            });
            let convert = move |frame: Frame| -> anyhow::Result<EncodedChunk> {
                let pts = match &frame {
                    Frame::Native(native) => native.pts(),
                    other => frame_data(other)?.pts,
                };
                Ok(EncodedChunk {
                    packet: PacketData {
                        data: Bytes::from_static(b"hwpacket"),
                        pts,
                        dts: pts,
                        duration: 0,
                        key: true,
                        time_base: Rational::MICROS,
                    },
                    parameters: params.take(),
                })
            };
            let encoder: Box<dyn HwEncoder> = Box::new(MockHwCodec {
                counters: self.counters.clone(),
                queue: VecDeque::new(),
                sink,
                convert: Box::new(convert),
                _live: self.counters.hw_codecs.track(),
            });
            Ok(Some(encoder))
        })
    }
}

/// Frames of `params` with increasing timestamps, in batches of `per_batch`.
pub fn frame_batches(
    params: &StreamParameters,
    batches: usize,
    per_batch: usize,
) -> impl Stream<Item = crate::Result<Vec<Frame>>> + Send + 'static {
    let params = params.clone();
    futures::stream::iter(0..batches).map(move |b| {
        Ok((0..per_batch)
            .map(|i| {
                let pts = ((b * per_batch + i) as i64) * PACKET_STEP;
                Frame::Value(frame_for(&params, Some(pts)))
            })
            .collect())
    })
}

pub fn pts_of(frame: &Frame) -> Option<i64> {
    match frame {
        Frame::Native(native) => native.pts(),
        other => frame_data(other).ok().and_then(|d| d.pts),
    }
}

pub fn format_of(frame: &Frame) -> FrameFormat {
    match frame {
        Frame::Native(native) => native.frame_format(),
        other => frame_data(other).map(|d| d.frame_format()).unwrap_or_default(),
    }
}
