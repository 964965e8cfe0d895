use std::collections::{BTreeMap, VecDeque};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    command::{Command, CommandResult},
    engine::{EncoderSettings, EngineHandle, SoftwareEncoder},
    error::{Error, Result},
    frame::{Frame, FrameFormat, StreamFrame},
    hw::{self, EncodedChunk, HwEncoder, HwOutput, HwSink},
    packet::{Packet, StreamPacket},
    stage::{
        filter::{FilterOutput, GraphSlot},
        group_by_stream,
        normalizer::to_engine_frame,
        wait_for_room, Component, FrameStage, StreamType, Transformer,
    },
    stream::{MediaType, Rational, StreamParameters},
};

const DEFAULT_PIXEL_FORMAT: &str = "yuv420p";

/// Encoder request for one media type. Zero sizes and rates follow the input.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
    pub bit_rate: u64,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_rate: Option<Rational>,
    pub options: BTreeMap<String, String>,
}

impl EncoderConfig {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            ..Default::default()
        }
    }

    pub fn with_bit_rate(mut self, bit_rate: u64) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    pub fn settings(&self, input: &StreamParameters) -> EncoderSettings {
        let channels = if self.channels == 0 {
            input.channels
        } else {
            self.channels
        };
        EncoderSettings {
            media_type: input.media_type,
            codec: self.codec.clone(),
            width: if self.width == 0 { input.width } else { self.width },
            height: if self.height == 0 { input.height } else { self.height },
            format: self.format.clone().unwrap_or_default(),
            sample_rate: if self.sample_rate == 0 {
                input.sample_rate
            } else {
                self.sample_rate
            },
            channels,
            channel_layout: if channels == input.channels {
                input.channel_layout
            } else {
                0
            },
            bit_rate: self.bit_rate,
            frame_rate: self.frame_rate.or(input.frame_rate),
            time_base: Rational::MICROS,
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderOptions {
    pub video: Option<EncoderConfig>,
    pub audio: Option<EncoderConfig>,
}

enum EncoderSlot {
    Hardware {
        encoder: Box<dyn HwEncoder>,
        output: usize,
    },
    Software {
        encoder: Box<dyn SoftwareEncoder>,
        adapter: GraphSlot,
        output: usize,
    },
    Dropped,
}

impl EncoderSlot {
    fn output(&self) -> Option<usize> {
        match self {
            EncoderSlot::Hardware { output, .. } | EncoderSlot::Software { output, .. } => {
                Some(*output)
            }
            EncoderSlot::Dropped => None,
        }
    }

    async fn open(
        handle: &EngineHandle,
        index: usize,
        output: usize,
        settings: &EncoderSettings,
        sink: HwSink<EncodedChunk>,
    ) -> Result<Self> {
        if let Some(hw) = handle.hw() {
            match hw.open_encoder(settings, sink).await {
                Ok(Some(encoder)) => {
                    log::info!("encoder: stream {} uses hardware {}", index, settings.codec);
                    return Ok(EncoderSlot::Hardware { encoder, output });
                }
                Ok(None) => log::info!("encoder: no hardware support for {}", settings.codec),
                Err(e) => log::warn!(
                    "encoder: hardware rejected {}: {:#}, falling back to software",
                    settings.codec,
                    e
                ),
            }
        }

        let mut settings = settings.clone();
        if settings.media_type == MediaType::Video && settings.format.is_empty() {
            settings.format = DEFAULT_PIXEL_FORMAT.to_string();
        }
        let encoder = handle
            .engine()
            .open_encoder(&settings)
            .map_err(|e| Error::BackendConfig {
                stream: index,
                message: format!("{:#}", e),
            })?;
        log::info!("encoder: stream {} uses software {}", index, settings.codec);
        Ok(EncoderSlot::Software {
            encoder,
            adapter: GraphSlot::Unconfigured,
            output,
        })
    }
}

/// Adapter from whatever the first frame looks like to what the encoder takes.
fn adapter_for(input: &FrameFormat, params: &StreamParameters, frame_size: u32) -> (String, FilterOutput) {
    match input.media_type {
        MediaType::Audio => (
            "aresample".to_string(),
            FilterOutput {
                format: Some(params.format.clone()),
                sample_rate: Some(params.sample_rate),
                channels: Some(params.channels),
                channel_layout: Some(params.channel_layout),
                time_base: Some(Rational::new(1, params.sample_rate.max(1) as i32)),
                frame_size: Some(frame_size),
                ..Default::default()
            },
        ),
        _ => {
            let description = if input.width != params.width || input.height != params.height {
                format!("scale={}:{}", params.width, params.height)
            } else {
                "null".to_string()
            };
            (
                description,
                FilterOutput {
                    format: Some(params.format.clone()),
                    width: Some(params.width),
                    height: Some(params.height),
                    time_base: Some(Rational::MICROS),
                    ..Default::default()
                },
            )
        }
    }
}

fn latch(latched: &mut Option<Error>, index: usize, err: impl std::fmt::Display) {
    log::error!("encoder: stream {}: {:#}", index, err);
    if latched.is_none() {
        *latched = Some(Error::stream(format!("encoding stream {}: {:#}", index, err)));
    }
}

/// Frames in, packets out.
///
/// Output parameters of hardware encoders are only known once they produce
/// their first chunk, so [`Transformer::streams`] may read ahead and buffer
/// encoded batches until every output substream is described.
pub struct Encoder {
    handle: EngineHandle,
    upstream: Box<FrameStage>,
    ptr: bool,
    slots: Vec<EncoderSlot>,
    settings: Vec<EncoderSettings>,
    out_params: Vec<Option<StreamParameters>>,
    hw_rx: UnboundedReceiver<HwOutput<EncodedChunk>>,
    pending: Vec<StreamPacket>,
    ahead: VecDeque<Vec<StreamPacket>>,
    latched: Option<Error>,
    eof: bool,
    closed: bool,
}

impl Encoder {
    pub async fn open(
        handle: &EngineHandle,
        mut upstream: FrameStage,
        options: EncoderOptions,
        ptr: bool,
    ) -> Result<Self> {
        let input_streams = upstream.streams().await?;
        let (tx, hw_rx) = hw::output_channel();

        let mut slots = Vec::with_capacity(input_streams.len());
        let mut settings = Vec::new();
        let mut out_params = Vec::new();
        for (i, params) in input_streams.iter().enumerate() {
            handle.check_cancelled()?;
            let config = match params.media_type {
                MediaType::Video => options.video.as_ref(),
                MediaType::Audio => options.audio.as_ref(),
                MediaType::Other => None,
            };
            let Some(config) = config else {
                log::info!("encoder: stream {} ({:?}) dropped", i, params.media_type);
                slots.push(EncoderSlot::Dropped);
                continue;
            };

            let resolved = config.settings(params);
            let output = settings.len();
            let slot = EncoderSlot::open(handle, i, output, &resolved, HwSink::new(i, tx.clone())).await?;
            out_params.push(match &slot {
                EncoderSlot::Software { encoder, .. } => Some(encoder.parameters()),
                _ => None,
            });
            settings.push(resolved);
            slots.push(slot);
        }

        Ok(Self {
            handle: handle.clone(),
            upstream: Box::new(upstream),
            ptr,
            slots,
            settings,
            out_params,
            hw_rx,
            pending: Vec::new(),
            ahead: VecDeque::new(),
            latched: None,
            eof: false,
            closed: false,
        })
    }

    fn packet(&self, packet: crate::packet::PacketData) -> anyhow::Result<Packet> {
        if self.ptr {
            Ok(Packet::Ptr(self.handle.engine().packet_to_ptr(packet)?))
        } else {
            Ok(Packet::Value(packet))
        }
    }

    fn drain_hw(&mut self) {
        while let Ok(out) = self.hw_rx.try_recv() {
            let Some(output) = self.slots.get(out.stream_index).and_then(EncoderSlot::output) else {
                continue;
            };
            match out.result {
                Ok(chunk) => {
                    if let Some(mut params) = chunk.parameters {
                        if self.out_params[output].is_none() {
                            params.time_base = Rational::MICROS;
                            self.out_params[output] = Some(params);
                        }
                    }
                    match self.packet(chunk.packet) {
                        Ok(packet) => self.pending.push(StreamPacket::new(output, packet)),
                        Err(e) => latch(&mut self.latched, out.stream_index, e),
                    }
                }
                Err(e) => latch(&mut self.latched, out.stream_index, e),
            }
        }
    }

    async fn feed(&mut self, batch: Vec<StreamFrame>) -> Result<()> {
        let Self {
            handle,
            slots,
            out_params,
            pending,
            latched,
            ptr,
            ..
        } = self;
        let engine = handle.engine().clone();

        for (index, frames) in group_by_stream(batch) {
            if latched.is_some() {
                break;
            }
            match slots.get_mut(index) {
                Some(EncoderSlot::Software {
                    encoder,
                    adapter,
                    output,
                }) => {
                    let res = (|| -> anyhow::Result<Vec<Packet>> {
                        let frames = frames
                            .into_iter()
                            .map(|f| to_engine_frame(engine.as_ref(), f.frame, true))
                            .collect::<anyhow::Result<Vec<Frame>>>()?;
                        let Some(first) = frames.first() else {
                            return Ok(Vec::new());
                        };
                        if let GraphSlot::Unconfigured = adapter {
                            let input = engine.frame_format(first)?;
                            let params = out_params[*output]
                                .clone()
                                .ok_or_else(|| anyhow::anyhow!("encoder parameters unknown"))?;
                            let (description, target) =
                                adapter_for(&input, &params, encoder.frame_size());
                            adapter.get_or_open(handle, first, &description, &target)?;
                        }
                        let GraphSlot::Configured(graph) = adapter else {
                            return Ok(Vec::new());
                        };
                        let frames = graph.filter(frames, false, true)?;
                        encoder.encode(frames, false, *ptr)
                    })();
                    match res {
                        Ok(packets) => pending
                            .extend(packets.into_iter().map(|p| StreamPacket::new(*output, p))),
                        Err(e) => latch(latched, index, e),
                    }
                }
                Some(EncoderSlot::Hardware { encoder, .. }) => {
                    for unit in frames {
                        wait_for_room(&mut **encoder, handle).await?;
                        if let Err(e) = encoder.encode(unit.frame) {
                            latch(latched, index, e);
                            break;
                        }
                    }
                }
                Some(EncoderSlot::Dropped) | None => {}
            }
        }
        Ok(())
    }

    /// End of input: per substream, drain the adapter, then the encoder.
    async fn finish(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                EncoderSlot::Software {
                    encoder,
                    adapter,
                    output,
                } => {
                    let res = (|| -> anyhow::Result<Vec<Packet>> {
                        let mut packets = Vec::new();
                        if let GraphSlot::Configured(graph) = adapter {
                            let tail = graph.filter(Vec::new(), true, true)?;
                            packets.extend(encoder.encode(tail, false, self.ptr)?);
                        }
                        packets.extend(encoder.encode(Vec::new(), true, self.ptr)?);
                        Ok(packets)
                    })();
                    match res {
                        Ok(packets) => self
                            .pending
                            .extend(packets.into_iter().map(|p| StreamPacket::new(*output, p))),
                        Err(e) => latch(&mut self.latched, index, e),
                    }
                }
                EncoderSlot::Hardware { encoder, .. } => {
                    if let Err(e) = encoder.flush().await {
                        latch(&mut self.latched, index, e);
                    }
                }
                EncoderSlot::Dropped => {}
            }
        }
        self.drain_hw();

        for (output, params) in self.out_params.iter_mut().enumerate() {
            if params.is_none() {
                log::warn!("encoder: output {} produced nothing, using configured parameters", output);
                *params = Some(self.settings[output].fallback_parameters());
            }
        }
    }

    async fn pull(&mut self) -> Result<Option<Vec<StreamPacket>>> {
        loop {
            self.drain_hw();
            if !self.pending.is_empty() {
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
            if let Some(e) = self.latched.take() {
                return Err(e);
            }
            if self.eof {
                return Ok(None);
            }
            self.handle.check_cancelled()?;

            match self.upstream.next_batch().await? {
                None => {
                    self.finish().await;
                    self.eof = true;
                }
                Some(batch) if batch.is_empty() => return Ok(Some(Vec::new())),
                Some(batch) => self.feed(batch).await?,
            }
        }
    }

    async fn fill(&mut self) -> Result<Option<Vec<StreamPacket>>> {
        if self.closed {
            return Ok(None);
        }
        let res = self.pull().await;
        if !matches!(res, Ok(Some(_))) {
            self.teardown();
        }
        res
    }

    fn teardown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending.clear();
            self.slots.clear();
            log::info!("encoder: closed");
        }
    }
}

impl Transformer for Encoder {
    type Item = StreamPacket;

    fn component(&self) -> Component {
        Component::Encoder
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Packet
    }

    fn ptr(&self) -> bool {
        self.ptr
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        Box::pin(async move {
            while self.out_params.iter().any(Option::is_none) {
                match self.fill().await? {
                    Some(batch) => self.ahead.push_back(batch),
                    None => break,
                }
            }
            self.out_params
                .iter()
                .map(|p| {
                    p.clone()
                        .ok_or_else(|| Error::stream("encoder closed before its parameters were known"))
                })
                .collect()
        })
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<StreamPacket>>>> {
        Box::pin(async move {
            if let Some(batch) = self.ahead.pop_front() {
                return Ok(Some(batch));
            }
            self.fill().await
        })
    }

    fn apply_commands<'a>(
        &'a mut self,
        commands: &'a [Command],
        results: &'a mut [CommandResult],
    ) -> BoxFuture<'a, ()> {
        self.upstream.apply_commands(commands, results)
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
