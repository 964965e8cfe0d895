use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    command::{Command, CommandResult},
    engine::EngineHandle,
    error::{Error, Result},
    frame::{Frame, FrameFormat, StreamFrame},
    stage::{
        filter::{FilterOutput, GraphSlot},
        group_by_stream,
        normalizer::to_engine_frame,
        Component, FrameStage, StreamType, Transformer,
    },
    stream::{MediaType, StreamParameters},
};

const PLAY_SAMPLE_FORMAT: &str = "fltp";
const PLAY_PIXEL_FORMAT: &str = "rgba";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayOptions {
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: Option<u32>,
}

fn latch(latched: &mut Option<Error>, index: usize, err: anyhow::Error) {
    log::error!("play-normalizer: stream {}: {:#}", index, err);
    if latched.is_none() {
        *latched = Some(Error::stream(format!("converting stream {}: {:#}", index, err)));
    }
}

enum PlaySlot {
    Unconfigured,
    Passthrough,
    Convert(GraphSlot),
}

/// Prepares frames for playback: planar float audio at a fixed rate, RGBA
/// video. Hardware-native video is passed through untouched.
pub struct PlayNormalizer {
    handle: EngineHandle,
    upstream: Box<FrameStage>,
    options: PlayOptions,
    ptr: bool,
    streams: Vec<StreamParameters>,
    slots: Vec<PlaySlot>,
    pending: Vec<StreamFrame>,
    latched: Option<Error>,
    eof: bool,
    closed: bool,
}

impl PlayNormalizer {
    pub async fn open(
        handle: &EngineHandle,
        mut upstream: FrameStage,
        options: PlayOptions,
        ptr: bool,
    ) -> Result<Self> {
        if options.sample_rate == 0 {
            return Err(Error::build("play-normalizer needs a sample rate"));
        }
        let streams = upstream
            .streams()
            .await?
            .into_iter()
            .map(|mut params| {
                match params.media_type {
                    MediaType::Audio => {
                        params.format = PLAY_SAMPLE_FORMAT.to_string();
                        params.sample_rate = options.sample_rate;
                        if let Some(channels) = options.channels {
                            params.channels = channels;
                            params.channel_layout = 0;
                        }
                        params.time_base = crate::stream::Rational::new(1, options.sample_rate as i32);
                    }
                    MediaType::Video => params.format = PLAY_PIXEL_FORMAT.to_string(),
                    MediaType::Other => {}
                }
                params
            })
            .collect::<Vec<_>>();
        let slots = streams.iter().map(|_| PlaySlot::Unconfigured).collect();
        Ok(Self {
            handle: handle.clone(),
            upstream: Box::new(upstream),
            options,
            ptr,
            streams,
            slots,
            pending: Vec::new(),
            latched: None,
            eof: false,
            closed: false,
        })
    }

    fn target(&self, input: &FrameFormat) -> Option<FilterOutput> {
        match input.media_type {
            MediaType::Audio => {
                let same_channels = self.options.channels.is_none_or(|c| c == input.channels);
                if input.format == PLAY_SAMPLE_FORMAT
                    && input.sample_rate == self.options.sample_rate
                    && same_channels
                {
                    return None;
                }
                Some(FilterOutput {
                    format: Some(PLAY_SAMPLE_FORMAT.to_string()),
                    sample_rate: Some(self.options.sample_rate),
                    channels: self.options.channels,
                    channel_layout: self.options.channels.map(|_| 0),
                    ..Default::default()
                })
            }
            MediaType::Video if input.format != PLAY_PIXEL_FORMAT => Some(FilterOutput {
                format: Some(PLAY_PIXEL_FORMAT.to_string()),
                ..Default::default()
            }),
            _ => None,
        }
    }

    fn feed(&mut self, batch: Vec<StreamFrame>) {
        for (index, frames) in group_by_stream(batch) {
            if index >= self.slots.len() {
                continue;
            }
            if let Err(e) = self.convert(index, frames) {
                latch(&mut self.latched, index, e);
                break;
            }
        }
    }

    fn convert(&mut self, index: usize, frames: Vec<StreamFrame>) -> anyhow::Result<()> {
        let engine = self.handle.engine().clone();
        for unit in frames {
            let format = engine.frame_format(&unit.frame)?;
            let frame = match unit.frame {
                Frame::Native(native) if format.media_type == MediaType::Video => Frame::Native(native),
                frame => to_engine_frame(engine.as_ref(), frame, self.ptr)?,
            };

            if let PlaySlot::Unconfigured = self.slots[index] {
                self.slots[index] = if frame.is_native() {
                    PlaySlot::Passthrough
                } else {
                    match self.target(&format) {
                        Some(output) => {
                            let mut graph = GraphSlot::Unconfigured;
                            let description = match format.media_type {
                                MediaType::Audio => "aresample",
                                _ => "null",
                            };
                            graph.get_or_open(&self.handle, &frame, description, &output)?;
                            PlaySlot::Convert(graph)
                        }
                        None => PlaySlot::Passthrough,
                    }
                };
            }

            match &mut self.slots[index] {
                PlaySlot::Convert(GraphSlot::Configured(graph)) => {
                    let out = graph.filter(vec![frame], false, self.ptr)?;
                    self.pending
                        .extend(out.into_iter().map(|f| StreamFrame::new(index, f)));
                }
                _ => self.pending.push(StreamFrame::new(index, frame)),
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let PlaySlot::Convert(GraphSlot::Configured(graph)) = slot {
                match graph.filter(Vec::new(), true, self.ptr) {
                    Ok(out) => self
                        .pending
                        .extend(out.into_iter().map(|f| StreamFrame::new(index, f))),
                    Err(e) => latch(&mut self.latched, index, e),
                }
            }
        }
    }

    async fn pull(&mut self) -> Result<Option<Vec<StreamFrame>>> {
        loop {
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
                    self.finish();
                    self.eof = true;
                }
                Some(batch) if batch.is_empty() => return Ok(Some(Vec::new())),
                Some(batch) => self.feed(batch),
            }
        }
    }

    fn teardown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending.clear();
            self.slots.clear();
        }
    }
}

impl Transformer for PlayNormalizer {
    type Item = StreamFrame;

    fn component(&self) -> Component {
        Component::PlayNormalizer
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Frame
    }

    fn ptr(&self) -> bool {
        self.ptr
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        Box::pin(async move { Ok(self.streams.clone()) })
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<StreamFrame>>>> {
        Box::pin(async move {
            if self.closed {
                return Ok(None);
            }
            let res = self.pull().await;
            if !matches!(res, Ok(Some(_))) {
                self.teardown();
            }
            res
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

impl Drop for PlayNormalizer {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "play_normalizer_test.rs"]
mod play_normalizer_test;
