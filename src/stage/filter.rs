use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    command::{Command, CommandResult},
    engine::{EngineHandle, FilterGraph, FilterSpec},
    error::{Error, Result},
    frame::{Frame, FrameFormat, StreamFrame},
    stage::{group_by_stream, Component, FrameStage, StreamType, Transformer},
    stream::{MediaType, Rational, StreamParameters},
};

/// Output overrides of a filter graph; unset fields follow the input.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterOutput {
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub channel_layout: Option<u64>,
    pub time_base: Option<Rational>,
    pub frame_size: Option<u32>,
}

impl FilterOutput {
    pub fn resolve(&self, input: &FrameFormat) -> (FrameFormat, u32) {
        let mut out = input.clone();
        if let Some(format) = &self.format {
            out.format = format.clone();
        }
        out.width = self.width.unwrap_or(out.width);
        out.height = self.height.unwrap_or(out.height);
        out.sample_rate = self.sample_rate.unwrap_or(out.sample_rate);
        out.channels = self.channels.unwrap_or(out.channels);
        out.channel_layout = self.channel_layout.unwrap_or(out.channel_layout);
        out.time_base = Some(match (self.time_base, input.media_type) {
            (Some(tb), _) => tb,
            (None, MediaType::Audio) if out.sample_rate > 0 => Rational::new(1, out.sample_rate as i32),
            (None, _) => input.time_base.unwrap_or(Rational::MICROS),
        });
        (out, self.frame_size.unwrap_or(0))
    }

    fn apply(&self, mut params: StreamParameters) -> StreamParameters {
        if let Some(format) = &self.format {
            params.format = format.clone();
        }
        params.width = self.width.unwrap_or(params.width);
        params.height = self.height.unwrap_or(params.height);
        params.sample_rate = self.sample_rate.unwrap_or(params.sample_rate);
        params.channels = self.channels.unwrap_or(params.channels);
        params.channel_layout = self.channel_layout.unwrap_or(params.channel_layout);
        if let Some(time_base) = self.time_base {
            params.time_base = time_base;
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterOptions {
    pub video_filters: String,
    pub audio_filters: String,
    pub video_output: Option<FilterOutput>,
    pub audio_output: Option<FilterOutput>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            video_filters: "null".to_string(),
            audio_filters: "aresample".to_string(),
            video_output: None,
            audio_output: None,
        }
    }
}

impl FilterOptions {
    fn for_type(&self, media_type: MediaType) -> Option<(&str, FilterOutput)> {
        match media_type {
            MediaType::Video => Some((
                self.video_filters.as_str(),
                self.video_output.clone().unwrap_or_default(),
            )),
            MediaType::Audio => Some((
                self.audio_filters.as_str(),
                self.audio_output.clone().unwrap_or_default(),
            )),
            MediaType::Other => None,
        }
    }
}

/// Per-substream graph, configured by the first frame seen on the substream.
pub(crate) enum GraphSlot {
    Unconfigured,
    Configured(Box<dyn FilterGraph>),
}

impl GraphSlot {
    /// Returns the graph, building it from `first` if needed.
    pub(crate) fn get_or_open(
        &mut self,
        handle: &EngineHandle,
        first: &Frame,
        description: &str,
        output: &FilterOutput,
    ) -> anyhow::Result<&mut Box<dyn FilterGraph>> {
        if let GraphSlot::Unconfigured = self {
            let engine = handle.engine();
            let input = engine.frame_format(first)?;
            let (output, frame_size) = output.resolve(&input);
            log::debug!("filter graph {:?}: {:?} -> {:?}", description, input, output);
            let graph = engine.open_filter(&FilterSpec {
                description: description.to_string(),
                input,
                output,
                frame_size,
            })?;
            *self = GraphSlot::Configured(graph);
        }
        match self {
            GraphSlot::Configured(graph) => Ok(graph),
            GraphSlot::Unconfigured => Err(anyhow::anyhow!("filter graph not configured")),
        }
    }
}

fn latch(latched: &mut Option<Error>, index: usize, err: anyhow::Error) {
    log::error!("filter: stream {}: {:#}", index, err);
    if latched.is_none() {
        *latched = Some(Error::stream(format!("filtering stream {}: {:#}", index, err)));
    }
}

/// Runs engine filter graphs over engine frames, one graph per substream.
pub struct Filter {
    handle: EngineHandle,
    upstream: Box<FrameStage>,
    options: FilterOptions,
    ptr: bool,
    streams: Vec<StreamParameters>,
    slots: Vec<GraphSlot>,
    pending: Vec<StreamFrame>,
    latched: Option<Error>,
    eof: bool,
    closed: bool,
}

impl Filter {
    pub async fn open(
        handle: &EngineHandle,
        mut upstream: FrameStage,
        options: FilterOptions,
        ptr: bool,
    ) -> Result<Self> {
        if upstream.stream_type() != StreamType::EngineFrame {
            return Err(Error::build("filter input must be an engine-frame stream"));
        }
        let input_streams = upstream.streams().await?;
        let streams = input_streams
            .into_iter()
            .map(|params| match options.for_type(params.media_type) {
                Some((_, output)) => output.apply(params),
                None => params,
            })
            .collect::<Vec<_>>();
        let slots = streams.iter().map(|_| GraphSlot::Unconfigured).collect();
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

    fn filter_one(&mut self, index: usize, frames: Vec<StreamFrame>) -> anyhow::Result<()> {
        let Some(slot) = self.slots.get_mut(index) else {
            return Ok(());
        };
        let Some(first) = frames.first() else {
            return Ok(());
        };
        let media_type = self.handle.engine().frame_format(&first.frame)?.media_type;
        let Some((description, output)) = self.options.for_type(media_type) else {
            return Ok(());
        };
        let graph = slot.get_or_open(&self.handle, &first.frame, description, &output)?;
        let frames = frames.into_iter().map(|f| f.frame).collect();
        let out = graph.filter(frames, false, self.ptr)?;
        self.pending
            .extend(out.into_iter().map(|f| StreamFrame::new(index, f)));
        Ok(())
    }

    fn feed(&mut self, batch: Vec<StreamFrame>) {
        for (index, frames) in group_by_stream(batch) {
            if let Err(e) = self.filter_one(index, frames) {
                latch(&mut self.latched, index, e);
                break;
            }
        }
    }

    fn finish(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let GraphSlot::Configured(graph) = slot {
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
            log::info!("filter: closed");
        }
    }
}

impl Transformer for Filter {
    type Item = StreamFrame;

    fn component(&self) -> Component {
        Component::Filter
    }

    fn stream_type(&self) -> StreamType {
        StreamType::EngineFrame
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

impl Drop for Filter {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "filter_test.rs"]
mod filter_test;
