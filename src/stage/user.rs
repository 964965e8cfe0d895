//! Caller-supplied packet and frame streams.

use std::collections::VecDeque;

use futures::{future::BoxFuture, stream::BoxStream, StreamExt};

use crate::{
    command::{Command, CommandResult},
    engine::EngineHandle,
    error::Result,
    frame::{Frame, FrameFormat, StreamFrame},
    packet::StreamPacket,
    stage::{Component, StreamType, Transformer},
    stream::{MediaType, PartialStreamParameters, Rational, StreamParameters},
};

pub struct UserPacketStream {
    handle: EngineHandle,
    streams: Vec<StreamParameters>,
    input: BoxStream<'static, Result<Vec<StreamPacket>>>,
    ptr: bool,
    closed: bool,
}

impl UserPacketStream {
    pub fn new(
        handle: &EngineHandle,
        streams: Vec<StreamParameters>,
        input: BoxStream<'static, Result<Vec<StreamPacket>>>,
        ptr: bool,
    ) -> Self {
        Self {
            handle: handle.clone(),
            streams,
            input,
            ptr,
            closed: false,
        }
    }
}

impl Transformer for UserPacketStream {
    type Item = StreamPacket;

    fn component(&self) -> Component {
        Component::PacketStream
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Packet
    }

    fn ptr(&self) -> bool {
        self.ptr
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        Box::pin(async move { Ok(self.streams.clone()) })
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<StreamPacket>>>> {
        Box::pin(async move {
            if self.closed {
                return Ok(None);
            }
            let res = match self.handle.check_cancelled() {
                Ok(()) => self.input.next().await.transpose(),
                Err(e) => Err(e),
            };
            if !matches!(res, Ok(Some(_))) {
                self.closed = true;
            }
            res
        })
    }

    fn apply_commands<'a>(
        &'a mut self,
        _commands: &'a [Command],
        _results: &'a mut [CommandResult],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Parameters of a substream as far as its first frame tells.
fn infer(format: &FrameFormat) -> StreamParameters {
    let media_type = match format.media_type {
        MediaType::Other if format.width > 0 => MediaType::Video,
        MediaType::Other => MediaType::Audio,
        known => known,
    };
    StreamParameters {
        media_type,
        format: format.format.clone(),
        width: format.width,
        height: format.height,
        sample_rate: format.sample_rate,
        channels: format.channels,
        channel_layout: format.channel_layout,
        time_base: format.time_base.unwrap_or(Rational::MICROS),
        ..Default::default()
    }
}

/// Frames from the caller. Substream parameters are completed from the first
/// frame of each substream, so [`Transformer::streams`] reads ahead.
pub struct UserFrameStream {
    handle: EngineHandle,
    partial: Vec<PartialStreamParameters>,
    known: Vec<Option<StreamParameters>>,
    input: BoxStream<'static, Result<Vec<StreamFrame>>>,
    ahead: VecDeque<Vec<StreamFrame>>,
    ptr: bool,
    closed: bool,
}

impl UserFrameStream {
    pub fn new(
        handle: &EngineHandle,
        partial: Vec<PartialStreamParameters>,
        input: BoxStream<'static, Result<Vec<StreamFrame>>>,
        ptr: bool,
    ) -> Self {
        Self {
            handle: handle.clone(),
            known: vec![None; partial.len()],
            partial,
            input,
            ahead: VecDeque::new(),
            ptr,
            closed: false,
        }
    }

    /// Single-substream variant: every frame belongs to substream 0.
    pub fn mono(
        handle: &EngineHandle,
        partial: PartialStreamParameters,
        input: BoxStream<'static, Result<Vec<Frame>>>,
        ptr: bool,
    ) -> Self {
        let input = input
            .map(|batch| batch.map(|frames| frames.into_iter().map(|f| StreamFrame::new(0, f)).collect()))
            .boxed();
        Self::new(handle, vec![partial], input, ptr)
    }

    fn observe(&mut self, batch: &[StreamFrame]) -> Result<()> {
        for unit in batch {
            let index = unit.stream_index;
            if self.known.get(index).is_some_and(Option::is_none) {
                let format = self.handle.engine().frame_format(&unit.frame)?;
                self.known[index] = Some(self.partial[index].apply(infer(&format)));
            }
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Vec<StreamFrame>>> {
        if self.closed {
            return Ok(None);
        }
        let res = match self.handle.check_cancelled() {
            Ok(()) => self.input.next().await.transpose(),
            Err(e) => Err(e),
        };
        match res {
            Ok(Some(batch)) => {
                self.observe(&batch)?;
                Ok(Some(batch))
            }
            other => {
                self.closed = true;
                other
            }
        }
    }
}

impl Transformer for UserFrameStream {
    type Item = StreamFrame;

    fn component(&self) -> Component {
        Component::FrameStream
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Frame
    }

    fn ptr(&self) -> bool {
        self.ptr
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        Box::pin(async move {
            while self.known.iter().any(Option::is_none) {
                match self.read().await? {
                    Some(batch) => self.ahead.push_back(batch),
                    None => break,
                }
            }
            Ok(self
                .known
                .iter()
                .zip(&self.partial)
                .map(|(known, partial)| match known {
                    Some(params) => params.clone(),
                    None => partial.apply(StreamParameters::default()),
                })
                .collect())
        })
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<StreamFrame>>>> {
        Box::pin(async move {
            match self.ahead.pop_front() {
                Some(batch) => Ok(Some(batch)),
                None => self.read().await,
            }
        })
    }

    fn apply_commands<'a>(
        &'a mut self,
        _commands: &'a [Command],
        _results: &'a mut [CommandResult],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}
