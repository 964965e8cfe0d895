use futures::future::BoxFuture;

use crate::{
    command::{Command, CommandResult},
    engine::{Engine, EngineHandle},
    error::{Error, Result},
    frame::{Frame, StreamFrame},
    stage::{Component, FrameStage, StreamType, Transformer},
    stream::StreamParameters,
};

/// Converts a frame to engine layout, in pointer or value form. Native frames
/// are closed once copied.
pub(crate) fn to_engine_frame(engine: &dyn Engine, frame: Frame, ptr: bool) -> anyhow::Result<Frame> {
    match frame {
        Frame::Native(native) => {
            let data = native.to_frame_data()?;
            drop(native);
            if ptr {
                Ok(Frame::Ptr(engine.frame_to_ptr(data)?))
            } else {
                Ok(Frame::Value(data))
            }
        }
        Frame::Value(data) if ptr => Ok(Frame::Ptr(engine.frame_to_ptr(data)?)),
        Frame::Ptr(frame) if !ptr => Ok(Frame::Value(engine.frame_from_ptr(&frame)?)),
        frame => Ok(frame),
    }
}

/// Unifies hardware-native and engine frames into one engine representation.
pub struct Normalizer {
    handle: EngineHandle,
    upstream: Box<FrameStage>,
    ptr: bool,
    latched: Option<Error>,
    closed: bool,
}

impl Normalizer {
    pub fn new(handle: &EngineHandle, upstream: FrameStage, ptr: bool) -> Self {
        Self {
            handle: handle.clone(),
            upstream: Box::new(upstream),
            ptr,
            latched: None,
            closed: false,
        }
    }

    /// A failed conversion still hands out the frames converted before it;
    /// the error follows on the next pull.
    async fn pull(&mut self) -> Result<Option<Vec<StreamFrame>>> {
        if let Some(e) = self.latched.take() {
            return Err(e);
        }
        self.handle.check_cancelled()?;
        let Some(batch) = self.upstream.next_batch().await? else {
            return Ok(None);
        };
        let marker = batch.is_empty();
        let engine = self.handle.engine().as_ref();
        let mut out = Vec::with_capacity(batch.len());
        for unit in batch {
            match to_engine_frame(engine, unit.frame, self.ptr) {
                Ok(frame) => out.push(StreamFrame::new(unit.stream_index, frame)),
                Err(e) => {
                    log::error!("normalizer: stream {}: {:#}", unit.stream_index, e);
                    self.latched = Some(Error::stream(format!(
                        "normalizing stream {}: {:#}",
                        unit.stream_index, e
                    )));
                    break;
                }
            }
        }
        if out.is_empty() && !marker {
            if let Some(e) = self.latched.take() {
                return Err(e);
            }
        }
        Ok(Some(out))
    }
}

impl Transformer for Normalizer {
    type Item = StreamFrame;

    fn component(&self) -> Component {
        Component::FrameNormalizer
    }

    fn stream_type(&self) -> StreamType {
        StreamType::EngineFrame
    }

    fn ptr(&self) -> bool {
        self.ptr
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        self.upstream.streams()
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<StreamFrame>>>> {
        Box::pin(async move {
            if self.closed {
                return Ok(None);
            }
            let res = self.pull().await;
            if !matches!(res, Ok(Some(_))) {
                self.closed = true;
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

#[cfg(test)]
#[path = "normalizer_test.rs"]
mod normalizer_test;
