//! Seam to a hardware-accelerated codec service.
//!
//! Hardware codecs are asynchronous: units are submitted, outputs arrive later
//! through an [`HwSink`]. Queue depth is exposed so stages can apply
//! backpressure.

use futures::future::BoxFuture;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    engine::EncoderSettings,
    frame::{Frame, NativeFrame},
    packet::{Packet, PacketData},
    stream::StreamParameters,
};

/// Output of a hardware encoder. The first chunk carries the negotiated parameters.
#[derive(Debug)]
pub struct EncodedChunk {
    pub packet: PacketData,
    pub parameters: Option<StreamParameters>,
}

pub struct HwOutput<T> {
    pub stream_index: usize,
    pub result: anyhow::Result<T>,
}

/// Output callback of one hardware codec, tagged with its substream.
pub struct HwSink<T> {
    stream_index: usize,
    tx: UnboundedSender<HwOutput<T>>,
}

impl<T> Clone for HwSink<T> {
    fn clone(&self) -> Self {
        Self {
            stream_index: self.stream_index,
            tx: self.tx.clone(),
        }
    }
}

impl<T> HwSink<T> {
    pub fn new(stream_index: usize, tx: UnboundedSender<HwOutput<T>>) -> Self {
        Self { stream_index, tx }
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn output(&self, value: T) {
        let _ = self.tx.send(HwOutput {
            stream_index: self.stream_index,
            result: Ok(value),
        });
    }

    pub fn error(&self, err: anyhow::Error) {
        let _ = self.tx.send(HwOutput {
            stream_index: self.stream_index,
            result: Err(err),
        });
    }
}

pub type DecodedFrame = Box<dyn NativeFrame>;

pub fn output_channel<T>() -> (UnboundedSender<HwOutput<T>>, UnboundedReceiver<HwOutput<T>>) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Submission queue shared by hardware decoders and encoders.
pub trait HwQueue: Send {
    /// Units submitted but not yet consumed by the codec.
    fn queue_size(&self) -> usize;

    /// Resolves after the queue shrinks.
    fn dequeued(&mut self) -> BoxFuture<'_, ()>;

    /// Emits every pending output through the sink, then returns.
    fn flush(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;
}

pub trait HwDecoder: HwQueue {
    fn decode(&mut self, packet: Packet) -> anyhow::Result<()>;
}

pub trait HwEncoder: HwQueue {
    fn encode(&mut self, frame: Frame) -> anyhow::Result<()>;
}

/// `Ok(None)` means the configuration is not supported; `Err` means it was
/// rejected while configuring. Either way the caller falls back to software.
pub trait HwCodecService: Send + Sync {
    fn open_decoder<'a>(
        &'a self,
        params: &'a StreamParameters,
        sink: HwSink<DecodedFrame>,
    ) -> BoxFuture<'a, anyhow::Result<Option<Box<dyn HwDecoder>>>>;

    fn open_encoder<'a>(
        &'a self,
        settings: &'a EncoderSettings,
        sink: HwSink<EncodedChunk>,
    ) -> BoxFuture<'a, anyhow::Result<Option<Box<dyn HwEncoder>>>>;
}
