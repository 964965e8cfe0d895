//! Live pipeline stages.
//!
//! Every stage implements [`Transformer`]: a consumer calls
//! [`Transformer::next_batch`], the stage pulls its own upstream as needed and
//! returns one batch. An empty batch is an in-band flush marker (a seek
//! happened upstream); `Ok(None)` is end of stream. Once a stage has returned
//! `Ok(None)` or an error it has released its resources and stays closed.

use futures::{future::BoxFuture, stream::BoxStream};
use serde::Serialize;

use crate::{
    command::{Command, CommandResult},
    engine::{FileWrite, EngineHandle},
    error::{Error, Result},
    frame::StreamFrame,
    hw::HwQueue,
    packet::StreamPacket,
    stream::StreamParameters,
};

pub mod decoder;
pub mod demuxer;
pub mod encoder;
pub mod filter;
pub mod muxer;
pub mod normalizer;
pub mod play_normalizer;
pub mod selector;
pub mod user;

pub use decoder::Decoder;
pub use demuxer::Demuxer;
pub use encoder::{Encoder, EncoderConfig, EncoderOptions};
pub use filter::{Filter, FilterOptions, FilterOutput};
pub use muxer::{Muxer, MuxerOptions};
pub use normalizer::Normalizer;
pub use play_normalizer::{PlayNormalizer, PlayOptions};
pub use selector::{FrameSelector, PacketSelector};
pub use user::{UserFrameStream, UserPacketStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    PacketStream,
    Demuxer,
    PacketSelector,
    FrameStream,
    Decoder,
    FrameSelector,
    FrameNormalizer,
    PlayNormalizer,
    Filter,
    Encoder,
    Muxer,
}

/// What flows out of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamType {
    Packet,
    /// Frames that may still be hardware-native.
    Frame,
    /// Frames in engine layout only.
    EngineFrame,
    File,
}

pub trait Transformer: Send {
    type Item: Send + 'static;

    fn component(&self) -> Component;

    fn stream_type(&self) -> StreamType;

    /// Pointer mode for engine units; fixed at construction.
    fn ptr(&self) -> bool;

    /// Output substream parameters, ordered by output index.
    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>>;

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<Self::Item>>>>;

    /// Handles the commands this stage understands, then passes them upstream.
    fn apply_commands<'a>(
        &'a mut self,
        commands: &'a [Command],
        results: &'a mut [CommandResult],
    ) -> BoxFuture<'a, ()>;

    fn send_commands(&mut self, commands: Vec<Command>) -> BoxFuture<'_, Vec<CommandResult>> {
        Box::pin(async move {
            let mut results = vec![CommandResult::default(); commands.len()];
            self.apply_commands(&commands, &mut results).await;
            results
        })
    }

    fn into_stream(self) -> BoxStream<'static, Result<Vec<Self::Item>>>
    where
        Self: Sized + 'static,
    {
        Box::pin(futures::stream::unfold(Some(self), |stage| async move {
            let mut stage = stage?;
            match stage.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), Some(stage))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        }))
    }
}

/// A unit tagged with its substream.
pub trait Tagged: Send + 'static {
    fn stream_index(&self) -> usize;

    fn set_stream_index(&mut self, index: usize);
}

impl Tagged for StreamPacket {
    fn stream_index(&self) -> usize {
        self.stream_index
    }

    fn set_stream_index(&mut self, index: usize) {
        self.stream_index = index;
    }
}

impl Tagged for StreamFrame {
    fn stream_index(&self) -> usize {
        self.stream_index
    }

    fn set_stream_index(&mut self, index: usize) {
        self.stream_index = index;
    }
}

/// Splits a batch by substream, keeping per-substream order.
/// Groups are ordered by first appearance.
pub(crate) fn group_by_stream<T: Tagged>(batch: Vec<T>) -> Vec<(usize, Vec<T>)> {
    let mut groups: Vec<(usize, Vec<T>)> = Vec::new();
    for unit in batch {
        let index = unit.stream_index();
        match groups.iter_mut().find(|(i, _)| *i == index) {
            Some((_, units)) => units.push(unit),
            None => groups.push((index, vec![unit])),
        }
    }
    groups
}

/// Waits until the hardware queue has room for one more unit.
pub(crate) async fn wait_for_room<Q: HwQueue + ?Sized>(
    queue: &mut Q,
    handle: &EngineHandle,
) -> Result<()> {
    let threshold = handle.config().hw_queue_threshold;
    while queue.queue_size() >= threshold {
        tokio::select! {
            _ = handle.cancellation_token().cancelled() => return Err(Error::Cancelled),
            _ = queue.dequeued() => {}
        }
    }
    Ok(())
}

pub enum PacketStage {
    Demuxer(Demuxer),
    PacketSelector(PacketSelector),
    Encoder(Encoder),
    User(UserPacketStream),
}

pub enum FrameStage {
    Decoder(Decoder),
    FrameSelector(FrameSelector),
    Normalizer(Normalizer),
    PlayNormalizer(PlayNormalizer),
    Filter(Filter),
    User(UserFrameStream),
}

macro_rules! dispatch {
    ($self:ident, $ty:ident, $s:ident => $e:expr, [$($variant:ident),*]) => {
        match $self {
            $($ty::$variant($s) => $e,)*
        }
    };
}

impl Transformer for PacketStage {
    type Item = StreamPacket;

    fn component(&self) -> Component {
        dispatch!(self, PacketStage, s => s.component(), [Demuxer, PacketSelector, Encoder, User])
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Packet
    }

    fn ptr(&self) -> bool {
        dispatch!(self, PacketStage, s => s.ptr(), [Demuxer, PacketSelector, Encoder, User])
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        dispatch!(self, PacketStage, s => s.streams(), [Demuxer, PacketSelector, Encoder, User])
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<StreamPacket>>>> {
        dispatch!(self, PacketStage, s => s.next_batch(), [Demuxer, PacketSelector, Encoder, User])
    }

    fn apply_commands<'a>(
        &'a mut self,
        commands: &'a [Command],
        results: &'a mut [CommandResult],
    ) -> BoxFuture<'a, ()> {
        dispatch!(self, PacketStage, s => s.apply_commands(commands, results), [Demuxer, PacketSelector, Encoder, User])
    }
}

impl Transformer for FrameStage {
    type Item = StreamFrame;

    fn component(&self) -> Component {
        dispatch!(self, FrameStage, s => s.component(), [Decoder, FrameSelector, Normalizer, PlayNormalizer, Filter, User])
    }

    fn stream_type(&self) -> StreamType {
        dispatch!(self, FrameStage, s => s.stream_type(), [Decoder, FrameSelector, Normalizer, PlayNormalizer, Filter, User])
    }

    fn ptr(&self) -> bool {
        dispatch!(self, FrameStage, s => s.ptr(), [Decoder, FrameSelector, Normalizer, PlayNormalizer, Filter, User])
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        dispatch!(self, FrameStage, s => s.streams(), [Decoder, FrameSelector, Normalizer, PlayNormalizer, Filter, User])
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<StreamFrame>>>> {
        dispatch!(self, FrameStage, s => s.next_batch(), [Decoder, FrameSelector, Normalizer, PlayNormalizer, Filter, User])
    }

    fn apply_commands<'a>(
        &'a mut self,
        commands: &'a [Command],
        results: &'a mut [CommandResult],
    ) -> BoxFuture<'a, ()> {
        dispatch!(self, FrameStage, s => s.apply_commands(commands, results), [Decoder, FrameSelector, Normalizer, PlayNormalizer, Filter, User])
    }
}

/// Any built stage.
pub enum Stage {
    Packet(PacketStage),
    Frame(FrameStage),
    File(Muxer),
}

impl Stage {
    pub fn component(&self) -> Component {
        match self {
            Stage::Packet(s) => s.component(),
            Stage::Frame(s) => s.component(),
            Stage::File(s) => s.component(),
        }
    }

    pub fn stream_type(&self) -> StreamType {
        match self {
            Stage::Packet(s) => s.stream_type(),
            Stage::Frame(s) => s.stream_type(),
            Stage::File(s) => s.stream_type(),
        }
    }

    pub fn ptr(&self) -> bool {
        match self {
            Stage::Packet(s) => s.ptr(),
            Stage::Frame(s) => s.ptr(),
            Stage::File(s) => s.ptr(),
        }
    }

    pub async fn streams(&mut self) -> Result<Vec<StreamParameters>> {
        match self {
            Stage::Packet(s) => s.streams().await,
            Stage::Frame(s) => s.streams().await,
            Stage::File(s) => s.streams().await,
        }
    }

    pub async fn send_commands(&mut self, commands: Vec<Command>) -> Vec<CommandResult> {
        match self {
            Stage::Packet(s) => s.send_commands(commands).await,
            Stage::Frame(s) => s.send_commands(commands).await,
            Stage::File(s) => s.send_commands(commands).await,
        }
    }

    pub fn into_packets(self) -> Result<PacketStage> {
        match self {
            Stage::Packet(s) => Ok(s),
            other => Err(Error::build(format!(
                "{:?} stage does not produce packets",
                other.component()
            ))),
        }
    }

    pub fn into_frames(self) -> Result<FrameStage> {
        match self {
            Stage::Frame(s) => Ok(s),
            other => Err(Error::build(format!(
                "{:?} stage does not produce frames",
                other.component()
            ))),
        }
    }

    pub fn into_muxer(self) -> Result<Muxer> {
        match self {
            Stage::File(s) => Ok(s),
            other => Err(Error::build(format!(
                "{:?} stage does not produce file writes",
                other.component()
            ))),
        }
    }

    /// Mux output as a stream of write batches.
    pub fn into_file_stream(self) -> Result<BoxStream<'static, Result<Vec<FileWrite>>>> {
        Ok(self.into_muxer()?.into_stream())
    }
}

impl From<PacketStage> for Stage {
    fn from(stage: PacketStage) -> Self {
        Stage::Packet(stage)
    }
}

impl From<FrameStage> for Stage {
    fn from(stage: FrameStage) -> Self {
        Stage::Frame(stage)
    }
}

impl From<Muxer> for Stage {
    fn from(stage: Muxer) -> Self {
        Stage::File(stage)
    }
}
