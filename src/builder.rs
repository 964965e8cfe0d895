//! Resolves a task description into a chain of live stages.
//!
//! [`build`] validates the whole description synchronously, before any
//! backend resource is opened, and returns the future that opens the stages
//! leaf first. Where a node needs frames but its input produces packets a
//! decoder is inserted, and the other way round an encoder; inserted and
//! inner stages always run in pointer mode.

use std::path::PathBuf;

use futures::{
    future::BoxFuture,
    stream::BoxStream,
};
use serde::{Deserialize, Serialize};

use crate::{
    engine::EngineHandle,
    error::{Error, Result},
    frame::{Frame, StreamFrame},
    input::InputFile,
    packet::StreamPacket,
    selector::Selection,
    stage::{
        Decoder, Demuxer, Encoder, EncoderConfig, EncoderOptions, Filter, FilterOptions,
        FrameSelector, FrameStage, Muxer, MuxerOptions, Normalizer, PacketSelector, PacketStage,
        PlayNormalizer, PlayOptions, Stage, StreamType, Transformer, UserFrameStream,
        UserPacketStream,
    },
    stream::{PartialStreamParameters, StreamParameters},
};

/// Task description node.
pub enum Init {
    File(InputFile),
    Stage(Stage),
    Pending(BoxFuture<'static, Result<Stage>>),
    Demuxer {
        input: Box<Init>,
        ptr: bool,
    },
    PacketSelector {
        input: Box<Init>,
        selection: Selection,
    },
    Decoder {
        input: Box<Init>,
        ptr: bool,
    },
    FrameSelector {
        input: Box<Init>,
        selection: Selection,
    },
    FrameNormalizer {
        input: Box<Init>,
        ptr: bool,
    },
    PlayNormalizer {
        input: Box<Init>,
        options: PlayOptions,
        ptr: bool,
    },
    Filter {
        input: Box<Init>,
        options: FilterOptions,
        ptr: bool,
    },
    Encoder {
        input: Box<Init>,
        options: EncoderOptions,
        ptr: bool,
    },
    Muxer {
        input: Box<Init>,
        options: MuxerOptions,
    },
    UserPacketStream {
        streams: Vec<StreamParameters>,
        packets: BoxStream<'static, Result<Vec<StreamPacket>>>,
        ptr: bool,
    },
    UserFrameStream {
        streams: Vec<PartialStreamParameters>,
        frames: BoxStream<'static, Result<Vec<StreamFrame>>>,
        ptr: bool,
    },
    UserMonoFrameStream {
        stream: PartialStreamParameters,
        frames: BoxStream<'static, Result<Vec<Frame>>>,
        ptr: bool,
    },
}

impl Init {
    pub fn file(input: impl Into<InputFile>) -> Self {
        Init::File(input.into())
    }

    pub fn decode(self) -> Self {
        Init::Decoder {
            input: Box::new(self),
            ptr: false,
        }
    }

    pub fn select_packets(self, selection: impl Into<Selection>) -> Self {
        Init::PacketSelector {
            input: Box::new(self),
            selection: selection.into(),
        }
    }

    pub fn select_frames(self, selection: impl Into<Selection>) -> Self {
        Init::FrameSelector {
            input: Box::new(self),
            selection: selection.into(),
        }
    }

    pub fn filter(self, options: FilterOptions) -> Self {
        Init::Filter {
            input: Box::new(self),
            options,
            ptr: false,
        }
    }

    pub fn encode(self, options: EncoderOptions) -> Self {
        Init::Encoder {
            input: Box::new(self),
            options,
            ptr: false,
        }
    }

    pub fn mux(self, options: MuxerOptions) -> Self {
        Init::Muxer {
            input: Box::new(self),
            options,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Init::File(_) => "file",
            Init::Stage(_) => "stage",
            Init::Pending(_) => "pending stage",
            Init::Demuxer { .. } => "demuxer",
            Init::PacketSelector { .. } => "packet-selector",
            Init::Decoder { .. } => "decoder",
            Init::FrameSelector { .. } => "frame-selector",
            Init::FrameNormalizer { .. } => "frame-normalizer",
            Init::PlayNormalizer { .. } => "play-normalizer",
            Init::Filter { .. } => "filter",
            Init::Encoder { .. } => "encoder",
            Init::Muxer { .. } => "muxer",
            Init::UserPacketStream { .. } => "packet-stream",
            Init::UserFrameStream { .. } => "frame-stream",
            Init::UserMonoFrameStream { .. } => "mono-frame-stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Any,
    Stream,
}

fn validate(init: &Init, want: Want) -> Result<()> {
    let produces_file = matches!(init, Init::Muxer { .. } | Init::Stage(Stage::File(_)));
    if want == Want::Stream && produces_file {
        return Err(Error::build(format!(
            "{} output cannot feed another stage",
            init.kind()
        )));
    }

    match init {
        Init::File(_)
        | Init::Stage(_)
        | Init::Pending(_)
        | Init::UserPacketStream { .. }
        | Init::UserFrameStream { .. }
        | Init::UserMonoFrameStream { .. } => Ok(()),
        Init::Demuxer { input, .. } => match input.as_ref() {
            Init::File(_) => Ok(()),
            other => Err(Error::build(format!(
                "demuxer input must be a file, got {}",
                other.kind()
            ))),
        },
        Init::PacketSelector { input, selection } | Init::FrameSelector { input, selection } => {
            selection.validate().map_err(|e| Error::build(e.to_string()))?;
            validate(input, Want::Stream)
        }
        Init::PlayNormalizer { input, options, .. } => {
            if options.sample_rate == 0 {
                return Err(Error::build("play-normalizer needs a sample rate"));
            }
            validate(input, Want::Stream)
        }
        Init::Decoder { input, .. }
        | Init::FrameNormalizer { input, .. }
        | Init::Filter { input, .. }
        | Init::Encoder { input, .. }
        | Init::Muxer { input, .. } => validate(input, Want::Stream),
    }
}

/// Validates `init` and returns the future that opens its stages.
pub fn build(handle: &EngineHandle, init: Init) -> Result<BoxFuture<'static, Result<Stage>>> {
    validate(&init, Want::Any)?;
    let handle = handle.clone();
    Ok(Box::pin(async move {
        let stage = build_stage(handle, init, false).await?;
        log::info!("built {:?} stage", stage.component());
        Ok(stage)
    }))
}

fn default_encoder(handle: &EngineHandle) -> EncoderOptions {
    let config = handle.config();
    EncoderOptions {
        video: Some(EncoderConfig::new(config.default_video_codec.clone())),
        audio: Some(EncoderConfig::new(config.default_audio_codec.clone())),
    }
}

async fn packet_stream(handle: EngineHandle, init: Init) -> Result<PacketStage> {
    match build_stage(handle.clone(), init, true).await? {
        Stage::Packet(stage) => Ok(stage),
        Stage::Frame(frames) => {
            log::debug!("builder: encoding frames for a packet consumer");
            let options = default_encoder(&handle);
            Ok(PacketStage::Encoder(
                Encoder::open(&handle, frames, options, true).await?,
            ))
        }
        Stage::File(_) => Err(Error::build("muxer output cannot feed another stage")),
    }
}

async fn frame_stream(handle: EngineHandle, init: Init) -> Result<FrameStage> {
    match build_stage(handle.clone(), init, true).await? {
        Stage::Frame(stage) => Ok(stage),
        Stage::Packet(packets) => {
            log::debug!("builder: decoding packets for a frame consumer");
            Ok(FrameStage::Decoder(Decoder::open(&handle, packets, true).await?))
        }
        Stage::File(_) => Err(Error::build("muxer output cannot feed another stage")),
    }
}

fn build_stage(handle: EngineHandle, init: Init, inner: bool) -> BoxFuture<'static, Result<Stage>> {
    Box::pin(async move {
        handle.check_cancelled()?;
        let ptr_of = |ptr: bool| inner || ptr;
        let stage: Stage = match init {
            Init::Stage(stage) => stage,
            Init::Pending(pending) => pending.await?,
            Init::File(file) => PacketStage::Demuxer(Demuxer::open(&handle, file, inner).await?).into(),
            Init::Demuxer { input, ptr } => match *input {
                Init::File(file) => {
                    PacketStage::Demuxer(Demuxer::open(&handle, file, ptr_of(ptr)).await?).into()
                }
                other => {
                    return Err(Error::build(format!(
                        "demuxer input must be a file, got {}",
                        other.kind()
                    )))
                }
            },
            Init::PacketSelector { input, selection } => {
                let upstream = packet_stream(handle.clone(), *input).await?;
                PacketStage::PacketSelector(PacketSelector::new(upstream, &selection).await?).into()
            }
            Init::Decoder { input, ptr } => {
                let upstream = packet_stream(handle.clone(), *input).await?;
                FrameStage::Decoder(Decoder::open(&handle, upstream, ptr_of(ptr)).await?).into()
            }
            Init::FrameSelector { input, selection } => {
                let upstream = frame_stream(handle.clone(), *input).await?;
                FrameStage::FrameSelector(FrameSelector::new(upstream, &selection).await?).into()
            }
            Init::FrameNormalizer { input, ptr } => {
                let upstream = frame_stream(handle.clone(), *input).await?;
                FrameStage::Normalizer(Normalizer::new(&handle, upstream, ptr_of(ptr))).into()
            }
            Init::PlayNormalizer {
                input,
                options,
                ptr,
            } => {
                let upstream = frame_stream(handle.clone(), *input).await?;
                FrameStage::PlayNormalizer(
                    PlayNormalizer::open(&handle, upstream, options, ptr_of(ptr)).await?,
                )
                .into()
            }
            Init::Filter {
                input,
                options,
                ptr,
            } => {
                let mut upstream = frame_stream(handle.clone(), *input).await?;
                if upstream.stream_type() != StreamType::EngineFrame {
                    upstream = FrameStage::Normalizer(Normalizer::new(&handle, upstream, true));
                }
                FrameStage::Filter(Filter::open(&handle, upstream, options, ptr_of(ptr)).await?).into()
            }
            Init::Encoder {
                input,
                options,
                ptr,
            } => {
                let upstream = frame_stream(handle.clone(), *input).await?;
                PacketStage::Encoder(Encoder::open(&handle, upstream, options, ptr_of(ptr)).await?)
                    .into()
            }
            Init::Muxer { input, options } => {
                let upstream = packet_stream(handle.clone(), *input).await?;
                Stage::File(Muxer::open(&handle, upstream, options).await?)
            }
            Init::UserPacketStream {
                streams,
                packets,
                ptr,
            } => PacketStage::User(UserPacketStream::new(&handle, streams, packets, ptr)).into(),
            Init::UserFrameStream {
                streams,
                frames,
                ptr,
            } => FrameStage::User(UserFrameStream::new(&handle, streams, frames, ptr)).into(),
            Init::UserMonoFrameStream { stream, frames, ptr } => {
                FrameStage::User(UserFrameStream::mono(&handle, stream, frames, ptr)).into()
            }
        };
        Ok(stage)
    })
}

/// Input of a serialized task: a path (demuxed) or a nested task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskInput {
    Path(PathBuf),
    Task(Box<TaskSpec>),
}

/// Serializable form of [`Init`], tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaskSpec {
    File {
        path: PathBuf,
    },
    Demuxer {
        input: TaskInput,
        #[serde(default)]
        ptr: bool,
    },
    PacketSelector {
        input: TaskInput,
        selection: Selection,
    },
    Decoder {
        input: TaskInput,
        #[serde(default)]
        ptr: bool,
    },
    FrameSelector {
        input: TaskInput,
        selection: Selection,
    },
    FrameNormalizer {
        input: TaskInput,
        #[serde(default)]
        ptr: bool,
    },
    PlayNormalizer {
        input: TaskInput,
        #[serde(flatten)]
        options: PlayOptions,
        #[serde(default)]
        ptr: bool,
    },
    Filter {
        input: TaskInput,
        #[serde(flatten)]
        options: FilterOptions,
        #[serde(default)]
        ptr: bool,
    },
    Encoder {
        input: TaskInput,
        #[serde(flatten)]
        options: EncoderOptions,
        #[serde(default)]
        ptr: bool,
    },
    Muxer {
        input: TaskInput,
        #[serde(flatten)]
        options: MuxerOptions,
    },
}

impl TaskSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::build(format!("task description: {}", e)))
    }

    /// Opens referenced files and converts to an [`Init`] tree.
    pub fn into_init(self) -> Result<Init> {
        let input = |input: TaskInput| -> Result<Box<Init>> {
            Ok(Box::new(match input {
                TaskInput::Path(path) => Init::Demuxer {
                    input: Box::new(open_file(&path)?),
                    ptr: false,
                },
                TaskInput::Task(task) => task.into_init()?,
            }))
        };
        Ok(match self {
            TaskSpec::File { path } => open_file(&path)?,
            TaskSpec::Demuxer { input: i, ptr } => Init::Demuxer { input: input(i)?, ptr },
            TaskSpec::PacketSelector { input: i, selection } => Init::PacketSelector {
                input: input(i)?,
                selection,
            },
            TaskSpec::Decoder { input: i, ptr } => Init::Decoder { input: input(i)?, ptr },
            TaskSpec::FrameSelector { input: i, selection } => Init::FrameSelector {
                input: input(i)?,
                selection,
            },
            TaskSpec::FrameNormalizer { input: i, ptr } => {
                Init::FrameNormalizer { input: input(i)?, ptr }
            }
            TaskSpec::PlayNormalizer {
                input: i,
                options,
                ptr,
            } => Init::PlayNormalizer {
                input: input(i)?,
                options,
                ptr,
            },
            TaskSpec::Filter {
                input: i,
                options,
                ptr,
            } => Init::Filter {
                input: input(i)?,
                options,
                ptr,
            },
            TaskSpec::Encoder {
                input: i,
                options,
                ptr,
            } => Init::Encoder {
                input: input(i)?,
                options,
                ptr,
            },
            TaskSpec::Muxer { input: i, options } => Init::Muxer {
                input: input(i)?,
                options,
            },
        })
    }
}

fn open_file(path: &std::path::Path) -> Result<Init> {
    InputFile::open(path)
        .map(Init::File)
        .map_err(|e| Error::build(format!("opening {}: {}", path.display(), e)))
}

#[cfg(test)]
#[path = "builder_test.rs"]
mod builder_test;
