//! Composable media transcoding pipeline.
//!
//! A task description ([`builder::Init`]) is resolved into a chain of live
//! stages (demux, decode, select, normalize, filter, encode, mux). Every stage
//! is pulled by its consumer; nothing runs until the outermost stage is read.
//! Codec, container and filter work is delegated to an [`engine::Engine`] and,
//! optionally, a [`hw::HwCodecService`].

pub mod builder;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod hw;
pub mod input;
pub mod packet;
pub mod selector;
pub mod stage;
pub mod stream;

#[cfg(test)]
pub(crate) mod mock;

pub use builder::{build, Init, TaskInput, TaskSpec};
pub use command::{Command, CommandResult};
pub use engine::EngineHandle;
pub use error::{Error, Result};
pub use stage::{FrameStage, PacketStage, Stage, Transformer};
