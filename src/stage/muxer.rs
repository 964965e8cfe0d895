use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    command::{Command, CommandResult},
    engine::{EngineHandle, FileWrite, MuxContext, MuxSettings},
    error::{Error, Result},
    stage::{Component, PacketStage, StreamType, Transformer},
    stream::StreamParameters,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerOptions {
    /// Container format name; the configured default when unset.
    pub format: Option<String>,
    /// Allow the container to seek back and patch earlier bytes.
    pub random_access: bool,
}

/// Sink stage: packets in, positioned file writes out.
pub struct Muxer {
    handle: EngineHandle,
    upstream: Box<PacketStage>,
    name: String,
    streams: Vec<StreamParameters>,
    ctx: Option<Box<dyn MuxContext>>,
    writes: UnboundedReceiver<FileWrite>,
    latched: Option<Error>,
    closed: bool,
}

impl Muxer {
    pub async fn open(handle: &EngineHandle, mut upstream: PacketStage, options: MuxerOptions) -> Result<Self> {
        let streams = upstream.streams().await?;
        handle.check_cancelled()?;

        let settings = MuxSettings {
            name: handle.next_name("out"),
            format: options
                .format
                .unwrap_or_else(|| handle.config().default_mux_format.clone()),
            random_access: options.random_access,
            streams: streams.clone(),
        };
        let (tx, writes) = tokio::sync::mpsc::unbounded_channel();
        let ctx = handle.engine().open_muxer(&settings, tx)?;
        log::info!(
            "muxer {}: {} with {} streams ({})",
            settings.name,
            settings.format,
            streams.len(),
            if settings.random_access { "random access" } else { "streaming" }
        );

        Ok(Self {
            handle: handle.clone(),
            upstream: Box::new(upstream),
            name: settings.name,
            streams,
            ctx: Some(ctx),
            writes,
            latched: None,
            closed: false,
        })
    }

    fn drain_writes(&mut self) -> Option<Vec<FileWrite>> {
        let mut out = Vec::new();
        while let Ok(write) = self.writes.try_recv() {
            out.push(write);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.write_trailer()?;
            log::info!("muxer {}: trailer written", self.name);
        }
        Ok(())
    }

    fn latch(&mut self, err: anyhow::Error) {
        log::error!("muxer {}: {:#}", self.name, err);
        if self.latched.is_none() {
            self.latched = Some(Error::stream(format!("muxing {}: {:#}", self.name, err)));
        }
    }

    /// Writes the engine already produced go out before a latched error.
    async fn pull(&mut self) -> Result<Option<Vec<FileWrite>>> {
        loop {
            if let Some(writes) = self.drain_writes() {
                return Ok(Some(writes));
            }
            if let Some(e) = self.latched.take() {
                return Err(e);
            }
            if self.ctx.is_none() {
                return Ok(None);
            }
            self.handle.check_cancelled()?;

            match self.upstream.next_batch().await? {
                None => {
                    if let Err(e) = self.finish() {
                        self.latch(e);
                    }
                }
                Some(batch) if batch.is_empty() => {}
                Some(batch) => {
                    let res = match self.ctx.as_mut() {
                        Some(ctx) => ctx.write_packets(batch),
                        None => Ok(()),
                    };
                    if let Err(e) = res {
                        self.latch(e);
                    }
                }
            }
        }
    }

    fn teardown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.ctx = None;
            self.writes.close();
            log::info!("muxer {}: closed", self.name);
        }
    }
}

impl Transformer for Muxer {
    type Item = FileWrite;

    fn component(&self) -> Component {
        Component::Muxer
    }

    fn stream_type(&self) -> StreamType {
        StreamType::File
    }

    fn ptr(&self) -> bool {
        false
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        Box::pin(async move { Ok(self.streams.clone()) })
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<FileWrite>>>> {
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

impl Drop for Muxer {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
