use futures::future::BoxFuture;

use crate::{
    command::{Command, CommandResult, SeekCommand},
    engine::{DemuxContext, EngineHandle, ReadStatus},
    error::{Error, Result},
    input::InputFile,
    packet::StreamPacket,
    stage::{Component, StreamType, Transformer},
    stream::{Rational, StreamParameters},
};

/// Source stage: container bytes in, packets out.
pub struct Demuxer {
    handle: EngineHandle,
    name: String,
    ptr: bool,
    streams: Vec<StreamParameters>,
    ctx: Option<Box<dyn DemuxContext>>,
    seeked: bool,
    eof: bool,
}

impl Demuxer {
    pub async fn open(handle: &EngineHandle, input: InputFile, ptr: bool) -> Result<Self> {
        handle.check_cancelled()?;
        let name = handle.next_name("in");
        log::info!("demuxer {}: opening {} input", name, input.kind());
        let ctx = handle.engine().open_demuxer(&name, input)?;
        let streams = ctx.streams();
        for (i, stream) in streams.iter().enumerate() {
            log::info!(
                "demuxer {}: stream {} {:?} codec {:?} tb {}",
                name,
                i,
                stream.media_type,
                stream.codec,
                stream.time_base
            );
        }
        Ok(Self {
            handle: handle.clone(),
            name,
            ptr,
            streams,
            ctx: Some(ctx),
            seeked: false,
            eof: false,
        })
    }

    fn close(&mut self) {
        if self.ctx.take().is_some() {
            log::info!("demuxer {}: closed", self.name);
        }
    }

    fn seek(&mut self, cmd: &SeekCommand) -> anyhow::Result<()> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("demuxer {} is closed", self.name))?;

        let (min, ts, max) = if cmd.stream_timebase {
            let ts = cmd.time.round() as i64;
            (
                cmd.min.map(|v| v.round() as i64).unwrap_or(0),
                ts,
                cmd.max.map(|v| v.round() as i64).unwrap_or(ts),
            )
        } else {
            let time_base = match cmd.stream {
                Some(i) => self
                    .streams
                    .get(i)
                    .map(|s| s.time_base.or_micros())
                    .ok_or_else(|| anyhow::anyhow!("no stream {}", i))?,
                None => Rational::MICROS,
            };
            let ts = time_base.ticks(cmd.time);
            (
                cmd.min.map(|v| time_base.ticks(v)).unwrap_or(0),
                ts,
                cmd.max.map(|v| time_base.ticks(v)).unwrap_or(ts),
            )
        };

        log::debug!("demuxer {}: seek to {} in [{}, {}]", self.name, ts, min, max);
        let res = ctx.seek(cmd.stream, min, ts, max);
        // downstream flushes even when the container refused to move
        self.seeked = true;
        if res.is_ok() {
            self.eof = false;
        }
        res
    }

    async fn pull(&mut self) -> Result<Option<Vec<StreamPacket>>> {
        if self.seeked {
            self.seeked = false;
            return Ok(Some(Vec::new()));
        }
        let limit = self.handle.config().demux_chunk_size;
        loop {
            if self.eof {
                return Ok(None);
            }
            self.handle.check_cancelled()?;
            let Some(ctx) = self.ctx.as_mut() else {
                return Ok(None);
            };
            let outcome = ctx.read_packets(limit, self.ptr).map_err(Error::stream)?;
            if outcome.status == ReadStatus::Eof {
                self.eof = true;
            }
            if !outcome.packets.is_empty() {
                return Ok(Some(outcome.packets));
            }
            if outcome.status == ReadStatus::Again {
                tokio::task::yield_now().await;
            }
        }
    }
}

impl Transformer for Demuxer {
    type Item = StreamPacket;

    fn component(&self) -> Component {
        Component::Demuxer
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
            if self.ctx.is_none() {
                return Ok(None);
            }
            match self.pull().await {
                Ok(Some(batch)) => Ok(Some(batch)),
                Ok(None) => {
                    self.close();
                    Ok(None)
                }
                Err(e) => {
                    log::error!("demuxer {}: {}", self.name, e);
                    self.close();
                    Err(e)
                }
            }
        })
    }

    fn apply_commands<'a>(
        &'a mut self,
        commands: &'a [Command],
        results: &'a mut [CommandResult],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for (cmd, result) in commands.iter().zip(results.iter_mut()) {
                if let Command::Seek(seek) = cmd {
                    match self.seek(seek) {
                        Ok(()) => result.ok(),
                        Err(e) => {
                            log::warn!("demuxer {}: seek failed: {:#}", self.name, e);
                            result.fail(format!("{:#}", e));
                        }
                    }
                }
            }
        })
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        self.close();
    }
}
