use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    command::{Command, CommandResult},
    engine::{Engine, EngineHandle, SoftwareDecoder},
    error::{Error, Result},
    frame::{Frame, StreamFrame},
    hw::{self, DecodedFrame, HwDecoder, HwOutput, HwSink},
    packet::StreamPacket,
    stage::{group_by_stream, wait_for_room, Component, PacketStage, StreamType, Transformer},
    stream::StreamParameters,
};

enum DecoderSlot {
    Hardware(Box<dyn HwDecoder>),
    Software {
        decoder: Box<dyn SoftwareDecoder>,
        // dropped after the decoder it created
        _engine: Arc<dyn Engine>,
    },
    Dropped,
}

impl DecoderSlot {
    async fn open(
        handle: &EngineHandle,
        index: usize,
        params: &StreamParameters,
        sink: HwSink<DecodedFrame>,
    ) -> Result<Self> {
        if !params.media_type.is_av() {
            log::info!("decoder: stream {} is {:?}, dropped", index, params.media_type);
            return Ok(DecoderSlot::Dropped);
        }

        if let Some(hw) = handle.hw() {
            match hw.open_decoder(params, sink).await {
                Ok(Some(decoder)) => {
                    log::info!("decoder: stream {} uses hardware {}", index, params.codec);
                    return Ok(DecoderSlot::Hardware(decoder));
                }
                Ok(None) => {
                    log::info!("decoder: no hardware support for {}", params.codec);
                }
                Err(e) => {
                    log::warn!(
                        "decoder: hardware rejected {}: {:#}, falling back to software",
                        params.codec,
                        e
                    );
                }
            }
        }

        let backend_err = |e: anyhow::Error| Error::BackendConfig {
            stream: index,
            message: format!("{:#}", e),
        };
        let engine = handle.codec_engine(&params.codec).map_err(backend_err)?;
        let decoder = engine.open_decoder(params).map_err(backend_err)?;
        log::info!("decoder: stream {} uses software {}", index, params.codec);
        Ok(DecoderSlot::Software {
            decoder,
            _engine: engine,
        })
    }
}

fn latch(latched: &mut Option<Error>, index: usize, err: anyhow::Error) {
    log::error!("decoder: stream {}: {:#}", index, err);
    if latched.is_none() {
        *latched = Some(Error::stream(format!("decoding stream {}: {:#}", index, err)));
    }
}

/// Packets in, frames out. Each substream gets its own decoder, hardware first.
pub struct Decoder {
    handle: EngineHandle,
    upstream: Box<PacketStage>,
    ptr: bool,
    streams: Vec<StreamParameters>,
    slots: Vec<DecoderSlot>,
    hw_rx: UnboundedReceiver<HwOutput<DecodedFrame>>,
    pending: Vec<StreamFrame>,
    marker: bool,
    latched: Option<Error>,
    eof: bool,
    closed: bool,
}

impl Decoder {
    pub async fn open(handle: &EngineHandle, mut upstream: PacketStage, ptr: bool) -> Result<Self> {
        let streams = upstream.streams().await?;
        let (tx, hw_rx) = hw::output_channel();
        let mut slots = Vec::with_capacity(streams.len());
        for (i, params) in streams.iter().enumerate() {
            handle.check_cancelled()?;
            slots.push(DecoderSlot::open(handle, i, params, HwSink::new(i, tx.clone())).await?);
        }

        Ok(Self {
            handle: handle.clone(),
            upstream: Box::new(upstream),
            ptr,
            streams,
            slots,
            hw_rx,
            pending: Vec::new(),
            marker: false,
            latched: None,
            eof: false,
            closed: false,
        })
    }

    fn drain_hw(&mut self) {
        while let Ok(out) = self.hw_rx.try_recv() {
            match out.result {
                Ok(frame) => self
                    .pending
                    .push(StreamFrame::new(out.stream_index, Frame::Native(frame))),
                Err(e) => latch(&mut self.latched, out.stream_index, e),
            }
        }
    }

    async fn feed(&mut self, batch: Vec<StreamPacket>) -> Result<()> {
        let Self {
            handle,
            slots,
            pending,
            latched,
            ptr,
            ..
        } = self;

        for (index, packets) in group_by_stream(batch) {
            if latched.is_some() {
                break;
            }
            match slots.get_mut(index) {
                Some(DecoderSlot::Software { decoder, .. }) => {
                    let packets = packets.into_iter().map(|p| p.packet).collect();
                    match decoder.decode(packets, false, *ptr) {
                        Ok(frames) => {
                            pending.extend(frames.into_iter().map(|f| StreamFrame::new(index, f)))
                        }
                        Err(e) => latch(latched, index, e),
                    }
                }
                Some(DecoderSlot::Hardware(decoder)) => {
                    for packet in packets {
                        wait_for_room(&mut **decoder, handle).await?;
                        if let Err(e) = decoder.decode(packet.packet) {
                            latch(latched, index, e);
                            break;
                        }
                    }
                }
                Some(DecoderSlot::Dropped) | None => {}
            }
        }
        Ok(())
    }

    /// Seek marker: forget decoder state. Hardware decoders still hand out
    /// what they already have, ahead of the marker.
    async fn reset(&mut self) {
        log::debug!("decoder: flush marker");
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                DecoderSlot::Software { decoder, .. } => decoder.flush_buffers(),
                DecoderSlot::Hardware(decoder) => {
                    if let Err(e) = decoder.flush().await {
                        latch(&mut self.latched, index, e);
                    }
                }
                DecoderSlot::Dropped => {}
            }
        }
        self.drain_hw();
    }

    async fn finish(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                DecoderSlot::Software { decoder, .. } => match decoder.decode(Vec::new(), true, self.ptr) {
                    Ok(frames) => self
                        .pending
                        .extend(frames.into_iter().map(|f| StreamFrame::new(index, f))),
                    Err(e) => latch(&mut self.latched, index, e),
                },
                DecoderSlot::Hardware(decoder) => {
                    if let Err(e) = decoder.flush().await {
                        latch(&mut self.latched, index, e);
                    }
                }
                DecoderSlot::Dropped => {}
            }
        }
        self.drain_hw();
    }

    async fn pull(&mut self) -> Result<Option<Vec<StreamFrame>>> {
        loop {
            self.drain_hw();
            if !self.pending.is_empty() {
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
            if self.marker {
                self.marker = false;
                return Ok(Some(Vec::new()));
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
                    self.finish().await;
                    self.eof = true;
                }
                Some(batch) if batch.is_empty() => {
                    self.reset().await;
                    self.marker = true;
                }
                Some(batch) => self.feed(batch).await?,
            }
        }
    }

    fn teardown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending.clear();
            self.slots.clear();
            log::info!("decoder: closed");
        }
    }
}

impl Transformer for Decoder {
    type Item = StreamFrame;

    fn component(&self) -> Component {
        Component::Decoder
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

impl Drop for Decoder {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
