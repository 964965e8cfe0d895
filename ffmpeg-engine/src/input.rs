use std::ptr;

use avchain::{
    engine::{DemuxContext, ReadOutcome, ReadStatus},
    input::InputFile,
    packet::StreamPacket,
    stream::StreamParameters,
};
use ffmpeg_next::{ffi, util::error::EAGAIN};

use crate::{
    io::{AvioContext, Reader},
    packet::RawPacket,
    stream::describe_stream,
};

/// Container demuxer reading through a custom AVIO context.
pub struct AvInput {
    name: String,
    // declared before `_io` so the format context closes first
    inner: ffmpeg_next::format::context::Input,
    _io: AvioContext<Reader>,
    streams: Vec<StreamParameters>,
}

unsafe impl Send for AvInput {}

impl AvInput {
    pub fn new(name: &str, input: InputFile) -> anyhow::Result<Self> {
        let kind = input.kind();
        let mut io = AvioContext::reader(input)?;
        let inner = unsafe {
            let mut ctx = ffi::avformat_alloc_context();
            if ctx.is_null() {
                anyhow::bail!("out of memory allocating a format context");
            }
            (*ctx).pb = io.as_mut_ptr();
            (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as i32;

            let ret = ffi::avformat_open_input(&mut ctx, ptr::null(), ptr::null(), ptr::null_mut());
            if ret < 0 {
                // avformat_open_input frees the context on failure
                return Err(anyhow::anyhow!(
                    "open {} input {}: {}",
                    kind,
                    name,
                    ffmpeg_next::Error::from(ret)
                ));
            }
            let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                ffi::avformat_close_input(&mut ctx);
                return Err(anyhow::anyhow!(
                    "probe {}: {}",
                    name,
                    ffmpeg_next::Error::from(ret)
                ));
            }
            ffmpeg_next::format::context::Input::wrap(ctx)
        };

        let streams: Vec<StreamParameters> = inner.streams().map(|s| describe_stream(&s)).collect();
        log::info!(
            "demuxer {}: {} input, format {}, {} streams",
            name,
            kind,
            inner.format().name(),
            streams.len()
        );
        for (index, stream) in streams.iter().enumerate() {
            log::debug!(
                "demuxer {}: stream {} {:?} {} time_base {}",
                name,
                index,
                stream.media_type,
                stream.codec,
                stream.time_base
            );
        }

        Ok(Self {
            name: name.to_string(),
            inner,
            _io: io,
            streams,
        })
    }

    pub fn read_packet(&mut self) -> Result<RawPacket, ffmpeg_next::Error> {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        packet.read(&mut self.inner)?;
        let time_base = self
            .streams
            .get(packet.stream())
            .map(|s| s.time_base)
            .unwrap_or_default();
        Ok((packet, time_base).into())
    }
}

impl DemuxContext for AvInput {
    fn streams(&self) -> Vec<StreamParameters> {
        self.streams.clone()
    }

    fn read_packets(&mut self, limit: usize, ptr: bool) -> anyhow::Result<ReadOutcome> {
        let mut packets = Vec::new();
        let mut size = 0;
        while size < limit {
            match self.read_packet() {
                Ok(packet) => {
                    size += packet.size();
                    let stream_index = packet.packet().stream();
                    packets.push(StreamPacket::new(stream_index, packet.into_packet(ptr)));
                }
                Err(ffmpeg_next::Error::Eof) => {
                    log::debug!("demuxer {}: end of input", self.name);
                    return Ok(ReadOutcome {
                        packets,
                        status: ReadStatus::Eof,
                    });
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => {
                    let status = if packets.is_empty() {
                        ReadStatus::Again
                    } else {
                        ReadStatus::Ok
                    };
                    return Ok(ReadOutcome { packets, status });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ReadOutcome {
            packets,
            status: ReadStatus::Ok,
        })
    }

    fn seek(&mut self, stream: Option<usize>, min: i64, ts: i64, max: i64) -> anyhow::Result<()> {
        let index = stream.map(|s| s as i32).unwrap_or(-1);
        // lands on the keyframe at or before `ts`
        let ret = unsafe {
            ffi::avformat_seek_file(
                self.inner.as_mut_ptr(),
                index,
                min,
                ts,
                max,
                ffi::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            return Err(anyhow::anyhow!(
                "seek {} to {}: {}",
                self.name,
                ts,
                ffmpeg_next::Error::from(ret)
            ));
        }
        log::debug!("demuxer {}: seeked stream {} to {}", self.name, index, ts);
        Ok(())
    }
}
