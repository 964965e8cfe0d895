use std::{ffi::CString, ptr};

use avchain::{
    engine::{MuxContext, MuxSettings, WriteSink},
    packet::StreamPacket,
    stream::Rational,
};
use ffmpeg_next::ffi;

use crate::{
    io::{AvioContext, Writer},
    packet::RawPacket,
    stream::{av_rational, codec_parameters, rational},
};

/// Container muxer writing through a custom AVIO context.
pub struct AvOutput {
    name: String,
    // declared before `io` so the format context is freed first
    inner: ffmpeg_next::format::context::Output,
    io: AvioContext<Writer>,
    time_bases: Vec<Rational>,
    interleaved: bool,
    have_written_trailer: bool,
}

unsafe impl Send for AvOutput {}

impl AvOutput {
    /// Allocates the container, adds `settings.streams` and writes the header.
    pub fn new(settings: &MuxSettings, sink: WriteSink) -> anyhow::Result<Self> {
        let mut io = AvioContext::writer(sink, settings.random_access)?;
        let format = CString::new(settings.format.as_str())?;
        let inner = unsafe {
            let mut ctx = ptr::null_mut();
            let ret = ffi::avformat_alloc_output_context2(&mut ctx, ptr::null(), format.as_ptr(), ptr::null());
            if ret < 0 || ctx.is_null() {
                return Err(anyhow::anyhow!(
                    "muxer {}: unknown format {}: {}",
                    settings.name,
                    settings.format,
                    ffmpeg_next::Error::from(ret)
                ));
            }
            (*ctx).pb = io.as_mut_ptr();
            (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as i32;
            ffmpeg_next::format::context::Output::wrap(ctx)
        };

        let mut output = Self {
            name: settings.name.clone(),
            inner,
            io,
            time_bases: Vec::new(),
            interleaved: settings.streams.len() > 1,
            have_written_trailer: false,
        };
        for params in &settings.streams {
            output.add_stream(params)?;
        }
        output.inner.write_header()?;
        output.time_bases = output
            .inner
            .streams()
            .map(|s| rational(s.time_base()))
            .collect();
        output.io.flush();
        log::info!(
            "muxer {}: {} with {} streams{}",
            output.name,
            settings.format,
            settings.streams.len(),
            if settings.random_access { ", random access" } else { "" }
        );
        Ok(output)
    }

    fn add_stream(&mut self, params: &avchain::stream::StreamParameters) -> anyhow::Result<()> {
        let parameters = codec_parameters(params)?;
        let mut writer_stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(parameters.id()))?;
        writer_stream.set_parameters(parameters);
        writer_stream.set_time_base(av_rational(params.time_base.or_micros()));
        Ok(())
    }

    pub fn write_packet(&mut self, stream_index: usize, mut packet: RawPacket) -> anyhow::Result<()> {
        let Some(&out_time_base) = self.time_bases.get(stream_index) else {
            return Err(anyhow::anyhow!("muxer {}: stream {} not found", self.name, stream_index));
        };
        packet.rescale(out_time_base);
        let p = packet.get_mut();
        p.set_stream(stream_index);
        p.set_position(-1);
        if self.interleaved {
            p.write_interleaved(&mut self.inner)?;
        } else {
            p.write(&mut self.inner)?;
        }
        Ok(())
    }

    pub fn finish(&mut self) -> anyhow::Result<()> {
        if !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
            self.io.flush();
            log::info!("muxer {}: trailer written", self.name);
        }
        Ok(())
    }
}

impl MuxContext for AvOutput {
    fn write_packets(&mut self, packets: Vec<StreamPacket>) -> anyhow::Result<()> {
        for unit in packets {
            self.write_packet(unit.stream_index, RawPacket::from_packet(unit.packet)?)?;
        }
        self.io.flush();
        Ok(())
    }

    fn write_trailer(&mut self) -> anyhow::Result<()> {
        self.finish()
    }
}

impl Drop for AvOutput {
    fn drop(&mut self) {
        // the AVIO context is not FFmpeg's to close
        unsafe { (*self.inner.as_mut_ptr()).pb = ptr::null_mut() };
    }
}
