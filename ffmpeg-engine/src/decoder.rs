use avchain::{
    engine::SoftwareDecoder,
    frame::Frame,
    packet::Packet,
    stream::{MediaType, Rational, StreamParameters},
};

use crate::{
    frame::RawFrame,
    packet::RawPacket,
    stream::{av_rational, codec_parameters},
};

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

impl DecoderType {
    fn send_packet(&mut self, packet: &ffmpeg_next::codec::packet::Packet) -> anyhow::Result<()> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_packet(packet)?,
            DecoderType::Audio(audio_decoder) => audio_decoder.send_packet(packet)?,
        }
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_eof()?,
            DecoderType::Audio(audio_decoder) => audio_decoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_frame(&mut self, time_base: Rational) -> anyhow::Result<Option<RawFrame>> {
        let res = match self {
            DecoderType::Video(video_decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                video_decoder
                    .receive_frame(&mut frame)
                    .map(|()| RawFrame::video(frame, Some(time_base)))
            }
            DecoderType::Audio(audio_decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                audio_decoder
                    .receive_frame(&mut frame)
                    .map(|()| RawFrame::audio(frame, Some(time_base)))
            }
        };
        match res {
            Ok(mut frame) => {
                if frame.pts().is_none() {
                    let best_effort = frame.timestamp();
                    frame.set_pts(best_effort);
                }
                Ok(Some(frame))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&mut self) {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.flush(),
            DecoderType::Audio(audio_decoder) => audio_decoder.flush(),
        }
    }
}

/// Send/receive decoder for one substream. Also drives hardware decoders,
/// which differ only in the codec implementation picked.
pub struct Decoder {
    inner: DecoderType,
    decoder_time_base: Rational,
}

impl Decoder {
    pub fn new(params: &StreamParameters, codec: Option<ffmpeg_next::Codec>) -> anyhow::Result<Self> {
        let mut decoder_ctx = match codec {
            Some(codec) => ffmpeg_next::codec::Context::new_with_codec(codec),
            None => ffmpeg_next::codec::Context::new(),
        };
        let decoder_time_base = params.time_base.or_micros();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = av_rational(decoder_time_base).into();
            (*decoder_ctx.as_mut_ptr()).pkt_timebase = av_rational(decoder_time_base).into();
        }
        decoder_ctx.set_parameters(codec_parameters(params)?)?;

        let decoder = decoder_ctx.decoder();
        let inner = match (params.media_type, codec) {
            (MediaType::Video, Some(codec)) => DecoderType::Video(decoder.open_as(codec)?.video()?),
            (MediaType::Video, None) => DecoderType::Video(decoder.video()?),
            (MediaType::Audio, Some(codec)) => DecoderType::Audio(decoder.open_as(codec)?.audio()?),
            (MediaType::Audio, None) => DecoderType::Audio(decoder.audio()?),
            (MediaType::Other, _) => return Err(anyhow::anyhow!("unsupported stream type")),
        };
        if let DecoderType::Video(video_decoder) = &inner {
            if video_decoder.width() == 0 || video_decoder.height() == 0 {
                return Err(anyhow::anyhow!("missing codec parameters"));
            }
        }

        Ok(Self {
            inner,
            decoder_time_base,
        })
    }

    pub fn send_packet(&mut self, mut packet: RawPacket) -> anyhow::Result<()> {
        packet.rescale(self.decoder_time_base);
        self.inner.send_packet(packet.packet())
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()
    }

    pub fn receive_frame(&mut self) -> anyhow::Result<Option<RawFrame>> {
        self.inner.receive_frame(self.decoder_time_base)
    }

    /// Drains every frame the decoder can produce without more input.
    pub fn receive_frames(&mut self, out: &mut Vec<RawFrame>) -> anyhow::Result<()> {
        while let Some(frame) = self.receive_frame()? {
            out.push(frame);
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        self.inner.flush();
    }
}

impl SoftwareDecoder for Decoder {
    fn decode(&mut self, packets: Vec<Packet>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Frame>> {
        let mut frames = Vec::new();
        for packet in packets {
            self.send_packet(RawPacket::from_packet(packet)?)?;
            self.receive_frames(&mut frames)?;
        }
        if fin {
            self.send_eof()?;
            self.receive_frames(&mut frames)?;
        }
        frames.into_iter().map(|f| f.into_frame(ptr)).collect()
    }

    fn flush_buffers(&mut self) {
        self.flush();
    }
}
