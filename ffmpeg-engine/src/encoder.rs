use avchain::{
    engine::{EncoderSettings, SoftwareEncoder},
    frame::Frame,
    packet::Packet,
    stream::{MediaType, Rational, StreamParameters},
};
use ffmpeg_next::{
    Dictionary,
    codec::{Parameters, capabilities::Capabilities},
    ffi,
    format::{Pixel, Sample},
};

use crate::{
    frame::{AvFrame, RawFrame},
    packet::RawPacket,
    scaler::Scaler,
    stream::{av_rational, codec_id, describe, pixel, rational, sample, set_channels},
};

pub enum EncoderType {
    Video(ffmpeg_next::codec::encoder::Video),
    Audio(ffmpeg_next::codec::encoder::Audio),
}

impl EncoderType {
    fn send_frame(&mut self, frame: &RawFrame) -> anyhow::Result<()> {
        match (self, frame.frame()) {
            (EncoderType::Video(encoder), AvFrame::Video(frame)) => encoder.send_frame(frame)?,
            (EncoderType::Audio(encoder), AvFrame::Audio(frame)) => encoder.send_frame(frame)?,
            _ => anyhow::bail!("invalid frame type"),
        };
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        match self {
            EncoderType::Video(encoder) => encoder.send_eof()?,
            EncoderType::Audio(encoder) => encoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_packet(&mut self, time_base: Rational) -> anyhow::Result<Option<RawPacket>> {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        let encode_result = match self {
            EncoderType::Video(encoder) => encoder.receive_packet(&mut packet),
            EncoderType::Audio(encoder) => encoder.receive_packet(&mut packet),
        };

        match encode_result {
            Ok(()) => Ok(Some(RawPacket::from((packet, time_base)))),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn as_ptr(&self) -> *const ffi::AVCodecContext {
        unsafe {
            match self {
                EncoderType::Video(encoder) => encoder.as_ptr(),
                EncoderType::Audio(encoder) => encoder.as_ptr(),
            }
        }
    }
}

/// Looks an encoder up by codec name first, then by implementation name.
pub fn find_encoder(name: &str) -> anyhow::Result<ffmpeg_next::Codec> {
    let cname = std::ffi::CString::new(name)?;
    let is_codec_name = unsafe { !ffi::avcodec_descriptor_get_by_name(cname.as_ptr()).is_null() };
    let codec = if is_codec_name {
        ffmpeg_next::encoder::find(codec_id(name)?)
    } else {
        ffmpeg_next::encoder::find_by_name(name)
    };
    codec.ok_or_else(|| anyhow::anyhow!("codec not found: {}", name))
}

fn options(settings: &EncoderSettings, codec: &ffmpeg_next::Codec) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    for (key, value) in &settings.options {
        opts.set(key, value);
    }
    if settings.options.is_empty() && codec.name() == "libx264" {
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
    }
    opts
}

/// Send/receive encoder for one substream, shared by the software engine and
/// the hardware workers.
pub struct Encoder {
    inner: EncoderType,
    encoder_time_base: Rational,
    parameters: StreamParameters,
    frame_size: u32,
    scaler: Option<Scaler>,
}

impl Encoder {
    pub fn new(settings: &EncoderSettings, codec: ffmpeg_next::Codec) -> anyhow::Result<Self> {
        let mut context = ffmpeg_next::codec::Context::new_with_codec(codec);
        context.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        if codec.capabilities().contains(Capabilities::EXPERIMENTAL) {
            unsafe { (*context.as_mut_ptr()).strict_std_compliance = ffi::FF_COMPLIANCE_EXPERIMENTAL };
        }
        let opts = options(settings, &codec);

        let inner = match settings.media_type {
            MediaType::Video => {
                let format = if settings.format.is_empty() {
                    codec
                        .video()
                        .ok()
                        .and_then(|v| v.formats().and_then(|mut f| f.next()))
                        .unwrap_or(Pixel::YUV420P)
                } else {
                    pixel(&settings.format)?
                };
                let mut encoder = context.encoder().video()?;
                encoder.set_width(settings.width);
                encoder.set_height(settings.height);
                encoder.set_format(format);
                encoder.set_frame_rate(settings.frame_rate.map(av_rational));
                encoder.set_time_base(av_rational(settings.time_base.or_micros()));
                if settings.bit_rate > 0 {
                    encoder.set_bit_rate(settings.bit_rate as usize);
                }
                EncoderType::Video(encoder.open_with(opts)?)
            }
            MediaType::Audio => {
                let format = if settings.format.is_empty() {
                    codec
                        .audio()
                        .ok()
                        .and_then(|a| a.formats().and_then(|mut f| f.next()))
                        .unwrap_or(Sample::F32(ffmpeg_next::format::sample::Type::Planar))
                } else {
                    sample(&settings.format)?
                };
                let mut encoder = context.encoder().audio()?;
                encoder.set_rate(settings.sample_rate as i32);
                encoder.set_format(format);
                unsafe {
                    set_channels(
                        &mut (*encoder.as_mut_ptr()).ch_layout,
                        settings.channels,
                        settings.channel_layout,
                    );
                }
                encoder.set_time_base(ffmpeg_next::Rational::new(1, settings.sample_rate.max(1) as i32));
                if settings.bit_rate > 0 {
                    encoder.set_bit_rate(settings.bit_rate as usize);
                }
                EncoderType::Audio(encoder.open_with(opts)?)
            }
            MediaType::Other => anyhow::bail!("unsupported stream type"),
        };

        let encoder_time_base = rational(unsafe { (*inner.as_ptr()).time_base.into() });
        let mut parameters = Parameters::new();
        let ret = unsafe { ffi::avcodec_parameters_from_context(parameters.as_mut_ptr(), inner.as_ptr()) };
        if ret < 0 {
            return Err(ffmpeg_next::Error::from(ret).into());
        }
        let mut parameters = describe(&parameters, encoder_time_base, settings.frame_rate);
        parameters.codec = settings.codec.clone();

        let frame_size = match &inner {
            EncoderType::Audio(encoder)
                if !codec.capabilities().contains(Capabilities::VARIABLE_FRAME_SIZE) =>
            {
                encoder.frame_size()
            }
            _ => 0,
        };
        log::info!(
            "encoder opened successfully: {} ({}), time_base {}",
            codec.name(),
            settings.codec,
            encoder_time_base
        );

        Ok(Self {
            inner,
            encoder_time_base,
            parameters,
            frame_size,
            scaler: None,
        })
    }

    pub fn parameters(&self) -> &StreamParameters {
        &self.parameters
    }

    pub fn send_frame(&mut self, mut frame: RawFrame) -> anyhow::Result<()> {
        frame.rescale(self.encoder_time_base);
        let converted = match (&self.inner, frame.frame()) {
            (EncoderType::Video(e), AvFrame::Video(f))
                if f.format() != e.format() || f.width() != e.width() || f.height() != e.height() =>
            {
                let scaler = match self.scaler.take() {
                    Some(scaler) if scaler.accepts(f) => scaler,
                    _ => Scaler::new(f, e.format(), e.width(), e.height())?,
                };
                let scaler = self.scaler.insert(scaler);
                Some(scaler.run(f)?)
            }
            _ => None,
        };
        if let Some(converted) = converted {
            frame = RawFrame::video(converted, frame.time_base());
        }
        self.inner.send_frame(&frame)
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()
    }

    pub fn receive_packet(&mut self) -> anyhow::Result<Option<RawPacket>> {
        self.inner.receive_packet(self.encoder_time_base)
    }

    pub fn receive_packets(&mut self, out: &mut Vec<RawPacket>) -> anyhow::Result<()> {
        while let Some(packet) = self.receive_packet()? {
            out.push(packet);
        }
        Ok(())
    }
}

impl SoftwareEncoder for Encoder {
    fn parameters(&self) -> StreamParameters {
        self.parameters.clone()
    }

    fn frame_size(&self) -> u32 {
        self.frame_size
    }

    fn encode(&mut self, frames: Vec<Frame>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Packet>> {
        let mut packets = Vec::new();
        for frame in frames {
            self.send_frame(RawFrame::from_frame(frame)?)?;
            self.receive_packets(&mut packets)?;
        }
        if fin {
            self.send_eof()?;
            self.receive_packets(&mut packets)?;
        }
        Ok(packets.into_iter().map(|p| p.into_packet(ptr)).collect())
    }
}
