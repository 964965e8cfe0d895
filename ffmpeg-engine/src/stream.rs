//! Translation between avchain stream descriptions and FFmpeg codec parameters.

use std::ffi::{c_int, CString};

use avchain::stream::{MediaType, Rational, StreamParameters};
use bytes::Bytes;
use ffmpeg_next::{
    codec::Parameters,
    ffi,
    format::{stream, Pixel, Sample},
};

pub fn av_rational(r: Rational) -> ffmpeg_next::Rational {
    ffmpeg_next::Rational::new(r.num, r.den)
}

pub fn rational(r: ffmpeg_next::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

pub fn media_type(medium: ffmpeg_next::media::Type) -> MediaType {
    match medium {
        ffmpeg_next::media::Type::Video => MediaType::Video,
        ffmpeg_next::media::Type::Audio => MediaType::Audio,
        _ => MediaType::Other,
    }
}

pub fn medium(media_type: MediaType) -> ffmpeg_next::media::Type {
    match media_type {
        MediaType::Video => ffmpeg_next::media::Type::Video,
        MediaType::Audio => ffmpeg_next::media::Type::Audio,
        MediaType::Other => ffmpeg_next::media::Type::Data,
    }
}

/// Resolves a codec name (`vp8`, `opus`) or an implementation name (`libvpx`).
pub fn codec_id(name: &str) -> anyhow::Result<ffmpeg_next::codec::Id> {
    let cname = CString::new(name)?;
    let descriptor = unsafe { ffi::avcodec_descriptor_get_by_name(cname.as_ptr()) };
    if !descriptor.is_null() {
        return Ok(unsafe { (*descriptor).id }.into());
    }
    ffmpeg_next::encoder::find_by_name(name)
        .or_else(|| ffmpeg_next::decoder::find_by_name(name))
        .map(|codec| codec.id())
        .ok_or_else(|| anyhow::anyhow!("unknown codec: {}", name))
}

pub fn pixel_name(format: Pixel) -> String {
    format
        .descriptor()
        .map(|d| d.name().to_string())
        .unwrap_or_default()
}

pub fn pixel(name: &str) -> anyhow::Result<Pixel> {
    name.parse::<Pixel>()
        .map_err(|_| anyhow::anyhow!("unknown pixel format: {}", name))
}

pub fn sample_name(format: Sample) -> String {
    if format == Sample::None {
        String::new()
    } else {
        format.name().to_string()
    }
}

pub fn sample(name: &str) -> anyhow::Result<Sample> {
    match Sample::from(name) {
        Sample::None => Err(anyhow::anyhow!("unknown sample format: {}", name)),
        format => Ok(format),
    }
}

/// Channel count and native-order mask (0 when the order is not native).
pub(crate) unsafe fn channels_of(layout: *const ffi::AVChannelLayout) -> (u32, u64) {
    unsafe {
        let channels = (*layout).nb_channels.max(0) as u32;
        let mask = if (*layout).order == ffi::AVChannelOrder::AV_CHANNEL_ORDER_NATIVE {
            (*layout).u.mask
        } else {
            0
        };
        (channels, mask)
    }
}

pub(crate) unsafe fn set_channels(layout: *mut ffi::AVChannelLayout, channels: u32, mask: u64) {
    unsafe {
        ffi::av_channel_layout_uninit(layout);
        if mask != 0 {
            ffi::av_channel_layout_from_mask(layout, mask);
        } else {
            ffi::av_channel_layout_default(layout, channels as c_int);
        }
    }
}

pub fn describe(
    parameters: &Parameters,
    time_base: Rational,
    frame_rate: Option<Rational>,
) -> StreamParameters {
    let media_type = media_type(parameters.medium());
    let mut out = StreamParameters {
        codec: parameters.id().name().to_string(),
        media_type,
        frame_rate,
        time_base: time_base.or_micros(),
        ..Default::default()
    };
    unsafe {
        let ptr = parameters.as_ptr();
        out.bit_rate = (*ptr).bit_rate.max(0) as u64;
        out.frame_size = (*ptr).frame_size.max(0) as u32;
        match media_type {
            MediaType::Video => {
                out.width = (*ptr).width.max(0) as u32;
                out.height = (*ptr).height.max(0) as u32;
                let format = std::mem::transmute::<c_int, ffi::AVPixelFormat>((*ptr).format);
                out.format = pixel_name(Pixel::from(format));
            }
            MediaType::Audio => {
                out.sample_rate = (*ptr).sample_rate.max(0) as u32;
                (out.channels, out.channel_layout) = channels_of(&(*ptr).ch_layout);
                let format = std::mem::transmute::<c_int, ffi::AVSampleFormat>((*ptr).format);
                out.format = sample_name(Sample::from(format));
            }
            MediaType::Other => {}
        }
        if !(*ptr).extradata.is_null() && (*ptr).extradata_size > 0 {
            let extradata =
                std::slice::from_raw_parts((*ptr).extradata, (*ptr).extradata_size as usize);
            out.extradata = Some(Bytes::copy_from_slice(extradata));
        }
    }
    out
}

/// Parameters of a container stream.
pub fn describe_stream(stream: &stream::Stream) -> StreamParameters {
    let rate = stream.avg_frame_rate();
    let frame_rate = (rate.numerator() > 0 && rate.denominator() > 0).then(|| rational(rate));
    describe(&stream.parameters(), rational(stream.time_base()), frame_rate)
}

pub fn codec_parameters(params: &StreamParameters) -> anyhow::Result<Parameters> {
    let id = codec_id(&params.codec)?;
    let mut parameters = Parameters::new();
    unsafe {
        let ptr = parameters.as_mut_ptr();
        (*ptr).codec_type = medium(params.media_type).into();
        (*ptr).codec_id = id.into();
        (*ptr).codec_tag = 0;
        (*ptr).bit_rate = params.bit_rate as i64;
        match params.media_type {
            MediaType::Video => {
                (*ptr).width = params.width as c_int;
                (*ptr).height = params.height as c_int;
                if !params.format.is_empty() {
                    (*ptr).format = ffi::AVPixelFormat::from(pixel(&params.format)?) as c_int;
                }
            }
            MediaType::Audio => {
                (*ptr).sample_rate = params.sample_rate as c_int;
                (*ptr).frame_size = params.frame_size as c_int;
                set_channels(&mut (*ptr).ch_layout, params.channels, params.channel_layout);
                if !params.format.is_empty() {
                    (*ptr).format = ffi::AVSampleFormat::from(sample(&params.format)?) as c_int;
                }
            }
            MediaType::Other => {}
        }
        if let Some(extradata) = &params.extradata {
            let size = extradata.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
            let buf = ffi::av_mallocz(size) as *mut u8;
            if buf.is_null() {
                anyhow::bail!("out of memory copying extradata");
            }
            std::ptr::copy_nonoverlapping(extradata.as_ptr(), buf, extradata.len());
            (*ptr).extradata = buf;
            (*ptr).extradata_size = extradata.len() as c_int;
        }
    }
    Ok(parameters)
}
