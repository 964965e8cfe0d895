use avchain::{
    engine::{FilterGraph, FilterSpec},
    frame::{Frame, FrameFormat},
    stream::{MediaType, Rational},
};
use ffmpeg_next::{filter, frame, util::error};

use crate::{
    frame::{AvFrame, RawFrame},
    stream::rational,
};

struct Configured {
    graph: filter::Graph,
    media_type: MediaType,
    input_time_base: Rational,
    sink_time_base: Rational,
}

/// Filter graph of one `buffer`/`abuffer` source and one sink. The graph is
/// configured from the first frame so upstream formats need not be known
/// up front.
pub struct AvFilterGraph {
    spec: FilterSpec,
    configured: Option<Configured>,
    finished: bool,
}

unsafe impl Send for AvFilterGraph {}

impl AvFilterGraph {
    pub fn new(spec: &FilterSpec) -> anyhow::Result<Self> {
        if spec.input.media_type == MediaType::Other {
            anyhow::bail!("filter graph needs a video or audio input");
        }
        Ok(Self {
            spec: spec.clone(),
            configured: None,
            finished: false,
        })
    }

    fn configure(&self, first: &FrameFormat) -> anyhow::Result<Configured> {
        let input = merge(first, &self.spec.input);
        let input_time_base = input.time_base.unwrap_or_default().or_micros();
        let tb = input_time_base;
        let mut graph = filter::Graph::new();
        let (source, sink, args, default_description) = match input.media_type {
            MediaType::Video => (
                "buffer",
                "buffersink",
                format!(
                    "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect=1/1",
                    input.width, input.height, input.format, tb.num, tb.den
                ),
                "null",
            ),
            MediaType::Audio => (
                "abuffer",
                "abuffersink",
                format!(
                    "time_base={}/{}:sample_rate={}:sample_fmt={}:{}",
                    tb.num,
                    tb.den,
                    input.sample_rate,
                    input.format,
                    layout_arg("channel_layout", input.channels, input.channel_layout)
                ),
                "anull",
            ),
            MediaType::Other => anyhow::bail!("filter graph needs a video or audio input"),
        };
        let find = |name: &str| filter::find(name).ok_or_else(|| anyhow::anyhow!("filter not found: {}", name));
        graph.add(&find(source)?, "in", &args)?;
        graph.add(&find(sink)?, "out", "")?;

        let mut description = self.spec.description.trim().to_string();
        if description.is_empty() {
            description = default_description.to_string();
        }
        if let Some(conversion) = output_conversion(&self.spec.output, input.media_type) {
            description = format!("{},{}", description, conversion);
        }
        graph.output("in", 0)?.input("out", 0)?.parse(&description)?;
        graph.validate()?;

        if input.media_type == MediaType::Audio && self.spec.frame_size > 0 {
            if let Some(mut out) = graph.get("out") {
                out.sink().set_frame_size(self.spec.frame_size);
            }
        }

        let sink_time_base = match graph.get("out") {
            Some(out) => rational(unsafe { ffi_sink_time_base(out.as_ptr()) }),
            None => anyhow::bail!("filter graph lost its sink"),
        };
        log::debug!(
            "filter graph configured: {} ({} -> tb {})",
            description,
            args,
            sink_time_base
        );
        Ok(Configured {
            graph,
            media_type: input.media_type,
            input_time_base,
            sink_time_base,
        })
    }

    fn push(&mut self, mut frame: RawFrame) -> anyhow::Result<()> {
        if self.configured.is_none() {
            self.configured = Some(self.configure(&frame.frame_format())?);
        }
        let Some(configured) = self.configured.as_mut() else {
            return Ok(());
        };
        frame.rescale(configured.input_time_base);
        let mut source = configured
            .graph
            .get("in")
            .ok_or_else(|| anyhow::anyhow!("filter graph lost its source"))?;
        match frame.frame() {
            AvFrame::Video(f) => source.source().add(f)?,
            AvFrame::Audio(f) => source.source().add(f)?,
        }
        Ok(())
    }

    fn pull(&mut self, out: &mut Vec<RawFrame>) -> anyhow::Result<()> {
        let output_time_base = self.spec.output.time_base;
        let Some(configured) = self.configured.as_mut() else {
            return Ok(());
        };
        let mut sink = configured
            .graph
            .get("out")
            .ok_or_else(|| anyhow::anyhow!("filter graph lost its sink"))?;
        loop {
            let res = match configured.media_type {
                MediaType::Video => {
                    let mut f = frame::Video::empty();
                    sink.sink()
                        .frame(&mut f)
                        .map(|()| RawFrame::video(f, Some(configured.sink_time_base)))
                }
                _ => {
                    let mut f = frame::Audio::empty();
                    sink.sink()
                        .frame(&mut f)
                        .map(|()| RawFrame::audio(f, Some(configured.sink_time_base)))
                }
            };
            match res {
                Ok(mut frame) => {
                    if let Some(tb) = output_time_base {
                        frame.rescale(tb);
                    }
                    out.push(frame);
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(ffmpeg_next::Error::Other { errno }) if errno == error::EAGAIN => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(configured) = self.configured.as_mut() {
            if let Some(mut source) = configured.graph.get("in") {
                source.source().flush()?;
            }
        }
        Ok(())
    }
}

impl FilterGraph for AvFilterGraph {
    fn filter(&mut self, frames: Vec<Frame>, fin: bool, ptr: bool) -> anyhow::Result<Vec<Frame>> {
        let mut out = Vec::new();
        for frame in frames {
            self.push(RawFrame::from_frame(frame)?)?;
            self.pull(&mut out)?;
        }
        if fin {
            self.flush()?;
            self.pull(&mut out)?;
        }
        out.into_iter().map(|f| f.into_frame(ptr)).collect()
    }
}

unsafe fn ffi_sink_time_base(ctx: *const ffmpeg_next::ffi::AVFilterContext) -> ffmpeg_next::Rational {
    unsafe { ffmpeg_next::ffi::av_buffersink_get_time_base(ctx).into() }
}

/// Fields the frame leaves unset are taken from the declared input format.
fn merge(frame: &FrameFormat, declared: &FrameFormat) -> FrameFormat {
    let pick = |a: u32, b: u32| if a > 0 { a } else { b };
    FrameFormat {
        media_type: frame.media_type,
        format: if frame.format.is_empty() {
            declared.format.clone()
        } else {
            frame.format.clone()
        },
        width: pick(frame.width, declared.width),
        height: pick(frame.height, declared.height),
        sample_rate: pick(frame.sample_rate, declared.sample_rate),
        channels: pick(frame.channels, declared.channels),
        channel_layout: if frame.channel_layout != 0 {
            frame.channel_layout
        } else {
            declared.channel_layout
        },
        time_base: frame.time_base.or(declared.time_base),
    }
}

fn layout_arg(key: &str, channels: u32, mask: u64) -> String {
    if mask != 0 {
        format!("{}=0x{:x}", key, mask)
    } else {
        format!("channels={}", channels.max(1))
    }
}

/// Trailing `format`/`aformat` filter pinning the requested output format.
fn output_conversion(output: &FrameFormat, media_type: MediaType) -> Option<String> {
    match media_type {
        MediaType::Video if !output.format.is_empty() => Some(format!("format=pix_fmts={}", output.format)),
        MediaType::Audio => {
            let mut opts = Vec::new();
            if !output.format.is_empty() {
                opts.push(format!("sample_fmts={}", output.format));
            }
            if output.sample_rate > 0 {
                opts.push(format!("sample_rates={}", output.sample_rate));
            }
            if output.channel_layout != 0 {
                opts.push(format!("channel_layouts=0x{:x}", output.channel_layout));
            } else if output.channels > 0 {
                opts.push(format!("channel_layouts={}c", output.channels));
            }
            (!opts.is_empty()).then(|| format!("aformat={}", opts.join(":")))
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "filter_test.rs"]
mod filter_test;
