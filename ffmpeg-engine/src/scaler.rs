use ffmpeg_next::{format::Pixel, frame, software::scaling};

/// Pixel format and size converter in front of a video encoder.
pub struct Scaler {
    context: scaling::Context,
}

impl Scaler {
    pub fn new(source: &frame::Video, format: Pixel, width: u32, height: u32) -> anyhow::Result<Self> {
        let context = scaling::Context::get(
            source.format(),
            source.width(),
            source.height(),
            format,
            width,
            height,
            scaling::flag::Flags::BILINEAR,
        )?;
        Ok(Self { context })
    }

    /// Whether frames shaped like `frame` can go through this scaler.
    pub fn accepts(&self, frame: &frame::Video) -> bool {
        let input = self.context.input();
        input.format == frame.format() && input.width == frame.width() && input.height == frame.height()
    }

    pub fn run(&mut self, frame: &frame::Video) -> anyhow::Result<frame::Video> {
        let mut converted = frame::Video::empty();
        self.context.run(frame, &mut converted)?;
        converted.set_pts(frame.pts());
        Ok(converted)
    }
}

unsafe impl Send for Scaler {}
