use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Unit of timestamps on a substream: one tick lasts `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const MICROS: Rational = Rational {
        num: 1,
        den: 1_000_000,
    };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// `self` if it is a usable time base, microseconds otherwise.
    pub fn or_micros(self) -> Self {
        if self.is_valid() {
            self
        } else {
            Self::MICROS
        }
    }

    /// Number of ticks of this time base in `seconds`, rounded to nearest.
    pub fn ticks(&self, seconds: f64) -> i64 {
        (seconds * self.den as f64 / self.num as f64).round() as i64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::MICROS
    }
}

impl std::fmt::Display for Rational {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    #[default]
    Other,
}

impl MediaType {
    pub fn is_av(&self) -> bool {
        matches!(self, MediaType::Video | MediaType::Audio)
    }
}

/// Description of one substream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParameters {
    /// Engine codec name (`h264`, `vp8`, `opus`, ...). Empty when unknown.
    pub codec: String,
    pub media_type: MediaType,
    /// Pixel format for video, sample format for audio.
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub channel_layout: u64,
    pub frame_size: u32,
    pub bit_rate: u64,
    pub frame_rate: Option<Rational>,
    pub extradata: Option<Bytes>,
    pub time_base: Rational,
}

impl StreamParameters {
    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.media_type == MediaType::Audio
    }
}

/// Caller-provided overrides for parameters otherwise inferred from frames.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialStreamParameters {
    pub codec: Option<String>,
    pub media_type: Option<MediaType>,
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub channel_layout: Option<u64>,
    pub frame_size: Option<u32>,
    pub bit_rate: Option<u64>,
    pub frame_rate: Option<Rational>,
    pub time_base: Option<Rational>,
}

impl PartialStreamParameters {
    pub fn apply(&self, mut base: StreamParameters) -> StreamParameters {
        if let Some(codec) = &self.codec {
            base.codec = codec.clone();
        }
        if let Some(media_type) = self.media_type {
            base.media_type = media_type;
        }
        if let Some(format) = &self.format {
            base.format = format.clone();
        }
        base.width = self.width.unwrap_or(base.width);
        base.height = self.height.unwrap_or(base.height);
        base.sample_rate = self.sample_rate.unwrap_or(base.sample_rate);
        base.channels = self.channels.unwrap_or(base.channels);
        base.channel_layout = self.channel_layout.unwrap_or(base.channel_layout);
        base.frame_size = self.frame_size.unwrap_or(base.frame_size);
        base.bit_rate = self.bit_rate.unwrap_or(base.bit_rate);
        if self.frame_rate.is_some() {
            base.frame_rate = self.frame_rate;
        }
        if let Some(time_base) = self.time_base {
            base.time_base = time_base;
        }
        base.time_base = base.time_base.or_micros();
        base
    }
}
