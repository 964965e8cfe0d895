use std::any::Any;

use bytes::Bytes;

use crate::stream::{MediaType, Rational};

/// Shape of a frame, enough to configure a filter graph input.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameFormat {
    pub media_type: MediaType,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub channel_layout: u64,
    pub time_base: Option<Rational>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plane {
    pub data: Bytes,
    pub linesize: usize,
}

/// Raw frame copied out of the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameData {
    pub media_type: MediaType,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub channel_layout: u64,
    pub nb_samples: u32,
    pub planes: Vec<Plane>,
    pub pts: Option<i64>,
    pub time_base: Option<Rational>,
    pub key: bool,
}

impl FrameData {
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat {
            media_type: self.media_type,
            format: self.format.clone(),
            width: self.width,
            height: self.height,
            sample_rate: self.sample_rate,
            channels: self.channels,
            channel_layout: self.channel_layout,
            time_base: self.time_base,
        }
    }
}

/// Frame produced by a hardware codec service. Dropping it closes the frame.
pub trait NativeFrame: Send {
    fn frame_format(&self) -> FrameFormat;

    fn pts(&self) -> Option<i64>;

    /// Copies the frame into engine layout.
    fn to_frame_data(&self) -> anyhow::Result<FrameData>;

    fn as_any(&self) -> &dyn Any;
}

/// Opaque engine-owned frame. Dropping it releases the native frame.
pub struct FramePtr(Box<dyn Any + Send>);

impl FramePtr {
    pub fn new<T: Any + Send>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut()
    }

    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        match self.0.downcast::<T>() {
            Ok(inner) => Ok(*inner),
            Err(inner) => Err(Self(inner)),
        }
    }
}

impl std::fmt::Debug for FramePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FramePtr(..)")
    }
}

pub enum Frame {
    Native(Box<dyn NativeFrame>),
    Value(FrameData),
    Ptr(FramePtr),
}

impl Frame {
    pub fn is_native(&self) -> bool {
        matches!(self, Frame::Native(_))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Native(native) => write!(f, "Native({:?})", native.frame_format()),
            Frame::Value(data) => write!(f, "Value({:?}, pts {:?})", data.format, data.pts),
            Frame::Ptr(ptr) => ptr.fmt(f),
        }
    }
}

impl From<FrameData> for Frame {
    fn from(data: FrameData) -> Self {
        Frame::Value(data)
    }
}

#[derive(Debug)]
pub struct StreamFrame {
    pub stream_index: usize,
    pub frame: Frame,
}

impl StreamFrame {
    pub fn new(stream_index: usize, frame: impl Into<Frame>) -> Self {
        Self {
            stream_index,
            frame: frame.into(),
        }
    }
}
