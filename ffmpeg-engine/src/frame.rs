use std::ffi::c_int;

use avchain::{
    frame::{Frame, FrameData, FrameFormat, FramePtr, NativeFrame, Plane},
    stream::{MediaType, Rational},
};
use bytes::Bytes;
use ffmpeg_next::{Rescale, ffi, frame};

use crate::stream::{av_rational, channels_of, pixel, pixel_name, sample, sample_name, set_channels};

#[derive(Clone)]
pub enum AvFrame {
    Video(frame::Video),
    Audio(frame::Audio),
}

/// Native frame carried behind a [`FramePtr`], with the time base of its pts.
#[derive(Clone)]
pub struct RawFrame {
    frame: AvFrame,
    time_base: Option<Rational>,
}

impl RawFrame {
    pub fn video(frame: frame::Video, time_base: Option<Rational>) -> Self {
        Self {
            frame: AvFrame::Video(frame),
            time_base,
        }
    }

    pub fn audio(frame: frame::Audio, time_base: Option<Rational>) -> Self {
        Self {
            frame: AvFrame::Audio(frame),
            time_base,
        }
    }

    pub fn frame(&self) -> &AvFrame {
        &self.frame
    }

    pub fn get_mut(&mut self) -> &mut AvFrame {
        &mut self.frame
    }

    pub fn time_base(&self) -> Option<Rational> {
        self.time_base
    }

    pub fn pts(&self) -> Option<i64> {
        match &self.frame {
            AvFrame::Video(f) => f.pts(),
            AvFrame::Audio(f) => f.pts(),
        }
    }

    /// Best-effort timestamp guessed by the decoder.
    pub fn timestamp(&self) -> Option<i64> {
        match &self.frame {
            AvFrame::Video(f) => f.timestamp(),
            AvFrame::Audio(f) => f.timestamp(),
        }
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        match &mut self.frame {
            AvFrame::Video(f) => f.set_pts(pts),
            AvFrame::Audio(f) => f.set_pts(pts),
        }
    }

    /// Moves the pts into `time_base`. Frames without a time base are
    /// assumed to already be in it.
    pub fn rescale(&mut self, time_base: Rational) {
        if let (Some(from), Some(pts)) = (self.time_base, self.pts()) {
            if from != time_base {
                self.set_pts(Some(pts.rescale(av_rational(from), av_rational(time_base))));
            }
        }
        self.time_base = Some(time_base);
    }

    pub fn frame_format(&self) -> FrameFormat {
        match &self.frame {
            AvFrame::Video(f) => FrameFormat {
                media_type: MediaType::Video,
                format: pixel_name(f.format()),
                width: f.width(),
                height: f.height(),
                time_base: self.time_base,
                ..Default::default()
            },
            AvFrame::Audio(f) => {
                let (channels, channel_layout) = unsafe { channels_of(&(*f.as_ptr()).ch_layout) };
                FrameFormat {
                    media_type: MediaType::Audio,
                    format: sample_name(f.format()),
                    sample_rate: f.rate(),
                    channels,
                    channel_layout,
                    time_base: self.time_base,
                    ..Default::default()
                }
            }
        }
    }

    pub fn from_data(data: &FrameData) -> anyhow::Result<Self> {
        match data.media_type {
            MediaType::Video => {
                let mut frame = frame::Video::new(pixel(&data.format)?, data.width, data.height);
                let planes = frame.planes();
                for (i, plane) in data.planes.iter().enumerate().take(planes) {
                    let stride = frame.stride(i);
                    copy_plane(&plane.data, plane.linesize, frame.data_mut(i), stride);
                }
                frame.set_pts(data.pts);
                if data.key {
                    frame.set_kind(ffmpeg_next::picture::Type::I);
                }
                Ok(Self::video(frame, data.time_base))
            }
            MediaType::Audio => {
                let mut frame = frame::Audio::empty();
                unsafe {
                    let ptr = frame.as_mut_ptr();
                    (*ptr).format = ffi::AVSampleFormat::from(sample(&data.format)?) as c_int;
                    (*ptr).nb_samples = data.nb_samples as c_int;
                    (*ptr).sample_rate = data.sample_rate as c_int;
                    set_channels(&mut (*ptr).ch_layout, data.channels, data.channel_layout);
                    if data.nb_samples > 0 {
                        let ret = ffi::av_frame_get_buffer(ptr, 0);
                        if ret < 0 {
                            return Err(ffmpeg_next::Error::from(ret).into());
                        }
                    }
                }
                if data.nb_samples > 0 {
                    for (i, plane) in data.planes.iter().enumerate().take(frame.planes()) {
                        let dst = frame.data_mut(i);
                        let n = dst.len().min(plane.data.len());
                        dst[..n].copy_from_slice(&plane.data[..n]);
                    }
                }
                frame.set_pts(data.pts);
                Ok(Self::audio(frame, data.time_base))
            }
            MediaType::Other => anyhow::bail!("not a video or audio frame"),
        }
    }

    pub fn to_data(&self) -> anyhow::Result<FrameData> {
        let format = self.frame_format();
        let mut data = FrameData {
            media_type: format.media_type,
            format: format.format,
            width: format.width,
            height: format.height,
            sample_rate: format.sample_rate,
            channels: format.channels,
            channel_layout: format.channel_layout,
            pts: self.pts(),
            time_base: self.time_base,
            ..Default::default()
        };
        match &self.frame {
            AvFrame::Video(f) => {
                data.key = f.is_key();
                data.planes = (0..f.planes())
                    .map(|i| Plane {
                        data: Bytes::copy_from_slice(f.data(i)),
                        linesize: f.stride(i),
                    })
                    .collect();
            }
            AvFrame::Audio(f) => {
                data.nb_samples = f.samples() as u32;
                let per_plane = if f.is_planar() { 1 } else { format.channels as usize };
                let len = f.samples() * f.format().bytes() * per_plane;
                data.planes = (0..f.planes())
                    .map(|i| {
                        let plane = f.data(i);
                        let plane = &plane[..len.min(plane.len())];
                        Plane {
                            data: Bytes::copy_from_slice(plane),
                            linesize: plane.len(),
                        }
                    })
                    .collect();
            }
        }
        Ok(data)
    }

    /// Takes ownership of a pipeline frame in any representation.
    pub fn from_frame(frame: Frame) -> anyhow::Result<Self> {
        match frame {
            Frame::Value(data) => Self::from_data(&data),
            Frame::Ptr(ptr) => ptr
                .downcast::<RawFrame>()
                .map_err(|_| anyhow::anyhow!("frame pointer was not created by this engine")),
            Frame::Native(native) => match native.as_any().downcast_ref::<RawFrame>() {
                Some(raw) => Ok(raw.clone()),
                None => Self::from_data(&native.to_frame_data()?),
            },
        }
    }

    pub fn into_frame(self, ptr: bool) -> anyhow::Result<Frame> {
        if ptr {
            Ok(Frame::Ptr(FramePtr::new(self)))
        } else {
            Ok(Frame::Value(self.to_data()?))
        }
    }
}

impl NativeFrame for RawFrame {
    fn frame_format(&self) -> FrameFormat {
        RawFrame::frame_format(self)
    }

    fn pts(&self) -> Option<i64> {
        RawFrame::pts(self)
    }

    fn to_frame_data(&self) -> anyhow::Result<FrameData> {
        self.to_data()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn copy_plane(src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize) {
    if src_stride == 0 || dst_stride == 0 {
        return;
    }
    let width = src_stride.min(dst_stride);
    for (src_row, dst_row) in src.chunks(src_stride).zip(dst.chunks_mut(dst_stride)) {
        let n = width.min(src_row.len()).min(dst_row.len());
        dst_row[..n].copy_from_slice(&src_row[..n]);
    }
}
