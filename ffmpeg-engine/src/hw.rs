//! Hardware-accelerated codecs (CUDA/VAAPI/QSV/V4L2M2M).
//!
//! Each opened codec runs on a blocking worker thread. Units are queued from
//! the pipeline and outputs are reported through the codec's [`HwSink`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};

use avchain::{
    engine::EncoderSettings,
    frame::Frame,
    hw::{DecodedFrame, EncodedChunk, HwCodecService, HwDecoder, HwEncoder, HwQueue, HwSink},
    packet::Packet,
    stream::{MediaType, StreamParameters},
};
use ffmpeg_next::{ffi, format::Pixel, frame};
use futures::{FutureExt, future::BoxFuture};
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    decoder::Decoder,
    encoder::Encoder,
    frame::{AvFrame, RawFrame},
    packet::RawPacket,
    stream::{codec_id, pixel, pixel_name},
};

/// Try to find a hardware-accelerated decoder for the given codec ID.
pub fn find_hw_decoder(codec_id: ffmpeg_next::codec::Id) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_id {
        ffmpeg_next::codec::Id::H264 => &["h264_cuvid", "h264_qsv", "h264_v4l2m2m"],
        ffmpeg_next::codec::Id::HEVC => &["hevc_cuvid", "hevc_qsv", "hevc_v4l2m2m"],
        ffmpeg_next::codec::Id::VP8 => &["vp8_cuvid", "vp8_qsv", "vp8_v4l2m2m"],
        ffmpeg_next::codec::Id::VP9 => &["vp9_cuvid", "vp9_qsv", "vp9_v4l2m2m"],
        ffmpeg_next::codec::Id::AV1 => &["av1_cuvid", "av1_qsv"],
        ffmpeg_next::codec::Id::MPEG2VIDEO => &["mpeg2_cuvid", "mpeg2_qsv", "mpeg2_v4l2m2m"],
        ffmpeg_next::codec::Id::MPEG4 => &["mpeg4_cuvid", "mpeg4_v4l2m2m"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::decoder::find_by_name(name) {
            log::info!("found hardware decoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// Try to find a hardware-accelerated encoder for a codec or software encoder name.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        "libvpx-vp9" | "vp9" => &["vp9_vaapi", "vp9_qsv"],
        "libaom-av1" | "libsvtav1" | "av1" => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// Input pixel format for an encoder. Hardware encoders get NV12 unless a
/// YUV format was asked for.
pub fn pixel_format_for_encoder(source: Option<Pixel>, codec_name: &str) -> Pixel {
    let is_hw = codec_name.contains("nvenc")
        || codec_name.contains("vaapi")
        || codec_name.contains("qsv")
        || codec_name.contains("v4l2m2m");
    match source {
        None | Some(Pixel::RGB24) | Some(Pixel::BGR24) if is_hw => Pixel::NV12,
        None | Some(Pixel::RGB24) | Some(Pixel::BGR24) => Pixel::YUV420P,
        Some(source) => source,
    }
}

enum Job<U> {
    Unit(U),
    Flush(oneshot::Sender<anyhow::Result<()>>),
}

/// Codec state driven by a worker thread.
trait CodecLoop: Send + 'static {
    type Unit: Send + 'static;

    fn submit(&mut self, unit: Self::Unit) -> anyhow::Result<()>;

    /// Drains the codec to EOF and leaves it ready for more input where the
    /// codec allows it.
    fn flush(&mut self) -> anyhow::Result<()>;

    fn report(&self, err: anyhow::Error);
}

struct Queue<U> {
    name: String,
    jobs: mpsc::Sender<Job<U>>,
    queued: Arc<AtomicUsize>,
    dequeued: Arc<Notify>,
    cancel: CancellationToken,
}

impl<U: Send + 'static> Queue<U> {
    fn spawn<L: CodecLoop<Unit = U>>(name: String, codec: L) -> Self {
        let (jobs, rx) = mpsc::channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let dequeued = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let (worker_queued, worker_dequeued, worker_cancel) =
            (queued.clone(), dequeued.clone(), cancel.clone());
        let worker_name = name.clone();
        tokio::task::spawn_blocking(move || {
            Self::worker_loop(codec, worker_cancel, rx, worker_queued, worker_dequeued);
            log::debug!("hardware codec {} stopped", worker_name);
        });
        Self {
            name,
            jobs,
            queued,
            dequeued,
            cancel,
        }
    }

    fn worker_loop<L: CodecLoop<Unit = U>>(
        mut codec: L,
        cancel: CancellationToken,
        rx: mpsc::Receiver<Job<U>>,
        queued: Arc<AtomicUsize>,
        dequeued: Arc<Notify>,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(1)) {
                Ok(Job::Unit(unit)) => {
                    let res = codec.submit(unit);
                    queued.fetch_sub(1, Ordering::SeqCst);
                    dequeued.notify_one();
                    if let Err(e) = res {
                        log::error!("hardware codec error: {}", e);
                        codec.report(e);
                    }
                }
                Ok(Job::Flush(done)) => {
                    let _ = done.send(codec.flush());
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn submit(&self, unit: U) -> anyhow::Result<()> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(Job::Unit(unit)).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("hardware codec {} has stopped", self.name);
        }
        Ok(())
    }

    fn queue_size(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn dequeued(&self) -> BoxFuture<'_, ()> {
        let dequeued = self.dequeued.clone();
        async move { dequeued.notified().await }.boxed()
    }

    fn flush(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        let (tx, rx) = oneshot::channel();
        let sent = self.jobs.send(Job::Flush(tx));
        async move {
            if sent.is_err() {
                anyhow::bail!("hardware codec {} has stopped", self.name);
            }
            rx.await
                .map_err(|_| anyhow::anyhow!("hardware codec {} stopped while flushing", self.name))?
        }
        .boxed()
    }
}

impl<U> Drop for Queue<U> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct DecodeLoop {
    decoder: Decoder,
    sink: HwSink<DecodedFrame>,
}

impl DecodeLoop {
    fn emit(&mut self) -> anyhow::Result<()> {
        let mut frames = Vec::new();
        self.decoder.receive_frames(&mut frames)?;
        for frame in frames {
            self.sink.output(Box::new(download(frame)?));
        }
        Ok(())
    }
}

impl CodecLoop for DecodeLoop {
    type Unit = RawPacket;

    fn submit(&mut self, packet: RawPacket) -> anyhow::Result<()> {
        self.decoder.send_packet(packet)?;
        self.emit()
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof()?;
        self.emit()?;
        self.decoder.flush();
        Ok(())
    }

    fn report(&self, err: anyhow::Error) {
        self.sink.error(err);
    }
}

/// Copies a frame living in device memory back to system memory.
fn download(frame: RawFrame) -> anyhow::Result<RawFrame> {
    let AvFrame::Video(video) = frame.frame() else {
        return Ok(frame);
    };
    if unsafe { (*video.as_ptr()).hw_frames_ctx.is_null() } {
        return Ok(frame);
    }
    let mut sw = frame::Video::empty();
    let ret = unsafe { ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), video.as_ptr(), 0) };
    if ret < 0 {
        return Err(ffmpeg_next::Error::from(ret).into());
    }
    sw.set_pts(video.pts());
    Ok(RawFrame::video(sw, frame.time_base()))
}

struct EncodeLoop {
    encoder: Encoder,
    sink: HwSink<EncodedChunk>,
    announced: bool,
}

impl EncodeLoop {
    fn emit(&mut self) -> anyhow::Result<()> {
        let mut packets = Vec::new();
        self.encoder.receive_packets(&mut packets)?;
        for packet in packets {
            let parameters = if self.announced {
                None
            } else {
                self.announced = true;
                Some(self.encoder.parameters().clone())
            };
            self.sink.output(EncodedChunk {
                packet: packet.to_data(),
                parameters,
            });
        }
        Ok(())
    }
}

impl CodecLoop for EncodeLoop {
    type Unit = RawFrame;

    fn submit(&mut self, frame: RawFrame) -> anyhow::Result<()> {
        self.encoder.send_frame(frame)?;
        self.emit()
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof()?;
        self.emit()
    }

    fn report(&self, err: anyhow::Error) {
        self.sink.error(err);
    }
}

pub struct FfmpegHwDecoder(Queue<RawPacket>);

impl HwQueue for FfmpegHwDecoder {
    fn queue_size(&self) -> usize {
        self.0.queue_size()
    }

    fn dequeued(&mut self) -> BoxFuture<'_, ()> {
        self.0.dequeued()
    }

    fn flush(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.0.flush()
    }
}

impl HwDecoder for FfmpegHwDecoder {
    fn decode(&mut self, packet: Packet) -> anyhow::Result<()> {
        self.0.submit(RawPacket::from_packet(packet)?)
    }
}

pub struct FfmpegHwEncoder(Queue<RawFrame>);

impl HwQueue for FfmpegHwEncoder {
    fn queue_size(&self) -> usize {
        self.0.queue_size()
    }

    fn dequeued(&mut self) -> BoxFuture<'_, ()> {
        self.0.dequeued()
    }

    fn flush(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.0.flush()
    }
}

impl HwEncoder for FfmpegHwEncoder {
    fn encode(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.0.submit(RawFrame::from_frame(frame)?)
    }
}

/// Hardware codec service over the FFmpeg hardware codec wrappers. Only video
/// is accelerated.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegHw;

impl HwCodecService for FfmpegHw {
    fn open_decoder<'a>(
        &'a self,
        params: &'a StreamParameters,
        sink: HwSink<DecodedFrame>,
    ) -> BoxFuture<'a, anyhow::Result<Option<Box<dyn HwDecoder>>>> {
        async move {
            if params.media_type != MediaType::Video {
                return Ok(None);
            }
            let Ok(id) = codec_id(&params.codec) else {
                return Ok(None);
            };
            let Some(codec) = find_hw_decoder(id) else {
                return Ok(None);
            };
            let name = codec.name().to_string();
            let decoder = Decoder::new(params, Some(codec))?;
            log::info!("hardware decoder {} opened for stream {}", name, sink.stream_index());
            let queue = Queue::spawn(name, DecodeLoop { decoder, sink });
            Ok(Some(Box::new(FfmpegHwDecoder(queue)) as Box<dyn HwDecoder>))
        }
        .boxed()
    }

    fn open_encoder<'a>(
        &'a self,
        settings: &'a EncoderSettings,
        sink: HwSink<EncodedChunk>,
    ) -> BoxFuture<'a, anyhow::Result<Option<Box<dyn HwEncoder>>>> {
        async move {
            if settings.media_type != MediaType::Video {
                return Ok(None);
            }
            let Some(codec) = find_hw_encoder(&settings.codec) else {
                return Ok(None);
            };
            let name = codec.name().to_string();
            let mut settings = settings.clone();
            let source = pixel(&settings.format).ok();
            settings.format = pixel_name(pixel_format_for_encoder(source, &name));
            let encoder = Encoder::new(&settings, codec)?;
            log::info!("hardware encoder {} opened for stream {}", name, sink.stream_index());
            let queue = Queue::spawn(
                name,
                EncodeLoop {
                    encoder,
                    sink,
                    announced: false,
                },
            );
            Ok(Some(Box::new(FfmpegHwEncoder(queue)) as Box<dyn HwEncoder>))
        }
        .boxed()
    }
}

#[cfg(test)]
#[path = "hw_test.rs"]
mod hw_test;
