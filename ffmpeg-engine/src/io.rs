//! Custom AVIO contexts: container reads from an [`InputFile`], container
//! writes to a [`WriteSink`].

use std::{
    ffi::{c_int, c_void},
    io::Read,
    ptr,
};

use avchain::{
    engine::{FileWrite, WriteSink},
    input::InputFile,
};
use bytes::Bytes;
use ffmpeg_next::{ffi, util::error::{EIO, ENOSYS, ESPIPE}};

const BUFFER_SIZE: usize = 64 * 1024;

/// Byte stream FFmpeg reads a container from.
pub(crate) struct Reader {
    file: InputFile,
    position: u64,
}

impl Reader {
    fn size(&self) -> Option<u64> {
        match &self.file {
            InputFile::Blob(data) => Some(data.len() as u64),
            InputFile::Stream(_) => None,
            InputFile::RandomAccess { size, .. } => Some(*size),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = match &mut self.file {
            InputFile::Blob(data) => {
                let start = (self.position as usize).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                n
            }
            InputFile::Stream(reader) => reader.read(buf)?,
            InputFile::RandomAccess { reader, .. } => reader.read_at(self.position, buf)?,
        };
        self.position += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: c_int) -> i64 {
        let size = self.size();
        if whence & ffi::AVSEEK_SIZE as c_int != 0 {
            return size.map(|s| s as i64).unwrap_or(ffi::AVERROR(ENOSYS) as i64);
        }
        let Some(size) = size else {
            return ffi::AVERROR(ESPIPE) as i64;
        };
        let target = match whence & !(ffi::AVSEEK_FORCE as c_int) {
            seek_from::SET => offset,
            seek_from::CUR => self.position as i64 + offset,
            seek_from::END => size as i64 + offset,
            _ => return ffi::AVERROR(ENOSYS) as i64,
        };
        if target < 0 {
            return ffi::AVERROR(EIO) as i64;
        }
        self.position = target as u64;
        target
    }
}

/// Byte sink FFmpeg writes a container to. Every write is forwarded with its
/// absolute position.
pub(crate) struct Writer {
    sink: WriteSink,
    position: u64,
    end: u64,
}

impl Writer {
    fn write(&mut self, buf: &[u8]) -> c_int {
        let write = FileWrite {
            position: self.position,
            data: Bytes::copy_from_slice(buf),
        };
        if self.sink.send(write).is_err() {
            return ffi::AVERROR(EIO);
        }
        self.position += buf.len() as u64;
        self.end = self.end.max(self.position);
        buf.len() as c_int
    }

    fn seek(&mut self, offset: i64, whence: c_int) -> i64 {
        if whence & ffi::AVSEEK_SIZE as c_int != 0 {
            return self.end as i64;
        }
        let target = match whence & !(ffi::AVSEEK_FORCE as c_int) {
            seek_from::SET => offset,
            seek_from::CUR => self.position as i64 + offset,
            seek_from::END => self.end as i64 + offset,
            _ => return ffi::AVERROR(ENOSYS) as i64,
        };
        if target < 0 {
            return ffi::AVERROR(EIO) as i64;
        }
        self.position = target as u64;
        target
    }
}

mod seek_from {
    use std::ffi::c_int;

    pub const SET: c_int = 0;
    pub const CUR: c_int = 1;
    pub const END: c_int = 2;
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    if buf.is_null() || buf_size <= 0 {
        return ffi::AVERROR(EIO);
    }
    let reader = unsafe { &mut *(opaque as *mut Reader) };
    let slice = unsafe { std::slice::from_raw_parts_mut(buf, buf_size as usize) };
    match reader.read(slice) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(e) => {
            log::error!("input read failed: {}", e);
            ffi::AVERROR(EIO)
        }
    }
}

unsafe extern "C" fn seek_reader(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let reader = unsafe { &mut *(opaque as *mut Reader) };
    reader.seek(offset, whence)
}

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    if buf.is_null() || buf_size < 0 {
        return ffi::AVERROR(EIO);
    }
    let writer = unsafe { &mut *(opaque as *mut Writer) };
    let slice = unsafe { std::slice::from_raw_parts(buf, buf_size as usize) };
    writer.write(slice)
}

unsafe extern "C" fn seek_writer(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let writer = unsafe { &mut *(opaque as *mut Writer) };
    writer.seek(offset, whence)
}

/// Owns an `AVIOContext`, its buffer and the Rust state behind `opaque`.
/// The format context using it must be closed first.
pub(crate) struct AvioContext<T> {
    ptr: *mut ffi::AVIOContext,
    opaque: *mut T,
}

unsafe impl<T: Send> Send for AvioContext<T> {}

impl<T> AvioContext<T> {
    pub fn as_mut_ptr(&mut self) -> *mut ffi::AVIOContext {
        self.ptr
    }

    fn alloc(
        state: T,
        write_flag: bool,
        read: Option<unsafe extern "C" fn(*mut c_void, *mut u8, c_int) -> c_int>,
        write: Option<unsafe extern "C" fn(*mut c_void, *const u8, c_int) -> c_int>,
        seek: Option<unsafe extern "C" fn(*mut c_void, i64, c_int) -> i64>,
    ) -> anyhow::Result<Self> {
        unsafe {
            let mut buffer = ffi::av_malloc(BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                anyhow::bail!("out of memory allocating an AVIO buffer");
            }
            let opaque = Box::into_raw(Box::new(state));
            let ptr = ffi::avio_alloc_context(
                buffer,
                BUFFER_SIZE as c_int,
                write_flag as c_int,
                opaque as *mut c_void,
                read,
                write,
                seek,
            );
            if ptr.is_null() {
                ffi::av_freep(&mut buffer as *mut _ as *mut c_void);
                drop(Box::from_raw(opaque));
                anyhow::bail!("out of memory allocating an AVIO context");
            }
            Ok(Self { ptr, opaque })
        }
    }
}

impl AvioContext<Reader> {
    pub fn reader(file: InputFile) -> anyhow::Result<Self> {
        let seekable = !matches!(file, InputFile::Stream(_));
        let reader = Reader { file, position: 0 };
        let seek = if seekable {
            Some(seek_reader as unsafe extern "C" fn(*mut c_void, i64, c_int) -> i64)
        } else {
            None
        };
        Self::alloc(reader, false, Some(read_packet), None, seek)
    }
}

impl AvioContext<Writer> {
    pub fn writer(sink: WriteSink, seekable: bool) -> anyhow::Result<Self> {
        let writer = Writer {
            sink,
            position: 0,
            end: 0,
        };
        let seek = if seekable {
            Some(seek_writer as unsafe extern "C" fn(*mut c_void, i64, c_int) -> i64)
        } else {
            None
        };
        Self::alloc(writer, true, None, Some(write_packet), seek)
    }

    /// Pushes buffered bytes out to the sink.
    pub fn flush(&mut self) {
        unsafe { ffi::avio_flush(self.ptr) };
    }
}

impl<T> Drop for AvioContext<T> {
    fn drop(&mut self) {
        unsafe {
            if !self.ptr.is_null() {
                ffi::av_freep(&mut (*self.ptr).buffer as *mut _ as *mut c_void);
                ffi::avio_context_free(&mut self.ptr);
            }
            if !self.opaque.is_null() {
                drop(Box::from_raw(self.opaque));
                self.opaque = ptr::null_mut();
            }
        }
    }
}
