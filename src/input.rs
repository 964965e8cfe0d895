use std::{fs::File, io::Read, path::Path};

use bytes::Bytes;

/// Positional reads over a source of known size.
pub trait ReadAt: Send {
    /// Reads up to `buf.len()` bytes at `offset`; returns 0 at end of input.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

impl ReadAt for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::io::{Seek, SeekFrom};
        self.seek(SeekFrom::Start(offset))?;
        self.read(buf)
    }
}

/// Byte source accepted by the demuxer.
pub enum InputFile {
    /// Whole file in memory.
    Blob(Bytes),
    /// Forward-only stream; the container must not need to seek.
    Stream(Box<dyn Read + Send>),
    RandomAccess { size: u64, reader: Box<dyn ReadAt> },
}

impl InputFile {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(InputFile::RandomAccess {
            size,
            reader: Box::new(file),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InputFile::Blob(_) => "blob",
            InputFile::Stream(_) => "stream",
            InputFile::RandomAccess { .. } => "random-access",
        }
    }
}

impl std::fmt::Debug for InputFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputFile::Blob(data) => write!(f, "Blob({} bytes)", data.len()),
            InputFile::Stream(_) => f.write_str("Stream"),
            InputFile::RandomAccess { size, .. } => write!(f, "RandomAccess({} bytes)", size),
        }
    }
}

impl From<Bytes> for InputFile {
    fn from(data: Bytes) -> Self {
        InputFile::Blob(data)
    }
}

impl From<Vec<u8>> for InputFile {
    fn from(data: Vec<u8>) -> Self {
        InputFile::Blob(Bytes::from(data))
    }
}
