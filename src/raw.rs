//! Raw (unbuffered) streams.
//!
//! * [`MemoryRaw`]: a growable in-memory byte store, handy for tests and for
//!   wrapping data that already lives in memory.
//! * [`FileRaw`]: a `std::fs::File` viewed as a raw file-descriptor stream.

use crate::error::{Error, Result};
use crate::traits::{RawStream, Whence};
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Read, Seek, Write};
use std::path::Path;

/// An in-memory raw stream.
#[derive(Debug, Clone)]
pub struct MemoryRaw {
    data: Vec<u8>,
    pos: usize,
    closed: bool,
    readable: bool,
    writable: bool,
    seekable: bool,
}

impl MemoryRaw {
    /// Creates an empty readable, writable and seekable stream.
    pub fn new() -> Self {
        Self::with_data(Vec::new())
    }

    /// Creates a readable, writable and seekable stream positioned at 0.
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            closed: false,
            readable: true,
            writable: true,
            seekable: true,
        }
    }

    /// Creates a read-only stream over `data`.
    pub fn read_only(data: impl Into<Vec<u8>>) -> Self {
        Self {
            writable: false,
            ..Self::with_data(data)
        }
    }

    /// Creates an empty write-only stream.
    pub fn write_only() -> Self {
        Self {
            readable: false,
            ..Self::new()
        }
    }

    /// Disables seeking, turning this into a pipe-like stream.
    pub fn non_seekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// The stored bytes.
    pub fn get_ref(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the stream, returning the stored bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn check_open(&self, operation: &'static str) -> Result<()> {
        if self.closed {
            return Err(Error::closed(operation));
        }
        Ok(())
    }
}

impl Default for MemoryRaw {
    fn default() -> Self {
        Self::new()
    }
}

impl RawStream for MemoryRaw {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.check_open("read")?;
        if !self.readable {
            return Err(Error::unsupported("read", "File not open for reading"));
        }
        if self.pos >= self.data.len() {
            return Ok(Some(0));
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(Some(n))
    }

    fn readall(&mut self) -> Result<Option<Vec<u8>>> {
        self.check_open("read")?;
        if !self.readable {
            return Err(Error::unsupported("read", "File not open for reading"));
        }
        let start = self.pos.min(self.data.len());
        self.pos = self.data.len().max(self.pos);
        Ok(Some(self.data[start..].to_vec()))
    }

    fn write(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        self.check_open("write")?;
        if !self.writable {
            return Err(Error::unsupported("write", "File not open for writing"));
        }
        let end = self.pos + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(Some(buf.len()))
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        self.check_open("seek")?;
        if !self.seekable {
            return Err(Error::unsupported("seek", "stream is not seekable"));
        }
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.pos as i64,
            Whence::End => self.data.len() as i64,
        };
        let target = base
            .checked_add(offset)
            .ok_or_else(|| Error::invalid_argument("seek offset overflow"))?;
        if target < 0 {
            return Err(Error::invalid_argument(format!("negative seek value {target}")));
        }
        self.pos = target as usize;
        Ok(target)
    }

    fn tell(&mut self) -> Result<i64> {
        self.check_open("tell")?;
        if !self.seekable {
            return Err(Error::unsupported("tell", "stream is not seekable"));
        }
        Ok(self.pos as i64)
    }

    fn truncate(&mut self, size: Option<i64>) -> Result<i64> {
        self.check_open("truncate")?;
        if !self.writable {
            return Err(Error::unsupported("truncate", "File not open for writing"));
        }
        let size = size.unwrap_or(self.pos as i64);
        if size < 0 {
            return Err(Error::invalid_argument(format!("negative size value {size}")));
        }
        self.data.resize(size as usize, 0);
        Ok(size)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn seekable(&self) -> bool {
        self.seekable
    }
}

/// A file viewed as a raw stream.
///
/// `io::ErrorKind::WouldBlock` from the OS becomes the would-block sentinel;
/// `Interrupted` calls are retried.
#[derive(Debug)]
pub struct FileRaw {
    file: Option<File>,
    readable: bool,
    writable: bool,
    seekable: bool,
}

impl FileRaw {
    /// Wraps an already-open file with the given access capabilities.
    pub fn new(mut file: File, readable: bool, writable: bool) -> Self {
        let seekable = file.stream_position().is_ok();
        Self {
            file: Some(file),
            readable,
            writable,
            seekable,
        }
    }

    /// Opens an existing file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(file, true, false))
    }

    /// Creates (or truncates) a file for reading and writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file, true, true))
    }

    /// Opens an existing file for reading and writing without truncating it.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::new(file, true, true))
    }

    /// Returns the file unless the stream has been closed.
    pub fn into_file(self) -> Option<File> {
        self.file
    }

    fn file(&mut self, operation: &'static str) -> Result<&mut File> {
        self.file.as_mut().ok_or(Error::closed(operation))
    }
}

fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> Result<Option<T>> {
    loop {
        match op() {
            Ok(v) => return Ok(Some(v)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

impl RawStream for FileRaw {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if !self.readable {
            return Err(Error::unsupported("read", "File not open for reading"));
        }
        let file = self.file("read")?;
        retry_interrupted(|| file.read(buf))
    }

    fn readall(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.readable {
            return Err(Error::unsupported("read", "File not open for reading"));
        }
        let file = self.file("read")?;
        let mut out = Vec::new();
        match file.read_to_end(&mut out) {
            Ok(_) => Ok(Some(out)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && out.is_empty() => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Some(out)),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        if !self.writable {
            return Err(Error::unsupported("write", "File not open for writing"));
        }
        let file = self.file("write")?;
        retry_interrupted(|| file.write(buf))
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let target = whence.to_seek_from(offset)?;
        let pos = self.file("seek")?.seek(target)?;
        i64::try_from(pos).map_err(|_| Error::invalid_argument("file position exceeds i64"))
    }

    fn truncate(&mut self, size: Option<i64>) -> Result<i64> {
        if !self.writable {
            return Err(Error::unsupported("truncate", "File not open for writing"));
        }
        let file = self.file("truncate")?;
        let size = match size {
            Some(size) => size,
            None => file.stream_position()? as i64,
        };
        if size < 0 {
            return Err(Error::invalid_argument(format!("negative size value {size}")));
        }
        file.set_len(size as u64)?;
        Ok(size)
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn closed(&self) -> bool {
        self.file.is_none()
    }

    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn seekable(&self) -> bool {
        self.seekable
    }

    #[cfg(unix)]
    fn fileno(&self) -> Result<i32> {
        use std::os::unix::io::AsRawFd;
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or(Error::closed("fileno"))
    }

    fn isatty(&self) -> Result<bool> {
        self.file
            .as_ref()
            .map(|f| f.is_terminal())
            .ok_or(Error::closed("isatty"))
    }
}
