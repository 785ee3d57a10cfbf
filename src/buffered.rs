//! Buffered binary streams.
//!
//! [`BufferedStream`] wraps exactly one [`RawStream`] and owns a fixed-size
//! byte buffer that serves as read-ahead in read mode and as write-coalescing
//! storage in write mode. At most one of the two roles is active at a time:
//! switching direction flushes pending writes and re-aligns the raw stream
//! with the logical position.
//!
//! # Positions
//!
//! ```text
//!   buffer:  [ ........ pos ........ read_end ........ ]
//!                 ^ logical position      ^ raw_pos (raw stream is here)
//! ```
//!
//! The raw stream's real position differs from the logical one by the
//! *raw offset* (`raw_pos - pos`) whenever a read or write buffer is valid.
//! Every path that hands control back to the raw stream at a new position
//! either seeks by `-raw_offset` or invalidates the buffer.
//!
//! # Locking
//!
//! All operations run under the stream's [`StreamLock`], so a
//! `BufferedStream` can be shared between threads (`Arc<BufferedStream<R>>`).
//! Reads and seeks that stay inside the buffer never touch the raw stream,
//! but they still take the lock.

use crate::error::{Error, Result};
use crate::lock::StreamLock;
use crate::traits::{BinaryStream, RawStream, Whence, DEFAULT_BUFFER_SIZE};
use std::io;
use tracing::{debug, trace, warn};

/// Which directions a buffered stream serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BufferedMode {
    /// Read-ahead only; the raw stream must be readable.
    Reader,
    /// Write coalescing only; the raw stream must be writable.
    Writer,
    /// Both directions; the raw stream must be readable, writable and seekable.
    #[default]
    Random,
}

impl BufferedMode {
    pub const fn readable(self) -> bool {
        !matches!(self, BufferedMode::Writer)
    }

    pub const fn writable(self) -> bool {
        !matches!(self, BufferedMode::Reader)
    }

    /// The richest mode the raw stream's capabilities allow.
    pub fn for_raw<R: RawStream + ?Sized>(raw: &R) -> Self {
        if raw.readable() && raw.writable() && raw.seekable() {
            BufferedMode::Random
        } else if raw.readable() {
            BufferedMode::Reader
        } else {
            BufferedMode::Writer
        }
    }
}

/// Construction options for [`BufferedStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BufferedConfig {
    /// Capacity of the internal buffer in bytes. Must be non-zero.
    pub buffer_size: usize,
    pub mode: BufferedMode,
}

impl Default for BufferedConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            mode: BufferedMode::Random,
        }
    }
}

impl BufferedConfig {
    pub fn new(mode: BufferedMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_mode(mut self, mode: BufferedMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Reads from the raw stream into `dst`, keeping the cached absolute position current.
fn read_raw<R: RawStream>(
    raw: &mut R,
    abs_pos: &mut Option<i64>,
    dst: &mut [u8],
) -> Result<Option<usize>> {
    let requested = dst.len();
    match raw.read(dst)? {
        None => Ok(None),
        Some(n) if n > requested => Err(Error::InvalidLength {
            operation: "read",
            returned: n,
            requested,
        }),
        Some(n) => {
            if let Some(abs) = abs_pos.as_mut() {
                *abs += n as i64;
            }
            Ok(Some(n))
        }
    }
}

/// Writes `src` to the raw stream, keeping the cached absolute position current.
fn write_raw<R: RawStream>(
    raw: &mut R,
    abs_pos: &mut Option<i64>,
    src: &[u8],
) -> Result<Option<usize>> {
    match raw.write(src)? {
        None => Ok(None),
        Some(n) if n > src.len() => Err(Error::InvalidLength {
            operation: "write",
            returned: n,
            requested: src.len(),
        }),
        Some(0) if !src.is_empty() => Err(io::Error::from(io::ErrorKind::WriteZero).into()),
        Some(n) => {
            if let Some(abs) = abs_pos.as_mut() {
                *abs += n as i64;
            }
            Ok(Some(n))
        }
    }
}

/// Lock-protected state of a buffered stream.
#[derive(Debug)]
struct Buffered<R> {
    raw: Option<R>,
    /// Released (emptied) on close.
    buffer: Vec<u8>,
    buffer_size: usize,
    /// `buffer_size - 1` when the size is a power of two, otherwise 0.
    buffer_mask: usize,
    readable: bool,
    writable: bool,
    pos: usize,
    read_end: Option<usize>,
    write_pos: usize,
    write_end: Option<usize>,
    raw_pos: Option<usize>,
    abs_pos: Option<i64>,
}

impl<R: RawStream> Buffered<R> {
    fn new(raw: R, config: BufferedConfig) -> Self {
        let buffer_size = config.buffer_size;
        let buffer_mask = if buffer_size.is_power_of_two() {
            buffer_size - 1
        } else {
            0
        };
        let mut state = Self {
            raw: Some(raw),
            buffer: vec![0u8; buffer_size],
            buffer_size,
            buffer_mask,
            readable: config.mode.readable(),
            writable: config.mode.writable(),
            pos: 0,
            read_end: None,
            write_pos: 0,
            write_end: None,
            raw_pos: None,
            abs_pos: None,
        };
        // Non-seekable streams legitimately fail here.
        state.raw_tell_ignoring_errors();
        state
    }

    fn raw(&mut self) -> Result<&mut R> {
        self.raw.as_mut().ok_or(Error::Detached)
    }

    fn raw_ref(&self) -> Result<&R> {
        self.raw.as_ref().ok_or(Error::Detached)
    }

    fn valid_read(&self) -> bool {
        self.readable && self.read_end.is_some()
    }

    fn valid_write(&self) -> bool {
        self.writable && self.write_end.is_some()
    }

    fn readahead(&self) -> usize {
        match self.read_end {
            Some(end) if self.readable => end.saturating_sub(self.pos),
            _ => 0,
        }
    }

    fn raw_offset(&self) -> i64 {
        match self.raw_pos {
            Some(raw_pos) if self.valid_read() || self.valid_write() => {
                raw_pos as i64 - self.pos as i64
            }
            _ => 0,
        }
    }

    fn adjust_position(&mut self, pos: usize) {
        self.pos = pos;
        if let Some(end) = self.read_end.filter(|_| self.readable) {
            if end < pos {
                self.read_end = Some(pos);
            }
        }
    }

    fn reset_read(&mut self) {
        self.read_end = None;
    }

    fn reset_write(&mut self) {
        self.write_pos = 0;
        self.write_end = None;
    }

    /// Largest multiple of the buffer size not exceeding `size`.
    fn minus_last_block(&self, size: usize) -> usize {
        if self.buffer_mask == 0 {
            (size / self.buffer_size) * self.buffer_size
        } else {
            size & !self.buffer_mask
        }
    }

    fn is_closed(&self) -> Result<bool> {
        Ok(self.buffer.is_empty() || self.raw_ref()?.closed())
    }

    fn check_closed(&self, operation: &'static str) -> Result<()> {
        if self.is_closed()? && self.readahead() == 0 {
            return Err(Error::closed(operation));
        }
        Ok(())
    }

    fn check_readable(&self, operation: &'static str) -> Result<()> {
        self.raw_ref()?;
        if !self.readable {
            return Err(Error::unsupported(operation, "File or stream is not readable."));
        }
        Ok(())
    }

    fn check_writable(&self, operation: &'static str) -> Result<()> {
        self.raw_ref()?;
        if !self.writable {
            return Err(Error::unsupported(operation, "File or stream is not writable."));
        }
        Ok(())
    }

    fn check_seekable(&self) -> Result<()> {
        if !self.raw_ref()?.seekable() {
            return Err(Error::unsupported("seek", "File or stream is not seekable."));
        }
        Ok(())
    }

    fn raw_tell(&mut self) -> Result<i64> {
        let n = self.raw()?.tell()?;
        if n < 0 {
            return Err(Error::InvalidPosition(n));
        }
        self.abs_pos = Some(n);
        Ok(n)
    }

    fn raw_tell_ignoring_errors(&mut self) {
        if let Err(err) = self.raw_tell() {
            trace!(error = %err, "raw tell probe failed");
            self.abs_pos = None;
        }
    }

    fn cached_raw_tell(&mut self) -> Result<i64> {
        match self.abs_pos {
            Some(pos) => Ok(pos),
            None => self.raw_tell(),
        }
    }

    fn raw_seek(&mut self, target: i64, whence: Whence) -> Result<i64> {
        trace!(target, ?whence, "raw seek");
        let n = self.raw()?.seek(target, whence)?;
        if n < 0 {
            return Err(Error::InvalidPosition(n));
        }
        self.abs_pos = Some(n);
        Ok(n)
    }

    /// Reads once from the raw stream into the free tail of the buffer.
    fn fill_buffer(&mut self) -> Result<Option<usize>> {
        let start = match self.read_end {
            Some(end) if self.readable => end,
            _ => 0,
        };
        let raw = self.raw.as_mut().ok_or(Error::Detached)?;
        let n = read_raw(raw, &mut self.abs_pos, &mut self.buffer[start..])?;
        if let Some(n) = n.filter(|&n| n > 0) {
            self.read_end = Some(start + n);
            self.raw_pos = Some(start + n);
        }
        trace!(start, filled = ?n, "fill buffer");
        Ok(n)
    }

    /// Serves `n` bytes straight out of the buffer. Caller checks `n <= readahead()`.
    fn take_buffered(&mut self, n: usize) -> Vec<u8> {
        let out = self.buffer[self.pos..self.pos + n].to_vec();
        self.pos += n;
        out
    }

    /// Writes the valid write region to the raw stream.
    ///
    /// On success the write buffer is invalid, so a following `raw_offset()`
    /// only reflects read-ahead.
    fn flush_writes(&mut self) -> Result<()> {
        let write_end = match self.write_end {
            Some(end) if self.writable && end != self.write_pos => end,
            _ => {
                self.reset_write();
                return Ok(());
            }
        };

        let rewind = self.raw_offset() + (self.pos as i64 - self.write_pos as i64);
        if rewind != 0 {
            self.raw_seek(-rewind, Whence::Cur)?;
            self.raw_pos = self.raw_pos.map(|p| (p as i64 - rewind) as usize);
        }

        let pending = write_end - self.write_pos;
        while self.write_pos < write_end {
            let raw = self.raw.as_mut().ok_or(Error::Detached)?;
            match write_raw(raw, &mut self.abs_pos, &self.buffer[self.write_pos..write_end])? {
                None => return Err(Error::BlockingIo { written: 0 }),
                Some(n) => {
                    self.write_pos += n;
                    self.raw_pos = Some(self.write_pos);
                }
            }
        }
        debug!(bytes = pending, "flushed write buffer");
        self.reset_write();
        Ok(())
    }

    /// Flushes pending writes, then re-aligns the raw stream with the logical position.
    fn flush_and_rewind(&mut self) -> Result<()> {
        self.flush_writes()?;
        if self.readable {
            let offset = self.raw_offset();
            let result = self.raw_seek(-offset, Whence::Cur);
            self.reset_read();
            result?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.check_closed("flush")?;
        if self.writable {
            self.flush_and_rewind()
        } else {
            self.raw()?.flush()
        }
    }

    fn read_generic(&mut self, n: usize) -> Result<Vec<u8>> {
        let current = self.readahead();
        if n <= current {
            return Ok(self.take_buffered(n));
        }

        let mut out = vec![0u8; n];
        let mut written = 0;
        let mut remaining = n;
        if current > 0 {
            out[..current].copy_from_slice(&self.buffer[self.pos..self.pos + current]);
            self.pos += current;
            written = current;
            remaining -= current;
        }
        if self.writable {
            self.flush_and_rewind()?;
        }
        self.reset_read();

        // Read whole blocks straight into the result; keep the tail for the buffer.
        while remaining > 0 {
            let chunk = self.minus_last_block(remaining);
            if chunk == 0 {
                break;
            }
            let raw = self.raw.as_mut().ok_or(Error::Detached)?;
            match read_raw(raw, &mut self.abs_pos, &mut out[written..written + chunk])? {
                Some(0) => {
                    out.truncate(written);
                    return Ok(out);
                }
                None if written > 0 => {
                    out.truncate(written);
                    return Ok(out);
                }
                None => return Err(Error::WouldBlock),
                Some(r) => {
                    remaining -= r;
                    written += r;
                }
            }
        }

        self.pos = 0;
        self.raw_pos = Some(0);
        self.read_end = Some(0);

        // Once the request is satisfied, stop: another read could block indefinitely.
        while remaining > 0 && self.read_end.unwrap_or(0) < self.buffer_size {
            match self.fill_buffer()? {
                Some(0) => {
                    out.truncate(written);
                    return Ok(out);
                }
                None if written > 0 => {
                    out.truncate(written);
                    return Ok(out);
                }
                None => return Err(Error::WouldBlock),
                Some(r) => {
                    let take = r.min(remaining);
                    out[written..written + take]
                        .copy_from_slice(&self.buffer[self.pos..self.pos + take]);
                    written += take;
                    self.pos += take;
                    remaining -= take;
                }
            }
        }
        out.truncate(written);
        Ok(out)
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        let current = self.readahead();
        let mut data = Vec::with_capacity(current);
        if current > 0 {
            data.extend_from_slice(&self.buffer[self.pos..self.pos + current]);
            self.pos += current;
        }
        if self.writable {
            self.flush_and_rewind()?;
        }
        self.reset_read();

        match self.raw()?.readall()? {
            Some(rest) => {
                if let Some(abs) = self.abs_pos.as_mut() {
                    *abs += rest.len() as i64;
                }
                if data.is_empty() {
                    Ok(rest)
                } else {
                    data.extend_from_slice(&rest);
                    Ok(data)
                }
            }
            None if data.is_empty() => Err(Error::WouldBlock),
            None => Ok(data),
        }
    }

    fn peek(&mut self) -> Result<Vec<u8>> {
        let have = self.readahead();
        if have > 0 {
            return Ok(self.buffer[self.pos..self.pos + have].to_vec());
        }
        self.reset_read();
        let filled = self.fill_buffer()?.unwrap_or(0);
        self.pos = 0;
        Ok(self.buffer[..filled].to_vec())
    }

    fn read1(&mut self, n: usize) -> Result<Vec<u8>> {
        let have = self.readahead();
        if have > 0 {
            return Ok(self.take_buffered(have.min(n)));
        }
        if self.writable {
            self.flush_and_rewind()?;
        }
        self.reset_read();
        let mut out = vec![0u8; n];
        let raw = self.raw.as_mut().ok_or(Error::Detached)?;
        match read_raw(raw, &mut self.abs_pos, &mut out)? {
            Some(r) => {
                out.truncate(r);
                Ok(out)
            }
            None => Err(Error::WouldBlock),
        }
    }

    /// Shared body of `readinto` and `readinto1`.
    ///
    /// With `once` set, the internal buffer is not refilled after some bytes
    /// have been produced, and at most one raw read is issued.
    fn readinto_generic(&mut self, dst: &mut [u8], once: bool) -> Result<usize> {
        let have = self.readahead();
        let mut written = 0;
        if have > 0 {
            if have >= dst.len() {
                let len = dst.len();
                dst.copy_from_slice(&self.buffer[self.pos..self.pos + len]);
                self.pos += len;
                return Ok(len);
            }
            dst[..have].copy_from_slice(&self.buffer[self.pos..self.pos + have]);
            self.pos += have;
            written = have;
        }

        if self.writable {
            self.flush_and_rewind()?;
        }
        self.reset_read();
        self.pos = 0;

        while written < dst.len() {
            let remaining = dst.len() - written;
            let n = if remaining > self.buffer_size {
                let raw = self.raw.as_mut().ok_or(Error::Detached)?;
                read_raw(raw, &mut self.abs_pos, &mut dst[written..])?
            } else if !(once && written > 0) {
                match self.fill_buffer()? {
                    Some(n) if n > 0 => {
                        let n = n.min(remaining);
                        dst[written..written + n]
                            .copy_from_slice(&self.buffer[self.pos..self.pos + n]);
                        self.pos += n;
                        written += n;
                        continue;
                    }
                    other => other,
                }
            } else {
                Some(0)
            };

            match n {
                Some(0) => break,
                None if written > 0 => break,
                None => return Err(Error::WouldBlock),
                Some(n) => {
                    written += n;
                    if once {
                        break;
                    }
                }
            }
        }
        Ok(written)
    }

    fn readline(&mut self, limit: Option<usize>) -> Result<Vec<u8>> {
        let mut n = self.readahead();
        if let Some(limit) = limit {
            n = n.min(limit);
        }
        let start = self.pos;
        if let Some(idx) = self.buffer[start..start + n].iter().position(|&b| b == b'\n') {
            return Ok(self.take_buffered(idx + 1));
        }
        if Some(n) == limit {
            return Ok(self.take_buffered(n));
        }

        let mut line = Vec::new();
        let mut limit = limit;
        if n > 0 {
            line.extend_from_slice(&self.buffer[start..start + n]);
            self.pos += n;
            if let Some(l) = limit.as_mut() {
                *l -= n;
            }
        }
        if self.writable {
            self.flush_and_rewind()?;
        }

        loop {
            self.reset_read();
            let mut n = match self.fill_buffer()? {
                Some(n) if n > 0 => n,
                _ => break,
            };
            if let Some(l) = limit {
                n = n.min(l);
            }
            if let Some(idx) = self.buffer[..n].iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&self.buffer[..=idx]);
                self.pos = idx + 1;
                return Ok(line);
            }
            if Some(n) == limit {
                line.extend_from_slice(&self.buffer[..n]);
                self.pos = n;
                return Ok(line);
            }
            line.extend_from_slice(&self.buffer[..n]);
            if let Some(l) = limit.as_mut() {
                *l -= n;
            }
        }
        Ok(line)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.valid_read() && !self.valid_write() {
            self.pos = 0;
            self.raw_pos = Some(0);
        }

        let avail = self.buffer_size - self.pos;
        if data.len() <= avail {
            let pos = self.pos;
            self.buffer[pos..pos + data.len()].copy_from_slice(data);
            if !self.valid_write() || self.write_pos > pos {
                self.write_pos = pos;
            }
            self.adjust_position(pos + data.len());
            if self.write_end.map_or(true, |end| self.pos > end) {
                self.write_end = Some(self.pos);
            }
            return Ok(data.len());
        }

        // Write out the current buffer first.
        if let Err(err) = self.flush_writes() {
            if !err.is_would_block() {
                return Err(err);
            }
            // Make room by moving the unwritten tail to the front. The shift
            // invalidates any read-ahead sharing the buffer.
            if self.readable {
                self.reset_read();
            }
            let write_pos = self.write_pos;
            let write_end = self.write_end.unwrap_or(write_pos);
            self.buffer.copy_within(write_pos..write_end, 0);
            let write_end = write_end - write_pos;
            self.write_end = Some(write_end);
            self.raw_pos = self.raw_pos.map(|p| p.saturating_sub(write_pos));
            self.pos = self.pos.saturating_sub(write_pos);
            self.write_pos = 0;

            let avail = self.buffer_size - write_end;
            if data.len() <= avail {
                self.buffer[write_end..write_end + data.len()].copy_from_slice(data);
                self.write_end = Some(write_end + data.len());
                self.pos += data.len();
                return Ok(data.len());
            }
            self.buffer[write_end..].copy_from_slice(&data[..avail]);
            self.write_end = Some(self.buffer_size);
            self.pos += avail;
            debug!(accepted = avail, "raw stream would block; buffered partial write");
            return Err(Error::BlockingIo { written: avail });
        }

        let offset = self.raw_offset();
        if offset != 0 {
            self.raw_seek(-offset, Whence::Cur)?;
            self.raw_pos = self.raw_pos.map(|p| (p as i64 - offset) as usize);
        }

        // The buffer is empty now; hand over whole chunks directly.
        let mut remaining = data.len();
        let mut written = 0;
        while remaining > self.buffer_size {
            let raw = self.raw.as_mut().ok_or(Error::Detached)?;
            match write_raw(raw, &mut self.abs_pos, &data[written..])? {
                None => {
                    let size = self.buffer_size;
                    self.buffer.copy_from_slice(&data[written..written + size]);
                    self.raw_pos = Some(0);
                    self.adjust_position(size);
                    self.write_end = Some(size);
                    written += size;
                    debug!(accepted = written, "raw stream would block during direct write");
                    return Err(Error::BlockingIo { written });
                }
                Some(n) => {
                    written += n;
                    remaining -= n;
                }
            }
        }

        if self.readable {
            self.reset_read();
        }
        self.reset_write();
        self.buffer[..remaining].copy_from_slice(&data[written..]);
        written += remaining;
        self.write_pos = 0;
        self.write_end = Some(remaining);
        self.adjust_position(remaining);
        self.raw_pos = Some(0);
        Ok(written)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        if matches!(whence, Whence::Set | Whence::Cur) && self.readable {
            let current = self.cached_raw_tell()?;
            let avail = self.readahead();
            if avail > 0 {
                let mut local = offset;
                if whence == Whence::Set {
                    local -= current - self.raw_offset();
                }
                if local >= -(self.pos as i64) && local <= avail as i64 {
                    self.pos = (self.pos as i64 + local) as usize;
                    return Ok((current - avail as i64 + local) as u64);
                }
            }
        }

        if self.writable {
            self.flush_writes()?;
        }
        let mut target = offset;
        if whence == Whence::Cur {
            target -= self.raw_offset();
        }
        let n = self.raw_seek(target, whence)?;
        self.raw_pos = None;
        if self.readable {
            self.reset_read();
        }
        Ok(n as u64)
    }

    fn tell(&mut self) -> Result<u64> {
        let pos = self.raw_tell()? - self.raw_offset();
        Ok(pos.max(0) as u64)
    }

    fn truncate(&mut self, size: Option<u64>) -> Result<u64> {
        self.flush_and_rewind()?;
        let size = size
            .map(|s| i64::try_from(s).map_err(|_| Error::invalid_argument("truncate size exceeds i64")))
            .transpose()?;
        let n = self.raw()?.truncate(size)?;
        self.raw_tell_ignoring_errors();
        Ok(n.max(0) as u64)
    }

    fn close(&mut self) -> Result<()> {
        if self.is_closed()? {
            return Ok(());
        }
        let flushed = self.flush();
        let closed = self.raw()?.close();
        self.buffer = Vec::new();
        self.reset_read();
        self.reset_write();
        match (flushed, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(flush), Ok(())) => Err(flush),
            (Ok(()), Err(close)) => Err(close),
            (Err(flush), Err(close)) => {
                warn!(flush = %flush, close = %close, "close failed after flush failure");
                Err(Error::chain_close(flush, close))
            }
        }
    }
}

/// A buffered binary stream over one raw stream.
///
/// ```rust
/// use layerio::{BufferedStream, MemoryRaw, Whence};
///
/// let stream = BufferedStream::new(MemoryRaw::new())?;
/// stream.write(b"hello world")?;
/// stream.seek(6, Whence::Set)?;
/// assert_eq!(stream.read(Some(5))?, b"world");
/// # Ok::<(), layerio::Error>(())
/// ```
#[derive(Debug)]
pub struct BufferedStream<R: RawStream> {
    state: StreamLock<Buffered<R>>,
    mode: BufferedMode,
    buffer_size: usize,
}

impl<R: RawStream> BufferedStream<R> {
    /// Wraps `raw` with the default buffer size, in the richest mode it supports.
    pub fn new(raw: R) -> Result<Self> {
        let mode = BufferedMode::for_raw(&raw);
        Self::with_config(raw, BufferedConfig::new(mode))
    }

    /// Read-ahead buffering over a readable raw stream.
    pub fn reader(raw: R) -> Result<Self> {
        Self::with_config(raw, BufferedConfig::new(BufferedMode::Reader))
    }

    /// Write coalescing over a writable raw stream.
    pub fn writer(raw: R) -> Result<Self> {
        Self::with_config(raw, BufferedConfig::new(BufferedMode::Writer))
    }

    /// Both directions over a readable, writable and seekable raw stream.
    pub fn random(raw: R) -> Result<Self> {
        Self::with_config(raw, BufferedConfig::new(BufferedMode::Random))
    }

    pub fn with_config(raw: R, config: BufferedConfig) -> Result<Self> {
        if config.buffer_size == 0 {
            return Err(Error::invalid_argument("buffer size must be strictly positive"));
        }
        if config.mode == BufferedMode::Random && !raw.seekable() {
            return Err(Error::unsupported(
                "BufferedStream",
                "File or stream is not seekable.",
            ));
        }
        if config.mode.readable() && !raw.readable() {
            return Err(Error::unsupported(
                "BufferedStream",
                "File or stream is not readable.",
            ));
        }
        if config.mode.writable() && !raw.writable() {
            return Err(Error::unsupported(
                "BufferedStream",
                "File or stream is not writable.",
            ));
        }
        debug!(buffer_size = config.buffer_size, mode = ?config.mode, "buffered stream attached");
        Ok(Self {
            state: StreamLock::new(Buffered::new(raw, config)),
            mode: config.mode,
            buffer_size: config.buffer_size,
        })
    }

    pub fn mode(&self) -> BufferedMode {
        self.mode
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Reads up to `size` bytes; `None` reads until EOF.
    ///
    /// Requests that fit in the buffered read-ahead are served without raw
    /// I/O. Returns fewer bytes only at EOF or when a non-blocking raw stream
    /// runs dry after producing some data; `Error::WouldBlock` if it produced none.
    pub fn read(&self, size: Option<usize>) -> Result<Vec<u8>> {
        let mut s = self.state.enter()?;
        s.check_readable("read")?;
        s.check_closed("read")?;
        match size {
            None => s.read_all(),
            Some(0) => Ok(Vec::new()),
            Some(n) if n <= s.readahead() => Ok(s.take_buffered(n)),
            Some(n) => s.read_generic(n),
        }
    }

    /// Returns buffered bytes without consuming them; fills the buffer with
    /// exactly one raw read if it is empty.
    pub fn peek(&self) -> Result<Vec<u8>> {
        let mut s = self.state.enter()?;
        s.check_readable("peek")?;
        s.check_closed("peek")?;
        if s.writable {
            s.flush_and_rewind()?;
        }
        s.peek()
    }

    /// Reads up to `size` bytes (buffer size if `None`) with at most one raw read.
    pub fn read1(&self, size: Option<usize>) -> Result<Vec<u8>> {
        let mut s = self.state.enter()?;
        s.check_readable("read1")?;
        s.check_closed("read")?;
        let n = size.unwrap_or(s.buffer_size);
        if n == 0 {
            return Ok(Vec::new());
        }
        s.read1(n)
    }

    /// Fills `dst` as far as possible; returns the number of bytes written.
    pub fn readinto(&self, dst: &mut [u8]) -> Result<usize> {
        let mut s = self.state.enter()?;
        s.check_readable("readinto")?;
        s.check_closed("readinto")?;
        s.readinto_generic(dst, false)
    }

    /// Like [`readinto`](Self::readinto) but with at most one raw read.
    pub fn readinto1(&self, dst: &mut [u8]) -> Result<usize> {
        let mut s = self.state.enter()?;
        s.check_readable("readinto1")?;
        s.check_closed("readinto")?;
        s.readinto_generic(dst, true)
    }

    /// Reads through the next `\n` (inclusive), at most `limit` bytes.
    pub fn readline(&self, limit: Option<usize>) -> Result<Vec<u8>> {
        let mut s = self.state.enter()?;
        s.check_readable("readline")?;
        s.check_closed("readline")?;
        s.readline(limit)
    }

    /// Reads lines until EOF, or until their total length reaches `hint`.
    pub fn readlines(&self, hint: Option<usize>) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        let mut total = 0;
        loop {
            let line = self.readline(None)?;
            if line.is_empty() {
                break;
            }
            total += line.len();
            lines.push(line);
            if hint.is_some_and(|h| h > 0 && total >= h) {
                break;
            }
        }
        Ok(lines)
    }

    /// Buffers or writes all of `data`.
    ///
    /// If the raw stream would block, fails with `Error::BlockingIo` whose
    /// `written` is the number of bytes of `data` accepted so far.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut s = self.state.enter()?;
        s.check_writable("write")?;
        if s.is_closed()? {
            return Err(Error::closed("write"));
        }
        s.write(data)
    }

    pub fn flush(&self) -> Result<()> {
        let mut s = self.state.enter()?;
        s.flush()
    }

    /// Moves the logical position; returns the new absolute position.
    ///
    /// Targets inside the buffered read-ahead only move the buffer cursor.
    pub fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        let mut s = self.state.enter()?;
        s.check_closed("seek")?;
        s.check_seekable()?;
        s.seek(offset, whence)
    }

    /// The logical position: raw position minus the raw offset.
    pub fn tell(&self) -> Result<u64> {
        let mut s = self.state.enter()?;
        s.check_closed("tell")?;
        s.tell()
    }

    /// Resizes the raw stream to `size` bytes (logical position if `None`).
    pub fn truncate(&self, size: Option<u64>) -> Result<u64> {
        let mut s = self.state.enter()?;
        s.check_closed("truncate")?;
        s.check_writable("truncate")?;
        s.truncate(size)
    }

    /// Flushes, then closes the raw stream and releases the buffer.
    ///
    /// If both the flush and the raw close fail, the error is
    /// `Error::CloseAfterFlush` carrying both.
    pub fn close(&self) -> Result<()> {
        let mut s = self.state.enter()?;
        s.raw_ref()?;
        s.close()
    }

    /// Flushes and hands the raw stream back without closing it.
    pub fn detach(&self) -> Result<R> {
        let mut s = self.state.enter()?;
        s.flush()?;
        let raw = s.raw.take().ok_or(Error::Detached)?;
        debug!("raw stream detached");
        Ok(raw)
    }

    /// Flushes and returns the raw stream, consuming the buffered stream.
    pub fn into_inner(mut self) -> Result<R> {
        let state = self.state.get_mut();
        state.flush()?;
        state.raw.take().ok_or(Error::Detached)
    }

    /// Runs `f` with shared access to the raw stream.
    pub fn with_raw<T>(&self, f: impl FnOnce(&R) -> T) -> Result<T> {
        let s = self.state.enter()?;
        Ok(f(s.raw_ref()?))
    }

    pub fn closed(&self) -> Result<bool> {
        self.state.enter()?.is_closed()
    }

    pub fn readable(&self) -> Result<bool> {
        let s = self.state.enter()?;
        Ok(s.readable && s.raw_ref()?.readable())
    }

    pub fn writable(&self) -> Result<bool> {
        let s = self.state.enter()?;
        Ok(s.writable && s.raw_ref()?.writable())
    }

    pub fn seekable(&self) -> Result<bool> {
        Ok(self.state.enter()?.raw_ref()?.seekable())
    }

    pub fn fileno(&self) -> Result<i32> {
        self.state.enter()?.raw_ref()?.fileno()
    }

    pub fn isatty(&self) -> Result<bool> {
        self.state.enter()?.raw_ref()?.isatty()
    }
}

impl<R: RawStream> Drop for BufferedStream<R> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.raw.is_none() || state.is_closed().unwrap_or(true) {
            return;
        }
        if let Err(err) = state.close() {
            debug!(error = %err, "error closing buffered stream on drop");
        }
    }
}

impl<R: RawStream> BinaryStream for BufferedStream<R> {
    fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        BufferedStream::read(self, size)
    }

    fn read1(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        BufferedStream::read1(self, size)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        BufferedStream::write(self, data)
    }

    fn flush(&mut self) -> Result<()> {
        BufferedStream::flush(self)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        BufferedStream::seek(self, offset, whence)
    }

    fn tell(&mut self) -> Result<u64> {
        BufferedStream::tell(self)
    }

    fn truncate(&mut self, size: Option<u64>) -> Result<u64> {
        BufferedStream::truncate(self, size)
    }

    fn close(&mut self) -> Result<()> {
        BufferedStream::close(self)
    }

    fn closed(&self) -> Result<bool> {
        BufferedStream::closed(self)
    }

    fn readable(&self) -> Result<bool> {
        BufferedStream::readable(self)
    }

    fn writable(&self) -> Result<bool> {
        BufferedStream::writable(self)
    }

    fn seekable(&self) -> Result<bool> {
        BufferedStream::seekable(self)
    }

    fn fileno(&self) -> Result<i32> {
        BufferedStream::fileno(self)
    }

    fn isatty(&self) -> Result<bool> {
        BufferedStream::isatty(self)
    }
}

impl<R: RawStream> io::Read for BufferedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(BufferedStream::readinto1(self, buf)?)
    }
}

impl<R: RawStream> io::Write for BufferedStream<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match BufferedStream::write(self, buf) {
            Ok(n) => Ok(n),
            Err(Error::BlockingIo { written }) if written > 0 => Ok(written),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(BufferedStream::flush(self)?)
    }
}

impl<R: RawStream> io::Seek for BufferedStream<R> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            io::SeekFrom::Start(n) => (
                i64::try_from(n).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?,
                Whence::Set,
            ),
            io::SeekFrom::Current(n) => (n, Whence::Cur),
            io::SeekFrom::End(n) => (n, Whence::End),
        };
        Ok(BufferedStream::seek(self, offset, whence)?)
    }
}
