//! Core traits for the layerio library.
//!
//! The stack is built from two seams:
//!
//! * [`RawStream`] is the unbuffered byte source/sink at the bottom (a file
//!   descriptor, a socket-like object, an in-memory store). `BufferedStream`
//!   owns exactly one.
//! * [`BinaryStream`] is what `TextStream` needs from the layer below it.
//!   `BufferedStream` implements it, but any buffered binary stream will do.

use crate::error::{Error, Result};
use std::io::SeekFrom;

/// Default capacity of a buffered stream and default chunk size of a text stream.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Reference point for a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Whence {
    /// Absolute position.
    Set,
    /// Relative to the current position.
    Cur,
    /// Relative to the end of the stream.
    End,
}

impl Whence {
    /// The conventional numeric value (0, 1 or 2).
    pub const fn as_raw(self) -> i32 {
        match self {
            Whence::Set => 0,
            Whence::Cur => 1,
            Whence::End => 2,
        }
    }

    /// Converts an offset/whence pair into a `std::io::SeekFrom`.
    pub fn to_seek_from(self, offset: i64) -> Result<SeekFrom> {
        match self {
            Whence::Set => u64::try_from(offset)
                .map(SeekFrom::Start)
                .map_err(|_| Error::invalid_argument(format!("negative seek position {offset}"))),
            Whence::Cur => Ok(SeekFrom::Current(offset)),
            Whence::End => Ok(SeekFrom::End(offset)),
        }
    }
}

impl TryFrom<i32> for Whence {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            other => Err(Error::InvalidWhence(other)),
        }
    }
}

/// The unbuffered byte stream at the bottom of the stack.
///
/// Non-blocking streams report "no data yet" / "cannot accept data now" with
/// `Ok(None)` from [`read`](RawStream::read) and [`write`](RawStream::write).
/// That sentinel is not an error: the buffered layer turns it into
/// `Error::WouldBlock` or `Error::BlockingIo` carrying a partial count.
pub trait RawStream {
    /// Reads up to `buf.len()` bytes. `Ok(Some(0))` is EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Reads until EOF.
    ///
    /// Returns `Ok(None)` if the stream would block before producing any
    /// byte. Implementations with a cheaper whole-stream read override this.
    fn readall(&mut self) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            match self.read(&mut chunk)? {
                Some(0) => break,
                Some(n) => out.extend_from_slice(&chunk[..n]),
                None if out.is_empty() => return Ok(None),
                None => break,
            }
        }
        Ok(Some(out))
    }

    /// Writes up to `buf.len()` bytes and returns how many were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<Option<usize>>;

    /// Moves the stream position and returns the new absolute position.
    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64>;

    /// Returns the current absolute position.
    fn tell(&mut self) -> Result<i64> {
        self.seek(0, Whence::Cur)
    }

    /// Resizes the stream to `size` bytes (current position if `None`).
    fn truncate(&mut self, size: Option<i64>) -> Result<i64>;

    /// Flushes any state held below this layer (no-op for most streams).
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases the underlying resource. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;

    fn closed(&self) -> bool;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;

    fn seekable(&self) -> bool;

    /// The underlying OS file descriptor, if any.
    fn fileno(&self) -> Result<i32> {
        Err(Error::unsupported("fileno", "raw stream has no file descriptor"))
    }

    /// Whether the stream is attached to a terminal.
    fn isatty(&self) -> Result<bool> {
        Ok(false)
    }
}

impl<T: RawStream + ?Sized> RawStream for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        (**self).read(buf)
    }

    fn readall(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).readall()
    }

    fn write(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        (**self).write(buf)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        (**self).seek(offset, whence)
    }

    fn tell(&mut self) -> Result<i64> {
        (**self).tell()
    }

    fn truncate(&mut self, size: Option<i64>) -> Result<i64> {
        (**self).truncate(size)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn closed(&self) -> bool {
        (**self).closed()
    }

    fn readable(&self) -> bool {
        (**self).readable()
    }

    fn writable(&self) -> bool {
        (**self).writable()
    }

    fn seekable(&self) -> bool {
        (**self).seekable()
    }

    fn fileno(&self) -> Result<i32> {
        (**self).fileno()
    }

    fn isatty(&self) -> Result<bool> {
        (**self).isatty()
    }
}

/// A buffered binary stream, as consumed by `TextStream`.
///
/// Positions are logical byte offsets as seen by the caller, with any
/// read-ahead or pending writes already accounted for.
pub trait BinaryStream {
    /// Reads up to `size` bytes, or everything until EOF when `size` is `None`.
    fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>>;

    /// Reads up to `size` bytes with at most one call into the layer below.
    fn read1(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.read(size)
    }

    /// Writes all of `data` (buffering as needed) and returns its length.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()>;

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64>;

    fn tell(&mut self) -> Result<u64>;

    fn truncate(&mut self, size: Option<u64>) -> Result<u64>;

    fn close(&mut self) -> Result<()>;

    fn closed(&self) -> Result<bool>;

    fn readable(&self) -> Result<bool>;

    fn writable(&self) -> Result<bool>;

    fn seekable(&self) -> Result<bool>;

    fn fileno(&self) -> Result<i32>;

    fn isatty(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whence_from_raw() {
        assert_eq!(Whence::try_from(0).unwrap(), Whence::Set);
        assert_eq!(Whence::try_from(1).unwrap(), Whence::Cur);
        assert_eq!(Whence::try_from(2).unwrap(), Whence::End);
        match Whence::try_from(3) {
            Err(Error::InvalidWhence(3)) => {}
            other => panic!("Expected InvalidWhence, got: {:?}", other),
        }
        assert_eq!(Whence::End.as_raw(), 2);
    }

    #[test]
    fn test_seek_from_rejects_negative_absolute() {
        assert_eq!(Whence::Set.to_seek_from(4).unwrap(), SeekFrom::Start(4));
        assert_eq!(Whence::Cur.to_seek_from(-4).unwrap(), SeekFrom::Current(-4));
        assert!(matches!(
            Whence::Set.to_seek_from(-1),
            Err(Error::InvalidArgument { .. })
        ));
    }

    struct Trickle {
        chunks: Vec<Option<Vec<u8>>>,
    }

    impl RawStream for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
            if self.chunks.is_empty() {
                return Ok(Some(0));
            }
            match self.chunks.remove(0) {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(Some(chunk.len()))
                }
                None => Ok(None),
            }
        }
        fn write(&mut self, _buf: &[u8]) -> Result<Option<usize>> {
            Ok(None)
        }
        fn seek(&mut self, _offset: i64, _whence: Whence) -> Result<i64> {
            Err(Error::unsupported("seek", "not seekable"))
        }
        fn truncate(&mut self, _size: Option<i64>) -> Result<i64> {
            Err(Error::unsupported("truncate", "not seekable"))
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn closed(&self) -> bool {
            false
        }
        fn readable(&self) -> bool {
            true
        }
        fn writable(&self) -> bool {
            false
        }
        fn seekable(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_default_readall_stops_at_would_block_after_data() {
        let mut raw = Trickle {
            chunks: vec![Some(b"ab".to_vec()), Some(b"cd".to_vec()), None],
        };
        assert_eq!(raw.readall().unwrap(), Some(b"abcd".to_vec()));
    }

    #[test]
    fn test_default_readall_reports_would_block_without_data() {
        let mut raw = Trickle { chunks: vec![None] };
        assert_eq!(raw.readall().unwrap(), None);
        assert!(raw.fileno().is_err());
        assert!(!raw.isatty().unwrap());
    }
}
