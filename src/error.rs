use std::time::Duration;
use thiserror::Error;

/// Custom error types for the layerio library.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying I/O errors from std::io operations or a raw stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was attempted on a closed stream.
    #[error("{operation} of closed file")]
    Closed { operation: &'static str },

    /// The stream's underlying raw or binary stream has been detached.
    #[error("raw stream has been detached")]
    Detached,

    /// The stream does not have the capability an operation needs.
    #[error("{operation}: {reason}")]
    Unsupported {
        operation: &'static str,
        reason: &'static str,
    },

    /// A numeric whence value outside of SET/CUR/END.
    #[error("whence value {0} unsupported")]
    InvalidWhence(i32),

    /// An argument was rejected before any I/O took place.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A raw `seek()`/`tell()` reported a negative position.
    #[error("raw stream returned invalid position {0}")]
    InvalidPosition(i64),

    /// A raw `read()`/`write()` reported more bytes than it was handed.
    #[error("raw {operation}() returned invalid length {returned} (should have been between 0 and {requested})")]
    InvalidLength {
        operation: &'static str,
        returned: usize,
        requested: usize,
    },

    /// A write could not complete without blocking.
    ///
    /// `written` is the number of bytes the buffered layer accepted (buffered
    /// or handed to the raw stream) before the raw stream reported would-block.
    #[error("write could not complete without blocking ({written} bytes accepted)")]
    BlockingIo { written: usize },

    /// A read on a non-blocking raw stream had no data available yet.
    #[error("read could not complete without blocking")]
    WouldBlock,

    /// The stream lock was re-acquired by the thread already holding it.
    #[error("reentrant call inside buffered stream")]
    ReentrantCall,

    /// The stream lock could not be acquired during shutdown.
    #[error("could not acquire lock for buffered stream within {0:?} at shutdown, possibly due to daemon threads")]
    LockTimeout(Duration),

    /// A decoder returned or was handed a state it cannot represent.
    #[error("illegal decoder state: {message}")]
    IllegalDecoderState { message: String },

    /// `tell()` could not find a byte offset reproducing the current character position.
    #[error("can't reconstruct logical file position")]
    CannotReconstructPosition,

    /// `seek()` could not replay a cookie (the stream changed underneath it).
    #[error("can't restore logical file position")]
    CannotRestorePosition,

    /// `tell()` was called while a `lines()` iteration is in progress.
    #[error("telling position disabled by next() call")]
    TellingDisabled,

    /// Input bytes are not valid for the stream's encoding.
    #[error("'{encoding}' codec can't decode byte 0x{byte:02x} in position {position}: {reason}")]
    Decode {
        encoding: &'static str,
        byte: u8,
        position: usize,
        reason: &'static str,
    },

    /// A character cannot be represented in the stream's encoding.
    #[error("'{encoding}' codec can't encode character {character:?} in position {position}: {reason}")]
    Encode {
        encoding: &'static str,
        character: char,
        position: usize,
        reason: &'static str,
    },

    /// No built-in codec matches the requested name.
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),

    /// Closing failed after flushing had already failed; both errors are kept.
    #[error("{close} (raised while handling: {flush})")]
    CloseAfterFlush {
        flush: Box<Error>,
        #[source]
        close: Box<Error>,
    },
}

impl Error {
    /// Create a new `Closed` error naming the rejected operation.
    pub fn closed(operation: &'static str) -> Self {
        Self::Closed { operation }
    }

    /// Create a new `Unsupported` error.
    pub fn unsupported(operation: &'static str, reason: &'static str) -> Self {
        Self::Unsupported { operation, reason }
    }

    /// Create a new `InvalidArgument` error with a descriptive message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a new `IllegalDecoderState` error with a descriptive message.
    pub fn illegal_decoder_state(message: impl Into<String>) -> Self {
        Self::IllegalDecoderState {
            message: message.into(),
        }
    }

    /// Keep a flush error and the close error that followed it.
    pub fn chain_close(flush: Error, close: Error) -> Self {
        Self::CloseAfterFlush {
            flush: Box::new(flush),
            close: Box::new(close),
        }
    }

    /// Returns true for both the read and write flavours of would-block.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::BlockingIo { .. })
    }

    /// The partial-write count carried by a `BlockingIo` error.
    pub fn characters_written(&self) -> Option<usize> {
        match self {
            Self::BlockingIo { written } => Some(*written),
            _ => None,
        }
    }
}

/// Result type alias for the library operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Io(e) => e,
            e @ (Error::WouldBlock | Error::BlockingIo { .. }) => {
                std::io::Error::new(ErrorKind::WouldBlock, e)
            }
            e @ (Error::InvalidArgument { .. } | Error::InvalidWhence(_)) => {
                std::io::Error::new(ErrorKind::InvalidInput, e)
            }
            e @ (Error::Decode { .. } | Error::Encode { .. }) => {
                std::io::Error::new(ErrorKind::InvalidData, e)
            }
            e @ Error::Unsupported { .. } => std::io::Error::new(ErrorKind::Unsupported, e),
            e => std::io::Error::new(ErrorKind::Other, e),
        }
    }
}
