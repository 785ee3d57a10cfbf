//! # layerio
//!
//! Layered stream I/O: raw byte streams, buffered binary streams on top of
//! them, and text streams on top of those.
//!
//! ## Overview
//!
//! `layerio` separates stream concerns into three layers joined by traits:
//!
//! * **Raw** ([`RawStream`]): unbuffered byte I/O with explicit would-block
//!   reporting. [`FileRaw`] wraps a `std::fs::File`, [`MemoryRaw`] a `Vec<u8>`.
//! * **Buffered** ([`BufferedStream`]): read-ahead and write-behind buffering
//!   in reader, writer or random-access mode, safe to share across threads.
//! * **Text** ([`TextStream`]): incremental decoding and encoding, universal
//!   newline handling, and character-exact `tell`/`seek` through opaque
//!   [`Cookie`]s.
//!
//! ## Key Features
//!
//! * **Exact positions**: a text `tell()` can always be replayed by `seek()`,
//!   even in the middle of a multibyte character sequence.
//! * **Non-blocking aware**: partial writes report how many bytes were accepted.
//! * **Thread safe**: every buffered operation runs under a per-stream lock
//!   that detects re-entrant use instead of deadlocking.
//! * **Std interop**: buffered streams implement `std::io::{Read, Write, Seek}`.
//!
//! ## Quick Start
//!
//! ```rust
//! use layerio::*;
//!
//! fn main() -> Result<()> {
//!     let buffered = BufferedStream::new(MemoryRaw::new())?;
//!     let mut text = TextStream::with_config(
//!         buffered,
//!         TextConfig::new(Encoding::Utf8).with_newline(Newline::CrLf),
//!     )?;
//!
//!     text.write("hello\nworld\n")?;
//!     text.seek(Cookie::ZERO, Whence::Set)?;
//!     assert_eq!(text.readline(None)?, "hello\r\n");
//!
//!     let raw = text.detach()?.into_inner()?;
//!     assert_eq!(raw.get_ref(), b"hello\r\nworld\r\n");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! * **`RawStream`**: the contract buffered streams consume
//! * **`BinaryStream`**: the contract text streams consume
//! * **`Decoder` / `Encoder`**: incremental codecs with serialisable state
//!
//! Any layer can be swapped for another implementation of the trait below it.

pub mod buffered;
pub mod codec;
pub mod cookie;
pub mod error;
pub mod lock;
pub mod newline;
pub mod raw;
pub mod text;
pub mod traits;

// Re-export the main public API for user convenience.
pub use buffered::{BufferedConfig, BufferedMode, BufferedStream};
pub use codec::{Decoder, DecoderState, Encoder, Encoding, ErrorMode};
pub use cookie::{Cookie, COOKIE_LEN};
pub use error::{Error, Result};
pub use lock::{begin_shutdown, end_shutdown, is_shutting_down, SHUTDOWN_LOCK_TIMEOUT};
pub use newline::{IncrementalNewlineDecoder, Newlines};
pub use raw::{FileRaw, MemoryRaw};
pub use text::{Lines, Newline, Reconfigure, TextConfig, TextStream};
pub use traits::{BinaryStream, RawStream, Whence, DEFAULT_BUFFER_SIZE};
