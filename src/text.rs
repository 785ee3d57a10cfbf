//! Text streams.
//!
//! [`TextStream`] layers character I/O over any [`BinaryStream`]:
//!
//! - **Reading** pulls chunks with `read1`, decodes them (through an
//!   [`IncrementalNewlineDecoder`] in universal-newline modes) and serves
//!   characters out of the decoded chunk.
//! - **Writing** translates `\n` to the configured terminator, encodes, and
//!   batches the bytes until `chunk_size` is reached, a line-buffered write
//!   sees a newline, or write-through is on.
//! - **Positions** are [`Cookie`]s. `tell` finds the closest byte offset where
//!   the decoder had nothing buffered and records how to replay from there;
//!   `seek` replays it.

use crate::codec::{Decoder, DecoderState, Encoder, Encoding, ErrorMode};
use crate::cookie::Cookie;
use crate::error::{Error, Result};
use crate::newline::{IncrementalNewlineDecoder, Newlines};
use crate::traits::{BinaryStream, Whence, DEFAULT_BUFFER_SIZE};
use std::fmt;
use tracing::{debug, trace, warn};

/// Line terminator handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Newline {
    /// Accept `\n`, `\r` and `\r\n` and translate them to `\n` on input;
    /// write `\n` as the platform line separator.
    #[default]
    Universal,
    /// Recognise all three terminators but return them unchanged; no output translation.
    Untranslated,
    /// Lines end with `\n` only.
    Lf,
    /// Lines end with `\r` only; `\n` is written as `\r`.
    Cr,
    /// Lines end with `\r\n` only; `\n` is written as `\r\n`.
    CrLf,
}

impl Newline {
    /// Parses the conventional `newline` argument: `None`, `""`, `"\n"`, `"\r"` or `"\r\n"`.
    pub fn from_option(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(Newline::Universal),
            Some("") => Ok(Newline::Untranslated),
            Some("\n") => Ok(Newline::Lf),
            Some("\r") => Ok(Newline::Cr),
            Some("\r\n") => Ok(Newline::CrLf),
            Some(other) => Err(Error::invalid_argument(format!(
                "illegal newline value: {other:?}"
            ))),
        }
    }

    pub fn as_option(self) -> Option<&'static str> {
        match self {
            Newline::Universal => None,
            Newline::Untranslated => Some(""),
            Newline::Lf => Some("\n"),
            Newline::Cr => Some("\r"),
            Newline::CrLf => Some("\r\n"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NewlineSettings {
    read_universal: bool,
    read_translate: bool,
    read_newline: Option<&'static str>,
    write_translate: bool,
    /// `None` when `\n` is written as-is.
    write_newline: Option<&'static str>,
}

impl From<Newline> for NewlineSettings {
    fn from(newline: Newline) -> Self {
        let read_universal = matches!(newline, Newline::Universal | Newline::Untranslated);
        let read_newline = match newline {
            Newline::Lf => Some("\n"),
            Newline::Cr => Some("\r"),
            Newline::CrLf => Some("\r\n"),
            Newline::Universal | Newline::Untranslated => None,
        };
        let write_newline = match newline {
            Newline::Cr => Some("\r"),
            Newline::CrLf => Some("\r\n"),
            Newline::Universal if cfg!(windows) => Some("\r\n"),
            _ => None,
        };
        Self {
            read_universal,
            read_translate: newline == Newline::Universal,
            read_newline,
            write_translate: newline != Newline::Untranslated,
            write_newline,
        }
    }
}

/// Construction options for [`TextStream`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TextConfig {
    pub encoding: Encoding,
    pub errors: ErrorMode,
    pub newline: Newline,
    /// Flush to the binary stream whenever a write contains `\n` or `\r`.
    pub line_buffering: bool,
    /// Hand every write to the binary stream immediately.
    pub write_through: bool,
    /// Bytes requested per read and pending-write threshold.
    pub chunk_size: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Utf8,
            errors: ErrorMode::Strict,
            newline: Newline::Universal,
            line_buffering: false,
            write_through: false,
            chunk_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TextConfig {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            ..Self::default()
        }
    }

    pub fn with_errors(mut self, errors: ErrorMode) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_newline(mut self, newline: Newline) -> Self {
        self.newline = newline;
        self
    }

    pub fn with_line_buffering(mut self, line_buffering: bool) -> Self {
        self.line_buffering = line_buffering;
        self
    }

    pub fn with_write_through(mut self, write_through: bool) -> Self {
        self.write_through = write_through;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Settings changed by [`TextStream::reconfigure`]; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reconfigure {
    pub encoding: Option<Encoding>,
    /// Defaults to strict when only the encoding changes.
    pub errors: Option<ErrorMode>,
    pub newline: Option<Newline>,
    pub line_buffering: Option<bool>,
    pub write_through: Option<bool>,
}

/// Decoder flags and the input fed since, captured where the decoder buffer was empty.
#[derive(Debug, Clone)]
struct Snapshot {
    dec_flags: i64,
    next_input: Vec<u8>,
}

enum LineEnd {
    /// Byte offset just past the terminator.
    Found(usize),
    /// No terminator; the first `consumed` bytes cannot start one.
    NotFound { consumed: usize },
}

/// Locates the first line terminator in `text` for the given newline mode.
fn find_line_ending(
    translated: bool,
    universal: bool,
    read_newline: Option<&str>,
    text: &str,
) -> LineEnd {
    let bytes = text.as_bytes();
    if translated {
        return match bytes.iter().position(|&b| b == b'\n') {
            Some(i) => LineEnd::Found(i + 1),
            None => LineEnd::NotFound {
                consumed: bytes.len(),
            },
        };
    }
    if universal {
        return match bytes.iter().position(|&b| b == b'\n' || b == b'\r') {
            None => LineEnd::NotFound {
                consumed: bytes.len(),
            },
            Some(i) if bytes[i] == b'\n' => LineEnd::Found(i + 1),
            Some(i) => match bytes.get(i + 1) {
                Some(b'\n') => LineEnd::Found(i + 2),
                Some(_) => LineEnd::Found(i + 1),
                // A lone trailing \r may be followed by \n in the next chunk.
                None => LineEnd::NotFound { consumed: i },
            },
        };
    }
    let terminator = read_newline.unwrap_or("\n");
    match text.find(terminator) {
        Some(i) => LineEnd::Found(i + terminator.len()),
        None => {
            let mut consumed = bytes.len().saturating_sub(terminator.len() - 1);
            while !text.is_char_boundary(consumed) {
                consumed -= 1;
            }
            LineEnd::NotFound { consumed }
        }
    }
}

/// Byte offset `chars` characters after byte offset `from` (clamped to the end).
fn char_offset(text: &str, from: usize, chars: usize) -> usize {
    text[from..]
        .char_indices()
        .nth(chars)
        .map_or(text.len(), |(i, _)| from + i)
}

fn flags_to_i32(flags: i64) -> Result<i32> {
    i32::try_from(flags)
        .map_err(|_| Error::illegal_decoder_state(format!("decoder flags {flags} do not fit in a cookie")))
}

/// Puts the decoder in the state a cookie names.
///
/// Position 0 with zero flags means a fresh stream, which for some codecs
/// (BOM detection) differs from "flags 0".
fn restore_decoder(decoder: &mut dyn Decoder, cookie: &Cookie) -> Result<()> {
    if cookie.start_pos == 0 && cookie.dec_flags == 0 {
        decoder.reset();
        Ok(())
    } else {
        decoder.setstate(&DecoderState::with_flags(i64::from(cookie.dec_flags)))
    }
}

/// Finds a replayable cookie for the position `chars_to_skip` characters
/// into the decoded snapshot. `cookie` arrives at the snapshot point.
///
/// Leaves the decoder in an arbitrary state; the caller restores it.
fn reconstruct_cookie(
    decoder: &mut dyn Decoder,
    next_input: &[u8],
    b2cratio: f64,
    mut cookie: Cookie,
    mut chars_to_skip: usize,
) -> Result<Cookie> {
    // Coarse search backwards from the ratio estimate for a safe point.
    let mut skip_bytes = ((b2cratio * chars_to_skip as f64) as i64).min(next_input.len() as i64);
    let mut skip_back = 1i64;
    while skip_bytes > 0 {
        restore_decoder(decoder, &cookie)?;
        let decoded = decoder
            .decode(&next_input[..skip_bytes as usize], false)?
            .chars()
            .count();
        if decoded <= chars_to_skip {
            let state = decoder.getstate();
            if state.buffer.is_empty() {
                cookie.dec_flags = flags_to_i32(state.flags)?;
                chars_to_skip -= decoded;
                break;
            }
            skip_bytes -= state.buffer.len() as i64;
            skip_back = 1;
        } else {
            skip_bytes -= skip_back;
            skip_back *= 2;
        }
    }
    if skip_bytes <= 0 {
        skip_bytes = 0;
        restore_decoder(decoder, &cookie)?;
    }
    cookie.start_pos += skip_bytes;
    if chars_to_skip == 0 {
        return Ok(cookie);
    }

    // Feed one byte at a time, moving the start to each later safe point.
    let mut chars_decoded = 0usize;
    let mut bytes_to_feed = 0usize;
    let mut reached = false;
    for i in skip_bytes as usize..next_input.len() {
        chars_decoded += decoder.decode(&next_input[i..=i], false)?.chars().count();
        bytes_to_feed += 1;
        let state = decoder.getstate();
        if state.buffer.is_empty() && chars_decoded <= chars_to_skip {
            cookie.start_pos += bytes_to_feed as i64;
            chars_to_skip -= chars_decoded;
            cookie.dec_flags = flags_to_i32(state.flags)?;
            bytes_to_feed = 0;
            chars_decoded = 0;
        }
        if chars_decoded >= chars_to_skip {
            reached = true;
            break;
        }
    }
    if !reached {
        chars_decoded += decoder.decode(b"", true)?.chars().count();
        cookie.need_eof = true;
        if chars_decoded < chars_to_skip {
            return Err(Error::CannotReconstructPosition);
        }
    }

    cookie.bytes_to_feed =
        i32::try_from(bytes_to_feed).map_err(|_| Error::CannotReconstructPosition)?;
    cookie.chars_to_skip =
        i32::try_from(chars_to_skip).map_err(|_| Error::CannotReconstructPosition)?;
    Ok(cookie)
}

fn build_decoder(
    encoding: Encoding,
    errors: ErrorMode,
    newline: &NewlineSettings,
) -> Box<dyn Decoder + Send> {
    let decoder = encoding.decoder(errors);
    if newline.read_universal {
        Box::new(IncrementalNewlineDecoder::new(
            Some(decoder),
            newline.read_translate,
        ))
    } else {
        decoder
    }
}

/// A character stream over a binary stream.
///
/// ```rust
/// use layerio::{BufferedStream, MemoryRaw, TextStream, Whence};
///
/// let mut text = TextStream::new(BufferedStream::new(MemoryRaw::new())?)?;
/// text.write("première ligne\nseconde\n")?;
/// text.seek(layerio::Cookie::ZERO, Whence::Set)?;
/// assert_eq!(text.readline(None)?, "première ligne\n");
/// let mark = text.tell()?;
/// assert_eq!(text.read(None)?, "seconde\n");
/// text.seek(mark, Whence::Set)?;
/// assert_eq!(text.read(Some(3))?, "sec");
/// # Ok::<(), layerio::Error>(())
/// ```
pub struct TextStream<B: BinaryStream> {
    buffer: Option<B>,
    encoding: Encoding,
    errors: ErrorMode,
    newline: Newline,
    nl: NewlineSettings,
    line_buffering: bool,
    write_through: bool,
    chunk_size: usize,
    decoder: Option<Box<dyn Decoder + Send>>,
    encoder: Option<Box<dyn Encoder + Send>>,
    decoded_chars: String,
    /// Length of `decoded_chars` in characters.
    decoded_chars_len: usize,
    /// Characters of `decoded_chars` already returned.
    decoded_chars_used: usize,
    /// Byte offset matching `decoded_chars_used`.
    decoded_offset: usize,
    pending_bytes: Vec<u8>,
    snapshot: Option<Snapshot>,
    b2cratio: f64,
    telling: bool,
    seekable: bool,
}

impl<B: BinaryStream> fmt::Debug for TextStream<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextStream")
            .field("attached", &self.buffer.is_some())
            .field("encoding", &self.encoding)
            .field("errors", &self.errors)
            .field("newline", &self.newline)
            .field("line_buffering", &self.line_buffering)
            .field("write_through", &self.write_through)
            .field("chunk_size", &self.chunk_size)
            .field("pending_bytes", &self.pending_bytes.len())
            .field("telling", &self.telling)
            .finish()
    }
}

impl<B: BinaryStream> TextStream<B> {
    /// UTF-8 text with universal newlines.
    pub fn new(buffer: B) -> Result<Self> {
        Self::with_config(buffer, TextConfig::default())
    }

    pub fn with_config(buffer: B, config: TextConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(Error::invalid_argument("chunk size must be strictly positive"));
        }
        let readable = buffer.readable()?;
        let writable = buffer.writable()?;
        let seekable = buffer.seekable()?;
        let nl = NewlineSettings::from(config.newline);

        let mut stream = Self {
            buffer: Some(buffer),
            encoding: config.encoding,
            errors: config.errors,
            newline: config.newline,
            nl,
            line_buffering: config.line_buffering,
            write_through: config.write_through,
            chunk_size: config.chunk_size,
            decoder: readable.then(|| build_decoder(config.encoding, config.errors, &nl)),
            encoder: writable.then(|| config.encoding.encoder(config.errors)),
            decoded_chars: String::new(),
            decoded_chars_len: 0,
            decoded_chars_used: 0,
            decoded_offset: 0,
            pending_bytes: Vec::new(),
            snapshot: None,
            b2cratio: 0.0,
            telling: seekable,
            seekable,
        };
        stream.fix_encoder_state()?;
        debug!(
            encoding = %config.encoding,
            newline = ?config.newline,
            readable,
            writable,
            seekable,
            "text stream attached"
        );
        Ok(stream)
    }

    /// A stream opened mid-file must not write a byte-order mark.
    fn fix_encoder_state(&mut self) -> Result<()> {
        if !self.seekable || self.encoder.is_none() {
            return Ok(());
        }
        let position = self.buffer_mut()?.tell()?;
        if position != 0 {
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.setstate(0)?;
            }
        }
        Ok(())
    }

    /// The underlying binary stream.
    pub fn buffer(&self) -> Result<&B> {
        self.buffer.as_ref().ok_or(Error::Detached)
    }

    /// Mutable access to the underlying binary stream. Reading or seeking it
    /// directly desynchronises the text layer until the next `seek`.
    pub fn buffer_mut(&mut self) -> Result<&mut B> {
        self.buffer.as_mut().ok_or(Error::Detached)
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn errors(&self) -> ErrorMode {
        self.errors
    }

    pub fn newline(&self) -> Newline {
        self.newline
    }

    pub fn line_buffering(&self) -> bool {
        self.line_buffering
    }

    pub fn write_through(&self) -> bool {
        self.write_through
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) -> Result<()> {
        if chunk_size == 0 {
            return Err(Error::invalid_argument("a strictly positive integer is required"));
        }
        self.chunk_size = chunk_size;
        Ok(())
    }

    /// Newline kinds seen so far; `None` unless reading with universal newlines.
    pub fn newlines(&self) -> Option<Newlines> {
        self.decoder.as_ref().and_then(|d| d.newlines())
    }

    pub fn closed(&self) -> Result<bool> {
        self.buffer()?.closed()
    }

    pub fn readable(&self) -> Result<bool> {
        self.buffer()?.readable()
    }

    pub fn writable(&self) -> Result<bool> {
        self.buffer()?.writable()
    }

    pub fn seekable(&self) -> Result<bool> {
        self.buffer()?;
        Ok(self.seekable)
    }

    pub fn fileno(&self) -> Result<i32> {
        self.buffer()?.fileno()
    }

    pub fn isatty(&self) -> Result<bool> {
        self.buffer()?.isatty()
    }

    fn check_closed(&self, operation: &'static str) -> Result<()> {
        if self.buffer()?.closed()? {
            return Err(Error::closed(operation));
        }
        Ok(())
    }

    fn check_readable(&self, operation: &'static str) -> Result<()> {
        self.check_closed(operation)?;
        if self.decoder.is_none() {
            return Err(Error::unsupported(operation, "not readable"));
        }
        Ok(())
    }

    fn check_writable(&self, operation: &'static str) -> Result<()> {
        self.check_closed(operation)?;
        if self.encoder.is_none() {
            return Err(Error::unsupported(operation, "not writable"));
        }
        Ok(())
    }

    fn check_seekable(&self, operation: &'static str) -> Result<()> {
        if !self.seekable {
            return Err(Error::unsupported(operation, "underlying stream is not seekable"));
        }
        Ok(())
    }

    fn set_decoded_chars(&mut self, text: String) {
        self.decoded_chars_len = text.chars().count();
        self.decoded_chars = text;
        self.decoded_chars_used = 0;
        self.decoded_offset = 0;
    }

    fn decoded_remaining(&self) -> usize {
        self.decoded_chars_len - self.decoded_chars_used
    }

    /// Takes up to `n` characters (all if `None`) from the decoded chunk.
    fn take_decoded(&mut self, n: Option<usize>) -> (String, usize) {
        let available = self.decoded_remaining();
        let n = n.map_or(available, |n| n.min(available));
        if n == 0 {
            return (String::new(), 0);
        }
        let end = char_offset(&self.decoded_chars, self.decoded_offset, n);
        let taken = self.decoded_chars[self.decoded_offset..end].to_string();
        self.decoded_offset = end;
        self.decoded_chars_used += n;
        (taken, n)
    }

    fn write_flush(&mut self) -> Result<()> {
        if self.pending_bytes.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending_bytes);
        trace!(bytes = pending.len(), "writing pending text bytes");
        self.buffer_mut()?.write(&pending)?;
        Ok(())
    }

    fn encoder_reset(&mut self, start_of_stream: bool) -> Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) if start_of_stream => {
                encoder.reset();
                Ok(())
            }
            Some(encoder) => encoder.setstate(0),
            None => Ok(()),
        }
    }

    /// Reads and decodes one chunk. Returns `false` at EOF.
    fn read_chunk(&mut self, size_hint: usize) -> Result<bool> {
        // The decoder buffer plus the new input is what tell() replays from.
        let before = if self.telling {
            self.decoder.as_ref().map(|d| d.getstate())
        } else {
            None
        };

        let size_hint = if size_hint > 0 {
            (self.b2cratio.max(1.0) * size_hint as f64) as usize
        } else {
            0
        };
        let chunk_size = self.chunk_size.max(size_hint);
        let input = self.buffer_mut()?.read1(Some(chunk_size))?;
        let mut eof = input.is_empty();

        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::unsupported("read", "not readable"))?;
        let decoded = decoder.decode(&input, eof)?;
        self.set_decoded_chars(decoded);
        let nchars = self.decoded_chars_len;
        self.b2cratio = if nchars > 0 {
            input.len() as f64 / nchars as f64
        } else {
            0.0
        };
        if nchars > 0 {
            eof = false;
        }

        if let Some(state) = before {
            let mut next_input = state.buffer;
            next_input.extend_from_slice(&input);
            self.snapshot = Some(Snapshot {
                dec_flags: state.flags,
                next_input,
            });
        }
        trace!(bytes = input.len(), chars = nchars, eof, "read text chunk");
        Ok(!eof)
    }

    /// Reads up to `size` characters, or to EOF when `size` is `None`.
    pub fn read(&mut self, size: Option<usize>) -> Result<String> {
        self.check_readable("read")?;
        self.write_flush()?;

        let Some(size) = size else {
            let input = self.buffer_mut()?.read(None)?;
            let decoder = self
                .decoder
                .as_mut()
                .ok_or_else(|| Error::unsupported("read", "not readable"))?;
            let decoded = decoder.decode(&input, true)?;
            let (mut result, _) = self.take_decoded(None);
            result.push_str(&decoded);
            self.set_decoded_chars(String::new());
            self.snapshot = None;
            return Ok(result);
        };

        let (mut result, got) = self.take_decoded(Some(size));
        let mut remaining = size - got;
        while remaining > 0 {
            if !self.read_chunk(remaining)? {
                break;
            }
            let (chunk, got) = self.take_decoded(Some(remaining));
            result.push_str(&chunk);
            remaining -= got;
        }
        Ok(result)
    }

    /// Reads one line including its terminator, at most `limit` characters.
    ///
    /// Which terminators end a line depends on the newline mode: `\n` after
    /// translation, any of `\n`/`\r`/`\r\n` untranslated, or exactly the
    /// configured terminator.
    pub fn readline(&mut self, limit: Option<usize>) -> Result<String> {
        enum Step {
            Done(usize),
            SetAside { end: usize },
        }

        self.check_readable("readline")?;
        self.write_flush()?;

        let mut chunks = String::new();
        let mut chunked = 0usize;
        let mut remaining: Option<String> = None;
        let mut found: Option<(Option<String>, usize, usize, usize)> = None;

        loop {
            let mut more = true;
            while self.decoded_remaining() == 0 {
                more = self.read_chunk(0)?;
                if !more {
                    break;
                }
            }
            if !more {
                self.set_decoded_chars(String::new());
                self.snapshot = None;
                break;
            }

            // Text left over from the previous chunk is glued to this one.
            let (joined, start, offset_to_buffer) = match remaining.take() {
                Some(mut rest) => {
                    let offset = rest.len();
                    rest.push_str(&self.decoded_chars);
                    (Some(rest), 0, offset)
                }
                None => (None, self.decoded_offset, 0),
            };

            let line = joined.as_deref().unwrap_or(&self.decoded_chars);
            let ending = find_line_ending(
                self.nl.read_translate,
                self.nl.read_universal,
                self.nl.read_newline,
                &line[start..],
            );
            let step = match ending {
                LineEnd::Found(len) => {
                    let end = start + len;
                    match limit {
                        Some(limit) if line[start..end].chars().count() + chunked >= limit => {
                            Step::Done(char_offset(line, start, limit - chunked))
                        }
                        _ => Step::Done(end),
                    }
                }
                LineEnd::NotFound { consumed } => {
                    let end = start + consumed;
                    match limit {
                        Some(limit) if line[start..end].chars().count() + chunked >= limit => {
                            Step::Done(char_offset(line, start, limit - chunked))
                        }
                        _ => Step::SetAside { end },
                    }
                }
            };

            match step {
                Step::Done(end) => {
                    found = Some((joined, start, end, offset_to_buffer));
                    break;
                }
                Step::SetAside { end } => {
                    let line = joined.as_deref().unwrap_or(&self.decoded_chars);
                    if end > start {
                        chunked += line[start..end].chars().count();
                        chunks.push_str(&line[start..end]);
                    }
                    if end < line.len() {
                        remaining = Some(line[end..].to_string());
                    }
                    self.set_decoded_chars(String::new());
                }
            }
        }

        let mut result = chunks;
        if let Some(rest) = remaining {
            result.push_str(&rest);
        }
        if let Some((joined, start, end, offset_to_buffer)) = found {
            match joined {
                Some(line) => result.push_str(&line[start..end]),
                None => result.push_str(&self.decoded_chars[start..end]),
            }
            let new_offset = end.saturating_sub(offset_to_buffer).max(self.decoded_offset);
            self.decoded_chars_used += self.decoded_chars[self.decoded_offset..new_offset]
                .chars()
                .count();
            self.decoded_offset = new_offset;
        }
        Ok(result)
    }

    /// Reads lines until EOF, or until their total length reaches `hint` characters.
    pub fn readlines(&mut self, hint: Option<usize>) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut total = 0;
        loop {
            let line = self.readline(None)?;
            if line.is_empty() {
                break;
            }
            total += line.chars().count();
            lines.push(line);
            if hint.is_some_and(|h| h > 0 && total >= h) {
                break;
            }
        }
        Ok(lines)
    }

    /// Iterates over lines. `tell()` fails with `Error::TellingDisabled`
    /// until the iteration reaches EOF or the stream is flushed.
    pub fn lines(&mut self) -> Lines<'_, B> {
        Lines {
            stream: self,
            finished: false,
        }
    }

    /// Writes `text` and returns its length in characters.
    pub fn write(&mut self, text: &str) -> Result<usize> {
        self.check_writable("write")?;
        let length = text.chars().count();

        let has_lf = ((self.nl.write_translate && self.nl.write_newline.is_some())
            || self.line_buffering)
            && text.contains('\n');
        let translated;
        let text = match self.nl.write_newline {
            Some(terminator) if has_lf && self.nl.write_translate => {
                translated = text.replace('\n', terminator);
                translated.as_str()
            }
            _ => text,
        };
        let needs_flush = self.line_buffering && (has_lf || text.contains('\r'));

        let encoded = match self.encoder.as_mut() {
            Some(encoder) => encoder.encode(text)?,
            None => return Err(Error::unsupported("write", "not writable")),
        };
        if self.pending_bytes.len() + encoded.len() > self.chunk_size {
            self.write_flush()?;
        }
        self.pending_bytes.extend_from_slice(&encoded);
        if self.pending_bytes.len() >= self.chunk_size || needs_flush || self.write_through {
            self.write_flush()?;
        }
        if needs_flush {
            self.buffer_mut()?.flush()?;
        }

        self.set_decoded_chars(String::new());
        self.snapshot = None;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        Ok(length)
    }

    /// Writes pending bytes and flushes the binary stream; re-enables `tell()`.
    pub fn flush(&mut self) -> Result<()> {
        self.check_closed("flush")?;
        self.telling = self.seekable;
        self.write_flush()?;
        self.buffer_mut()?.flush()
    }

    /// The current position as a cookie for [`seek`](Self::seek).
    pub fn tell(&mut self) -> Result<Cookie> {
        self.check_closed("tell")?;
        self.check_seekable("tell")?;
        if !self.telling {
            return Err(Error::TellingDisabled);
        }
        self.flush()?;
        let raw_position = self.buffer_mut()?.tell()?;
        let position = i64::try_from(raw_position).map_err(|_| Error::InvalidPosition(i64::MAX))?;

        let (decoder, snapshot) = match (self.decoder.as_mut(), self.snapshot.as_ref()) {
            (Some(decoder), Some(snapshot)) => (decoder, snapshot),
            _ => return Ok(Cookie::at(position)),
        };

        let cookie = Cookie {
            start_pos: position - snapshot.next_input.len() as i64,
            dec_flags: flags_to_i32(snapshot.dec_flags)?,
            ..Cookie::ZERO
        };
        if self.decoded_chars_used == 0 {
            return Ok(cookie);
        }

        let saved = decoder.getstate();
        let result = reconstruct_cookie(
            decoder.as_mut(),
            &snapshot.next_input,
            self.b2cratio,
            cookie,
            self.decoded_chars_used,
        );
        let restored = decoder.setstate(&saved);
        let cookie = result?;
        restored?;
        trace!(%cookie, "reconstructed text position");
        Ok(cookie)
    }

    /// Moves to a position returned by [`tell`](Self::tell).
    ///
    /// `Whence::Cur` and `Whence::End` only accept [`Cookie::ZERO`]: the
    /// former syncs like `tell()`, the latter moves to the end of the stream.
    pub fn seek(&mut self, cookie: Cookie, whence: Whence) -> Result<Cookie> {
        self.check_closed("seek")?;
        self.check_seekable("seek")?;

        match whence {
            Whence::Cur => {
                if !cookie.is_zero() {
                    return Err(Error::unsupported("seek", "can't do nonzero cur-relative seeks"));
                }
                return self.tell();
            }
            Whence::End => {
                if !cookie.is_zero() {
                    return Err(Error::unsupported("seek", "can't do nonzero end-relative seeks"));
                }
                self.flush()?;
                self.set_decoded_chars(String::new());
                self.snapshot = None;
                if let Some(decoder) = self.decoder.as_mut() {
                    decoder.reset();
                }
                let position = self.buffer_mut()?.seek(0, Whence::End)?;
                self.encoder_reset(position == 0)?;
                let position =
                    i64::try_from(position).map_err(|_| Error::InvalidPosition(i64::MAX))?;
                return Ok(Cookie::at(position));
            }
            Whence::Set => {}
        }

        if cookie.start_pos < 0 || cookie.bytes_to_feed < 0 || cookie.chars_to_skip < 0 {
            return Err(Error::invalid_argument(format!("negative seek position {cookie}")));
        }
        self.flush()?;

        self.buffer_mut()?.seek(cookie.start_pos, Whence::Set)?;
        self.set_decoded_chars(String::new());
        self.snapshot = None;
        if let Some(decoder) = self.decoder.as_mut() {
            restore_decoder(decoder.as_mut(), &cookie)?;
        }

        if cookie.chars_to_skip > 0 {
            let bytes_to_feed = cookie.bytes_to_feed as usize;
            let chars_to_skip = cookie.chars_to_skip as usize;
            let input = self.buffer_mut()?.read(Some(bytes_to_feed))?;
            self.snapshot = Some(Snapshot {
                dec_flags: i64::from(cookie.dec_flags),
                next_input: input.clone(),
            });
            if input.len() < bytes_to_feed {
                warn!(%cookie, got = input.len(), "stream shorter than cookie expects");
                return Err(Error::CannotRestorePosition);
            }
            let decoder = self
                .decoder
                .as_mut()
                .ok_or_else(|| Error::unsupported("seek", "not readable"))?;
            let decoded = decoder.decode(&input, cookie.need_eof)?;
            self.set_decoded_chars(decoded);
            if self.decoded_chars_len < chars_to_skip {
                return Err(Error::CannotRestorePosition);
            }
            self.take_decoded(Some(chars_to_skip));
        } else if self.decoder.is_some() {
            self.snapshot = Some(Snapshot {
                dec_flags: i64::from(cookie.dec_flags),
                next_input: Vec::new(),
            });
        }

        self.encoder_reset(cookie.start_pos == 0 && cookie.dec_flags == 0)?;
        trace!(%cookie, "text seek");
        Ok(cookie)
    }

    /// Flushes, then resizes the binary stream (at its current position if `None`).
    pub fn truncate(&mut self, size: Option<u64>) -> Result<u64> {
        self.flush()?;
        self.buffer_mut()?.truncate(size)
    }

    /// Changes stream settings.
    ///
    /// The encoding, error mode and newline mode of a readable stream can
    /// only change before anything has been read. Pending output is flushed
    /// first.
    pub fn reconfigure(&mut self, options: Reconfigure) -> Result<()> {
        self.buffer()?;
        let codec_change =
            options.encoding.is_some() || options.errors.is_some() || options.newline.is_some();
        if codec_change
            && self.decoder.is_some()
            && (!self.decoded_chars.is_empty()
                || self.snapshot.as_ref().is_some_and(|s| !s.next_input.is_empty()))
        {
            return Err(Error::unsupported(
                "reconfigure",
                "It is not possible to set the encoding or newline of stream after the first read",
            ));
        }

        let errors = match (options.errors, options.encoding) {
            (Some(errors), _) => errors,
            (None, Some(_)) => ErrorMode::Strict,
            (None, None) => self.errors,
        };
        let encoding = options.encoding.unwrap_or(self.encoding);

        self.flush()?;
        if let Some(newline) = options.newline {
            self.newline = newline;
            self.nl = NewlineSettings::from(newline);
        }
        if codec_change {
            self.encoding = encoding;
            self.errors = errors;
            self.b2cratio = 0.0;
            if self.decoder.is_some() {
                self.decoder = Some(build_decoder(encoding, errors, &self.nl));
            }
            if self.encoder.is_some() {
                self.encoder = Some(encoding.encoder(errors));
                self.fix_encoder_state()?;
            }
        }
        if let Some(line_buffering) = options.line_buffering {
            self.line_buffering = line_buffering;
        }
        if let Some(write_through) = options.write_through {
            self.write_through = write_through;
        }
        debug!(
            encoding = %self.encoding,
            newline = ?self.newline,
            line_buffering = self.line_buffering,
            write_through = self.write_through,
            "text stream reconfigured"
        );
        Ok(())
    }

    /// Flushes and closes the binary stream. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.buffer()?.closed()? {
            return Ok(());
        }
        let flushed = self.flush();
        let closed = self.buffer_mut()?.close();
        self.pending_bytes.clear();
        self.set_decoded_chars(String::new());
        self.snapshot = None;
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

    /// Flushes and returns the binary stream without closing it.
    pub fn detach(&mut self) -> Result<B> {
        self.buffer()?;
        self.flush()?;
        self.buffer.take().ok_or(Error::Detached)
    }
}

impl<B: BinaryStream> Drop for TextStream<B> {
    fn drop(&mut self) {
        match self.buffer.as_ref().map(|b| b.closed()) {
            Some(Ok(false)) => {}
            _ => return,
        }
        if let Err(err) = self.close() {
            debug!(error = %err, "error closing text stream on drop");
        }
    }
}

/// Line iterator returned by [`TextStream::lines`].
pub struct Lines<'a, B: BinaryStream> {
    stream: &'a mut TextStream<B>,
    finished: bool,
}

impl<B: BinaryStream> Iterator for Lines<'_, B> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.stream.telling = false;
        self.stream.snapshot = None;
        match self.stream.readline(None) {
            Ok(line) if line.is_empty() => {
                self.finished = true;
                self.stream.snapshot = None;
                self.stream.telling = self.stream.seekable;
                None
            }
            Ok(line) => Some(Ok(line)),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
