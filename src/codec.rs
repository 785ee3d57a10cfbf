//! Incremental codecs consumed by the text layer.
//!
//! A [`Decoder`] turns bytes into text across arbitrary chunk boundaries and
//! can snapshot its carry-over as a [`DecoderState`]; an [`Encoder`] turns
//! text into bytes and knows whether it is at the start of a stream (for
//! byte-order marks). The built-in codecs are selected through [`Encoding`].

use crate::error::{Error, Result};
use crate::newline::Newlines;
use std::fmt;
use std::str::FromStr;

/// Snapshot of an incremental decoder.
///
/// `buffer` holds input bytes the decoder has consumed but not yet turned
/// into characters. A state with an empty buffer marks a safe point: decoding
/// can restart there from `flags` alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderState {
    pub buffer: Vec<u8>,
    pub flags: i64,
}

impl DecoderState {
    pub fn new(buffer: Vec<u8>, flags: i64) -> Self {
        Self { buffer, flags }
    }

    /// A state with nothing buffered.
    pub fn with_flags(flags: i64) -> Self {
        Self {
            buffer: Vec::new(),
            flags,
        }
    }
}

/// Stateful bytes-to-text conversion.
pub trait Decoder {
    /// Decodes `input`, holding back incomplete sequences unless `final_` is set.
    fn decode(&mut self, input: &[u8], final_: bool) -> Result<String>;

    fn getstate(&self) -> DecoderState;

    fn setstate(&mut self, state: &DecoderState) -> Result<()>;

    /// Returns to the fresh start-of-stream state.
    fn reset(&mut self);

    /// Newline kinds observed so far, for decoders that track them.
    fn newlines(&self) -> Option<Newlines> {
        None
    }
}

/// Stateful text-to-bytes conversion.
pub trait Encoder {
    fn encode(&mut self, text: &str) -> Result<Vec<u8>>;

    /// Returns to the start-of-stream state (a BOM-writing encoder emits one again).
    fn reset(&mut self);

    /// Restores a state; `0` means "in the middle of a stream".
    fn setstate(&mut self, state: i64) -> Result<()>;
}

/// How malformed input or unencodable characters are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ErrorMode {
    /// Fail with `Error::Decode` / `Error::Encode`.
    #[default]
    Strict,
    /// Substitute U+FFFD when decoding, `?` when encoding.
    Replace,
    /// Drop the offending input.
    Ignore,
}

impl ErrorMode {
    pub fn name(self) -> &'static str {
        match self {
            ErrorMode::Strict => "strict",
            ErrorMode::Replace => "replace",
            ErrorMode::Ignore => "ignore",
        }
    }
}

impl FromStr for ErrorMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(ErrorMode::Strict),
            "replace" => Ok(ErrorMode::Replace),
            "ignore" => Ok(ErrorMode::Ignore),
            other => Err(Error::invalid_argument(format!(
                "unknown error handler name '{other}'"
            ))),
        }
    }
}

/// Built-in character encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
    Utf16Le,
    Utf16Be,
    /// UTF-16 with a byte-order mark: written on the first write of a
    /// stream, detected on the first read (little-endian if absent).
    Utf16,
}

impl Encoding {
    /// Looks up an encoding by name, ignoring case and `-`/`_` differences.
    pub fn from_name(name: &str) -> Result<Self> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "utf8" | "u8" | "utf" => Ok(Encoding::Utf8),
            "ascii" | "usascii" | "646" => Ok(Encoding::Ascii),
            "latin1" | "latin" | "l1" | "iso88591" | "iso885911987" | "8859" | "cp819" => {
                Ok(Encoding::Latin1)
            }
            "utf16le" => Ok(Encoding::Utf16Le),
            "utf16be" => Ok(Encoding::Utf16Be),
            "utf16" | "u16" => Ok(Encoding::Utf16),
            _ => Err(Error::UnknownEncoding(name.to_string())),
        }
    }

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin-1",
            Encoding::Utf16Le => "utf-16-le",
            Encoding::Utf16Be => "utf-16-be",
            Encoding::Utf16 => "utf-16",
        }
    }

    pub fn decoder(self, errors: ErrorMode) -> Box<dyn Decoder + Send> {
        match self {
            Encoding::Utf8 => Box::new(Utf8Decoder::new(errors)),
            Encoding::Ascii => Box::new(SingleByteDecoder::new(self.name(), 0x80, errors)),
            Encoding::Latin1 => Box::new(SingleByteDecoder::new(self.name(), 0x100, errors)),
            Encoding::Utf16Le => Box::new(Utf16Decoder::new(Some(Endian::Little), errors)),
            Encoding::Utf16Be => Box::new(Utf16Decoder::new(Some(Endian::Big), errors)),
            Encoding::Utf16 => Box::new(Utf16Decoder::new(None, errors)),
        }
    }

    pub fn encoder(self, errors: ErrorMode) -> Box<dyn Encoder + Send> {
        match self {
            Encoding::Utf8 => Box::new(Utf8Encoder),
            Encoding::Ascii => Box::new(SingleByteEncoder::new(self.name(), 0x80, errors)),
            Encoding::Latin1 => Box::new(SingleByteEncoder::new(self.name(), 0x100, errors)),
            Encoding::Utf16Le => Box::new(Utf16Encoder::new(Endian::Little, false)),
            Encoding::Utf16Be => Box::new(Utf16Encoder::new(Endian::Big, false)),
            Encoding::Utf16 => Box::new(Utf16Encoder::new(Endian::Little, true)),
        }
    }

    /// One-shot decode of a complete input.
    pub fn decode(self, input: &[u8], errors: ErrorMode) -> Result<String> {
        self.decoder(errors).decode(input, true)
    }

    /// One-shot encode from the start of a stream.
    pub fn encode(self, text: &str, errors: ErrorMode) -> Result<Vec<u8>> {
        self.encoder(errors).encode(text)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Encoding::from_name(s)
    }
}

impl TryFrom<String> for Encoding {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Encoding::from_name(&value)
    }
}

impl From<Encoding> for String {
    fn from(value: Encoding) -> Self {
        value.name().to_string()
    }
}

fn decode_error(encoding: &'static str, byte: u8, position: usize, reason: &'static str) -> Error {
    Error::Decode {
        encoding,
        byte,
        position,
        reason,
    }
}

/// Incremental UTF-8 decoder; carries an incomplete trailing sequence.
#[derive(Debug, Clone)]
struct Utf8Decoder {
    pending: Vec<u8>,
    errors: ErrorMode,
}

impl Utf8Decoder {
    fn new(errors: ErrorMode) -> Self {
        Self {
            pending: Vec::new(),
            errors,
        }
    }
}

impl Decoder for Utf8Decoder {
    fn decode(&mut self, input: &[u8], final_: bool) -> Result<String> {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(input);

        let mut out = String::with_capacity(data.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&data[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    out.push_str(std::str::from_utf8(&data[start..valid_end]).unwrap_or_default());
                    match e.error_len() {
                        None if !final_ => {
                            self.pending = data[valid_end..].to_vec();
                            break;
                        }
                        None => {
                            match self.errors {
                                ErrorMode::Strict => {
                                    return Err(decode_error(
                                        "utf-8",
                                        data[valid_end],
                                        valid_end,
                                        "unexpected end of data",
                                    ))
                                }
                                ErrorMode::Replace => out.push(char::REPLACEMENT_CHARACTER),
                                ErrorMode::Ignore => {}
                            }
                            break;
                        }
                        Some(len) => {
                            match self.errors {
                                ErrorMode::Strict => {
                                    return Err(decode_error(
                                        "utf-8",
                                        data[valid_end],
                                        valid_end,
                                        "invalid utf-8 sequence",
                                    ))
                                }
                                ErrorMode::Replace => out.push(char::REPLACEMENT_CHARACTER),
                                ErrorMode::Ignore => {}
                            }
                            start = valid_end + len;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn getstate(&self) -> DecoderState {
        DecoderState::new(self.pending.clone(), 0)
    }

    fn setstate(&mut self, state: &DecoderState) -> Result<()> {
        if state.buffer.len() > 3 {
            return Err(Error::illegal_decoder_state(format!(
                "utf-8 decoder cannot buffer {} bytes",
                state.buffer.len()
            )));
        }
        self.pending = state.buffer.clone();
        Ok(())
    }

    fn reset(&mut self) {
        self.pending.clear();
    }
}

/// ASCII (`limit == 0x80`) and Latin-1 (`limit == 0x100`). Stateless.
#[derive(Debug, Clone)]
struct SingleByteDecoder {
    name: &'static str,
    limit: u32,
    errors: ErrorMode,
}

impl SingleByteDecoder {
    fn new(name: &'static str, limit: u32, errors: ErrorMode) -> Self {
        Self {
            name,
            limit,
            errors,
        }
    }
}

impl Decoder for SingleByteDecoder {
    fn decode(&mut self, input: &[u8], _final: bool) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        for (position, &byte) in input.iter().enumerate() {
            if u32::from(byte) < self.limit {
                out.push(char::from(byte));
                continue;
            }
            match self.errors {
                ErrorMode::Strict => {
                    return Err(decode_error(self.name, byte, position, "ordinal not in range(128)"))
                }
                ErrorMode::Replace => out.push(char::REPLACEMENT_CHARACTER),
                ErrorMode::Ignore => {}
            }
        }
        Ok(out)
    }

    fn getstate(&self) -> DecoderState {
        DecoderState::default()
    }

    fn setstate(&mut self, state: &DecoderState) -> Result<()> {
        if !state.buffer.is_empty() {
            return Err(Error::illegal_decoder_state(format!(
                "{} decoder has no buffered input",
                self.name
            )));
        }
        Ok(())
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn unit(self, pair: [u8; 2]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes(pair),
            Endian::Big => u16::from_be_bytes(pair),
        }
    }

    fn bytes(self, unit: u16) -> [u8; 2] {
        match self {
            Endian::Little => unit.to_le_bytes(),
            Endian::Big => unit.to_be_bytes(),
        }
    }
}

/// UTF-16 decoder. With `detect` set, the byte order comes from a leading BOM.
///
/// State flags: `2` while the byte order is undetermined, otherwise `0` for
/// little-endian and `1` for big-endian.
#[derive(Debug, Clone)]
struct Utf16Decoder {
    pending: Vec<u8>,
    order: Option<Endian>,
    detect: bool,
    errors: ErrorMode,
}

impl Utf16Decoder {
    fn new(order: Option<Endian>, errors: ErrorMode) -> Self {
        Self {
            pending: Vec::new(),
            order,
            detect: order.is_none(),
            errors,
        }
    }

    fn name(&self) -> &'static str {
        match (self.detect, self.order) {
            (true, _) => "utf-16",
            (false, Some(Endian::Big)) => "utf-16-be",
            (false, _) => "utf-16-le",
        }
    }

    fn invalid(&self, out: &mut String, byte: u8, position: usize) -> Result<()> {
        match self.errors {
            ErrorMode::Strict => Err(decode_error(self.name(), byte, position, "illegal UTF-16 surrogate")),
            ErrorMode::Replace => {
                out.push(char::REPLACEMENT_CHARACTER);
                Ok(())
            }
            ErrorMode::Ignore => Ok(()),
        }
    }
}

impl Decoder for Utf16Decoder {
    fn decode(&mut self, input: &[u8], final_: bool) -> Result<String> {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(input);
        let mut start = 0;

        let order = match self.order {
            Some(order) => order,
            None if data.len() < 2 && !final_ => {
                self.pending = data;
                return Ok(String::new());
            }
            None => {
                let order = match data.get(..2) {
                    Some([0xFE, 0xFF]) => {
                        start = 2;
                        Endian::Big
                    }
                    Some([0xFF, 0xFE]) => {
                        start = 2;
                        Endian::Little
                    }
                    _ => Endian::Little,
                };
                self.order = Some(order);
                order
            }
        };

        let mut out = String::with_capacity(data.len() / 2);
        let mut i = start;
        while i + 2 <= data.len() {
            let unit = order.unit([data[i], data[i + 1]]);
            match unit {
                0xD800..=0xDBFF => {
                    if i + 4 > data.len() {
                        if final_ {
                            self.invalid(&mut out, data[i], i)?;
                            i = data.len();
                        }
                        break;
                    }
                    let low = order.unit([data[i + 2], data[i + 3]]);
                    if (0xDC00..=0xDFFF).contains(&low) {
                        let code = 0x10000 + ((u32::from(unit) - 0xD800) << 10) + (u32::from(low) - 0xDC00);
                        match char::from_u32(code) {
                            Some(c) => out.push(c),
                            None => self.invalid(&mut out, data[i], i)?,
                        }
                        i += 4;
                    } else {
                        self.invalid(&mut out, data[i], i)?;
                        i += 2;
                    }
                }
                0xDC00..=0xDFFF => {
                    self.invalid(&mut out, data[i], i)?;
                    i += 2;
                }
                _ => {
                    match char::from_u32(u32::from(unit)) {
                        Some(c) => out.push(c),
                        None => self.invalid(&mut out, data[i], i)?,
                    }
                    i += 2;
                }
            }
        }

        if i < data.len() {
            if final_ {
                match self.errors {
                    ErrorMode::Strict => {
                        return Err(decode_error(self.name(), data[i], i, "truncated data"))
                    }
                    ErrorMode::Replace => out.push(char::REPLACEMENT_CHARACTER),
                    ErrorMode::Ignore => {}
                }
            } else {
                self.pending = data[i..].to_vec();
            }
        }
        Ok(out)
    }

    fn getstate(&self) -> DecoderState {
        let flags = match self.order {
            None => 2,
            Some(Endian::Little) => 0,
            Some(Endian::Big) => 1,
        };
        DecoderState::new(self.pending.clone(), flags)
    }

    fn setstate(&mut self, state: &DecoderState) -> Result<()> {
        if state.buffer.len() > 3 {
            return Err(Error::illegal_decoder_state(format!(
                "utf-16 decoder cannot buffer {} bytes",
                state.buffer.len()
            )));
        }
        if self.detect {
            self.order = match state.flags {
                0 => Some(Endian::Little),
                1 => Some(Endian::Big),
                2 => None,
                other => {
                    return Err(Error::illegal_decoder_state(format!(
                        "utf-16 decoder flags must be 0, 1 or 2, not {other}"
                    )))
                }
            };
        }
        self.pending = state.buffer.clone();
        Ok(())
    }

    fn reset(&mut self) {
        self.pending.clear();
        if self.detect {
            self.order = None;
        }
    }
}

/// UTF-8 encoding cannot fail for a Rust `str` and has no state.
#[derive(Debug, Clone, Copy)]
struct Utf8Encoder;

impl Encoder for Utf8Encoder {
    fn encode(&mut self, text: &str) -> Result<Vec<u8>> {
        Ok(text.as_bytes().to_vec())
    }

    fn reset(&mut self) {}

    fn setstate(&mut self, _state: i64) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SingleByteEncoder {
    name: &'static str,
    limit: u32,
    errors: ErrorMode,
}

impl SingleByteEncoder {
    fn new(name: &'static str, limit: u32, errors: ErrorMode) -> Self {
        Self {
            name,
            limit,
            errors,
        }
    }
}

impl Encoder for SingleByteEncoder {
    fn encode(&mut self, text: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(text.len());
        for (position, c) in text.chars().enumerate() {
            let code = u32::from(c);
            if code < self.limit {
                out.push(code as u8);
                continue;
            }
            match self.errors {
                ErrorMode::Strict => {
                    return Err(Error::Encode {
                        encoding: self.name,
                        character: c,
                        position,
                        reason: "ordinal not in range",
                    })
                }
                ErrorMode::Replace => out.push(b'?'),
                ErrorMode::Ignore => {}
            }
        }
        Ok(out)
    }

    fn reset(&mut self) {}

    fn setstate(&mut self, _state: i64) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Utf16Encoder {
    order: Endian,
    with_bom: bool,
    bom_pending: bool,
}

impl Utf16Encoder {
    fn new(order: Endian, with_bom: bool) -> Self {
        Self {
            order,
            with_bom,
            bom_pending: with_bom,
        }
    }
}

impl Encoder for Utf16Encoder {
    fn encode(&mut self, text: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(text.len() * 2 + 2);
        if self.bom_pending {
            out.extend_from_slice(&self.order.bytes(0xFEFF));
            self.bom_pending = false;
        }
        for unit in text.encode_utf16() {
            out.extend_from_slice(&self.order.bytes(unit));
        }
        Ok(out)
    }

    fn reset(&mut self) {
        self.bom_pending = self.with_bom;
    }

    fn setstate(&mut self, state: i64) -> Result<()> {
        self.bom_pending = self.with_bom && state != 0;
        Ok(())
    }
}
