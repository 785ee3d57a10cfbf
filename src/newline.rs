//! Universal-newline decoding.
//!
//! [`IncrementalNewlineDecoder`] sits between a codec decoder and the text
//! stream. It records which line terminators it has seen and, when
//! translating, rewrites `\r\n` and `\r` to `\n`. A `\r` at the end of a
//! non-final chunk is held back until the next call so that a `\r\n` pair
//! split across chunks is recognised as one terminator.

use crate::codec::{Decoder, DecoderState};
use crate::error::{Error, Result};
use std::fmt;

/// Set of newline kinds observed by a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Newlines(u8);

impl Newlines {
    pub const CR: Newlines = Newlines(1);
    pub const LF: Newlines = Newlines(2);
    pub const CRLF: Newlines = Newlines(4);

    pub const fn empty() -> Self {
        Newlines(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Newlines) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Newlines) {
        self.0 |= other.0;
    }

    /// The observed terminators, in `\r`, `\n`, `\r\n` order.
    pub fn terminators(self) -> Vec<&'static str> {
        [(Self::CR, "\r"), (Self::LF, "\n"), (Self::CRLF, "\r\n")]
            .into_iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, s)| s)
            .collect()
    }
}

impl std::ops::BitOr for Newlines {
    type Output = Newlines;

    fn bitor(self, rhs: Newlines) -> Newlines {
        Newlines(self.0 | rhs.0)
    }
}

impl fmt::Display for Newlines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.terminators())
    }
}

/// Newline-tracking wrapper around an optional codec decoder.
pub struct IncrementalNewlineDecoder {
    decoder: Option<Box<dyn Decoder + Send>>,
    translate: bool,
    pending_cr: bool,
    seen: Newlines,
}

impl fmt::Debug for IncrementalNewlineDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementalNewlineDecoder")
            .field("has_decoder", &self.decoder.is_some())
            .field("translate", &self.translate)
            .field("pending_cr", &self.pending_cr)
            .field("seen", &self.seen)
            .finish()
    }
}

impl IncrementalNewlineDecoder {
    pub fn new(decoder: Option<Box<dyn Decoder + Send>>, translate: bool) -> Self {
        Self {
            decoder,
            translate,
            pending_cr: false,
            seen: Newlines::empty(),
        }
    }

    pub fn translate(&self) -> bool {
        self.translate
    }

    /// Runs already-decoded text through newline tracking and translation.
    pub fn decode_str(&mut self, text: &str, final_: bool) -> String {
        self.process(text.to_string(), final_)
    }

    fn process(&mut self, mut output: String, final_: bool) -> String {
        if self.pending_cr && (final_ || !output.is_empty()) {
            output.insert(0, '\r');
            self.pending_cr = false;
        }
        // A trailing \r might be the first half of \r\n; wait for more input.
        if !final_ && output.ends_with('\r') {
            output.pop();
            self.pending_cr = true;
        }

        if !output.contains('\r') {
            if output.contains('\n') {
                self.seen.insert(Newlines::LF);
            }
            return output;
        }

        let bytes = output.as_bytes();
        let mut translated = if self.translate {
            Vec::with_capacity(bytes.len())
        } else {
            Vec::new()
        };
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\r' if bytes.get(i + 1) == Some(&b'\n') => {
                    self.seen.insert(Newlines::CRLF);
                    if self.translate {
                        translated.push(b'\n');
                    }
                    i += 2;
                    continue;
                }
                b'\r' => {
                    self.seen.insert(Newlines::CR);
                    if self.translate {
                        translated.push(b'\n');
                    }
                }
                b'\n' => {
                    self.seen.insert(Newlines::LF);
                    if self.translate {
                        translated.push(b'\n');
                    }
                }
                b => {
                    if self.translate {
                        translated.push(b);
                    }
                }
            }
            i += 1;
        }

        if self.translate {
            // Only ASCII bytes were replaced by ASCII bytes.
            String::from_utf8(translated).unwrap_or(output)
        } else {
            output
        }
    }
}

impl Decoder for IncrementalNewlineDecoder {
    fn decode(&mut self, input: &[u8], final_: bool) -> Result<String> {
        let output = match self.decoder.as_mut() {
            Some(decoder) => decoder.decode(input, final_)?,
            None => std::str::from_utf8(input)
                .map_err(|e| Error::Decode {
                    encoding: "utf-8",
                    byte: input[e.valid_up_to()],
                    position: e.valid_up_to(),
                    reason: "newline decoder without a codec only accepts complete UTF-8",
                })?
                .to_string(),
        };
        Ok(self.process(output, final_))
    }

    fn getstate(&self) -> DecoderState {
        let mut state = match &self.decoder {
            Some(decoder) => decoder.getstate(),
            None => DecoderState::default(),
        };
        state.flags <<= 1;
        if self.pending_cr {
            state.flags |= 1;
        }
        state
    }

    fn setstate(&mut self, state: &DecoderState) -> Result<()> {
        if state.flags < 0 {
            return Err(Error::illegal_decoder_state(format!(
                "negative newline decoder flags {}",
                state.flags
            )));
        }
        self.pending_cr = state.flags & 1 != 0;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.setstate(&DecoderState::new(state.buffer.clone(), state.flags >> 1))?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.seen = Newlines::empty();
        self.pending_cr = false;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
    }

    fn newlines(&self) -> Option<Newlines> {
        Some(self.seen)
    }
}
