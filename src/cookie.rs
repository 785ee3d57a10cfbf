//! Text stream position cookies.
//!
//! A text position cannot be a plain byte offset: the decoder may hold
//! carry-over bytes and the character count per byte varies. A [`Cookie`]
//! names a safe byte offset plus the decoder flags there, and how to replay
//! from it (bytes to feed, characters to skip, whether to signal EOF).
//!
//! Wire layout, little-endian, fields in declaration order:
//!
//! ```text
//! offset  size  field
//!      0     8  start_pos      i64
//!      8     4  dec_flags      i32
//!     12     4  bytes_to_feed  i32
//!     16     4  chars_to_skip  i32
//!     20     1  need_eof       u8 (0 or 1)
//! ```

use crate::error::{Error, Result};
use std::fmt;

/// Serialized cookie length in bytes.
pub const COOKIE_LEN: usize = 21;

/// An opaque text stream position, as returned by `TextStream::tell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cookie {
    pub start_pos: i64,
    pub dec_flags: i32,
    pub bytes_to_feed: i32,
    pub chars_to_skip: i32,
    pub need_eof: bool,
}

impl Cookie {
    /// The start of the stream.
    pub const ZERO: Cookie = Cookie {
        start_pos: 0,
        dec_flags: 0,
        bytes_to_feed: 0,
        chars_to_skip: 0,
        need_eof: false,
    };

    /// A position at a safe point with fresh decoder flags.
    pub const fn at(start_pos: i64) -> Self {
        Cookie {
            start_pos,
            ..Cookie::ZERO
        }
    }

    /// True if every field is zero (the cookie for position 0).
    pub fn is_zero(&self) -> bool {
        *self == Cookie::ZERO
    }

    /// True if the cookie is a plain byte offset needing no replay.
    pub fn is_simple(&self) -> bool {
        self.dec_flags == 0 && self.bytes_to_feed == 0 && self.chars_to_skip == 0 && !self.need_eof
    }

    pub fn to_bytes(&self) -> [u8; COOKIE_LEN] {
        let mut out = [0u8; COOKIE_LEN];
        out[0..8].copy_from_slice(&self.start_pos.to_le_bytes());
        out[8..12].copy_from_slice(&self.dec_flags.to_le_bytes());
        out[12..16].copy_from_slice(&self.bytes_to_feed.to_le_bytes());
        out[16..20].copy_from_slice(&self.chars_to_skip.to_le_bytes());
        out[20] = u8::from(self.need_eof);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; COOKIE_LEN] = bytes.try_into().map_err(|_| {
            Error::invalid_argument(format!(
                "cookie must be {COOKIE_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        let need_eof = match bytes[20] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::invalid_argument(format!(
                    "cookie need_eof byte must be 0 or 1, got {other}"
                )))
            }
        };
        let i32_at = |at: usize| i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut start = [0u8; 8];
        start.copy_from_slice(&bytes[0..8]);
        Ok(Cookie {
            start_pos: i64::from_le_bytes(start),
            dec_flags: i32_at(8),
            bytes_to_feed: i32_at(12),
            chars_to_skip: i32_at(16),
            need_eof,
        })
    }
}

impl From<i64> for Cookie {
    fn from(start_pos: i64) -> Self {
        Cookie::at(start_pos)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_simple() {
            return write!(f, "{}", self.start_pos);
        }
        write!(
            f,
            "{}+{}b/{}c flags={}{}",
            self.start_pos,
            self.bytes_to_feed,
            self.chars_to_skip,
            self.dec_flags,
            if self.need_eof { " eof" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_little_endian_in_field_order() {
        let cookie = Cookie {
            start_pos: 0x0102,
            dec_flags: 3,
            bytes_to_feed: 4,
            chars_to_skip: 5,
            need_eof: true,
        };
        let bytes = cookie.to_bytes();
        assert_eq!(bytes.len(), COOKIE_LEN);
        assert_eq!(&bytes[0..8], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[3, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[4, 0, 0, 0]);
        assert_eq!(&bytes[16..20], &[5, 0, 0, 0]);
        assert_eq!(bytes[20], 1);
        assert_eq!(Cookie::from_bytes(&bytes).unwrap(), cookie);
    }

    #[test]
    fn test_from_bytes_rejects_bad_input() {
        assert!(matches!(
            Cookie::from_bytes(&[0u8; 17]),
            Err(Error::InvalidArgument { .. })
        ));
        let mut bytes = Cookie::ZERO.to_bytes();
        bytes[20] = 2;
        assert!(Cookie::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_zero_and_simple() {
        assert!(Cookie::ZERO.is_zero());
        assert!(Cookie::from(0i64).is_zero());
        let plain = Cookie::at(42);
        assert!(!plain.is_zero());
        assert!(plain.is_simple());
        assert_eq!(plain.to_string(), "42");
        let replay = Cookie {
            chars_to_skip: 2,
            ..plain
        };
        assert!(!replay.is_simple());
        assert_eq!(replay.to_string(), "42+0b/2c flags=0");
    }
}
