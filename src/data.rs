use std::borrow::Cow;
use std::fmt;

use crate::header::{Header, HEADER_LEN};

/// An owned payload buffer with the frame header prefix reserved up front.
///
/// The allocation always holds `8 + n` bytes; the user-visible payload is the
/// slice past the first 8. The send path writes the header into the reserved
/// prefix in place, so sending never reallocates or copies the payload.
pub struct Data {
    buf: Vec<u8>,
}

impl Data {
    /// Copies `s` into a fresh payload buffer.
    pub fn new(s: &str) -> Data {
        let mut data = Data::with_len(s.len());
        data.payload_mut().copy_from_slice(s.as_bytes());
        data
    }

    /// A zeroed payload buffer of `len` bytes.
    pub fn with_len(len: usize) -> Data {
        Data {
            buf: vec![0; len + HEADER_LEN],
        }
    }

    /// The no-payload sentinel; carries no allocation at all.
    pub(crate) fn empty() -> Data {
        Data { buf: Vec::new() }
    }

    /// Wraps a received datagram (header included) without copying.
    pub(crate) fn from_frame(frame: Vec<u8>) -> Data {
        debug_assert!(frame.len() >= HEADER_LEN);
        Data { buf: frame }
    }

    pub fn len(&self) -> usize {
        self.buf.len().saturating_sub(HEADER_LEN)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        if self.buf.len() < HEADER_LEN {
            &[]
        } else {
            &self.buf[HEADER_LEN..]
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        if self.buf.len() < HEADER_LEN {
            &mut []
        } else {
            &mut self.buf[HEADER_LEN..]
        }
    }

    /// The payload as text. Error events carry their message here.
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.payload())
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes `header` into the reserved prefix.
    pub(crate) fn set_header(&mut self, header: Header) {
        debug_assert!(!self.is_sentinel());
        self.buf[..HEADER_LEN].copy_from_slice(&header.encode());
    }

    /// The full wire frame: header prefix plus payload.
    pub(crate) fn frame(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data").field("len", &self.len()).finish()
    }
}
