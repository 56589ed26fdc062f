//! Versioned binary framing
//!
//! Every persisted record carries a version preamble so that readers can
//! skip fields appended by newer writers, and refuse records they are too
//! old to understand. All integers are little-endian.
//!
//! Frame layout:
//! ```text
//! +----------+----------+--------+---------+
//! | struct_v | compat_v | len    | payload |
//! | 1B       | 1B       | 4B     | len B   |
//! +----------+----------+--------+---------+
//! ```
//!
//! `struct_v` is the version the writer produced; `compat_v` is the oldest
//! reader version that can still make sense of the payload. A reader that
//! supports version `V` rejects any frame with `compat_v > V` and ignores
//! payload bytes past the fields it knows about.

use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::collections::{BTreeMap, BTreeSet};

/// Encode one versioned frame, with the payload written by `payload`.
///
/// The length prefix is patched in after the payload closure runs.
pub fn encode_frame(
    buf: &mut BytesMut,
    struct_v: u8,
    compat_v: u8,
    payload: impl FnOnce(&mut BytesMut),
) {
    buf.put_u8(struct_v);
    buf.put_u8(compat_v);
    let len_at = buf.len();
    buf.put_u32_le(0);
    let start = buf.len();
    payload(buf);
    let len = (buf.len() - start) as u32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_le_bytes());
}

/// Append a length-prefixed UTF-8 string
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Append a count-prefixed set of `u64`
pub fn put_u64_set(buf: &mut BytesMut, set: &BTreeSet<u64>) {
    buf.put_u32_le(set.len() as u32);
    for v in set {
        buf.put_u64_le(*v);
    }
}

/// Append a count-prefixed string-to-string map
pub fn put_string_map(buf: &mut BytesMut, map: &BTreeMap<String, String>) {
    buf.put_u32_le(map.len() as u32);
    for (k, v) in map {
        put_string(buf, k);
        put_string(buf, v);
    }
}

/// An open frame being decoded
///
/// Tracks where the framed payload ends so unread trailing fields can be
/// skipped and reads cannot run past the frame.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    struct_v: u8,
    end: usize,
}

impl Frame {
    /// The writer's structure version
    #[must_use]
    pub const fn struct_v(&self) -> u8 {
        self.struct_v
    }

    /// Byte offset one past the framed payload
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }
}

/// Bounds-checked reader over an encoded byte slice
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Create a decoder over `buf`
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once the whole buffer is consumed
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Current byte offset
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Re-point the cursor at an earlier offset
    pub fn seek(&mut self, pos: usize) {
        debug_assert!(pos <= self.buf.len());
        self.pos = pos;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::decode(format!(
                "unexpected end of buffer: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read one byte
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u32`
    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4-byte slice")))
    }

    /// Read a little-endian `u64`
    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    /// Read a length-prefixed UTF-8 string
    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| Error::decode("invalid UTF-8 in string"))
    }

    /// Read a count-prefixed set of `u64`
    pub fn get_u64_set(&mut self) -> Result<BTreeSet<u64>> {
        let n = self.get_u32()?;
        let mut set = BTreeSet::new();
        for _ in 0..n {
            set.insert(self.get_u64()?);
        }
        Ok(set)
    }

    /// Read a count-prefixed string-to-string map
    pub fn get_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let n = self.get_u32()?;
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let k = self.get_string()?;
            let v = self.get_string()?;
            map.insert(k, v);
        }
        Ok(map)
    }

    /// Open a frame, rejecting records this reader cannot understand.
    ///
    /// `supported` is the newest structure version the caller knows.
    pub fn begin_frame(&mut self, supported: u8) -> Result<Frame> {
        let struct_v = self.get_u8()?;
        let compat_v = self.get_u8()?;
        if compat_v > supported {
            return Err(Error::decode(format!(
                "record requires version {compat_v}, decoder supports {supported}"
            )));
        }
        let len = self.get_u32()? as usize;
        if self.remaining() < len {
            return Err(Error::decode(format!(
                "framed payload overruns buffer: len {len}, have {}",
                self.remaining()
            )));
        }
        Ok(Frame {
            struct_v,
            end: self.pos + len,
        })
    }

    /// Close a frame, skipping any trailing fields the reader did not
    /// consume.
    pub fn finish_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.pos > frame.end {
            return Err(Error::decode("decoded past end of frame"));
        }
        self.pos = frame.end;
        Ok(())
    }
}
