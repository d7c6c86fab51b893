//! SSH binary wire primitives (RFC 4251 §5)
//!
//! `uint32` values are big-endian; a `string` is a `uint32` length followed
//! by that many raw bytes.

use crate::keys::KeyError;

/// Append-only encoder for SSH wire fields
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Length-prefixed byte string
    pub fn put_string(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_string(value.as_bytes())
    }

    /// Raw bytes with no length prefix
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Pad with the bytes 1, 2, 3, ... until the length is a multiple of `block`
    pub fn pad_to_block(&mut self, block: usize) -> &mut Self {
        let mut next = 1u8;
        while self.buf.len() % block != 0 {
            self.buf.push(next);
            next = next.wrapping_add(1);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over SSH wire fields
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_u32(&mut self) -> Result<u32, KeyError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_string(&mut self) -> Result<&'a [u8], KeyError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_str(&mut self) -> Result<&'a str, KeyError> {
        let bytes = self.read_string()?;
        std::str::from_utf8(bytes).map_err(|_| KeyError::Malformed("field is not UTF-8".to_string()))
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], KeyError> {
        self.take(len)
    }

    /// Bytes not yet consumed
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], KeyError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                KeyError::Malformed(format!(
                    "truncated field: wanted {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.data.len() - self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}
