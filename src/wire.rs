//! Ordered read/write cursors over command frame bytes.
//!
//! Every command writes its fields in one fixed declared order per tag; that
//! order is the wire contract and these cursors are its only enforcement
//! point. Primitives are little-endian; strings are u32-length-prefixed
//! UTF-8; raw byte ranges are u64-length-prefixed. Reads are checked and
//! fail with a `ProtocolError` instead of panicking, because a short or
//! garbled frame must abort the consuming loop cleanly.

use crate::core::errors::ProtocolError;
use crate::handle::Handle;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Write cursor used by `Command::serialize`
#[derive(Debug)]
pub struct WriteStream {
    buf: BytesMut,
}

impl WriteStream {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_handle(&mut self, handle: Handle) {
        self.buf.put_u64_le(handle.raw());
    }

    /// u32 length prefix followed by the UTF-8 bytes. Strings too long for
    /// the prefix are rejected rather than written with a wrapped length.
    pub fn write_str(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.buf.put_u32_le(str_prefix(value.len())?);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    /// u64 length prefix followed by the raw bytes
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.put_u64_le(value.len() as u64);
        self.buf.put_slice(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for WriteStream {
    fn default() -> Self {
        Self::new()
    }
}

fn str_prefix(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| {
        ProtocolError::malformed(
            "string",
            format!("length {len} exceeds the u32 length prefix"),
        )
    })
}

/// Read cursor used by `Command::deserialize`
#[derive(Debug)]
pub struct ReadStream {
    buf: Bytes,
}

impl ReadStream {
    pub fn new(frame: Bytes) -> Self {
        Self { buf: frame }
    }

    fn need(&self, what: &'static str, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                what,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.need("u8", 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.need("u32", 4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        self.need("u64", 8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.need("i32", 4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        self.need("i64", 8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        self.need("f32", 4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::malformed(
                "bool",
                format!("expected 0 or 1, got {other}"),
            )),
        }
    }

    pub fn read_handle(&mut self) -> Result<Handle, ProtocolError> {
        Ok(Handle::from_raw(self.read_u64()?))
    }

    pub fn read_str(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        self.need(field, len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
    }

    /// Zero-copy: the returned `Bytes` shares the frame's backing buffer,
    /// which the receiving process owns outright
    pub fn read_bytes(&mut self, field: &'static str) -> Result<Bytes, ProtocolError> {
        let len = self.read_u64()?;
        let len = usize::try_from(len).map_err(|_| {
            ProtocolError::malformed(field, format!("payload length {len} exceeds address space"))
        })?;
        self.need(field, len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
