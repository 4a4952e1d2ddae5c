//! BigSize-prefixed TLV streams as used in onion hop payloads.
//!
//! Entries are kept in wire order so that an unmodified stream re-encodes to
//! exactly the bytes it was decoded from.

use bytes::{Buf, BufMut, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TlvError {
    #[error("truncated BigSize at offset {offset}")]
    TruncatedBigSize { offset: usize },
    #[error("non-canonical BigSize at offset {offset}")]
    NonCanonicalBigSize { offset: usize },
    #[error("TLV type={typ} declares {declared} bytes but only {available} remain")]
    TruncatedValue {
        typ: u64,
        declared: u64,
        available: usize,
    },
    #[error("TLV types not strictly increasing: {previous} then {next}")]
    UnorderedTypes { previous: u64, next: u64 },
    #[error("length prefix {declared} does not match stream length {actual}")]
    LengthMismatch { declared: u64, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    pub typ: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvStream(pub Vec<TlvEntry>);

impl TlvStream {
    /// Decodes a bare TLV stream (no length prefix).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TlvError> {
        let mut buf = bytes;
        let mut entries: Vec<TlvEntry> = vec![];
        while buf.has_remaining() {
            let offset = bytes.len() - buf.remaining();
            let typ = buf.try_get_bigsize(offset)?;
            let len = buf.try_get_bigsize(bytes.len() - buf.remaining())?;
            if len > buf.remaining() as u64 {
                return Err(TlvError::TruncatedValue {
                    typ,
                    declared: len,
                    available: buf.remaining(),
                });
            }
            if let Some(last) = entries.last() {
                if last.typ >= typ {
                    return Err(TlvError::UnorderedTypes {
                        previous: last.typ,
                        next: typ,
                    });
                }
            }
            let value = buf.copy_to_bytes(len as usize).to_vec();
            entries.push(TlvEntry { typ, value });
        }
        Ok(Self(entries))
    }

    /// Decodes a stream that starts with a BigSize length prefix, as found in
    /// the `payload` field of the `htlc_accepted` hook.
    pub fn from_length_prefixed(bytes: &[u8]) -> Result<Self, TlvError> {
        let mut buf = bytes;
        let declared = buf.try_get_bigsize(0)?;
        if declared != buf.remaining() as u64 {
            return Err(TlvError::LengthMismatch {
                declared,
                actual: buf.remaining(),
            });
        }
        Self::from_bytes(buf)
    }

    pub fn get(&self, typ: u64) -> Option<&TlvEntry> {
        self.0.iter().find(|e| e.typ == typ)
    }

    /// Replaces the value of an existing entry. Returns false if no entry of
    /// that type exists.
    pub fn replace(&mut self, typ: u64, value: Vec<u8>) -> bool {
        match self.0.iter_mut().find(|e| e.typ == typ) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = BytesMut::new();
        for e in self.0.iter() {
            b.put_bigsize(e.typ);
            b.put_bigsize(e.value.len() as u64);
            b.put_slice(&e.value);
        }
        b.to_vec()
    }

    pub fn to_length_prefixed(&self) -> Vec<u8> {
        let body = self.to_bytes();
        let mut b = BytesMut::with_capacity(body.len() + 9);
        b.put_bigsize(body.len() as u64);
        b.put_slice(&body);
        b.to_vec()
    }
}

impl std::fmt::Display for TlvStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// Extensions on top of `Buf` to read LN proto primitives without panicking
/// on short input.
pub trait ProtoBuf: Buf {
    fn try_get_bigsize(&mut self, offset: usize) -> Result<u64, TlvError> {
        if !self.has_remaining() {
            return Err(TlvError::TruncatedBigSize { offset });
        }
        let (width, min) = match self.get_u8() {
            253 => (2, 0xFD),
            254 => (4, 0x1_0000),
            255 => (8, 0x1_0000_0000),
            v => return Ok(v as u64),
        };
        if self.remaining() < width {
            return Err(TlvError::TruncatedBigSize { offset });
        }
        let value = self.get_uint(width);
        if value < min {
            return Err(TlvError::NonCanonicalBigSize { offset });
        }
        Ok(value)
    }
}

impl ProtoBuf for &[u8] {}

pub trait ProtoBufMut: BufMut {
    fn put_bigsize(&mut self, v: u64) {
        match v {
            0..=0xFC => self.put_u8(v as u8),
            0xFD..=0xFFFF => {
                self.put_u8(253);
                self.put_u16(v as u16);
            }
            0x10000..=0xFFFFFFFF => {
                self.put_u8(254);
                self.put_u32(v as u32);
            }
            _ => {
                self.put_u8(255);
                self.put_u64(v);
            }
        }
    }
}

impl ProtoBufMut for BytesMut {}
