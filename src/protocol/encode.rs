// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Little-endian, length-delimited primitives shared by all payload codecs.
//! Field order is fixed per structure, which makes serialization
//! deterministic and the round-trip byte-identical.

use super::PayloadError;

pub(super) fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(super) fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(super) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(super) fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Writes a u32 length prefix followed by the raw bytes.
pub(super) fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    write_u32(buf, value.len() as u32);
    buf.extend_from_slice(value);
}

/// Sequential reader over a payload slice which tracks completeness.
pub(super) struct ReadCursor<'data> {
    data: &'data [u8],
    offset: usize,
}

impl<'data> ReadCursor<'data> {
    pub fn new(data: &'data [u8]) -> Self {
        ReadCursor { data, offset: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, PayloadError> {
        let bytes = self.take(1)?;
        Ok(bytes[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, PayloadError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, PayloadError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, PayloadError> {
        let bytes = self.take(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(le))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, PayloadError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_array<const LEN: usize>(&mut self) -> Result<[u8; LEN], PayloadError> {
        let bytes = self.take(LEN)?;
        let mut array = [0u8; LEN];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    /// Fails unless every byte of the payload has been consumed.
    pub fn finish(self) -> Result<(), PayloadError> {
        let remaining = self.data.len() - self.offset;
        if remaining != 0 {
            return Err(PayloadError::TrailingBytes(remaining));
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'data [u8], PayloadError> {
        if self.offset + len > self.data.len() {
            return Err(PayloadError::UnexpectedEnd);
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }
}
