//! Bounds-checked byte reading and length-encoded integers
//!
//! Every read returns a protocol error instead of panicking when the buffer
//! is shorter than the wire format promises.

use crate::common::{CanalError, Result};
use bytes::{BufMut, BytesMut};

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CanalError::protocol(format!(
                "unexpected end of data: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        Ok(self.uint_le(2)? as u16)
    }

    pub fn u24_le(&mut self) -> Result<u32> {
        Ok(self.uint_le(3)? as u32)
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        Ok(self.uint_le(4)? as u32)
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        self.uint_le(8)
    }

    pub fn i64_le(&mut self) -> Result<i64> {
        Ok(self.uint_le(8)? as i64)
    }

    /// Little-endian unsigned integer of `n` (≤ 8) bytes.
    pub fn uint_le(&mut self, n: usize) -> Result<u64> {
        let b = self.bytes(n)?;
        Ok(b.iter().rev().fold(0u64, |acc, x| (acc << 8) | u64::from(*x)))
    }

    /// Big-endian unsigned integer of `n` (≤ 8) bytes.
    pub fn uint_be(&mut self, n: usize) -> Result<u64> {
        let b = self.bytes(n)?;
        Ok(b.iter().fold(0u64, |acc, x| (acc << 8) | u64::from(*x)))
    }

    /// Bytes up to (excluding) the next NUL; the NUL is consumed.
    pub fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CanalError::protocol("missing NUL terminator"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// Length-encoded integer; `None` stands for SQL NULL (0xFB).
    pub fn lenenc_int(&mut self) -> Result<Option<u64>> {
        let first = self.u8()?;
        Ok(match first {
            0xFB => None,
            0xFC => Some(self.uint_le(2)?),
            0xFD => Some(self.uint_le(3)?),
            0xFE => Some(self.uint_le(8)?),
            v => Some(u64::from(v)),
        })
    }

    /// Length-encoded integer where NULL is not allowed.
    pub fn packed_int(&mut self) -> Result<u64> {
        self.lenenc_int()?
            .ok_or_else(|| CanalError::protocol("unexpected NULL length"))
    }

    pub fn lenenc_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        match self.lenenc_int()? {
            Some(n) => Ok(Some(self.bytes(n as usize)?)),
            None => Ok(None),
        }
    }

    pub fn lenenc_string(&mut self) -> Result<String> {
        Ok(self
            .lenenc_bytes()?
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default())
    }
}

/// Write a length-encoded integer.
pub fn put_lenenc_int(buf: &mut BytesMut, v: u64) {
    if v < 251 {
        buf.put_u8(v as u8);
    } else if v < 1 << 16 {
        buf.put_u8(0xFC);
        buf.put_uint_le(v, 2);
    } else if v < 1 << 24 {
        buf.put_u8(0xFD);
        buf.put_uint_le(v, 3);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(v);
    }
}

/// Write a length-encoded byte string.
pub fn put_lenenc_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_lenenc_int(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Number of bytes of a bitmap covering `bits` bits.
pub fn bitmap_len(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Bit `idx` of a little-endian bitmap.
pub fn bit_is_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map(|b| b & (1 << (idx % 8)) != 0)
        .unwrap_or(false)
}

pub fn count_set_bits(bitmap: &[u8], bits: usize) -> usize {
    (0..bits).filter(|&i| bit_is_set(bitmap, i)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.u16_le().unwrap(), 0x0201);
        assert_eq!(r.u24_le().unwrap(), 0x050403);
        assert_eq!(r.remaining(), 3);
        assert!(r.u32_le().is_err());

        let mut r = ByteReader::new(&data);
        assert_eq!(r.uint_be(3).unwrap(), 0x010203);
    }

    #[test]
    fn test_lenenc_round_trip() {
        for v in [0u64, 250, 251, 65535, 65536, 16_777_215, 16_777_216, u64::MAX] {
            let mut buf = BytesMut::new();
            put_lenenc_int(&mut buf, v);
            let mut r = ByteReader::new(&buf);
            assert_eq!(r.lenenc_int().unwrap(), Some(v));
            assert!(r.is_empty());
        }

        let mut r = ByteReader::new(&[0xFB]);
        assert_eq!(r.lenenc_int().unwrap(), None);
    }

    #[test]
    fn test_null_terminated() {
        let mut r = ByteReader::new(b"abc\0rest");
        assert_eq!(r.null_terminated().unwrap(), b"abc");
        assert_eq!(r.rest(), b"rest");
        assert!(ByteReader::new(b"abc").null_terminated().is_err());
    }

    #[test]
    fn test_bitmaps() {
        assert_eq!(bitmap_len(0), 0);
        assert_eq!(bitmap_len(8), 1);
        assert_eq!(bitmap_len(9), 2);

        let bitmap = [0b0000_0101, 0b0000_0001];
        assert!(bit_is_set(&bitmap, 0));
        assert!(!bit_is_set(&bitmap, 1));
        assert!(bit_is_set(&bitmap, 2));
        assert!(bit_is_set(&bitmap, 8));
        assert!(!bit_is_set(&bitmap, 64));
        assert_eq!(count_set_bits(&bitmap, 9), 3);
        assert_eq!(count_set_bits(&bitmap, 4), 2);
    }
}
