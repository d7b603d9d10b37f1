//! Primitive decoding for the ABC container.
//!
//! All multi-byte fixed-width values are little-endian. `u30`, `u32` and
//! `s32` use a base-128 variable-length encoding of at most five bytes.

use tracing::warn;

use super::{Anomaly, ParseError, Result};

/// Cursor over an ABC byte stream that collects [`Anomaly`] values.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    anomalies: Vec<Anomaly>,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            anomalies: Vec::new(),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Capacity hint for `count` entries read from the input. Every entry
    /// takes at least one byte, so a count past the unread input is bounded
    /// by it.
    pub fn capacity_for(&self, count: usize) -> usize {
        count.min(self.remaining())
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Records a recoverable oddity.
    pub fn note(&mut self, anomaly: Anomaly) {
        warn!(%anomaly, "parse anomaly");
        self.anomalies.push(anomaly);
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn take_anomalies(&mut self) -> Vec<Anomaly> {
        std::mem::take(&mut self.anomalies)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(ParseError::UnexpectedEof {
                offset: self.pos,
                wanted: len,
            }),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_d64(&mut self) -> Result<f64> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }

    /// 24-bit little-endian value, sign-extended from bit 23.
    pub fn read_s24(&mut self) -> Result<i32> {
        let b = self.read_bytes(3)?;
        let raw = (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16);
        Ok(((raw << 8) as i32) >> 8)
    }

    /// Returns the accumulated value, the number of payload bits consumed
    /// and the final byte.
    fn read_varint(&mut self) -> Result<(u32, u32, u8)> {
        let mut value = 0u32;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u32) << shift;
            shift += 7;
            if byte & 0x80 == 0 || shift == 35 {
                return Ok((value, shift, byte));
            }
        }
    }

    pub fn read_u30(&mut self) -> Result<u32> {
        let offset = self.pos;
        let (value, _, _) = self.read_varint()?;
        if value & 0xc000_0000 != 0 {
            self.note(Anomaly::U30Overflow { offset, value });
        }
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let offset = self.pos;
        let (value, shift, last) = self.read_varint()?;
        if shift == 35 && last & 0x7f > 0x0f {
            self.note(Anomaly::U32HighBits { offset });
        }
        Ok(value)
    }

    pub fn read_s32(&mut self) -> Result<i32> {
        let (mut value, shift, last) = self.read_varint()?;
        if shift < 32 && last & 0x40 != 0 {
            value |= !0u32 << shift;
        }
        Ok(value as i32)
    }

    /// Length-prefixed string. Non-ASCII text is decoded lossily and
    /// flagged.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u30()? as usize;
        let offset = self.pos;
        let bytes = self.read_bytes(len)?;
        if bytes.iter().any(|b| b & 0x80 != 0) {
            self.note(Anomaly::MultibyteString { offset });
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::writer::Writer;

    fn encoded(f: impl FnOnce(&mut Writer)) -> Vec<u8> {
        let mut w = Writer::new();
        f(&mut w);
        w.into_bytes()
    }

    #[test]
    fn test_u30_boundaries() {
        for value in [0u32, 1, 127, 128, 16383, 16384, (1 << 30) - 1] {
            let bytes = encoded(|w| w.write_u30(value));
            let mut r = Reader::new(&bytes);
            assert_eq!(r.read_u30().unwrap(), value);
            assert!(r.is_at_end());
            assert!(r.anomalies().is_empty(), "value {value}");
        }
    }

    #[test]
    fn test_u30_over_ceiling_is_anomaly() {
        let bytes = encoded(|w| w.write_u32(1 << 30));
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u30().unwrap(), 1 << 30);
        assert_eq!(
            r.anomalies(),
            &[Anomaly::U30Overflow { offset: 0, value: 1 << 30 }]
        );
    }

    #[test]
    fn test_u32_boundaries() {
        for value in [0u32, 0x7f, 0x80, 0x0fff_ffff, 0x1000_0000, u32::MAX] {
            let bytes = encoded(|w| w.write_u32(value));
            let mut r = Reader::new(&bytes);
            assert_eq!(r.read_u32().unwrap(), value);
            assert!(r.anomalies().is_empty());
        }
    }

    #[test]
    fn test_u32_high_bits() {
        let mut r = Reader::new(&[0xff, 0xff, 0xff, 0xff, 0x7f]);
        assert_eq!(r.read_u32().unwrap(), u32::MAX);
        assert_eq!(r.anomalies(), &[Anomaly::U32HighBits { offset: 0 }]);
    }

    #[test]
    fn test_s32_sign_extension() {
        for value in [0i32, 1, -1, 63, 64, -64, -65, 8191, -8192, i32::MAX, i32::MIN] {
            let bytes = encoded(|w| w.write_s32(value));
            let mut r = Reader::new(&bytes);
            assert_eq!(r.read_s32().unwrap(), value, "bytes {bytes:02x?}");
            assert!(r.is_at_end());
        }
    }

    #[test]
    fn test_s32_single_byte_negative() {
        let mut r = Reader::new(&[0x7f]);
        assert_eq!(r.read_s32().unwrap(), -1);
    }

    #[test]
    fn test_s24_boundaries() {
        for value in [0i32, 1, -1, 0x7f_ffff, -0x80_0000, -3, 300] {
            let bytes = encoded(|w| w.write_s24(value));
            assert_eq!(bytes.len(), 3);
            let mut r = Reader::new(&bytes);
            assert_eq!(r.read_s24().unwrap(), value);
        }
    }

    #[test]
    fn test_s24_wraps_past_ceiling() {
        // 0x800000 does not fit; it reads back as the most negative value.
        let bytes = encoded(|w| w.write_s24(0x80_0000));
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_s24().unwrap(), -0x80_0000);
    }

    #[test]
    fn test_multibyte_string_is_flagged() {
        let bytes = encoded(|w| w.write_string("caf\u{e9}"));
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "caf\u{e9}");
        assert_eq!(r.anomalies().len(), 1);
    }

    #[test]
    fn test_truncated_input() {
        let mut r = Reader::new(&[0x80, 0x80]);
        assert_eq!(
            r.read_u30(),
            Err(ParseError::UnexpectedEof { offset: 2, wanted: 1 })
        );
        let mut r = Reader::new(&[3, b'a']);
        assert!(matches!(r.read_string(), Err(ParseError::UnexpectedEof { .. })));
    }
}
