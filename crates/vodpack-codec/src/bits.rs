//! MSB-first bit reader over RBSP data.

use crate::error::{CodecError, Result};

/// Reads bits, Exp-Golomb codes and trailing-bit patterns from an RBSP buffer.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    /// Read a single bit
    pub fn read_bit(&mut self) -> Result<bool> {
        let byte = *self.data.get(self.byte_pos).ok_or(CodecError::UnexpectedEof)?;
        let bit = (byte >> (7 - self.bit_pos)) & 1;

        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }

        Ok(bit == 1)
    }

    /// Read n bits (up to 32)
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        debug_assert!(n <= 32);
        let mut result = 0u64;
        for _ in 0..n {
            result = (result << 1) | u64::from(self.read_bit()?);
        }
        Ok(result as u32)
    }

    /// Skip n bits, any count
    pub fn skip_bits(&mut self, n: u64) -> Result<()> {
        if n > self.bits_left() {
            self.byte_pos = self.data.len();
            self.bit_pos = 0;
            return Err(CodecError::UnexpectedEof);
        }

        let pos = self.bit_position() + n;
        self.byte_pos = (pos / 8) as usize;
        self.bit_pos = (pos % 8) as u8;
        Ok(())
    }

    /// Read unsigned Exp-Golomb coded value
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(CodecError::bad_data("exp-golomb code longer than 32 bits"));
            }
        }

        if leading_zeros == 0 {
            return Ok(0);
        }

        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }

    /// Read signed Exp-Golomb coded value
    pub fn read_se(&mut self) -> Result<i32> {
        let value = i64::from(self.read_ue()?);
        let signed = if value & 1 == 1 {
            (value + 1) / 2
        } else {
            -(value / 2)
        };
        Ok(signed as i32)
    }

    /// Skip an Exp-Golomb coded value (signed or unsigned)
    pub fn skip_exp_golomb(&mut self) -> Result<()> {
        self.read_ue().map(|_| ())
    }

    /// Number of bits consumed so far
    pub fn bit_position(&self) -> u64 {
        self.byte_pos as u64 * 8 + u64::from(self.bit_pos)
    }

    /// Number of unread bits
    pub fn bits_left(&self) -> u64 {
        (self.data.len() as u64 * 8).saturating_sub(self.bit_position())
    }

    /// Number of bytes touched by the reads so far, counting a partially
    /// consumed byte as a whole one
    pub fn bytes_touched(&self) -> usize {
        self.byte_pos + usize::from(self.bit_pos > 0)
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bit_pos == 0
    }

    /// `more_rbsp_data()`: true unless only the stop bit and zero padding remain
    pub fn more_rbsp_data(&self) -> bool {
        let mut lookahead = self.clone();
        lookahead.rbsp_trailing_bits().is_err()
    }

    /// Consume `rbsp_trailing_bits()`, requiring a one bit followed by zeros
    /// up to the end of the buffer
    pub fn rbsp_trailing_bits(&mut self) -> Result<()> {
        if !self.read_bit()? {
            return Err(CodecError::bad_data("invalid rbsp stop bit"));
        }
        while self.bits_left() > 0 {
            if self.read_bit()? {
                return Err(CodecError::bad_data("non-zero rbsp alignment bit"));
            }
        }
        Ok(())
    }
}

/// Ceiling of log2, with `ceil_log2(0) == ceil_log2(1) == 0`
pub fn ceil_log2(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        32 - (value - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_reader_read_bits() {
        let data = [0b10110100, 0b01010101];
        let mut reader = BitReader::new(&data);

        assert_eq!(reader.read_bits(4), Ok(0b1011));
        assert_eq!(reader.read_bits(4), Ok(0b0100));
        assert_eq!(reader.read_bits(8), Ok(0b01010101));
        assert_eq!(reader.read_bits(1), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn test_bit_reader_read_ue() {
        // 1 -> 0, 010 -> 1, 011 -> 2, 00100 -> 3
        let data = [0b10100110, 0b01000000];
        let mut reader = BitReader::new(&data);

        assert_eq!(reader.read_ue(), Ok(0));
        assert_eq!(reader.read_ue(), Ok(1));
        assert_eq!(reader.read_ue(), Ok(2));
        assert_eq!(reader.read_ue(), Ok(3));
    }

    #[test]
    fn test_bit_reader_read_se() {
        // 010 -> +1, 011 -> -1, 00100 -> +2
        let data = [0b01001100, 0b10000000];
        let mut reader = BitReader::new(&data);

        assert_eq!(reader.read_se(), Ok(1));
        assert_eq!(reader.read_se(), Ok(-1));
        assert_eq!(reader.read_se(), Ok(2));
    }

    #[test]
    fn test_skip_and_positions() {
        let data = [0xff; 8];
        let mut reader = BitReader::new(&data);

        reader.skip_bits(43).unwrap();
        assert_eq!(reader.bit_position(), 43);
        assert_eq!(reader.bytes_touched(), 6);
        assert_eq!(reader.bits_left(), 21);
        assert!(reader.skip_bits(22).is_err());
    }

    #[test]
    fn test_rbsp_trailing_bits() {
        let data = [0b1010_0000];
        let mut reader = BitReader::new(&data);
        reader.read_bits(2).unwrap();
        assert!(!reader.more_rbsp_data());
        assert!(reader.rbsp_trailing_bits().is_ok());

        let data = [0b1011_0000];
        let mut reader = BitReader::new(&data);
        reader.read_bits(2).unwrap();
        assert!(reader.more_rbsp_data());
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(8160), 13);
    }
}
