//! Decoder configuration records (`avcC`, `hvcC`) carried as codec extra data.

use crate::error::{CodecError, Result};
use crate::nal;

/// Size of the fixed `avcC` header preceding the SPS list
pub const AVCC_HEADER_SIZE: usize = 5;

/// Size of the fixed `hvcC` header preceding the NAL unit arrays
pub const HVCC_HEADER_SIZE: usize = 22;

/// Parameter-set NAL units extracted from a decoder configuration record.
///
/// Each unit includes its NAL header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig<'a> {
    /// Width of the NAL length prefix used by samples (1, 2 or 4)
    pub nal_length_size: usize,
    /// Parameter sets in record order
    pub units: Vec<&'a [u8]>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self, what: &str) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| CodecError::bad_data(format!("extra data overflow while reading {what}")))?;
        self.pos += 1;
        Ok(b)
    }

    fn be16(&mut self, what: &str) -> Result<u16> {
        let hi = self.u8(what)?;
        let lo = self.u8(what)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| CodecError::bad_data(format!("extra data overflow while reading {what}")))?;
        self.pos = end;
        Ok(slice)
    }
}

/// Parse an `AVCDecoderConfigurationRecord`
pub fn parse_avcc(extra_data: &[u8]) -> Result<DecoderConfig<'_>> {
    if extra_data.len() < AVCC_HEADER_SIZE {
        return Err(CodecError::bad_data(format!(
            "extra data size {} too small",
            extra_data.len()
        )));
    }

    let nal_length_size = usize::from(extra_data[4] & 0x3) + 1;
    let mut cursor = Cursor {
        data: extra_data,
        pos: AVCC_HEADER_SIZE,
    };

    let mut units = Vec::new();
    // once for SPS, once for PPS
    for _ in 0..2 {
        let count = cursor.u8("unit count")? & 0x1f;
        for _ in 0..count {
            let size = usize::from(cursor.be16("unit size")?);
            let unit = cursor.bytes(size, "unit data")?;
            if unit.len() < nal::avc::HEADER_SIZE {
                return Err(CodecError::bad_data("unit of zero size"));
            }
            units.push(unit);
        }
    }

    Ok(DecoderConfig {
        nal_length_size,
        units,
    })
}

/// Parse an `HEVCDecoderConfigurationRecord`
pub fn parse_hvcc(extra_data: &[u8]) -> Result<DecoderConfig<'_>> {
    if extra_data.len() < HVCC_HEADER_SIZE {
        return Err(CodecError::bad_data("overflow while parsing hevc config"));
    }

    // lengthSizeMinusOne is the low two bits of the last header byte
    let nal_length_size = usize::from(extra_data[HVCC_HEADER_SIZE - 1] & 0x3) + 1;
    let mut cursor = Cursor {
        data: extra_data,
        pos: HVCC_HEADER_SIZE,
    };

    let mut units = Vec::new();
    let array_count = cursor.u8("type count")?;
    for _ in 0..array_count {
        cursor.u8("type header")?; // array_completeness + NAL_unit_type
        let count = cursor.be16("type header")?;
        for _ in 0..count {
            let size = usize::from(cursor.be16("unit size")?);
            let unit = cursor.bytes(size, "unit data")?;
            if unit.len() < nal::hevc::HEADER_SIZE {
                return Err(CodecError::bad_data("unit smaller than header size"));
            }
            units.push(unit);
        }
    }

    Ok(DecoderConfig {
        nal_length_size,
        units,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avcc(sps: &[&[u8]], pps: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![1, 0x64, 0x00, 0x1f, 0xff];
        out.push(0xe0 | sps.len() as u8);
        for unit in sps {
            out.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            out.extend_from_slice(unit);
        }
        out.push(pps.len() as u8);
        for unit in pps {
            out.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            out.extend_from_slice(unit);
        }
        out
    }

    #[test]
    fn test_parse_avcc() {
        let data = avcc(&[&[0x67, 0x64, 0x00]], &[&[0x68, 0xee]]);
        let config = parse_avcc(&data).unwrap();
        assert_eq!(config.nal_length_size, 4);
        assert_eq!(config.units, vec![&[0x67, 0x64, 0x00][..], &[0x68, 0xee][..]]);
    }

    #[test]
    fn test_parse_avcc_too_small() {
        assert!(matches!(parse_avcc(&[1, 2, 3]), Err(CodecError::BadData(_))));
    }

    #[test]
    fn test_parse_avcc_truncated_unit() {
        let mut data = avcc(&[&[0x67, 0x64, 0x00]], &[]);
        data.truncate(data.len() - 2);
        assert!(parse_avcc(&data).is_err());
    }

    #[test]
    fn test_parse_avcc_zero_size_unit() {
        let data = avcc(&[&[]], &[]);
        assert!(parse_avcc(&data).is_err());
    }

    #[test]
    fn test_parse_hvcc() {
        let mut data = vec![0u8; HVCC_HEADER_SIZE];
        data[0] = 1;
        data[HVCC_HEADER_SIZE - 1] = 0x0f; // 4 byte lengths
        data.push(1); // one array
        data.extend_from_slice(&[0x20 | 0x80, 0, 1]); // VPS array, one unit
        data.extend_from_slice(&[0, 3, 0x40, 0x01, 0x0c]);

        let config = parse_hvcc(&data).unwrap();
        assert_eq!(config.nal_length_size, 4);
        assert_eq!(config.units, vec![&[0x40, 0x01, 0x0c][..]]);
    }
}
