//! NAL unit helpers: type constants, emulation prevention, length prefixes.

use std::borrow::Cow;

use crate::error::{CodecError, Result};

/// AVC NAL unit types
pub mod avc {
    pub const SLICE: u8 = 1;
    pub const DPA: u8 = 2;
    pub const DPB: u8 = 3;
    pub const DPC: u8 = 4;
    pub const IDR_SLICE: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
    /// MVC extension slice
    pub const SLICE_EXT: u8 = 20;
    /// 3D-AVC extension slice
    pub const SLICE_EXT_DEPTH: u8 = 21;

    /// NAL type from the first header byte
    pub const fn nal_type(header: u8) -> u8 {
        header & 0x1f
    }

    pub const HEADER_SIZE: usize = 1;
}

/// HEVC NAL unit types
pub mod hevc {
    pub const TRAIL_N: u8 = 0;
    pub const RASL_R: u8 = 9;
    pub const BLA_W_LP: u8 = 16;
    pub const IDR_W_RADL: u8 = 19;
    pub const IDR_N_LP: u8 = 20;
    pub const CRA_NUT: u8 = 21;
    pub const RSV_IRAP_VCL23: u8 = 23;
    pub const VPS: u8 = 32;
    pub const SPS: u8 = 33;
    pub const PPS: u8 = 34;
    pub const AUD: u8 = 35;
    pub const PREFIX_SEI: u8 = 39;

    /// NAL type from the first header byte
    pub const fn nal_type(header: u8) -> u8 {
        (header >> 1) & 0x3f
    }

    pub const HEADER_SIZE: usize = 2;
}

/// Remove emulation prevention bytes (`00 00 03` -> `00 00`).
///
/// Borrows the input when no escape sequence is present.
pub fn remove_emulation_prevention(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.windows(3).any(|w| w == [0, 0, 3]) {
        return Cow::Borrowed(data);
    }

    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 3 {
            result.extend_from_slice(&[0, 0]);
            i += 3;
        } else {
            result.push(data[i]);
            i += 1;
        }
    }

    Cow::Owned(result)
}

/// Number of emulation prevention bytes an encoder would insert into `rbsp`
/// (one per `00 00 0x` run with `x <= 3`)
pub fn emulation_prevention_count(rbsp: &[u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i + 2 < rbsp.len() {
        if rbsp[i] == 0 && rbsp[i + 1] == 0 && rbsp[i + 2] <= 3 {
            count += 1;
            i += 3;
        } else {
            i += 1;
        }
    }
    count
}

/// Read a big-endian NAL length prefix of 1 to 4 bytes
pub fn read_length_prefix(data: &[u8], size_length: usize) -> Result<u32> {
    if !(1..=4).contains(&size_length) {
        return Err(CodecError::bad_data(format!("invalid nal length size {size_length}")));
    }
    let prefix = data.get(..size_length).ok_or(CodecError::UnexpectedEof)?;
    Ok(prefix.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

/// Split a length-prefixed access unit into NAL units
pub fn split_length_prefixed(data: &[u8], size_length: usize) -> Result<Vec<&[u8]>> {
    let mut units = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let len = read_length_prefix(rest, size_length)? as usize;
        rest = &rest[size_length..];
        if len > rest.len() {
            return Err(CodecError::bad_data(format!(
                "nal unit of {len} bytes exceeds remaining {} bytes",
                rest.len()
            )));
        }
        units.push(&rest[..len]);
        rest = &rest[len..];
    }
    Ok(units)
}
