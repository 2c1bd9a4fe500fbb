//! EBML element primitives.
//!
//! Master elements reserve an 8-byte size field. The payload size is known
//! from the layout before anything is written, so the slot is filled
//! directly instead of being patched afterwards.

use bytes::BufMut;

use crate::layout::{Emitter, Layout};

/// Width of a master element size field
pub const MAX_NUM_SIZE: usize = 8;

pub const ID_EBML: u32 = 0x1A45_DFA3;
pub const ID_SEGMENT: u32 = 0x1853_8067;
pub const ID_INFO: u32 = 0x1549_A966;
pub const ID_TRACKS: u32 = 0x1654_AE6B;
pub const ID_CLUSTER: u32 = 0x1F43_B675;

pub const ID_TIMECODE_SCALE: u32 = 0x2A_D7B1;
pub const ID_DURATION: u32 = 0x4489;
pub const ID_WRITING_APP: u32 = 0x5741;
pub const ID_MUXING_APP: u32 = 0x4D80;

pub const ID_TRACK_ENTRY: u32 = 0xAE;
pub const ID_TRACK_NUMBER: u32 = 0xD7;
pub const ID_TRACK_UID: u32 = 0x73C5;
pub const ID_TRACK_TYPE: u32 = 0x83;
pub const ID_CODEC_ID: u32 = 0x86;
pub const ID_CODEC_PRIVATE: u32 = 0x63A2;
pub const ID_CODEC_DELAY: u32 = 0x56AA;
pub const ID_VIDEO: u32 = 0xE0;
pub const ID_PIXEL_WIDTH: u32 = 0xB0;
pub const ID_PIXEL_HEIGHT: u32 = 0xBA;
pub const ID_AUDIO: u32 = 0xE1;
pub const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
pub const ID_CHANNELS: u32 = 0x9F;
pub const ID_BIT_DEPTH: u32 = 0x6264;

pub const ID_CONTENT_ENCODINGS: u32 = 0x6D80;
pub const ID_CONTENT_ENCODING: u32 = 0x6240;
pub const ID_CONTENT_ENCODING_ORDER: u32 = 0x5031;
pub const ID_CONTENT_ENCODING_SCOPE: u32 = 0x5032;
pub const ID_CONTENT_ENCODING_TYPE: u32 = 0x5033;
pub const ID_CONTENT_ENCRYPTION: u32 = 0x5035;
pub const ID_CONTENT_ENC_ALGO: u32 = 0x47E1;
pub const ID_CONTENT_ENC_KEY_ID: u32 = 0x47E2;
pub const ID_CONTENT_ENC_AES_SETTINGS: u32 = 0x47E7;
pub const ID_AES_SETTINGS_CIPHER_MODE: u32 = 0x47E8;

pub const ID_CLUSTER_TIMECODE: u32 = 0xE7;
pub const ID_SIMPLE_BLOCK: u32 = 0xA3;

/// Bytes of a variable-length size field holding `num`.
///
/// The all-ones value of every width means "unknown", so `num + 1` has to
/// fit.
pub fn num_size(num: u64) -> usize {
    let mut num = num.saturating_add(1);
    let mut size = 0;
    loop {
        num >>= 7;
        size += 1;
        if num == 0 {
            return size;
        }
    }
}

/// Bytes of the big-endian payload of an unsigned integer element.
pub fn uint_size(mut num: u64) -> usize {
    let mut size = 1;
    loop {
        num >>= 8;
        if num == 0 {
            return size;
        }
        size += 1;
    }
}

pub fn id_size(id: u32) -> usize {
    match id {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

pub fn put_id(out: &mut Emitter<'_>, id: u32) {
    let size = id_size(id);
    out.put_slice(&id.to_be_bytes()[4 - size..]);
}

/// Write `num` as a size field of `size` bytes (`num_size(num)` when 0).
pub fn put_num(out: &mut Emitter<'_>, num: u64, size: usize) {
    let size = if size == 0 { num_size(num) } else { size };
    let marked = num | 1u64.checked_shl(7 * size as u32).unwrap_or(0);
    out.put_slice(&marked.to_be_bytes()[8 - size..]);
}

/// Unsigned integer element with the shortest payload.
#[derive(Debug, Clone, Copy)]
pub struct Uint {
    pub id: u32,
    pub value: u64,
}

impl Layout for Uint {
    fn size(&self) -> usize {
        id_size(self.id) + 1 + uint_size(self.value)
    }

    fn write(&self, out: &mut Emitter<'_>) {
        let size = uint_size(self.value);
        put_id(out, self.id);
        put_num(out, size as u64, 1);
        out.put_slice(&self.value.to_be_bytes()[8 - size..]);
    }
}

/// 64-bit float element.
#[derive(Debug, Clone, Copy)]
pub struct Float {
    pub id: u32,
    pub value: f64,
}

impl Layout for Float {
    fn size(&self) -> usize {
        id_size(self.id) + 1 + 8
    }

    fn write(&self, out: &mut Emitter<'_>) {
        put_id(out, self.id);
        put_num(out, 8, 1);
        out.put_f64(self.value);
    }
}

/// String or binary element.
#[derive(Debug, Clone, Copy)]
pub struct Binary<'a> {
    pub id: u32,
    pub data: &'a [u8],
}

impl Layout for Binary<'_> {
    fn size(&self) -> usize {
        id_size(self.id) + num_size(self.data.len() as u64) + self.data.len()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        put_id(out, self.id);
        put_num(out, self.data.len() as u64, 0);
        out.put_slice(self.data);
    }
}

/// Master element around `body`, with an 8-byte size field.
#[derive(Debug, Clone)]
pub struct Master<L> {
    pub id: u32,
    pub body: L,
}

impl<L: Layout> Layout for Master<L> {
    fn size(&self) -> usize {
        id_size(self.id) + MAX_NUM_SIZE + self.body.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        put_id(out, self.id);
        put_num(out, self.body.size() as u64, MAX_NUM_SIZE);
        self.body.write(out);
    }
}

/// The WebM EBML header: version 1, max id length 4, max size length 8,
/// doc type `webm` version 2.
pub const WEBM_HEADER: [u8; 36] = [
    0x1a, 0x45, 0xdf, 0xa3, 0x9f, 0x42, 0x86, 0x81, //
    0x01, 0x42, 0xf7, 0x81, 0x01, 0x42, 0xf2, 0x81, //
    0x04, 0x42, 0xf3, 0x81, 0x08, 0x42, 0x82, 0x84, //
    0x77, 0x65, 0x62, 0x6d, 0x42, 0x87, 0x81, 0x04, //
    0x42, 0x85, 0x81, 0x02,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Measured;

    #[test]
    fn test_num_size() {
        assert_eq!(num_size(0), 1);
        assert_eq!(num_size(126), 1);
        // 127 is the one-byte "unknown" marker
        assert_eq!(num_size(127), 2);
        assert_eq!(num_size(16382), 2);
        assert_eq!(num_size(16383), 3);
    }

    #[test]
    fn test_uint_size() {
        assert_eq!(uint_size(0), 1);
        assert_eq!(uint_size(255), 1);
        assert_eq!(uint_size(256), 2);
        assert_eq!(uint_size(u64::MAX), 8);
    }

    #[test]
    fn test_uint_element() {
        let bytes = Measured::new(Uint {
            id: ID_TIMECODE_SCALE,
            value: 1_000_000,
        })
        .emit()
        .unwrap();
        assert_eq!(&bytes[..], &[0x2a, 0xd7, 0xb1, 0x83, 0x0f, 0x42, 0x40]);
    }

    #[test]
    fn test_zero_uint_still_has_payload() {
        let bytes = Measured::new(Uint {
            id: ID_CONTENT_ENCODING_ORDER,
            value: 0,
        })
        .emit()
        .unwrap();
        assert_eq!(&bytes[..], &[0x50, 0x31, 0x81, 0x00]);
    }

    #[test]
    fn test_float_element() {
        let bytes = Measured::new(Float {
            id: ID_DURATION,
            value: 1.5,
        })
        .emit()
        .unwrap();
        assert_eq!(&bytes[..], &[0x44, 0x89, 0x88, 0x3f, 0xf8, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_master_uses_eight_byte_size() {
        let bytes = Measured::new(Master {
            id: ID_VIDEO,
            body: Uint {
                id: ID_PIXEL_WIDTH,
                value: 640,
            },
        })
        .emit()
        .unwrap();
        assert_eq!(&bytes[..9], &[0xe0, 0x01, 0, 0, 0, 0, 0, 0, 4]);
        assert_eq!(&bytes[9..], &[0xb0, 0x82, 0x02, 0x80]);
    }

    #[test]
    fn test_empty_binary() {
        let bytes = Measured::new(Binary {
            id: ID_CODEC_PRIVATE,
            data: &[],
        })
        .emit()
        .unwrap();
        assert_eq!(&bytes[..], &[0x63, 0xa2, 0x80]);
    }

    #[test]
    fn test_put_num_widths() {
        struct Num(u64, usize);
        impl Layout for Num {
            fn size(&self) -> usize {
                if self.1 == 0 {
                    num_size(self.0)
                } else {
                    self.1
                }
            }
            fn write(&self, out: &mut Emitter<'_>) {
                put_num(out, self.0, self.1);
            }
        }
        assert_eq!(&Measured::new(Num(5, 0)).emit().unwrap()[..], &[0x85]);
        assert_eq!(&Measured::new(Num(300, 0)).emit().unwrap()[..], &[0x41, 0x2c]);
        assert_eq!(&Measured::new(Num(300, 4)).emit().unwrap()[..], &[0x10, 0, 0x01, 0x2c]);
    }
}
