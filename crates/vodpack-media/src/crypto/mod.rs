//! Common Encryption: CENC (AES-CTR) and cbcs (pattern AES-CBC) output,
//! CENC source decryption and protected-source passthrough.

pub mod cbcs;
pub mod cenc;
pub mod decrypt;
pub mod passthrough;

use cipher::generic_array::GenericArray;
use cipher::KeyIvInit;

use crate::error::{Error, Result};
use crate::media::{CursorFrame, FrameCursor, Sequence};

pub use cbcs::{CbcsDecryptor, CbcsEncryptor};
pub use cenc::{CencAudio, CencVideo, CencVideoSink, SampleAux};
pub use decrypt::CencDecryptSource;
pub use passthrough::Passthrough;

/// AES block size
pub const AES_BLOCK_SIZE: usize = 16;

pub(crate) type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;
pub(crate) type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
pub(crate) type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128-CTR keyed with `key`, counter block `iv` (the low 64 bits count
/// blocks).
pub(crate) fn ctr_cipher(key: &[u8; 16], iv: &[u8; 16]) -> Aes128Ctr {
    Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
}

/// Counter block for an 8-byte CENC IV.
pub(crate) fn counter_block(iv: u64) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(&iv.to_be_bytes());
    block
}

pub(crate) fn cbc_encryptor(key: &[u8; 16], iv: &[u8; 16]) -> Aes128CbcEnc {
    Aes128CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
}

/// Walks the frames of a sequence alongside the bytes handed to an
/// encrypting writer, so the writer knows where each frame ends.
#[derive(Debug, Clone)]
pub(crate) struct FrameTracker<'s> {
    sequence: &'s Sequence,
    cursor: FrameCursor,
}

impl<'s> FrameTracker<'s> {
    pub(crate) fn new(sequence: &'s Sequence) -> Self {
        Self {
            sequence,
            cursor: FrameCursor::default(),
        }
    }

    /// The next frame; running out means the writer got more bytes than
    /// the frames describe.
    pub(crate) fn next_frame(&mut self) -> Result<CursorFrame<'s>> {
        self.cursor
            .advance(self.sequence)
            .ok_or_else(|| Error::bad_data("no more frames"))
    }

    pub(crate) fn peek(&self) -> Option<CursorFrame<'s>> {
        self.cursor.peek(self.sequence)
    }

    pub(crate) fn sequence(&self) -> &'s Sequence {
        self.sequence
    }
}

pub(crate) fn cbc_decryptor(key: &[u8; 16], iv: &[u8; 16]) -> Aes128CbcDec {
    Aes128CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
}
