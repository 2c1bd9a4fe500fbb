//! Frame source wrapper that removes CENC protection from source frames.

use tracing::debug;
use vodpack_common::SourceId;

use super::{ctr_cipher, Aes128Ctr};
use crate::error::{Error, Result};
use crate::media::{Frame, SampleProtection};
use crate::read_cache::{ReadCache, ReadHint};
use crate::source::{FrameSource, SourceRead};
use cipher::StreamCipher;

/// Reads the per-sample records of a `senc` payload.
#[derive(Debug, Clone)]
struct AuxReader {
    data: bytes::Bytes,
    pos: usize,
}

impl AuxReader {
    fn take(&mut self, len: usize, what: &str) -> Result<&[u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(Error::bad_data(format!("failed to get {what} from auxiliary info")));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Decrypts the frames of a protected part as they are read.
///
/// Each frame consumes one auxiliary record: the IV, and when subsamples are
/// in use, the clear/encrypted ranges of the frame.
pub struct CencDecryptSource {
    inner: Box<dyn FrameSource>,
    key: [u8; 16],
    iv_size: usize,
    use_subsamples: bool,
    aux: AuxReader,
    cipher: Option<Aes128Ctr>,
    subsamples_left: u16,
    clear_left: u32,
    encrypted_left: u32,
    output: Vec<u8>,
}

impl CencDecryptSource {
    pub fn new(inner: Box<dyn FrameSource>, protection: &SampleProtection) -> Result<Self> {
        let iv_size = usize::from(protection.iv_size);
        if iv_size != 8 && iv_size != 16 {
            return Err(Error::bad_data(format!("unsupported per-sample iv size {iv_size}")));
        }
        debug!(
            iv_size,
            use_subsamples = protection.use_subsamples,
            aux_len = protection.aux_info.len(),
            "cenc decryptor initialized"
        );
        Ok(Self {
            inner,
            key: protection.key,
            iv_size,
            use_subsamples: protection.use_subsamples,
            aux: AuxReader {
                data: protection.aux_info.clone(),
                pos: 0,
            },
            cipher: None,
            subsamples_left: 0,
            clear_left: 0,
            encrypted_left: 0,
            output: Vec::new(),
        })
    }

    /// Key the frames are decrypted with.
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// The wrapped ciphertext source.
    pub fn into_inner(self) -> Box<dyn FrameSource> {
        self.inner
    }

    fn next_subsample(&mut self) -> Result<()> {
        if self.subsamples_left == 0 {
            return Err(Error::bad_data("exhausted subsample bytes"));
        }
        self.clear_left = u32::from(self.aux.u16("subsample info")?);
        self.encrypted_left = self.aux.u32("subsample info")?;
        self.subsamples_left -= 1;
        Ok(())
    }

    fn decrypt_in_place(&mut self) -> Result<()> {
        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| Error::unexpected("decrypt without a started frame"))?;

        let mut pos = 0;
        while pos < self.output.len() {
            if self.clear_left == 0 && self.encrypted_left == 0 {
                if self.subsamples_left == 0 {
                    return Err(Error::bad_data("exhausted subsample bytes"));
                }
                self.clear_left = u32::from(self.aux.u16("subsample info")?);
                self.encrypted_left = self.aux.u32("subsample info")?;
                self.subsamples_left -= 1;
            }

            let left = self.output.len() - pos;
            let clear = (self.clear_left as usize).min(left);
            pos += clear;
            self.clear_left -= clear as u32;

            let encrypted = (self.encrypted_left as usize).min(self.output.len() - pos);
            cipher.apply_keystream(&mut self.output[pos..pos + encrypted]);
            pos += encrypted;
            self.encrypted_left -= encrypted as u32;
        }
        Ok(())
    }
}

impl FrameSource for CencDecryptSource {
    fn start_frame(&mut self, frame: &Frame, hint: Option<ReadHint>) -> Result<()> {
        self.inner.start_frame(frame, hint)?;

        let mut iv = [0u8; 16];
        iv[..self.iv_size].copy_from_slice(self.aux.take(self.iv_size, "iv")?);
        self.cipher = Some(ctr_cipher(&self.key, &iv));

        if !self.use_subsamples {
            self.subsamples_left = 0;
            self.clear_left = 0;
            self.encrypted_left = u32::MAX;
            return Ok(());
        }

        self.subsamples_left = self.aux.u16("subsample count")?;
        if self.subsamples_left == 0 {
            return Err(Error::bad_data("invalid subsample count"));
        }
        self.next_subsample()
    }

    fn read<'a>(&'a mut self, cache: &'a mut ReadCache) -> Result<SourceRead<'a>> {
        let frame_done = match self.inner.read(cache)? {
            SourceRead::Pending => return Ok(SourceRead::Pending),
            SourceRead::Data { data, frame_done } => {
                self.output.clear();
                self.output.extend_from_slice(data);
                frame_done
            }
        };

        self.decrypt_in_place()?;
        Ok(SourceRead::Data {
            data: &self.output,
            frame_done,
        })
    }

    fn source_id(&self) -> Option<SourceId> {
        self.inner.source_id()
    }

    fn pending_offset(&self) -> Option<u64> {
        self.inner.pending_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::frame;
    use crate::source::MemorySource;
    use assert_matches::assert_matches;
    use bytes::{BufMut, Bytes, BytesMut};

    const KEY: [u8; 16] = [0x11; 16];

    fn protection(use_subsamples: bool, aux_info: Bytes) -> SampleProtection {
        SampleProtection {
            key: KEY,
            iv_size: 8,
            use_subsamples,
            default_aux_size: 0,
            aux_sizes: Vec::new(),
            aux_info,
        }
    }

    fn encrypt(iv: [u8; 8], data: &mut [u8]) {
        let mut full = [0u8; 16];
        full[..8].copy_from_slice(&iv);
        ctr_cipher(&KEY, &full).apply_keystream(data);
    }

    fn read_all(source: &mut CencDecryptSource, frame: &Frame) -> Result<Vec<u8>> {
        let mut cache = ReadCache::new(64, 1)?;
        source.start_frame(frame, None)?;
        match source.read(&mut cache)? {
            SourceRead::Data { data, .. } => Ok(data.to_vec()),
            SourceRead::Pending => panic!("memory sources never block"),
        }
    }

    #[test]
    fn test_full_sample_decrypt() {
        let plain: Vec<u8> = (0..40u8).collect();
        let mut cipher_text = plain.clone();
        encrypt([7; 8], &mut cipher_text);

        let inner = Box::new(MemorySource::new(Bytes::from(cipher_text)));
        let mut source = CencDecryptSource::new(inner, &protection(false, Bytes::from_static(&[7; 8]))).unwrap();
        assert_eq!(read_all(&mut source, &frame(0, 40, 1)).unwrap(), plain);
    }

    #[test]
    fn test_subsample_decrypt() {
        let plain: Vec<u8> = (0..30u8).collect();
        let mut cipher_text = plain.clone();
        // 5 clear, 10 encrypted, 3 clear, 12 encrypted
        let mut stream = Vec::new();
        stream.extend_from_slice(&cipher_text[5..15]);
        stream.extend_from_slice(&cipher_text[18..30]);
        encrypt([1; 8], &mut stream);
        cipher_text[5..15].copy_from_slice(&stream[..10]);
        cipher_text[18..30].copy_from_slice(&stream[10..]);

        let mut aux = BytesMut::new();
        aux.put_slice(&[1; 8]);
        aux.put_u16(2);
        aux.put_u16(5);
        aux.put_u32(10);
        aux.put_u16(3);
        aux.put_u32(12);

        let inner = Box::new(MemorySource::new(Bytes::from(cipher_text)));
        let mut source = CencDecryptSource::new(inner, &protection(true, aux.freeze())).unwrap();
        assert_eq!(read_all(&mut source, &frame(0, 30, 1)).unwrap(), plain);
    }

    #[test]
    fn test_exhausted_subsamples() {
        let mut aux = BytesMut::new();
        aux.put_slice(&[0; 8]);
        aux.put_u16(1);
        aux.put_u16(2);
        aux.put_u32(2);

        let inner = Box::new(MemorySource::new(Bytes::from_static(&[0; 10])));
        let mut source = CencDecryptSource::new(inner, &protection(true, aux.freeze())).unwrap();
        assert_matches!(read_all(&mut source, &frame(0, 10, 1)), Err(Error::BadData(_)));
    }

    #[test]
    fn test_aux_info_overflow() {
        let inner = Box::new(MemorySource::new(Bytes::from_static(&[0; 10])));
        let mut source = CencDecryptSource::new(inner, &protection(false, Bytes::from_static(&[0; 4]))).unwrap();
        assert_matches!(source.start_frame(&frame(0, 10, 1), None), Err(Error::BadData(_)));
    }

    #[test]
    fn test_zero_subsample_count_rejected() {
        let mut aux = BytesMut::new();
        aux.put_slice(&[0; 8]);
        aux.put_u16(0);
        aux.put_bytes(0, 6);

        let inner = Box::new(MemorySource::new(Bytes::from_static(&[0; 10])));
        let mut source = CencDecryptSource::new(inner, &protection(true, aux.freeze())).unwrap();
        assert_matches!(source.start_frame(&frame(0, 10, 1), None), Err(Error::BadData(_)));
    }
}
