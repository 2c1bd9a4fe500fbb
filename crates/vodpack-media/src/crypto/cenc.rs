//! CENC (`cenc` scheme) fragment encryption: full-sample AES-CTR with
//! per-sample auxiliary information.
//!
//! Audio frames are encrypted up to the last whole block. Video frames are
//! parsed into length-prefixed NAL units; slices keep their length prefix
//! and NAL header clear and have the rest encrypted, other NAL units stay
//! clear. When every frame is known to hold a single NAL unit the
//! auxiliary information is computed up front; otherwise it is collected
//! while the frames stream through and the fragment header is prepended at
//! the end.

use bytes::Bytes;
use cipher::StreamCipher;
use tracing::{debug, warn};
use vodpack_codec::nal;
use vodpack_common::CodecId;

use super::{counter_block, ctr_cipher, Aes128Ctr, FrameTracker, AES_BLOCK_SIZE};
use crate::dash::{FragmentHeader, FragmentParams};
use crate::error::{Error, Result};
use crate::frame_writer::FrameWriter;
use crate::media::{Sequence, CENC_IV_SIZE};
use crate::mp4::boxes::{AuxBoxes, Saio, Saiz, Senc};
use crate::read_cache::ReadCache;
use crate::source::{Progress, SegmentProcessor};
use crate::write::{DynamicBuffer, SegmentWriter, WriteBuffer};

/// Frames in earlier clips are unknown; assume at most this frame rate
/// when advancing the IV past them.
const MAX_FRAME_RATE: u64 = 60;

/// Size of a record header: IV + subsample count
const RECORD_HEADER_SIZE: usize = CENC_IV_SIZE + 2;

/// Size of one (clear u16, encrypted u32) subsample entry
const SUBSAMPLE_SIZE: usize = 6;

/// Key and first per-sample IV of a sequence.
///
/// The IV continues from the sequence IV seed by the index of the first
/// frame, plus an estimate of the frames in earlier clips.
pub fn initial_iv(sequence: &Sequence) -> Result<([u8; 16], u64)> {
    let drm = sequence.drm()?;
    let track = sequence.first_track()?;
    let seed = drm.iv_seed();

    let mut iv = u64::from_be_bytes([seed[0], seed[1], seed[2], seed[3], seed[4], seed[5], seed[6], seed[7]]);
    iv = iv.wrapping_add(u64::from(track.first_frame_index));
    iv = iv.wrapping_add(track.clip_start_time * MAX_FRAME_RATE / 1000);
    Ok((drm.key, iv))
}

/// Per-sample auxiliary information of one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleAux {
    pub use_subsamples: bool,
    /// Shared record size, 0 when `sizes` differ.
    pub default_size: u8,
    pub sizes: Vec<u8>,
    pub sample_count: u32,
    pub data: Bytes,
}

impl SampleAux {
    fn from_records(data: DynamicBuffer, sizes: Vec<u8>, use_subsamples: bool) -> Self {
        let default_size = match sizes.split_first() {
            Some((first, rest)) if rest.iter().all(|s| s == first) => *first,
            _ => 0,
        };
        Self {
            use_subsamples,
            default_size,
            sample_count: sizes.len() as u32,
            sizes,
            data: data.freeze(),
        }
    }

    /// saiz, saio and senc carrying this information.
    pub fn into_boxes(self) -> AuxBoxes {
        AuxBoxes {
            saiz: Saiz {
                default_size: self.default_size,
                sizes: if self.default_size == 0 { self.sizes } else { Vec::new() },
                sample_count: self.sample_count,
            },
            saio: Saio { offset: 0 },
            senc: Senc {
                sample_count: self.sample_count,
                use_subsamples: self.use_subsamples,
                data: self.data,
            },
        }
    }
}

fn record_size(subsamples: usize) -> Result<u8> {
    u8::try_from(RECORD_HEADER_SIZE + subsamples * SUBSAMPLE_SIZE)
        .map_err(|_| Error::unsupported(format!("{subsamples} subsamples do not fit an auxiliary sample")))
}

/// Subsamples of an audio frame: whole blocks encrypted, the tail clear.
fn audio_subsamples(size: u32) -> Vec<(u16, u32)> {
    let trailer = size % AES_BLOCK_SIZE as u32;
    let encrypted = size - trailer;
    match (encrypted, trailer) {
        (0, 0) => Vec::new(),
        (0, _) => vec![(trailer as u16, 0)],
        (_, 0) => vec![(0, encrypted)],
        _ => vec![(0, encrypted), (trailer as u16, 0)],
    }
}

/// Auxiliary information of an audio sequence.
///
/// Every record carries subsamples, even for frames that are whole blocks.
/// A source stored with full-sample 8-byte IV-only records therefore gets a
/// different `senc` when re-encrypted than when passed through.
pub fn audio_aux(sequence: &Sequence, first_iv: u64) -> Result<SampleAux> {
    let count = sequence.total_frame_count();
    let mut data = DynamicBuffer::with_capacity(count * (RECORD_HEADER_SIZE + 2 * SUBSAMPLE_SIZE));
    let mut sizes = Vec::with_capacity(count);

    for (index, frame) in sequence.frames().enumerate() {
        let subsamples = audio_subsamples(frame.size);
        data.put_slice(&first_iv.wrapping_add(index as u64).to_be_bytes())?;
        data.put_u16(subsamples.len() as u16)?;
        for (clear, encrypted) in &subsamples {
            data.put_u16(*clear)?;
            data.put_u32(*encrypted)?;
        }
        sizes.push(record_size(subsamples.len())?);
    }
    Ok(SampleAux::from_records(data, sizes, true))
}

/// Auxiliary information of a video sequence whose frames each hold a
/// single NAL unit.
pub fn single_nalu_aux(sequence: &Sequence, first_iv: u64) -> Result<SampleAux> {
    let count = sequence.total_frame_count();
    let mut data = DynamicBuffer::with_capacity(count * (RECORD_HEADER_SIZE + SUBSAMPLE_SIZE));
    let mut sizes = Vec::with_capacity(count);

    let mut index = 0u64;
    for track in &sequence.clips {
        let clear = u32::from(track.media_info.video.nal_packet_size_length) + 1;
        for frame in track.frames() {
            data.put_slice(&first_iv.wrapping_add(index).to_be_bytes())?;
            index += 1;
            if frame.size == 0 {
                data.put_u16(0)?;
                sizes.push(record_size(0)?);
                continue;
            }
            if frame.size < clear {
                return Err(Error::bad_data(format!(
                    "frame size {} too small, nalu size {}",
                    frame.size,
                    clear - 1
                )));
            }
            data.put_u16(1)?;
            data.put_u16(clear as u16)?;
            data.put_u32(frame.size - clear)?;
            sizes.push(record_size(1)?);
        }
    }
    Ok(SampleAux::from_records(data, sizes, true))
}

fn write_encrypted<W: SegmentWriter>(out: &mut WriteBuffer<W>, cipher: &mut Aes128Ctr, data: &[u8]) -> Result<()> {
    let buf = out.get_bytes(data.len())?;
    buf.copy_from_slice(data);
    cipher.apply_keystream(buf);
    Ok(())
}

/// Encrypting writer for audio frames.
pub struct CencAudio<'s, W> {
    frames: FrameTracker<'s>,
    key: [u8; 16],
    next_iv: u64,
    cipher: Aes128Ctr,
    frame_left: u32,
    encrypted_left: u32,
    out: WriteBuffer<W>,
}

impl<'s, W: SegmentWriter> CencAudio<'s, W> {
    pub fn new(sequence: &'s Sequence, key: [u8; 16], first_iv: u64, inner: W) -> Self {
        debug!(sequence = sequence.index, first_iv, "cenc audio writer initialized");
        Self {
            frames: FrameTracker::new(sequence),
            key,
            next_iv: first_iv,
            cipher: ctr_cipher(&key, &counter_block(first_iv)),
            frame_left: 0,
            encrypted_left: 0,
            out: WriteBuffer::new(inner),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.out.into_inner()
    }

    fn start_frame(&mut self) -> Result<()> {
        loop {
            let found = self.frames.next_frame()?;
            self.cipher = ctr_cipher(&self.key, &counter_block(self.next_iv));
            self.next_iv = self.next_iv.wrapping_add(1);
            let size = found.frame.size;
            if size > 0 {
                self.frame_left = size;
                self.encrypted_left = size - size % AES_BLOCK_SIZE as u32;
                return Ok(());
            }
        }
    }
}

impl<W: SegmentWriter> SegmentWriter for CencAudio<'_, W> {
    fn write_tail(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.frame_left == 0 {
                self.start_frame()?;
            }

            let chunk = data.len().min(self.frame_left as usize);
            let encrypted = chunk.min(self.encrypted_left as usize);
            write_encrypted(&mut self.out, &mut self.cipher, &data[..encrypted])?;
            self.out.write(&data[encrypted..chunk])?;

            self.encrypted_left -= encrypted as u32;
            self.frame_left -= chunk as u32;
            data = &data[chunk..];
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.frame_left > 0 {
            return Err(Error::bad_data(format!("frame ended {} bytes early", self.frame_left)));
        }
        self.out.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalState {
    PacketSize,
    NalType,
    Data { encrypt: bool },
}

/// Encrypting writer for AVC/HEVC frames.
///
/// In general mode it records one auxiliary record per frame as the NAL
/// units are parsed; [`CencVideoSink::take_aux`] returns them once all
/// frames were written.
pub struct CencVideoSink<'s, W> {
    frames: FrameTracker<'s>,
    key: [u8; 16],
    next_iv: u64,
    cipher: Aes128Ctr,
    out: WriteBuffer<W>,
    single_nalu: bool,
    warned: bool,

    codec: CodecId,
    nal_length_size: usize,
    state: NalState,
    length_prefix: [u8; 4],
    length_bytes_left: usize,
    packet_left: u32,
    frame_left: u32,
    frame_active: bool,

    aux: DynamicBuffer,
    aux_sizes: Vec<u8>,
    record_start: usize,
    subsample_count: usize,
}

impl<'s, W: SegmentWriter> CencVideoSink<'s, W> {
    pub fn new(sequence: &'s Sequence, key: [u8; 16], first_iv: u64, single_nalu: bool, inner: W) -> Self {
        let frame_count = sequence.total_frame_count();
        // usually one nal unit per frame, except a first frame carrying codec info
        let aux_capacity = if single_nalu {
            0
        } else {
            (RECORD_HEADER_SIZE + SUBSAMPLE_SIZE) * frame_count + SUBSAMPLE_SIZE
        };
        debug!(sequence = sequence.index, first_iv, single_nalu, "cenc video writer initialized");

        Self {
            frames: FrameTracker::new(sequence),
            key,
            next_iv: first_iv,
            cipher: ctr_cipher(&key, &counter_block(first_iv)),
            out: WriteBuffer::new(inner),
            single_nalu,
            warned: false,
            codec: CodecId::Avc,
            nal_length_size: 4,
            state: NalState::PacketSize,
            length_prefix: [0; 4],
            length_bytes_left: 0,
            packet_left: 0,
            frame_left: 0,
            frame_active: false,
            aux: DynamicBuffer::with_capacity(aux_capacity),
            aux_sizes: Vec::with_capacity(if single_nalu { 0 } else { frame_count }),
            record_start: 0,
            subsample_count: 0,
        }
    }

    pub fn inner_mut(&mut self) -> &mut W {
        self.out.inner_mut()
    }

    pub fn into_inner(self) -> Result<W> {
        self.out.into_inner()
    }

    /// Auxiliary information collected in general mode.
    pub fn take_aux(&mut self) -> SampleAux {
        let data = std::mem::take(&mut self.aux);
        let sizes = std::mem::take(&mut self.aux_sizes);
        SampleAux::from_records(data, sizes, true)
    }

    fn start_frame(&mut self) -> Result<()> {
        let found = self.frames.next_frame()?;
        let info = &found.track.media_info;
        if !matches!(info.codec, CodecId::Avc | CodecId::Hevc) {
            return Err(Error::bad_request(format!("codec {} is not supported", info.codec)));
        }
        let nal_length_size = usize::from(info.video.nal_packet_size_length);
        if !(1..=4).contains(&nal_length_size) {
            return Err(Error::bad_data(format!("invalid nal packet size length {nal_length_size}")));
        }
        self.codec = info.codec;
        self.nal_length_size = nal_length_size;

        let iv = self.next_iv;
        self.next_iv = self.next_iv.wrapping_add(1);
        self.cipher = ctr_cipher(&self.key, &counter_block(iv));

        if !self.single_nalu {
            self.record_start = self.aux.len();
            self.aux.put_slice(&iv.to_be_bytes())?;
            self.aux.put_u16(0)?; // subsample count, set on frame end
            self.subsample_count = 0;
        }

        let size = found.frame.size;
        if size == 0 {
            return self.end_frame();
        }
        if size as usize <= nal_length_size {
            return Err(Error::bad_data(format!(
                "frame size {size} too small, nalu size {nal_length_size}"
            )));
        }

        self.frame_left = size;
        self.frame_active = true;
        self.state = NalState::PacketSize;
        self.length_bytes_left = nal_length_size;
        self.packet_left = 0;
        Ok(())
    }

    fn end_frame(&mut self) -> Result<()> {
        self.frame_active = false;
        if self.single_nalu {
            return Ok(());
        }
        self.aux.set_u16(self.record_start + CENC_IV_SIZE, self.subsample_count as u16);
        self.aux_sizes.push(record_size(self.subsample_count)?);
        Ok(())
    }

    fn add_subsample(&mut self, clear: u32, encrypted: u32) -> Result<()> {
        if self.single_nalu {
            return Ok(());
        }
        let clear = u16::try_from(clear)
            .map_err(|_| Error::unsupported(format!("clear subsample of {clear} bytes")))?;
        self.aux.put_u16(clear)?;
        self.aux.put_u32(encrypted)?;
        self.subsample_count += 1;
        Ok(())
    }

    fn is_slice(&self, header: u8) -> bool {
        match self.codec {
            CodecId::Hevc => nal::hevc::nal_type(header) < nal::hevc::VPS,
            _ => (nal::avc::SLICE..=nal::avc::IDR_SLICE).contains(&nal::avc::nal_type(header)),
        }
    }

    /// Parse the length prefix once all of its bytes arrived.
    fn packet_started(&mut self) -> Result<()> {
        let prefix = &self.length_prefix[..self.nal_length_size];
        let packet_size = prefix.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        let available = self.frame_left - self.nal_length_size as u32;

        if self.single_nalu {
            if packet_size != available && !self.warned {
                warn!(
                    packet_size,
                    frame_size = available,
                    "frame does not contain a single nalu, consider disabling single_nalu_per_frame"
                );
                self.warned = true;
            }
            self.packet_left = available;
            self.frame_left = 0;
            return Ok(());
        }

        if packet_size == 0 {
            return Err(Error::bad_data("zero size packet"));
        }
        if packet_size > available {
            return Err(Error::bad_data(format!(
                "packet size {packet_size} too big, nalu size {}, frame size {}",
                self.nal_length_size, self.frame_left
            )));
        }

        self.packet_left = packet_size;
        self.frame_left -= self.nal_length_size as u32 + packet_size;
        if self.frame_left > 0 && self.frame_left as usize <= self.nal_length_size {
            return Err(Error::bad_data(format!(
                "frame size left {} too small, nalu size {}",
                self.frame_left, self.nal_length_size
            )));
        }
        Ok(())
    }

    fn packet_done(&mut self) -> Result<()> {
        self.state = NalState::PacketSize;
        self.length_bytes_left = self.nal_length_size;
        if self.frame_left == 0 {
            self.end_frame()?;
        }
        Ok(())
    }

    /// Record zero-size frames at the end and check nothing is missing.
    fn finish_frames(&mut self) -> Result<()> {
        if self.frame_active {
            return Err(Error::bad_data("frame data ended mid-frame"));
        }
        while let Some(found) = self.frames.peek() {
            if found.frame.size > 0 {
                return Err(Error::bad_data("frame data ended before the last frame"));
            }
            self.start_frame()?;
        }
        Ok(())
    }
}

impl<W: SegmentWriter> SegmentWriter for CencVideoSink<'_, W> {
    fn write_tail(&mut self, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            if !self.frame_active {
                self.start_frame()?;
                continue;
            }

            match self.state {
                NalState::PacketSize => {
                    while self.length_bytes_left > 0 && pos < data.len() {
                        let index = self.nal_length_size - self.length_bytes_left;
                        self.length_prefix[index] = data[pos];
                        self.length_bytes_left -= 1;
                        pos += 1;
                    }
                    if self.length_bytes_left > 0 {
                        break;
                    }
                    self.packet_started()?;
                    self.state = NalState::NalType;
                }

                NalState::NalType => {
                    let header = data[pos];
                    pos += 1;

                    let clear = self.out.get_bytes(self.nal_length_size + 1)?;
                    clear[..self.nal_length_size].copy_from_slice(&self.length_prefix[..self.nal_length_size]);
                    clear[self.nal_length_size] = header;
                    self.packet_left -= 1;

                    let encrypt = self.single_nalu || self.is_slice(header);
                    let prefix = self.nal_length_size as u32 + 1;
                    if encrypt {
                        self.add_subsample(prefix, self.packet_left)?;
                    } else {
                        self.add_subsample(prefix + self.packet_left, 0)?;
                    }
                    self.state = NalState::Data { encrypt };
                    if self.packet_left == 0 {
                        self.packet_done()?;
                    }
                }

                NalState::Data { encrypt } => {
                    let chunk = (data.len() - pos).min(self.packet_left as usize);
                    let bytes = &data[pos..pos + chunk];
                    if encrypt {
                        write_encrypted(&mut self.out, &mut self.cipher, bytes)?;
                    } else {
                        self.out.write(bytes)?;
                    }
                    pos += chunk;
                    self.packet_left -= chunk as u32;
                    if self.packet_left == 0 {
                        self.packet_done()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Completes the frame data; the inner writer is flushed by the owner
    /// once any header was prepended.
    fn flush(&mut self) -> Result<()> {
        self.finish_frames()?;
        self.out.flush_block()
    }
}

/// A CENC video fragment whose auxiliary information is only known after
/// the frames were parsed: frames stream into the body, then the fragment
/// header is prepended with `write_head`.
pub struct CencVideo<'s, W> {
    sequence: &'s Sequence,
    params: FragmentParams,
    writer: FrameWriter<'s, CencVideoSink<'s, W>>,
    total_size: Option<u64>,
}

impl<'s, W: SegmentWriter> CencVideo<'s, W> {
    pub fn new(sequence: &'s Sequence, params: FragmentParams, reuse_buffers: bool, inner: W) -> Result<Self> {
        let (key, first_iv) = initial_iv(sequence)?;
        let sink = CencVideoSink::new(sequence, key, first_iv, false, inner);
        Ok(Self {
            sequence,
            params,
            writer: FrameWriter::new(sequence, sink, reuse_buffers),
            total_size: None,
        })
    }

    /// Size of the whole fragment, known once processing is done.
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer.into_writer().into_inner()
    }
}

impl<W: SegmentWriter> SegmentProcessor for CencVideo<'_, W> {
    fn process(&mut self, cache: &mut ReadCache) -> Result<Progress> {
        if self.total_size.is_some() {
            return Ok(Progress::Done);
        }
        if self.writer.process(cache)? == Progress::Pending {
            return Ok(Progress::Pending);
        }

        let sink = self.writer.writer_mut();
        let aux = sink.take_aux();
        let header = FragmentHeader::new(self.sequence, &self.params, Some(aux.into_boxes()), false)?;
        let total_size = header.total_size();
        let bytes = header
            .into_bytes()
            .ok_or_else(|| Error::unexpected("fragment header was not built"))?;

        let inner = sink.inner_mut();
        inner.write_head(&bytes)?;
        inner.flush()?;
        self.total_size = Some(total_size);
        Ok(Progress::Done)
    }
}
