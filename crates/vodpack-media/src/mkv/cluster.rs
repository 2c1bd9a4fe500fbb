//! WebM media segment: one Cluster holding a SimpleBlock per frame.

use bytes::{BufMut, BytesMut};
use cipher::StreamCipher;
use tracing::debug;
use vodpack_common::MediaType;

use super::ebml::{self, Uint};
use crate::crypto::{counter_block, ctr_cipher, Aes128Ctr, FrameTracker};
use crate::error::{Error, Result};
use crate::frame_writer::FrameWriter;
use crate::layout::{Emitter, Layout, Measured};
use crate::media::{rescale_time, Sequence};
use crate::read_cache::ReadCache;
use crate::source::{Progress, SegmentProcessor};
use crate::write::{SegmentWriter, WriteBuffer};

/// Block timecodes are milliseconds
const TIMESCALE: u32 = 1000;

/// track number (1) + timecode (2) + flags (1)
const FRAME_HEADER_SIZE_CLEAR: usize = 4;
/// clear header + signal byte
const FRAME_HEADER_SIZE_CLEAR_LEAD: usize = 5;
/// clear lead header + IV
const FRAME_HEADER_SIZE_ENCRYPTED: usize = 13;

const SIGNAL_CLEAR: u8 = 0x00;
const SIGNAL_ENCRYPTED: u8 = 0x01;
const FLAG_KEY_FRAME: u8 = 0x80;

/// Block encryption of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEncryption {
    Clear,
    /// Clear frames of an encrypted track.
    ClearLead,
    /// AES-CTR per frame; the 8-byte IV is carried in the block.
    Encrypted { key: [u8; 16], iv: u64 },
}

impl BlockEncryption {
    pub fn frame_header_size(&self) -> usize {
        match self {
            Self::Clear => FRAME_HEADER_SIZE_CLEAR,
            Self::ClearLead => FRAME_HEADER_SIZE_CLEAR_LEAD,
            Self::Encrypted { .. } => FRAME_HEADER_SIZE_ENCRYPTED,
        }
    }
}

/// Bytes of the SimpleBlock element of a frame, minus the frame data.
fn block_overhead(frame_size: u32, frame_header_size: usize) -> usize {
    let data_size = frame_header_size + frame_size as usize;
    1 + ebml::num_size(data_size as u64) + frame_header_size
}

struct ClusterStart {
    cluster_size: u64,
    timecode: u64,
}

impl Layout for ClusterStart {
    fn size(&self) -> usize {
        ebml::id_size(ebml::ID_CLUSTER) + ebml::num_size(self.cluster_size) + self.timecode().size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        ebml::put_id(out, ebml::ID_CLUSTER);
        ebml::put_num(out, self.cluster_size, 0);
        self.timecode().write(out);
    }
}

impl ClusterStart {
    fn timecode(&self) -> Uint {
        Uint {
            id: ebml::ID_CLUSTER_TIMECODE,
            value: self.timecode,
        }
    }
}

/// Cluster id, size and timecode; the blocks follow from [`ClusterWriter`].
#[derive(Debug)]
pub struct ClusterHeader {
    bytes: Option<BytesMut>,
    total_size: u64,
    timecode: u64,
}

impl ClusterHeader {
    pub fn new(sequence: &Sequence, encryption: &BlockEncryption, size_only: bool) -> Result<Self> {
        let frame_header_size = encryption.frame_header_size();
        let block_overheads: usize = sequence
            .frames()
            .map(|f| block_overhead(f.size, frame_header_size))
            .sum();

        let first = sequence.first_track()?;
        let first_pts_delay = first.first_frame().map_or(0, |f| u64::from(f.pts_delay));
        let timecode = rescale_time(
            first.first_frame_time_offset + first_pts_delay,
            first.media_info.timescale,
            TIMESCALE,
        ) + first.clip_start_time;

        let timecode_size = Uint {
            id: ebml::ID_CLUSTER_TIMECODE,
            value: timecode,
        }
        .size();
        let cluster_size = (timecode_size + block_overheads) as u64 + sequence.total_frame_size();

        let layout = Measured::new(ClusterStart { cluster_size, timecode });
        let total_size = layout.size() as u64 + cluster_size - timecode_size as u64;

        debug!(
            sequence = sequence.index,
            timecode,
            total_size,
            frame_header_size,
            "cluster header built"
        );

        let bytes = if size_only { None } else { Some(layout.emit()?) };
        Ok(Self {
            bytes,
            total_size,
            timecode,
        })
    }

    /// Size of the whole cluster.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn timecode(&self) -> u64 {
        self.timecode
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn into_bytes(self) -> Option<BytesMut> {
        self.bytes
    }
}

/// Segment writer that prefixes every frame with its SimpleBlock header
/// and encrypts frame data when requested.
pub struct BlockWriter<'s, W> {
    frames: FrameTracker<'s>,
    encryption: BlockEncryption,
    cipher: Option<Aes128Ctr>,
    next_iv: u64,
    out: WriteBuffer<W>,
    frame_left: u32,
    relative_dts: u64,
}

impl<'s, W: SegmentWriter> BlockWriter<'s, W> {
    pub fn new(sequence: &'s Sequence, encryption: BlockEncryption, inner: W) -> Self {
        let next_iv = match encryption {
            BlockEncryption::Encrypted { iv, .. } => iv,
            _ => 0,
        };
        Self {
            frames: FrameTracker::new(sequence),
            encryption,
            cipher: None,
            next_iv,
            out: WriteBuffer::new(inner),
            frame_left: 0,
            relative_dts: 0,
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.out.into_inner()
    }

    /// Write the header of the next frame.
    fn start_frame(&mut self) -> Result<u32> {
        let found = self.frames.next_frame()?;
        let frame = found.frame;
        let info = &found.track.media_info;

        let frame_header_size = self.encryption.frame_header_size();
        let data_size = frame_header_size + frame.size as usize;
        let relative_pts = self.relative_dts + u64::from(frame.pts_delay);
        let timecode = rescale_time(relative_pts, info.timescale, TIMESCALE) as u16;
        let key_frame = frame.key_frame || info.media_type == MediaType::Audio;
        self.relative_dts += u64::from(frame.duration);

        let header_len = block_overhead(frame.size, frame_header_size);
        let mut header = BytesMut::with_capacity(header_len);
        header.put_u8(ebml::ID_SIMPLE_BLOCK as u8);
        let size_len = ebml::num_size(data_size as u64);
        let marked = data_size as u64 | 1u64.checked_shl(7 * size_len as u32).unwrap_or(0);
        header.put_slice(&marked.to_be_bytes()[8 - size_len..]);
        header.put_u8(0x81); // track number 1
        header.put_u16(timecode);
        header.put_u8(if key_frame { FLAG_KEY_FRAME } else { 0 });

        match self.encryption {
            BlockEncryption::Clear => {}
            BlockEncryption::ClearLead => header.put_u8(SIGNAL_CLEAR),
            BlockEncryption::Encrypted { key, .. } => {
                header.put_u8(SIGNAL_ENCRYPTED);
                header.put_u64(self.next_iv);
                self.cipher = Some(ctr_cipher(&key, &counter_block(self.next_iv)));
                self.next_iv = self.next_iv.wrapping_add(1);
            }
        }

        if header.len() != header_len {
            return Err(Error::unexpected(format!(
                "block header length {} different than expected {header_len}",
                header.len()
            )));
        }
        self.out.write(&header)?;
        Ok(frame.size)
    }

    /// Start frames until one with data; empty frames get only a header.
    fn start_nonempty_frame(&mut self) -> Result<()> {
        loop {
            let size = self.start_frame()?;
            if size > 0 {
                self.frame_left = size;
                return Ok(());
            }
        }
    }
}

impl<W: SegmentWriter> SegmentWriter for BlockWriter<'_, W> {
    fn write_tail(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.frame_left == 0 {
                self.start_nonempty_frame()?;
            }

            let chunk = data.len().min(self.frame_left as usize);
            match self.cipher.as_mut() {
                Some(cipher) => {
                    let buf = self.out.get_bytes(chunk)?;
                    buf.copy_from_slice(&data[..chunk]);
                    cipher.apply_keystream(buf);
                }
                None => self.out.write(&data[..chunk])?,
            }

            self.frame_left -= chunk as u32;
            data = &data[chunk..];
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.frame_left > 0 {
            return Err(Error::bad_data(format!("frame ended {} bytes early", self.frame_left)));
        }
        // trailing empty frames
        while self.frames.peek().is_some() {
            if self.start_frame()? > 0 {
                return Err(Error::bad_data("cluster ended before its frames"));
            }
        }
        self.out.flush()
    }
}

/// Resumable writer of the blocks of a cluster.
pub struct ClusterWriter<'s, W> {
    inner: FrameWriter<'s, BlockWriter<'s, W>>,
}

impl<'s, W: SegmentWriter> ClusterWriter<'s, W> {
    pub fn new(sequence: &'s Sequence, encryption: BlockEncryption, writer: W, reuse_buffers: bool) -> Self {
        debug!(
            sequence = sequence.index,
            encrypted = matches!(encryption, BlockEncryption::Encrypted { .. }),
            "cluster writer initialized"
        );
        let blocks = BlockWriter::new(sequence, encryption, writer);
        Self {
            inner: FrameWriter::new(sequence, blocks, reuse_buffers),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.inner.into_writer().into_inner()
    }
}

impl<W: SegmentWriter> SegmentProcessor for ClusterWriter<'_, W> {
    fn process(&mut self, cache: &mut ReadCache) -> Result<Progress> {
        self.inner.process(cache)
    }
}
