//! Packaging data model: frames, frame parts, tracks and sequences.
//!
//! Everything here is produced by an upstream parser and only read while
//! packaging.

use bytes::Bytes;
#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};
use vodpack_common::{CodecId, MediaType, SourceId};

use crate::error::{Error, Result};

/// Size of a CENC per-sample IV
pub const CENC_IV_SIZE: usize = 8;

/// One compressed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Frame {
    /// Byte offset in the part's source.
    pub offset: u64,
    pub size: u32,
    /// Duration in track timescale units.
    pub duration: u32,
    /// Presentation time minus decode time.
    #[cfg_attr(feature = "serialize", serde(default))]
    pub pts_delay: u32,
    #[cfg_attr(feature = "serialize", serde(default))]
    pub key_frame: bool,
}

/// Where the bytes of a frame part come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// A file, read through the read cache.
    File(SourceId),
    /// Generated data held in memory; frame offsets index into it.
    Memory(Bytes),
}

/// CENC protection of the frames of one part, as found in the source file.
///
/// `aux_info` holds the raw `senc` sample records: an IV followed, when
/// `use_subsamples` is set, by a subsample count and `(clear u16,
/// encrypted u32)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleProtection {
    pub key: [u8; 16],
    pub iv_size: u8,
    pub use_subsamples: bool,
    /// `saiz` default sample info size, 0 when sizes vary.
    pub default_aux_size: u8,
    /// Per-sample info sizes when `default_aux_size` is 0.
    pub aux_sizes: Vec<u8>,
    pub aux_info: Bytes,
}

/// Video specific media info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct VideoInfo {
    pub width: u16,
    pub height: u16,
    /// Width of the NAL unit length prefix (1-4).
    #[cfg_attr(feature = "serialize", serde(default))]
    pub nal_packet_size_length: u8,
    /// Decoder delay of the first frame, in timescale units.
    #[cfg_attr(feature = "serialize", serde(default))]
    pub initial_pts_delay: u32,
}

/// Audio specific media info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct AudioInfo {
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
    /// MPEG-4 object type indication for `esds`.
    #[cfg_attr(feature = "serialize", serde(default = "default_object_type_id"))]
    pub object_type_id: u8,
}

#[cfg(feature = "serialize")]
fn default_object_type_id() -> u8 {
    0x40
}

/// Stream description shared by every frame of a track.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct MediaInfo {
    pub media_type: MediaType,
    pub codec: CodecId,
    pub track_id: u32,
    pub timescale: u32,
    /// Duration in timescale units.
    pub duration: u64,
    #[cfg_attr(feature = "serialize", serde(default))]
    pub duration_millis: u64,
    /// Codec delay in nanoseconds (Opus pre-skip).
    #[cfg_attr(feature = "serialize", serde(default))]
    pub codec_delay: u64,
    /// Decoder configuration record (`avcC`, `hvcC`, AudioSpecificConfig, ...).
    #[cfg_attr(feature = "serialize", serde(default, with = "hex::serde"))]
    pub extra_data: Vec<u8>,
    #[cfg_attr(feature = "serialize", serde(default))]
    pub bitrate: u32,
    #[cfg_attr(feature = "serialize", serde(default))]
    pub video: VideoInfo,
    #[cfg_attr(feature = "serialize", serde(default))]
    pub audio: AudioInfo,
}

/// A run of frames sharing one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePart {
    pub source: SourceRef,
    pub frames: Vec<Frame>,
    pub protection: Option<SampleProtection>,
}

impl FramePart {
    pub fn new(source: SourceRef, frames: Vec<Frame>) -> Self {
        Self {
            source,
            frames,
            protection: None,
        }
    }

    pub fn with_protection(mut self, protection: SampleProtection) -> Self {
        self.protection = Some(protection);
        self
    }

    /// Offset just past the last frame, the furthest a read has to go.
    pub fn end_offset(&self) -> u64 {
        self.frames
            .iter()
            .map(|f| f.offset + u64::from(f.size))
            .max()
            .unwrap_or(0)
    }
}

/// One elementary stream of one clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub media_info: MediaInfo,
    /// Frame parts in playback order; spliced clips chain several parts.
    pub parts: Vec<FramePart>,
    /// Index of the first frame within the whole source track.
    pub first_frame_index: u32,
    /// Decode time of the first frame, in timescale units.
    pub first_frame_time_offset: u64,
    /// Clip start within the sequence, in milliseconds.
    pub clip_start_time: u64,
    /// Offset added to decode times when clips are concatenated, in
    /// timescale units.
    pub clip_sequence_offset: u64,
}

impl Track {
    pub fn new(media_info: MediaInfo, parts: Vec<FramePart>) -> Self {
        Self {
            media_info,
            parts,
            first_frame_index: 0,
            first_frame_time_offset: 0,
            clip_start_time: 0,
            clip_sequence_offset: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.parts.iter().map(|p| p.frames.len()).sum()
    }

    pub fn total_frame_size(&self) -> u64 {
        self.frames().map(|f| u64::from(f.size)).sum()
    }

    pub fn total_duration(&self) -> u64 {
        self.frames().map(|f| u64::from(f.duration)).sum()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.parts.iter().flat_map(|p| p.frames.iter())
    }

    pub fn first_frame(&self) -> Option<&Frame> {
        self.frames().next()
    }

    /// Presentation time of the first frame, in timescale units.
    ///
    /// With `discontinuity` set every clip restarts its own timeline, so the
    /// clip sequence offset is left out.
    pub fn earliest_pres_time(&self, discontinuity: bool) -> u64 {
        let mut result = self.first_frame_time_offset;
        if !discontinuity {
            result += self.clip_sequence_offset;
        }
        if let Some(frame) = self.first_frame() {
            result += u64::from(frame.pts_delay);
        }
        result
    }
}

/// Convert `time` from one timescale to another, rounding to nearest.
pub fn rescale_time(time: u64, from: u32, to: u32) -> u64 {
    let from = u128::from(from.max(1));
    ((u128::from(time) * u128::from(to) + from / 2) / from) as u64
}

/// DRM material of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrmInfo {
    pub key: [u8; 16],
    pub key_id: [u8; 16],
    /// IV seed; derived from the key id when absent.
    pub iv: Option<[u8; 16]>,
}

impl DrmInfo {
    /// The IV seed, falling back to the key id.
    pub fn iv_seed(&self) -> [u8; 16] {
        self.iv.unwrap_or(self.key_id)
    }
}

/// One output track: the same logical track across spliced clips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub index: u32,
    pub clips: Vec<Track>,
    pub drm: Option<DrmInfo>,
}

impl Sequence {
    pub fn new(index: u32, clips: Vec<Track>) -> Self {
        Self {
            index,
            clips,
            drm: None,
        }
    }

    pub fn with_drm(mut self, drm: DrmInfo) -> Self {
        self.drm = Some(drm);
        self
    }

    /// First clip, whose media info describes the sequence.
    pub fn first_track(&self) -> Result<&Track> {
        self.clips
            .first()
            .ok_or_else(|| Error::bad_request(format!("sequence {} has no clips", self.index)))
    }

    pub fn media_type(&self) -> Option<MediaType> {
        self.clips.first().map(|t| t.media_info.media_type)
    }

    pub fn total_frame_count(&self) -> usize {
        self.clips.iter().map(Track::frame_count).sum()
    }

    pub fn total_frame_size(&self) -> u64 {
        self.clips.iter().map(Track::total_frame_size).sum()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.clips.iter().flat_map(Track::frames)
    }

    pub fn drm(&self) -> Result<&DrmInfo> {
        self.drm
            .as_ref()
            .ok_or_else(|| Error::bad_request(format!("sequence {} has no drm info", self.index)))
    }
}

/// Position of the next frame in a sequence: clip, part, frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCursor {
    pub clip: usize,
    pub part: usize,
    pub frame: usize,
}

/// A frame located by a cursor, with the part it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct CursorFrame<'a> {
    pub frame: &'a Frame,
    pub part: &'a FramePart,
    pub track: &'a Track,
    /// The frame is the first of its part.
    pub part_start: bool,
    /// The frame is the first of its clip.
    pub clip_start: bool,
}

impl FrameCursor {
    /// Skip empty parts and clips so the cursor points at a frame, or past
    /// the end.
    fn settle(&mut self, sequence: &Sequence) {
        while let Some(track) = sequence.clips.get(self.clip) {
            match track.parts.get(self.part) {
                Some(part) if self.frame < part.frames.len() => return,
                Some(_) => {
                    self.part += 1;
                    self.frame = 0;
                }
                None => {
                    self.clip += 1;
                    self.part = 0;
                    self.frame = 0;
                }
            }
        }
    }

    /// Frame under the cursor, without moving it.
    pub fn peek<'a>(&self, sequence: &'a Sequence) -> Option<CursorFrame<'a>> {
        let mut pos = *self;
        pos.settle(sequence);
        let track = sequence.clips.get(pos.clip)?;
        let part = track.parts.get(pos.part)?;
        let frame = part.frames.get(pos.frame)?;
        Some(CursorFrame {
            frame,
            part,
            track,
            part_start: pos.frame == 0,
            clip_start: pos.frame == 0 && track.parts[..pos.part].iter().all(|p| p.frames.is_empty()),
        })
    }

    /// Return the frame under the cursor and advance past it.
    pub fn advance<'a>(&mut self, sequence: &'a Sequence) -> Option<CursorFrame<'a>> {
        self.settle(sequence);
        let found = self.peek(sequence)?;
        self.frame += 1;
        Some(found)
    }

    pub fn is_done(&self, sequence: &Sequence) -> bool {
        self.peek(sequence).is_none()
    }
}
