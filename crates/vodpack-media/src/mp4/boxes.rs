//! Fragment-level ISOBMFF boxes.
//!
//! Each box is a [`Layout`]: `size()` is computed from the same fields
//! `write()` emits, so a parent can allocate its whole output up front.

use bytes::{BufMut, Bytes};
use vodpack_common::MediaType;

use crate::layout::{Emitter, Layout};
use crate::media::Frame;

/// Size of a plain box header
pub const ATOM_HEADER_SIZE: usize = 8;

/// Size of a full box header (header + version/flags)
pub const FULL_ATOM_HEADER_SIZE: usize = 12;

/// trun flags: data offset, duration, size, flags, composition offset
pub const TRUN_VIDEO_FLAGS: u32 = 0xF01;

/// trun flags: data offset, duration, size
pub const TRUN_AUDIO_FLAGS: u32 = 0x301;

const TRUN_HEADER_SIZE: usize = FULL_ATOM_HEADER_SIZE + 8;
const TRUN_VIDEO_ENTRY_SIZE: usize = 16;
const TRUN_AUDIO_ENTRY_SIZE: usize = 8;

/// Movie fragment header.
#[derive(Debug, Clone, Copy)]
pub struct Mfhd {
    pub sequence_number: u32,
}

impl Layout for Mfhd {
    fn size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + 4
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_full_atom_header(self.size(), b"mfhd", 0, 0);
        out.put_u32(self.sequence_number);
    }
}

/// Track fragment header, always default-base-is-moof.
#[derive(Debug, Clone, Copy)]
pub struct Tfhd {
    pub track_id: u32,
    /// Written only when non-zero.
    pub sample_description_index: u32,
}

impl Layout for Tfhd {
    fn size(&self) -> usize {
        let mut size = FULL_ATOM_HEADER_SIZE + 4;
        if self.sample_description_index > 0 {
            size += 4;
        }
        size
    }

    fn write(&self, out: &mut Emitter<'_>) {
        let mut flags = 0x020000; // default-base-is-moof
        if self.sample_description_index > 0 {
            flags |= 0x02; // sample-description-index-present
        }
        out.put_full_atom_header(self.size(), b"tfhd", 0, flags);
        out.put_u32(self.track_id);
        if self.sample_description_index > 0 {
            out.put_u32(self.sample_description_index);
        }
    }
}

/// Track fragment decode time; version 1 once the time needs 64 bits.
#[derive(Debug, Clone, Copy)]
pub struct Tfdt {
    pub decode_time: u64,
}

impl Tfdt {
    fn is_64bit(&self) -> bool {
        self.decode_time > u64::from(u32::MAX)
    }
}

impl Layout for Tfdt {
    fn size(&self) -> usize {
        if self.is_64bit() {
            FULL_ATOM_HEADER_SIZE + 8
        } else {
            FULL_ATOM_HEADER_SIZE + 4
        }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        if self.is_64bit() {
            out.put_full_atom_header(self.size(), b"tfdt", 1, 0);
            out.put_u64(self.decode_time);
        } else {
            out.put_full_atom_header(self.size(), b"tfdt", 0, 0);
            out.put_u32(self.decode_time as u32);
        }
    }
}

/// Track fragment decode time, always version 1.
#[derive(Debug, Clone, Copy)]
pub struct Tfdt64 {
    pub decode_time: u64,
}

impl Layout for Tfdt64 {
    fn size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + 8
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_full_atom_header(self.size(), b"tfdt", 1, 0);
        out.put_u64(self.decode_time);
    }
}

/// Decode time box of a traf, sized by value or forced to 64 bits.
#[derive(Debug, Clone, Copy)]
pub enum DecodeTime {
    Auto(Tfdt),
    Wide(Tfdt64),
}

impl Layout for DecodeTime {
    fn size(&self) -> usize {
        match self {
            Self::Auto(tfdt) => tfdt.size(),
            Self::Wide(tfdt) => tfdt.size(),
        }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        match self {
            Self::Auto(tfdt) => tfdt.write(out),
            Self::Wide(tfdt) => tfdt.write(out),
        }
    }
}

/// Sample flag convention of a trun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFlags {
    /// Single-track fragments: version 0, sync samples carry no flags.
    Fragment,
    /// Muxed fragments: version 1, explicit I-frame / non-sync flags and
    /// composition offsets relative to the initial decoder delay.
    Muxed,
}

/// One trun sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunEntry {
    pub duration: u32,
    pub size: u32,
    pub key_frame: bool,
    pub composition_offset: i32,
}

impl TrunEntry {
    pub fn from_frame(frame: &Frame, initial_pts_delay: u32) -> Self {
        Self {
            duration: frame.duration,
            size: frame.size,
            key_frame: frame.key_frame,
            composition_offset: frame.pts_delay.wrapping_sub(initial_pts_delay) as i32,
        }
    }
}

/// Track run.
#[derive(Debug, Clone)]
pub struct Trun {
    pub media_type: MediaType,
    pub flags: SampleFlags,
    /// Offset of the first sample, relative to the start of the moof.
    pub data_offset: u32,
    pub entries: Vec<TrunEntry>,
}

impl Trun {
    /// Size of a trun with `frame_count` samples.
    pub fn size_for(media_type: MediaType, frame_count: usize) -> usize {
        let entry = match media_type {
            MediaType::Video => TRUN_VIDEO_ENTRY_SIZE,
            _ => TRUN_AUDIO_ENTRY_SIZE,
        };
        TRUN_HEADER_SIZE + frame_count * entry
    }
}

impl Layout for Trun {
    fn size(&self) -> usize {
        Self::size_for(self.media_type, self.entries.len())
    }

    fn write(&self, out: &mut Emitter<'_>) {
        let video = self.media_type == MediaType::Video;
        if video {
            let version = match self.flags {
                SampleFlags::Fragment => 0,
                SampleFlags::Muxed => 1,
            };
            out.put_full_atom_header(self.size(), b"trun", version, TRUN_VIDEO_FLAGS);
        } else {
            out.put_full_atom_header(self.size(), b"trun", 0, TRUN_AUDIO_FLAGS);
        }
        out.put_u32(self.entries.len() as u32);
        out.put_u32(self.data_offset);

        for entry in &self.entries {
            out.put_u32(entry.duration);
            out.put_u32(entry.size);
            if !video {
                continue;
            }
            let sample_flags = match (self.flags, entry.key_frame) {
                (SampleFlags::Fragment, true) => 0,
                (SampleFlags::Fragment, false) => 0x0001_0000,
                (SampleFlags::Muxed, true) => 0x0200_0000, // I-frame
                (SampleFlags::Muxed, false) => 0x0101_0000, // not I-frame + non key sample
            };
            out.put_u32(sample_flags);
            out.put_i32(entry.composition_offset);
        }
    }
}

/// Sample auxiliary information sizes.
#[derive(Debug, Clone)]
pub struct Saiz {
    /// 0 when `sizes` lists every sample.
    pub default_size: u8,
    pub sizes: Vec<u8>,
    pub sample_count: u32,
}

impl Layout for Saiz {
    fn size(&self) -> usize {
        let mut size = FULL_ATOM_HEADER_SIZE + 1 + 4;
        if self.default_size == 0 {
            size += self.sizes.len();
        }
        size
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_full_atom_header(self.size(), b"saiz", 0, 0);
        out.put_u8(self.default_size);
        out.put_u32(self.sample_count);
        if self.default_size == 0 {
            out.put_slice(&self.sizes);
        }
    }
}

/// Sample auxiliary information offset, a single entry relative to the moof.
#[derive(Debug, Clone, Copy)]
pub struct Saio {
    pub offset: u32,
}

impl Layout for Saio {
    fn size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + 4 + 4
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_full_atom_header(self.size(), b"saio", 0, 0);
        out.put_u32(1); // entry count
        out.put_u32(self.offset);
    }
}

/// Sample encryption box; `data` holds the concatenated sample records.
#[derive(Debug, Clone)]
pub struct Senc {
    pub sample_count: u32,
    pub use_subsamples: bool,
    pub data: Bytes,
}

impl Senc {
    /// Offset of the sample records from the start of the box.
    pub const DATA_OFFSET: usize = FULL_ATOM_HEADER_SIZE + 4;
}

impl Layout for Senc {
    fn size(&self) -> usize {
        Self::DATA_OFFSET + self.data.len()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        let flags = if self.use_subsamples { 0x02 } else { 0 };
        out.put_full_atom_header(self.size(), b"senc", 0, flags);
        out.put_u32(self.sample_count);
        out.put_slice(&self.data);
    }
}

/// saiz + saio + senc appended to a traf.
///
/// `saio` points into the `senc` payload. The senc box is last in the last
/// traf, so the offset is `moof_size - data.len()`; [`Moof`] fills it in.
#[derive(Debug, Clone)]
pub struct AuxBoxes {
    pub saiz: Saiz,
    pub saio: Saio,
    pub senc: Senc,
}

impl Layout for AuxBoxes {
    fn size(&self) -> usize {
        self.saiz.size() + self.saio.size() + self.senc.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        self.saiz.write(out);
        self.saio.write(out);
        self.senc.write(out);
    }
}

/// Track fragment.
#[derive(Debug, Clone)]
pub struct Traf {
    pub tfhd: Tfhd,
    pub tfdt: DecodeTime,
    pub truns: Vec<Trun>,
    pub aux: Option<AuxBoxes>,
}

impl Layout for Traf {
    fn size(&self) -> usize {
        ATOM_HEADER_SIZE + self.tfhd.size() + self.tfdt.size() + self.truns.size() + self.aux.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_atom_header(self.size(), b"traf");
        self.tfhd.write(out);
        self.tfdt.write(out);
        self.truns.write(out);
        self.aux.write(out);
    }
}

/// Movie fragment.
#[derive(Debug, Clone)]
pub struct Moof {
    pub mfhd: Mfhd,
    pub trafs: Vec<Traf>,
}

impl Moof {
    /// Point the saio of the last traf at its senc payload.
    pub fn resolve_aux_offset(&mut self) {
        let moof_size = self.size();
        if let Some(aux) = self.trafs.last_mut().and_then(|t| t.aux.as_mut()) {
            aux.saio.offset = (moof_size - aux.senc.data.len()) as u32;
        }
    }
}

impl Layout for Moof {
    fn size(&self) -> usize {
        ATOM_HEADER_SIZE + self.mfhd.size() + self.trafs.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_atom_header(self.size(), b"moof");
        self.mfhd.write(out);
        self.trafs.write(out);
    }
}

/// Header of an mdat holding `payload_size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct MdatHeader {
    pub payload_size: u64,
}

impl Layout for MdatHeader {
    fn size(&self) -> usize {
        ATOM_HEADER_SIZE
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_atom_header(ATOM_HEADER_SIZE + self.payload_size as usize, b"mdat");
    }
}

/// Segment type box
pub const STYP: [u8; 28] = [
    0x00, 0x00, 0x00, 0x1c, // atom size
    b's', b't', b'y', b'p', //
    b'i', b's', b'o', b'6', // major brand
    0x00, 0x00, 0x00, 0x01, // minor version
    b'i', b's', b'o', b'm', // compatible brand
    b'i', b's', b'o', b'6', // compatible brand
    b'd', b'a', b's', b'h', // compatible brand
];

#[derive(Debug, Clone, Copy)]
pub struct Styp;

impl Layout for Styp {
    fn size(&self) -> usize {
        STYP.len()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_slice(&STYP);
    }
}

/// Segment index with a single reference; version 1 once the earliest
/// presentation time needs 64 bits.
#[derive(Debug, Clone, Copy)]
pub struct Sidx {
    pub timescale: u32,
    pub earliest_pres_time: u64,
    pub duration: u32,
    pub referenced_size: u32,
}

impl Sidx {
    fn is_64bit(&self) -> bool {
        self.earliest_pres_time > u64::from(u32::MAX)
    }
}

impl Layout for Sidx {
    fn size(&self) -> usize {
        if self.is_64bit() {
            FULL_ATOM_HEADER_SIZE + 40
        } else {
            FULL_ATOM_HEADER_SIZE + 32
        }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        let version = u8::from(self.is_64bit());
        out.put_full_atom_header(self.size(), b"sidx", version, 0);
        out.put_u32(1); // reference id
        out.put_u32(self.timescale);
        if self.is_64bit() {
            out.put_u64(self.earliest_pres_time);
            out.put_u64(0); // first offset
        } else {
            out.put_u32(self.earliest_pres_time as u32);
            out.put_u32(0); // first offset
        }
        out.put_u32(1); // reserved + reference count
        out.put_u32(self.referenced_size);
        out.put_u32(self.duration);
        out.put_u32(0x9000_0000); // starts with SAP / SAP type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Measured;

    fn emit<L: Layout>(layout: L) -> Vec<u8> {
        Measured::new(layout).emit().unwrap().to_vec()
    }

    fn video_trun(flags: SampleFlags) -> Trun {
        Trun {
            media_type: MediaType::Video,
            flags,
            data_offset: 100,
            entries: vec![
                TrunEntry {
                    duration: 3000,
                    size: 500,
                    key_frame: true,
                    composition_offset: 0,
                },
                TrunEntry {
                    duration: 3000,
                    size: 200,
                    key_frame: false,
                    composition_offset: -3000,
                },
            ],
        }
    }

    fn varied_frames() -> Vec<Frame> {
        (0..10u32)
            .map(|i| Frame {
                offset: u64::from(i) * 4096,
                size: 100 + i * 37 % 11 * 61,
                duration: if i % 3 == 0 { 3003 } else { 3000 + i },
                pts_delay: (i * 7 % 4) * 1500,
                key_frame: i % 4 == 0,
            })
            .collect()
    }

    /// Per-sample fields of an emitted trun: duration, size and, for
    /// video, flags and composition offset.
    fn read_trun(bytes: &[u8]) -> (u8, u32, Vec<(u32, u32, Option<(u32, i32)>)>) {
        let version = bytes[8];
        let flags = u32::from_be_bytes([0, bytes[9], bytes[10], bytes[11]]);
        let count = u32::from_be_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let video = flags == TRUN_VIDEO_FLAGS;
        let entry_size = if video { 16 } else { 8 };
        assert_eq!(bytes.len(), 20 + count * entry_size);

        let word = |pos: usize| u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap());
        let entries = (0..count)
            .map(|i| {
                let pos = 20 + i * entry_size;
                let extra = video.then(|| (word(pos + 8), word(pos + 12) as i32));
                (word(pos), word(pos + 4), extra)
            })
            .collect();
        (version, flags, entries)
    }

    #[test]
    fn test_trun_entries_match_frames() {
        let frames = varied_frames();
        let initial_pts_delay = 1500;

        for (flags, version) in [(SampleFlags::Fragment, 0u8), (SampleFlags::Muxed, 1)] {
            let trun = Trun {
                media_type: MediaType::Video,
                flags,
                data_offset: 0,
                entries: frames.iter().map(|f| TrunEntry::from_frame(f, initial_pts_delay)).collect(),
            };
            let (read_version, read_flags, entries) = read_trun(&emit(trun));
            assert_eq!(read_version, version);
            assert_eq!(read_flags, TRUN_VIDEO_FLAGS);
            assert_eq!(entries.len(), frames.len());

            for (frame, (duration, size, extra)) in frames.iter().zip(entries) {
                assert_eq!(duration, frame.duration);
                assert_eq!(size, frame.size);
                let (sample_flags, composition_offset) = extra.unwrap();
                let expected_flags = match (flags, frame.key_frame) {
                    (SampleFlags::Fragment, true) => 0,
                    (SampleFlags::Fragment, false) => 0x0001_0000,
                    (SampleFlags::Muxed, true) => 0x0200_0000,
                    (SampleFlags::Muxed, false) => 0x0101_0000,
                };
                assert_eq!(sample_flags, expected_flags);
                assert_eq!(i64::from(composition_offset), i64::from(frame.pts_delay) - 1500);
            }
        }

        let audio = Trun {
            media_type: MediaType::Audio,
            flags: SampleFlags::Fragment,
            data_offset: 0,
            entries: frames.iter().map(|f| TrunEntry::from_frame(f, 0)).collect(),
        };
        let (_, read_flags, entries) = read_trun(&emit(audio));
        assert_eq!(read_flags, TRUN_AUDIO_FLAGS);
        for (frame, (duration, size, extra)) in frames.iter().zip(entries) {
            assert_eq!((duration, size), (frame.duration, frame.size));
            assert!(extra.is_none());
        }
    }

    #[test]
    fn test_tfdt_threshold() {
        assert_eq!(emit(Tfdt { decode_time: u64::from(u32::MAX) }).len(), 16);
        let wide = emit(Tfdt {
            decode_time: u64::from(u32::MAX) + 1,
        });
        assert_eq!(wide.len(), 20);
        assert_eq!(wide[8], 1);
        assert_eq!(&wide[12..], &[0, 0, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_sidx_threshold() {
        let mut sidx = Sidx {
            timescale: 90000,
            earliest_pres_time: u64::from(u32::MAX),
            duration: 180000,
            referenced_size: 1234,
        };
        assert_eq!(emit(sidx).len(), 44);
        sidx.earliest_pres_time += 1;
        let bytes = emit(sidx);
        assert_eq!(bytes.len(), 52);
        assert_eq!(&bytes[bytes.len() - 4..], &[0x90, 0, 0, 0]);
    }

    #[test]
    fn test_tfhd_sample_description_index() {
        let plain = emit(Tfhd {
            track_id: 1,
            sample_description_index: 0,
        });
        assert_eq!(plain.len(), 16);
        assert_eq!(&plain[8..12], &[0, 2, 0, 0]);

        let indexed = emit(Tfhd {
            track_id: 1,
            sample_description_index: 2,
        });
        assert_eq!(indexed.len(), 20);
        assert_eq!(&indexed[8..12], &[0, 2, 0, 2]);
        assert_eq!(&indexed[16..], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_video_trun_sample_flags() {
        let fragment = emit(video_trun(SampleFlags::Fragment));
        assert_eq!(fragment.len(), 20 + 2 * 16);
        assert_eq!(&fragment[8..12], &[0, 0, 0x0f, 0x01]);
        assert_eq!(&fragment[28..32], &[0, 0, 0, 0]);
        assert_eq!(&fragment[44..48], &[0, 1, 0, 0]);

        let muxed = emit(video_trun(SampleFlags::Muxed));
        assert_eq!(&muxed[8..12], &[1, 0, 0x0f, 0x01]);
        assert_eq!(&muxed[28..32], &[2, 0, 0, 0]);
        assert_eq!(&muxed[44..48], &[1, 1, 0, 0]);
        assert_eq!(&muxed[48..52], &(-3000i32).to_be_bytes());
    }

    #[test]
    fn test_audio_trun() {
        let trun = Trun {
            media_type: MediaType::Audio,
            flags: SampleFlags::Fragment,
            data_offset: 8,
            entries: vec![TrunEntry::from_frame(
                &Frame {
                    offset: 0,
                    size: 300,
                    duration: 1024,
                    pts_delay: 0,
                    key_frame: false,
                },
                0,
            )],
        };
        let bytes = emit(trun);
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[8..12], &[0, 0, 3, 1]);
        assert_eq!(&bytes[20..], &[0, 0, 4, 0, 0, 0, 1, 44]);
    }

    #[test]
    fn test_saiz_variable_sizes() {
        let default = Saiz {
            default_size: 8,
            sizes: vec![],
            sample_count: 10,
        };
        assert_eq!(emit(default).len(), 17);

        let table = Saiz {
            default_size: 0,
            sizes: vec![16, 22, 16],
            sample_count: 3,
        };
        let bytes = emit(table);
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[17..], &[16, 22, 16]);
    }

    #[test]
    fn test_saio_points_at_senc_payload() {
        let aux = AuxBoxes {
            saiz: Saiz {
                default_size: 8,
                sizes: vec![],
                sample_count: 1,
            },
            saio: Saio { offset: 0 },
            senc: Senc {
                sample_count: 1,
                use_subsamples: false,
                data: Bytes::from_static(&[0xab; 8]),
            },
        };
        let mut moof = Moof {
            mfhd: Mfhd { sequence_number: 1 },
            trafs: vec![Traf {
                tfhd: Tfhd {
                    track_id: 2,
                    sample_description_index: 0,
                },
                tfdt: DecodeTime::Auto(Tfdt { decode_time: 0 }),
                truns: vec![],
                aux: Some(aux),
            }],
        };
        moof.resolve_aux_offset();
        let bytes = emit(&moof);
        let offset = u32::from_be_bytes(bytes[bytes.len() - 24 - 4..bytes.len() - 24].try_into().unwrap());
        assert_eq!(&bytes[offset as usize..offset as usize + 8], &[0xab; 8]);
    }

    #[test]
    fn test_wide_tfdt_ignores_threshold() {
        let bytes = emit(DecodeTime::Wide(Tfdt64 { decode_time: 7 }));
        assert_eq!(bytes.len(), 20);
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[12..], &[0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn test_styp_size_field() {
        assert_eq!(u32::from_be_bytes(STYP[..4].try_into().unwrap()) as usize, STYP.len());
    }
}
