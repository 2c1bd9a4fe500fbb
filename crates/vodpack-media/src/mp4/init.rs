//! ISOBMFF initialization segment: `ftyp` + `moov` with one `trak` per
//! output sequence and empty sample tables.
//!
//! Encrypted output rewrites every audio and video sample entry to
//! `encv`/`enca` with a `sinf` describing the scheme. With a clear lead the
//! original entry follows as a second `stsd` entry, so the first fragments
//! can reference it through the tfhd sample description index.

use bytes::{BufMut, BytesMut};
use tracing::debug;
use vodpack_common::{CodecId, EncryptionScheme, MediaType};

use super::boxes::{ATOM_HEADER_SIZE, FULL_ATOM_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::layout::{Emitter, Layout, Measured};
use crate::media::{MediaInfo, Sequence};

const FTYP: [u8; 24] = [
    0x00, 0x00, 0x00, 0x18, //
    b'f', b't', b'y', b'p', //
    b'i', b's', b'o', b'm', // major brand
    0x00, 0x00, 0x00, 0x01, // minor version
    b'i', b's', b'o', b'm', // compatible brand
    b'a', b'v', b'c', b'1', // compatible brand
];

const FTYP_ISO5: [u8; 28] = [
    0x00, 0x00, 0x00, 0x1c, //
    b'f', b't', b'y', b'p', //
    b'i', b's', b'o', b'5', // major brand
    0x00, 0x00, 0x00, 0x01, // minor version
    b'i', b's', b'o', b'5', // compatible brand
    b'd', b'a', b's', b'h', // compatible brand
    b'm', b's', b'i', b'x', // compatible brand
];

const DINF: [u8; 36] = [
    0x00, 0x00, 0x00, 0x24, //
    b'd', b'i', b'n', b'f', //
    0x00, 0x00, 0x00, 0x1c, //
    b'd', b'r', b'e', b'f', //
    0x00, 0x00, 0x00, 0x00, // version + flags
    0x00, 0x00, 0x00, 0x01, // entry count
    0x00, 0x00, 0x00, 0x0c, //
    b'u', b'r', b'l', b' ', //
    0x00, 0x00, 0x00, 0x01, // self-contained
];

/// Empty stts, stsc, stsz and stco
const EMPTY_SAMPLE_TABLES: [u8; 68] = [
    0x00, 0x00, 0x00, 0x10, b's', b't', b't', b's', 0, 0, 0, 0, 0, 0, 0, 0, //
    0x00, 0x00, 0x00, 0x10, b's', b't', b's', b'c', 0, 0, 0, 0, 0, 0, 0, 0, //
    0x00, 0x00, 0x00, 0x14, b's', b't', b's', b'z', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
    0x00, 0x00, 0x00, 0x10, b's', b't', b'c', b'o', 0, 0, 0, 0, 0, 0, 0, 0,
];

const SAMPLE_ENTRY_HEADER_SIZE: usize = ATOM_HEADER_SIZE + 8;
const VISUAL_ENTRY_FIELDS_SIZE: usize = 70;
const AUDIO_ENTRY_FIELDS_SIZE: usize = 20;

/// esds payload around the decoder specific info
const ESDS_FIXED_SIZE: usize = 29;

/// Largest decoder specific info that keeps the ES descriptor length in one byte
const MAX_ESDS_EXTRA_DATA: usize = 255 - 23;

const MP4_ES_DESCR_TAG: u8 = 3;
const MP4_DEC_CONFIG_DESCR_TAG: u8 = 4;
const MP4_DEC_SPECIFIC_DESCR_TAG: u8 = 5;
const MP4_SL_DESCR_TAG: u8 = 6;

const WEBVTT_CONFIG: &[u8] = b"WEBVTT";

/// How the init segment declares encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProtection {
    pub scheme: EncryptionScheme,
    pub key_id: [u8; 16],
    /// Constant IV, cbcs only.
    pub constant_iv: Option<[u8; 16]>,
    /// Keep the clear sample entry as the second stsd entry.
    pub clear_lead: bool,
}

/// Request-level init segment parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitParams {
    /// `iso5`/`dash`/`msix` brands instead of `isom`/`avc1`.
    pub iso5_brand: bool,
    pub protection: Option<InitProtection>,
}

fn put_matrix(out: &mut Emitter<'_>) {
    for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        out.put_u32(value);
    }
}

#[derive(Debug, Clone, Copy)]
struct Mvhd {
    timescale: u32,
    duration: u64,
}

impl Mvhd {
    fn is_64bit(&self) -> bool {
        self.duration > u64::from(u32::MAX)
    }
}

impl Layout for Mvhd {
    fn size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + if self.is_64bit() { 108 } else { 96 }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_full_atom_header(self.size(), b"mvhd", u8::from(self.is_64bit()), 0);
        if self.is_64bit() {
            out.put_u64(0); // creation time
            out.put_u64(0); // modification time
            out.put_u32(self.timescale);
            out.put_u64(self.duration);
        } else {
            out.put_u32(0);
            out.put_u32(0);
            out.put_u32(self.timescale);
            out.put_u32(self.duration as u32);
        }
        out.put_u32(0x0001_0000); // rate 1.0
        out.put_u16(0x0100); // volume 1.0
        out.put_zeros(10);
        put_matrix(out);
        out.put_zeros(24); // pre defined
        out.put_u32(u32::MAX); // next track id
    }
}

#[derive(Debug, Clone)]
struct Mvex {
    track_ids: Vec<u32>,
}

impl Mvex {
    const TREX_SIZE: usize = FULL_ATOM_HEADER_SIZE + 20;
}

impl Layout for Mvex {
    fn size(&self) -> usize {
        ATOM_HEADER_SIZE + Self::TREX_SIZE * self.track_ids.len()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_atom_header(self.size(), b"mvex");
        for &track_id in &self.track_ids {
            out.put_full_atom_header(Self::TREX_SIZE, b"trex", 0, 0);
            out.put_u32(track_id);
            out.put_u32(1); // default sample description index
            out.put_u32(0); // default sample duration
            out.put_u32(0); // default sample size
            out.put_u32(0); // default sample flags
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tkhd {
    track_id: u32,
    duration: u64,
    media_type: MediaType,
    width: u16,
    height: u16,
}

impl Tkhd {
    fn is_64bit(&self) -> bool {
        self.duration > u64::from(u32::MAX)
    }
}

impl Layout for Tkhd {
    fn size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + if self.is_64bit() { 92 } else { 80 }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        // enabled | in movie
        out.put_full_atom_header(self.size(), b"tkhd", u8::from(self.is_64bit()), 3);
        if self.is_64bit() {
            out.put_u64(0);
            out.put_u64(0);
            out.put_u32(self.track_id);
            out.put_u32(0);
            out.put_u64(self.duration);
        } else {
            out.put_u32(0);
            out.put_u32(0);
            out.put_u32(self.track_id);
            out.put_u32(0);
            out.put_u32(self.duration as u32);
        }
        out.put_zeros(12); // reserved, layer, alternate group
        out.put_u16(if self.media_type == MediaType::Audio { 0x0100 } else { 0 });
        out.put_u16(0);
        put_matrix(out);
        if self.media_type == MediaType::Video {
            out.put_u32(u32::from(self.width) << 16);
            out.put_u32(u32::from(self.height) << 16);
        } else {
            out.put_u64(0);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Mdhd {
    timescale: u32,
    duration: u64,
}

impl Mdhd {
    fn is_64bit(&self) -> bool {
        self.duration > u64::from(u32::MAX)
    }
}

impl Layout for Mdhd {
    fn size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + if self.is_64bit() { 32 } else { 20 }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_full_atom_header(self.size(), b"mdhd", u8::from(self.is_64bit()), 0);
        if self.is_64bit() {
            out.put_u64(0);
            out.put_u64(0);
            out.put_u32(self.timescale);
            out.put_u64(self.duration);
        } else {
            out.put_u32(0);
            out.put_u32(0);
            out.put_u32(self.timescale);
            out.put_u32(self.duration as u32);
        }
        out.put_u16(0); // language
        out.put_u16(0);
    }
}

#[derive(Debug, Clone, Copy)]
struct Hdlr(MediaType);

impl Hdlr {
    fn name(&self) -> &'static [u8] {
        match self.0 {
            MediaType::Video => b"VideoHandler\0",
            MediaType::Audio => b"SoundHandler\0",
            MediaType::Subtitle => b"subt\0",
        }
    }
}

impl Layout for Hdlr {
    fn size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + 20 + self.name().len()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_full_atom_header(self.size(), b"hdlr", 0, 0);
        out.put_u32(0); // pre defined
        out.put_slice(&self.0.handler_type());
        out.put_zeros(12);
        out.put_slice(self.name());
    }
}

/// Media header box of the minf.
#[derive(Debug, Clone, Copy)]
struct MediaHeader(MediaType);

impl Layout for MediaHeader {
    fn size(&self) -> usize {
        match self.0 {
            MediaType::Video => FULL_ATOM_HEADER_SIZE + 8,
            MediaType::Audio => FULL_ATOM_HEADER_SIZE + 4,
            MediaType::Subtitle => FULL_ATOM_HEADER_SIZE,
        }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        match self.0 {
            MediaType::Video => {
                out.put_full_atom_header(self.size(), b"vmhd", 0, 1);
                out.put_zeros(8); // graphics mode, opcolor
            }
            MediaType::Audio => {
                out.put_full_atom_header(self.size(), b"smhd", 0, 0);
                out.put_zeros(4); // balance
            }
            MediaType::Subtitle => out.put_full_atom_header(self.size(), b"sthd", 0, 0),
        }
    }
}

/// Codec configuration box inside a sample entry.
#[derive(Debug, Clone)]
enum CodecConfig {
    /// Plain box wrapping the extra data (`avcC`, `hvcC`, `dOps`, ...).
    Raw { kind: [u8; 4], data: Vec<u8> },
    /// Full box wrapping the extra data (`dfLa`).
    Full { kind: [u8; 4], data: Vec<u8> },
    Esds { object_type_id: u8, bitrate: u32, data: Vec<u8> },
}

impl Layout for CodecConfig {
    fn size(&self) -> usize {
        match self {
            Self::Raw { data, .. } => ATOM_HEADER_SIZE + data.len(),
            Self::Full { data, .. } => FULL_ATOM_HEADER_SIZE + data.len(),
            Self::Esds { data, .. } => ATOM_HEADER_SIZE + ESDS_FIXED_SIZE + data.len(),
        }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        match self {
            Self::Raw { kind, data } => {
                out.put_atom_header(self.size(), kind);
                out.put_slice(data);
            }
            Self::Full { kind, data } => {
                out.put_full_atom_header(self.size(), kind, 0, 0);
                out.put_slice(data);
            }
            Self::Esds {
                object_type_id,
                bitrate,
                data,
            } => {
                let len = data.len() as u8;
                out.put_full_atom_header(self.size(), b"esds", 0, 0);
                out.put_u8(MP4_ES_DESCR_TAG);
                out.put_u8(23 + len);
                out.put_u16(1); // es id
                out.put_u8(0); // flags

                out.put_u8(MP4_DEC_CONFIG_DESCR_TAG);
                out.put_u8(15 + len);
                out.put_u8(*object_type_id);
                out.put_u8(0x15); // audio stream
                out.put_u24(0); // buffer size
                out.put_u32(*bitrate); // max bitrate
                out.put_u32(*bitrate); // avg bitrate

                out.put_u8(MP4_DEC_SPECIFIC_DESCR_TAG);
                out.put_u8(len);
                out.put_slice(data);

                out.put_u8(MP4_SL_DESCR_TAG);
                out.put_u8(1);
                out.put_u8(2);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum EntryFields {
    Video { width: u16, height: u16 },
    Audio { channels: u16, bits_per_sample: u16, sample_rate: u16 },
    Text,
}

impl EntryFields {
    fn size(&self) -> usize {
        match self {
            Self::Video { .. } => VISUAL_ENTRY_FIELDS_SIZE,
            Self::Audio { .. } => AUDIO_ENTRY_FIELDS_SIZE,
            Self::Text => 0,
        }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        match *self {
            Self::Video { width, height } => {
                out.put_zeros(16); // pre defined, reserved
                out.put_u16(width);
                out.put_u16(height);
                out.put_u32(0x0048_0000); // 72 dpi
                out.put_u32(0x0048_0000);
                out.put_u32(0);
                out.put_u16(1); // frame count
                out.put_zeros(32); // compressor name
                out.put_u16(0x18); // depth
                out.put_u16(0xffff);
            }
            Self::Audio {
                channels,
                bits_per_sample,
                sample_rate,
            } => {
                out.put_zeros(8);
                out.put_u16(channels);
                out.put_u16(bits_per_sample);
                out.put_zeros(4);
                out.put_u16(sample_rate);
                out.put_u16(0);
            }
            Self::Text => {}
        }
    }
}

/// Protection scheme info appended to an encrypted sample entry.
#[derive(Debug, Clone)]
struct Sinf {
    original_format: [u8; 4],
    scheme: [u8; 4],
    /// tenc crypt/skip byte
    pattern: u8,
    per_sample_iv_size: u8,
    key_id: [u8; 16],
    constant_iv: Option<[u8; 16]>,
}

impl Sinf {
    fn tenc_size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + 20 + self.constant_iv.map_or(0, |iv| 1 + iv.len())
    }

    fn schi_size(&self) -> usize {
        ATOM_HEADER_SIZE + self.tenc_size()
    }
}

const FRMA_SIZE: usize = ATOM_HEADER_SIZE + 4;
const SCHM_SIZE: usize = FULL_ATOM_HEADER_SIZE + 8;

impl Layout for Sinf {
    fn size(&self) -> usize {
        ATOM_HEADER_SIZE + FRMA_SIZE + SCHM_SIZE + self.schi_size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_atom_header(self.size(), b"sinf");

        out.put_atom_header(FRMA_SIZE, b"frma");
        out.put_slice(&self.original_format);

        out.put_full_atom_header(SCHM_SIZE, b"schm", 0, 0);
        out.put_slice(&self.scheme);
        out.put_u32(0x10000); // scheme version

        out.put_atom_header(self.schi_size(), b"schi");
        let version = u8::from(self.constant_iv.is_some());
        out.put_full_atom_header(self.tenc_size(), b"tenc", version, 0);
        out.put_u8(0);
        out.put_u8(self.pattern);
        out.put_u8(1); // is protected
        out.put_u8(self.per_sample_iv_size);
        out.put_slice(&self.key_id);
        if let Some(iv) = &self.constant_iv {
            out.put_u8(iv.len() as u8);
            out.put_slice(iv);
        }
    }
}

/// One stsd entry; `sinf` turns it into `encv`/`enca`.
#[derive(Debug, Clone)]
struct SampleEntry {
    format: [u8; 4],
    fields: EntryFields,
    config: Option<CodecConfig>,
    sinf: Option<Sinf>,
}

impl SampleEntry {
    fn from_media_info(info: &MediaInfo) -> Result<Self> {
        let format = info
            .codec
            .sample_entry()
            .ok_or_else(|| Error::unsupported(format!("codec {} has no mp4 sample entry", info.codec)))?;
        let data = info.extra_data.clone();

        let (fields, config) = match info.media_type {
            MediaType::Video => {
                let kind = match info.codec {
                    CodecId::Avc => *b"avcC",
                    CodecId::Hevc => *b"hvcC",
                    other => return Err(Error::unsupported(format!("no mp4 video configuration for {other}"))),
                };
                (
                    EntryFields::Video {
                        width: info.video.width,
                        height: info.video.height,
                    },
                    Some(CodecConfig::Raw { kind, data }),
                )
            }
            MediaType::Audio => {
                let config = match info.codec {
                    CodecId::Aac | CodecId::Mp3 => CodecConfig::Esds {
                        object_type_id: info.audio.object_type_id,
                        bitrate: info.bitrate,
                        data,
                    },
                    CodecId::Ac3 => CodecConfig::Raw { kind: *b"dac3", data },
                    CodecId::Eac3 => CodecConfig::Raw { kind: *b"dec3", data },
                    CodecId::Opus => CodecConfig::Raw { kind: *b"dOps", data },
                    CodecId::Flac => CodecConfig::Full { kind: *b"dfLa", data },
                    other => return Err(Error::unsupported(format!("no mp4 audio configuration for {other}"))),
                };
                if let CodecConfig::Esds { data, .. } = &config {
                    if data.len() > MAX_ESDS_EXTRA_DATA {
                        return Err(Error::bad_data("extra data too long for esds"));
                    }
                }
                (
                    EntryFields::Audio {
                        channels: info.audio.channels,
                        bits_per_sample: info.audio.bits_per_sample,
                        sample_rate: info.audio.sample_rate as u16,
                    },
                    Some(config),
                )
            }
            MediaType::Subtitle => (
                EntryFields::Text,
                Some(CodecConfig::Raw {
                    kind: *b"vttC",
                    data: WEBVTT_CONFIG.to_vec(),
                }),
            ),
        };

        Ok(Self {
            format,
            fields,
            config,
            sinf: None,
        })
    }

    fn encrypted(&self, media_type: MediaType, protection: &InitProtection) -> Result<Self> {
        let scheme = protection
            .scheme
            .scheme_type()
            .ok_or_else(|| Error::bad_request("encrypted sample entry without a scheme"))?;
        let (pattern, per_sample_iv_size, constant_iv) = match protection.scheme {
            EncryptionScheme::Cbcs => {
                let iv = protection
                    .constant_iv
                    .ok_or_else(|| Error::bad_request("cbcs requires a constant iv"))?;
                let pattern = if media_type == MediaType::Video { 0x19 } else { 0 };
                (pattern, 0, Some(iv))
            }
            _ => (0, crate::media::CENC_IV_SIZE as u8, None),
        };
        let format = match media_type {
            MediaType::Video => *b"encv",
            _ => *b"enca",
        };
        Ok(Self {
            format,
            sinf: Some(Sinf {
                original_format: self.format,
                scheme,
                pattern,
                per_sample_iv_size,
                key_id: protection.key_id,
                constant_iv,
            }),
            ..self.clone()
        })
    }
}

impl Layout for SampleEntry {
    fn size(&self) -> usize {
        SAMPLE_ENTRY_HEADER_SIZE + self.fields.size() + self.config.size() + self.sinf.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_atom_header(self.size(), &self.format);
        out.put_zeros(6);
        out.put_u16(1); // data reference index
        self.fields.write(out);
        self.config.write(out);
        self.sinf.write(out);
    }
}

#[derive(Debug, Clone)]
struct Stsd {
    entries: Vec<SampleEntry>,
}

impl Layout for Stsd {
    fn size(&self) -> usize {
        FULL_ATOM_HEADER_SIZE + 4 + self.entries.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_full_atom_header(self.size(), b"stsd", 0, 0);
        out.put_u32(self.entries.len() as u32);
        self.entries.write(out);
    }
}

#[derive(Debug, Clone)]
struct Trak {
    tkhd: Tkhd,
    mdhd: Mdhd,
    stsd: Stsd,
}

impl Trak {
    fn media_type(&self) -> MediaType {
        self.tkhd.media_type
    }

    fn stbl_size(&self) -> usize {
        ATOM_HEADER_SIZE + self.stsd.size() + EMPTY_SAMPLE_TABLES.len()
    }

    fn minf_size(&self) -> usize {
        ATOM_HEADER_SIZE + MediaHeader(self.media_type()).size() + DINF.len() + self.stbl_size()
    }

    fn mdia_size(&self) -> usize {
        ATOM_HEADER_SIZE + self.mdhd.size() + Hdlr(self.media_type()).size() + self.minf_size()
    }
}

impl Layout for Trak {
    fn size(&self) -> usize {
        ATOM_HEADER_SIZE + self.tkhd.size() + self.mdia_size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_atom_header(self.size(), b"trak");
        self.tkhd.write(out);

        out.put_atom_header(self.mdia_size(), b"mdia");
        self.mdhd.write(out);
        Hdlr(self.media_type()).write(out);

        out.put_atom_header(self.minf_size(), b"minf");
        MediaHeader(self.media_type()).write(out);
        out.put_slice(&DINF);

        out.put_atom_header(self.stbl_size(), b"stbl");
        self.stsd.write(out);
        out.put_slice(&EMPTY_SAMPLE_TABLES);
    }
}

#[derive(Debug, Clone)]
struct InitLayout {
    iso5_brand: bool,
    mvhd: Mvhd,
    mvex: Mvex,
    traks: Vec<Trak>,
}

impl InitLayout {
    fn ftyp(&self) -> &'static [u8] {
        if self.iso5_brand {
            &FTYP_ISO5
        } else {
            &FTYP
        }
    }

    fn moov_size(&self) -> usize {
        ATOM_HEADER_SIZE + self.mvhd.size() + self.mvex.size() + self.traks.size()
    }
}

impl Layout for InitLayout {
    fn size(&self) -> usize {
        self.ftyp().len() + self.moov_size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_slice(self.ftyp());
        out.put_atom_header(self.moov_size(), b"moov");
        self.mvhd.write(out);
        self.mvex.write(out);
        self.traks.write(out);
    }
}

/// Presentation duration in `timescale` units, from the clip durations.
fn media_duration(sequences: &[Sequence], timescale: u32) -> u64 {
    let millis = sequences
        .iter()
        .map(|s| s.clips.iter().map(|c| c.media_info.duration_millis).sum::<u64>())
        .max()
        .unwrap_or(0);
    millis * u64::from(timescale / 1000)
}

/// Built init segment, MP4 or WebM; `bytes` is absent in size-only mode.
#[derive(Debug)]
pub struct InitSegment {
    bytes: Option<BytesMut>,
    total_size: usize,
}

impl InitSegment {
    pub(crate) fn new(bytes: Option<BytesMut>, total_size: usize) -> Self {
        Self { bytes, total_size }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn into_bytes(self) -> Option<BytesMut> {
        self.bytes
    }
}

/// Build the init segment of `sequences`, one trak each.
pub fn init_segment(sequences: &[Sequence], params: &InitParams, size_only: bool) -> Result<InitSegment> {
    let first = sequences
        .first()
        .ok_or_else(|| Error::bad_request("init segment without tracks"))?
        .first_track()?;
    let timescale = first.media_info.timescale;
    let duration = media_duration(sequences, timescale);

    let mut traks = Vec::with_capacity(sequences.len());
    for sequence in sequences {
        let info = &sequence.first_track()?.media_info;
        let clear = SampleEntry::from_media_info(info)?;
        let entries = match &params.protection {
            Some(protection) if info.media_type != MediaType::Subtitle && protection.scheme.is_encrypted() => {
                let mut entries = vec![clear.encrypted(info.media_type, protection)?];
                if protection.clear_lead {
                    entries.push(clear);
                }
                entries
            }
            _ => vec![clear],
        };

        traks.push(Trak {
            tkhd: Tkhd {
                track_id: info.track_id,
                duration,
                media_type: info.media_type,
                width: info.video.width,
                height: info.video.height,
            },
            mdhd: Mdhd { timescale, duration },
            stsd: Stsd { entries },
        });
    }

    let layout = Measured::new(InitLayout {
        iso5_brand: params.iso5_brand,
        mvhd: Mvhd { timescale, duration },
        mvex: Mvex {
            track_ids: traks.iter().map(|t| t.tkhd.track_id).collect(),
        },
        traks,
    });

    let total_size = layout.size();
    debug!(
        tracks = sequences.len(),
        total_size,
        encrypted = params.protection.is_some(),
        "mp4 init segment built"
    );

    let bytes = if size_only { None } else { Some(layout.emit()?) };
    Ok(InitSegment::new(bytes, total_size))
}
