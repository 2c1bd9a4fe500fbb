//! DASH fragment header: `styp` + `sidx` + `moof` + `mdat` header for a
//! single sequence.

use bytes::BytesMut;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::{Emitter, Layout, Measured};
use crate::media::{rescale_time, Sequence};
use crate::mp4::boxes::{
    AuxBoxes, DecodeTime, MdatHeader, Mfhd, Moof, SampleFlags, Sidx, Styp, Tfdt, Tfhd, Traf, Trun, TrunEntry, ATOM_HEADER_SIZE,
};

/// Request-level fragment parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentParams {
    /// Written to `mfhd`.
    pub segment_index: u32,
    /// `tfhd` sample description index, 0 to omit.
    pub sample_description_index: u32,
    /// Clips keep their own timelines instead of being concatenated.
    pub discontinuity: bool,
}

struct FragmentLayout {
    sidx: Sidx,
    moof: Moof,
    mdat: MdatHeader,
}

impl Layout for FragmentLayout {
    fn size(&self) -> usize {
        Styp.size() + self.sidx.size() + self.moof.size() + self.mdat.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        Styp.write(out);
        self.sidx.write(out);
        self.moof.write(out);
        self.mdat.write(out);
    }
}

/// Sidx timescale, earliest presentation time and duration, normalized to
/// the largest timescale across the clips of the sequence.
fn sidx_params(sequence: &Sequence, discontinuity: bool) -> Result<(u32, u64, u64)> {
    let first = sequence.first_track()?;
    let mut timescale = first.media_info.timescale;
    let mut earliest = first.earliest_pres_time(discontinuity);
    let mut duration = first.total_duration();

    for track in &sequence.clips[1..] {
        let track_timescale = track.media_info.timescale;
        if timescale > track_timescale {
            duration += rescale_time(track.total_duration(), track_timescale, timescale);
            continue;
        }
        if timescale < track_timescale {
            duration = rescale_time(duration, timescale, track_timescale);
            earliest = rescale_time(earliest, timescale, track_timescale);
            timescale = track_timescale;
        }
        duration += track.total_duration();
    }
    Ok((timescale, earliest, duration))
}

/// Header of one DASH media segment.
///
/// In size-only mode only the sizes are computed.
#[derive(Debug)]
pub struct FragmentHeader {
    bytes: Option<BytesMut>,
    header_size: usize,
    total_size: u64,
    first_frame_offset: usize,
}

impl FragmentHeader {
    /// Build the header of `sequence`, with `aux` appended to the traf for
    /// encrypted output.
    pub fn new(sequence: &Sequence, params: &FragmentParams, aux: Option<AuxBoxes>, size_only: bool) -> Result<Self> {
        let first = sequence.first_track()?;
        let media_type = first.media_info.media_type;
        let frame_data_size = sequence.total_frame_size();

        let mdat_size = ATOM_HEADER_SIZE as u64 + frame_data_size;
        if mdat_size > u64::from(u32::MAX) {
            return Err(Error::bad_request(format!("fragment payload of {frame_data_size} bytes too large")));
        }

        let trun = Trun {
            media_type,
            flags: SampleFlags::Fragment,
            data_offset: 0,
            entries: sequence.frames().map(|f| TrunEntry::from_frame(f, 0)).collect(),
        };
        let mut moof = Moof {
            mfhd: Mfhd {
                sequence_number: params.segment_index,
            },
            trafs: vec![Traf {
                tfhd: Tfhd {
                    track_id: first.media_info.track_id,
                    sample_description_index: params.sample_description_index,
                },
                tfdt: DecodeTime::Auto(Tfdt {
                    decode_time: first.earliest_pres_time(params.discontinuity),
                }),
                truns: vec![trun],
                aux,
            }],
        };

        let moof_size = moof.size();
        let first_frame_offset = moof_size + ATOM_HEADER_SIZE;
        moof.trafs[0].truns[0].data_offset = first_frame_offset as u32;
        moof.resolve_aux_offset();

        let (timescale, earliest_pres_time, duration) = sidx_params(sequence, params.discontinuity)?;
        let layout = Measured::new(FragmentLayout {
            sidx: Sidx {
                timescale,
                earliest_pres_time,
                duration: duration as u32,
                referenced_size: (moof_size as u64 + mdat_size) as u32,
            },
            moof,
            mdat: MdatHeader {
                payload_size: frame_data_size,
            },
        });

        let header_size = layout.size();
        let total_size = header_size as u64 + frame_data_size;
        debug!(
            segment_index = params.segment_index,
            header_size,
            total_size,
            frames = sequence.total_frame_count(),
            "fragment header built"
        );

        let bytes = if size_only { None } else { Some(layout.emit()?) };
        Ok(Self {
            bytes,
            header_size,
            total_size,
            first_frame_offset,
        })
    }

    /// Header plus frame data.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// trun data offset of the first frame (moof size + mdat header).
    pub fn first_frame_offset(&self) -> usize {
        self.first_frame_offset
    }

    /// Header bytes, absent in size-only mode.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn into_bytes(self) -> Option<BytesMut> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::{frame, media_info};
    use crate::media::{FramePart, SourceRef, Track};
    use crate::mp4::boxes::STYP;
    use vodpack_common::{CodecId, MediaType, SourceId};

    fn audio_sequence(timescales: &[u32]) -> Sequence {
        let clips = timescales
            .iter()
            .map(|&ts| {
                Track::new(
                    media_info(MediaType::Audio, CodecId::Aac, ts),
                    vec![FramePart::new(
                        SourceRef::File(SourceId::new(0)),
                        vec![frame(0, 100, 1024), frame(100, 120, 1024)],
                    )],
                )
            })
            .collect();
        Sequence::new(0, clips)
    }

    #[test]
    fn test_fragment_sizes() {
        let sequence = audio_sequence(&[48000]);
        let header = FragmentHeader::new(&sequence, &FragmentParams::default(), None, false).unwrap();

        // mfhd 16, traf 8 + tfhd 16 + tfdt 16 + trun 20 + 2 * 8
        let moof_size = 8 + 16 + 8 + 16 + 16 + 20 + 16;
        assert_eq!(header.first_frame_offset(), moof_size + 8);
        assert_eq!(header.header_size(), 28 + 44 + moof_size + 8);
        assert_eq!(header.total_size(), header.header_size() as u64 + 220);

        let bytes = header.bytes().unwrap();
        assert_eq!(&bytes[..28], &STYP);
        assert_eq!(&bytes[bytes.len() - 4..], b"mdat");
        let mdat_size = u32::from_be_bytes(bytes[bytes.len() - 8..bytes.len() - 4].try_into().unwrap());
        assert_eq!(mdat_size, 228);
    }

    #[test]
    fn test_size_only_matches_emitted() {
        let sequence = audio_sequence(&[48000, 44100]);
        let sized = FragmentHeader::new(&sequence, &FragmentParams::default(), None, true).unwrap();
        assert!(sized.bytes().is_none());
        let built = FragmentHeader::new(&sequence, &FragmentParams::default(), None, false).unwrap();
        assert_eq!(sized.total_size(), built.total_size());
        assert_eq!(built.bytes().unwrap().len(), built.header_size());
    }

    #[test]
    fn test_sidx_uses_largest_timescale() {
        let sequence = audio_sequence(&[44100, 48000]);
        let (timescale, _, duration) = sidx_params(&sequence, false).unwrap();
        assert_eq!(timescale, 48000);
        assert_eq!(duration, rescale_time(2048, 44100, 48000) + 2048);
    }

    #[test]
    fn test_tfdt_switches_to_64_bit() {
        let limit = u64::from(u32::MAX);
        let mut sequence = audio_sequence(&[1000]);
        let mut sizes = Vec::new();
        for (offset, version) in [(limit, 0u8), (limit + 1, 1)] {
            sequence.clips[0].first_frame_time_offset = offset;
            let header = FragmentHeader::new(&sequence, &FragmentParams::default(), None, false).unwrap();
            let bytes = header.bytes().unwrap();
            assert_eq!(bytes.len(), header.header_size());

            let tfdt = bytes.windows(4).position(|w| w == b"tfdt").unwrap() - 4;
            assert_eq!(bytes[tfdt + 8], version);
            let decode_time = if version == 1 {
                u64::from_be_bytes(bytes[tfdt + 12..tfdt + 20].try_into().unwrap())
            } else {
                u64::from(u32::from_be_bytes(bytes[tfdt + 12..tfdt + 16].try_into().unwrap()))
            };
            assert_eq!(decode_time, offset);

            let sidx = bytes.windows(4).position(|w| w == b"sidx").unwrap() - 4;
            assert_eq!(bytes[sidx + 8], version);
            sizes.push(header.header_size());
        }
        // tfdt and sidx both grow
        assert_eq!(sizes[1], sizes[0] + 4 + 8);
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let sequence = Sequence::new(0, vec![]);
        assert!(FragmentHeader::new(&sequence, &FragmentParams::default(), None, true).is_err());
    }
}
