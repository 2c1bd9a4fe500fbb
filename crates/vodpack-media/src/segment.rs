//! Media segment assembly: picks the header builder and the frame pipeline
//! for a container and encryption scheme.
//!
//! The header is written to the output before the frames, except for CENC
//! video in general mode, where it depends on the parsed NAL units and is
//! prepended with `write_head` once the frames are done.

use std::fmt;

use tracing::{debug, info};
use vodpack_common::{EncryptionScheme, MediaType};

use crate::crypto::cenc::{audio_aux, initial_iv, single_nalu_aux, CencAudio, CencVideo, CencVideoSink};
use crate::crypto::{CbcsEncryptor, Passthrough};
use crate::dash::{FragmentHeader, FragmentParams};
use crate::error::{Error, Result};
use crate::frame_writer::FrameWriter;
use crate::media::Sequence;
use crate::mkv::{BlockEncryption, ClusterHeader, ClusterWriter};
use crate::mp4::muxer::SharedSink;
use crate::mp4::Muxer;
use crate::read_cache::{ReadCache, SourceReader};
use crate::source::{run_to_completion, Progress, SegmentProcessor};
use crate::write::{SegmentWriter, SizeCounter};

/// Media segment container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// One sequence as a DASH fragment.
    Mp4Fragment,
    /// Several sequences interleaved into one `moof` + `mdat`.
    Mp4Muxed,
    /// One sequence as a WebM cluster.
    WebmCluster,
}

/// What to package.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRequest<'s> {
    pub sequences: &'s [Sequence],
    pub container: Container,
    pub scheme: EncryptionScheme,
    pub segment_index: u32,
    /// Write the segment clear although the track is encrypted.
    pub clear_lead: bool,
    pub reuse_buffers: bool,
    /// Every video frame holds exactly one NAL unit.
    pub single_nalu_per_frame: bool,
    pub discontinuity: bool,
}

impl<'s> SegmentRequest<'s> {
    fn single(&self) -> Result<&'s Sequence> {
        match self.sequences {
            [sequence] => Ok(sequence),
            _ => Err(Error::bad_request(format!(
                "{:?} segments hold one sequence, got {}",
                self.container,
                self.sequences.len()
            ))),
        }
    }

    /// Scheme actually applied to the frames.
    fn applied_scheme(&self) -> EncryptionScheme {
        if self.clear_lead {
            EncryptionScheme::None
        } else {
            self.scheme
        }
    }
}

/// A segment whose header went out; the frames follow by driving
/// [`Segment::process`].
pub struct Segment<'a> {
    total_size: Option<u64>,
    processor: Option<Box<dyn SegmentProcessor + 'a>>,
}

impl Segment<'_> {
    /// Segment size, when known before the frames are processed.
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Whether frame data still has to be processed.
    pub fn has_frames(&self) -> bool {
        self.processor.is_some()
    }
}

impl fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("total_size", &self.total_size)
            .field("has_frames", &self.has_frames())
            .finish()
    }
}

impl SegmentProcessor for Segment<'_> {
    fn process(&mut self, cache: &mut ReadCache) -> Result<Progress> {
        match self.processor.as_mut() {
            Some(processor) => processor.process(cache),
            None => Ok(Progress::Done),
        }
    }
}

/// Write the header of the requested segment to `out` and set up the frame
/// pipeline.
///
/// In size-only mode nothing is written and the processor is only kept
/// when the size depends on the frame data.
pub fn build_segment<'a>(
    request: &SegmentRequest<'a>,
    out: &'a mut dyn SegmentWriter,
    size_only: bool,
) -> Result<Segment<'a>> {
    match request.container {
        Container::Mp4Fragment => build_fragment(request, out, size_only),
        Container::Mp4Muxed => build_muxed(request, out, size_only),
        Container::WebmCluster => build_cluster(request, out, size_only),
    }
}

/// Size of the requested segment. Reads frame data only for CENC video in
/// general mode.
pub fn segment_size(request: &SegmentRequest<'_>, cache: &mut ReadCache, reader: &mut dyn SourceReader) -> Result<u64> {
    let mut counter = SizeCounter::new();
    {
        let mut segment = build_segment(request, &mut counter, true)?;
        if let Some(total_size) = segment.total_size() {
            return Ok(total_size);
        }
        run_to_completion(&mut segment, cache, reader)?;
    }
    Ok(counter.total())
}

fn write_header(out: &mut dyn SegmentWriter, bytes: Option<&[u8]>) -> Result<()> {
    let bytes = bytes.ok_or_else(|| Error::unexpected("segment header was not built"))?;
    out.write_tail(bytes)
}

fn sized<'a>(total_size: u64) -> Segment<'a> {
    Segment {
        total_size: Some(total_size),
        processor: None,
    }
}

fn build_fragment<'a>(
    request: &SegmentRequest<'a>,
    out: &'a mut dyn SegmentWriter,
    size_only: bool,
) -> Result<Segment<'a>> {
    let sequence = request.single()?;
    let media_type = sequence.media_type();
    let mut params = FragmentParams {
        segment_index: request.segment_index,
        sample_description_index: 0,
        discontinuity: request.discontinuity,
    };
    if request.clear_lead && request.scheme.is_encrypted() {
        // the clear entry follows the encrypted one in the init segment
        params.sample_description_index = 2;
    }

    let scheme = match media_type {
        Some(MediaType::Subtitle) | None => EncryptionScheme::None,
        _ => request.applied_scheme(),
    };
    let reuse = request.reuse_buffers;

    match scheme {
        EncryptionScheme::None => {
            let header = FragmentHeader::new(sequence, &params, None, size_only)?;
            if size_only {
                return Ok(sized(header.total_size()));
            }
            write_header(out, header.bytes())?;
            Ok(Segment {
                total_size: Some(header.total_size()),
                processor: Some(Box::new(FrameWriter::new(sequence, out, reuse))),
            })
        }

        EncryptionScheme::Cbcs => {
            let drm = sequence.drm()?;
            let header = FragmentHeader::new(sequence, &params, None, size_only)?;
            if size_only {
                return Ok(sized(header.total_size()));
            }
            write_header(out, header.bytes())?;
            let encryptor = CbcsEncryptor::new(std::slice::from_ref(sequence), drm.key, drm.iv_seed(), out)?;
            Ok(Segment {
                total_size: Some(header.total_size()),
                processor: Some(Box::new(FrameWriter::new(sequence, encryptor, true))),
            })
        }

        EncryptionScheme::Cenc => {
            if let Some(passthrough) = Passthrough::detect(sequence) {
                info!(sequence = sequence.index, "forwarding protected frames as stored");
                let header = FragmentHeader::new(sequence, &params, Some(passthrough.boxes()), size_only)?;
                if size_only {
                    return Ok(sized(header.total_size()));
                }
                write_header(out, header.bytes())?;
                let writer = FrameWriter::new(sequence, out, reuse).keep_source_encryption();
                return Ok(Segment {
                    total_size: Some(header.total_size()),
                    processor: Some(Box::new(writer)),
                });
            }

            let (key, first_iv) = initial_iv(sequence)?;
            let aux = match media_type {
                Some(MediaType::Audio) => Some(audio_aux(sequence, first_iv)?),
                _ if request.single_nalu_per_frame => Some(single_nalu_aux(sequence, first_iv)?),
                _ => None,
            };

            let Some(aux) = aux else {
                debug!(sequence = sequence.index, "cenc video in general mode, header follows the frames");
                let video = CencVideo::new(sequence, params, reuse, out)?;
                return Ok(Segment {
                    total_size: None,
                    processor: Some(Box::new(video)),
                });
            };

            let header = FragmentHeader::new(sequence, &params, Some(aux.into_boxes()), size_only)?;
            if size_only {
                return Ok(sized(header.total_size()));
            }
            write_header(out, header.bytes())?;
            let total_size = Some(header.total_size());
            let processor: Box<dyn SegmentProcessor + 'a> = match media_type {
                Some(MediaType::Audio) => Box::new(FrameWriter::new(
                    sequence,
                    CencAudio::new(sequence, key, first_iv, out),
                    true,
                )),
                _ => Box::new(FrameWriter::new(
                    sequence,
                    CencVideoSink::new(sequence, key, first_iv, true, out),
                    true,
                )),
            };
            Ok(Segment {
                total_size,
                processor: Some(processor),
            })
        }
    }
}

fn build_muxed<'a>(request: &SegmentRequest<'a>, out: &'a mut dyn SegmentWriter, size_only: bool) -> Result<Segment<'a>> {
    if request.sequences.iter().any(|s| s.media_type() == Some(MediaType::Subtitle)) {
        return Err(Error::bad_request("subtitles cannot be muxed"));
    }
    let scheme = request.applied_scheme();
    if request.clear_lead && request.scheme.is_encrypted() {
        return Err(Error::bad_request("muxed segments have no clear lead"));
    }

    match scheme {
        EncryptionScheme::None => {
            let muxer = Muxer::new(request.sequences, SharedSink(out), request.reuse_buffers)?;
            let header = muxer.header(request.segment_index, size_only)?;
            if size_only {
                return Ok(sized(header.total_size()));
            }
            let total_size = header.total_size();
            let bytes = header
                .into_bytes()
                .ok_or_else(|| Error::unexpected("segment header was not built"))?;
            let mut muxer = muxer;
            muxer.sink_mut().0.write_tail(&bytes)?;
            Ok(Segment {
                total_size: Some(total_size),
                processor: Some(Box::new(muxer)),
            })
        }
        EncryptionScheme::Cbcs => {
            let drm = request
                .sequences
                .first()
                .ok_or_else(|| Error::bad_request("no streams to mux"))?
                .drm()?;
            let (key, iv) = (drm.key, drm.iv_seed());

            // the header goes out before the encryptor takes the writer
            let sizing = Muxer::new(request.sequences, SharedSink(SizeCounter::new()), request.reuse_buffers)?;
            let header = sizing.header(request.segment_index, size_only)?;
            if size_only {
                return Ok(sized(header.total_size()));
            }
            write_header(out, header.bytes())?;

            let encryptor = CbcsEncryptor::new(request.sequences, key, iv, out)?;
            let muxer = Muxer::new(request.sequences, encryptor, true)?;
            Ok(Segment {
                total_size: Some(header.total_size()),
                processor: Some(Box::new(muxer)),
            })
        }
        EncryptionScheme::Cenc => Err(Error::bad_request("cenc is not supported for muxed segments")),
    }
}

fn build_cluster<'a>(request: &SegmentRequest<'a>, out: &'a mut dyn SegmentWriter, size_only: bool) -> Result<Segment<'a>> {
    let sequence = request.single()?;
    let encryption = match request.scheme {
        EncryptionScheme::None => BlockEncryption::Clear,
        EncryptionScheme::Cenc if request.clear_lead => BlockEncryption::ClearLead,
        EncryptionScheme::Cenc => {
            let (key, iv) = initial_iv(sequence)?;
            BlockEncryption::Encrypted { key, iv }
        }
        EncryptionScheme::Cbcs => return Err(Error::bad_request("webm supports cenc encryption only")),
    };

    let header = ClusterHeader::new(sequence, &encryption, size_only)?;
    if size_only {
        return Ok(sized(header.total_size()));
    }
    write_header(out, header.bytes())?;
    Ok(Segment {
        total_size: Some(header.total_size()),
        processor: Some(Box::new(ClusterWriter::new(sequence, encryption, out, request.reuse_buffers))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::{frame, media_info};
    use crate::media::{DrmInfo, FramePart, SourceRef, Track};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::collections::HashMap;
    use vodpack_common::{CodecId, SourceId};

    fn drm() -> DrmInfo {
        DrmInfo {
            key: [0x5a; 16],
            key_id: [0x01; 16],
            iv: Some([0x33; 16]),
        }
    }

    fn audio(data: &[u8], sizes: &[u32]) -> Sequence {
        let mut offset = 0;
        let frames = sizes
            .iter()
            .map(|&s| {
                let f = frame(offset, s, 1024);
                offset += u64::from(s);
                f
            })
            .collect();
        let track = Track::new(
            media_info(MediaType::Audio, CodecId::Aac, 48000),
            vec![FramePart::new(SourceRef::Memory(Bytes::copy_from_slice(data)), frames)],
        );
        Sequence::new(0, vec![track]).with_drm(drm())
    }

    fn request(sequences: &[Sequence], container: Container, scheme: EncryptionScheme) -> SegmentRequest<'_> {
        SegmentRequest {
            sequences,
            container,
            scheme,
            segment_index: 1,
            clear_lead: false,
            reuse_buffers: true,
            single_nalu_per_frame: false,
            discontinuity: false,
        }
    }

    fn package(request: &SegmentRequest<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut segment = build_segment(request, &mut out, false).unwrap();
            run_to_completion(
                &mut segment,
                &mut ReadCache::new(256, 1).unwrap(),
                &mut HashMap::<SourceId, Vec<u8>>::new(),
            )
            .unwrap();
        }
        out
    }

    fn measure(request: &SegmentRequest<'_>) -> u64 {
        segment_size(
            request,
            &mut ReadCache::new(256, 1).unwrap(),
            &mut HashMap::<SourceId, Vec<u8>>::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_size_only_matches_output() {
        let data: Vec<u8> = (0..100u8).collect();
        let sequences = [audio(&data, &[40, 35, 25])];
        for (container, scheme) in [
            (Container::Mp4Fragment, EncryptionScheme::None),
            (Container::Mp4Fragment, EncryptionScheme::Cenc),
            (Container::Mp4Fragment, EncryptionScheme::Cbcs),
            (Container::Mp4Muxed, EncryptionScheme::None),
            (Container::Mp4Muxed, EncryptionScheme::Cbcs),
            (Container::WebmCluster, EncryptionScheme::None),
            (Container::WebmCluster, EncryptionScheme::Cenc),
        ] {
            let request = request(&sequences, container, scheme);
            let out = package(&request);
            assert_eq!(out.len() as u64, measure(&request), "{container:?} {scheme}");
            // running the size computation again gives the same answer
            assert_eq!(measure(&request), measure(&request));
        }
    }

    #[test]
    fn test_clear_fragment_carries_frames() {
        let data: Vec<u8> = (0..60u8).collect();
        let sequences = [audio(&data, &[30, 30])];
        let out = package(&request(&sequences, Container::Mp4Fragment, EncryptionScheme::None));
        assert_eq!(&out[4..8], b"styp");
        assert_eq!(&out[out.len() - 60..], &data[..]);
    }

    #[test]
    fn test_clear_lead_fragment_uses_second_entry() {
        let data = [7u8; 32];
        let sequences = [audio(&data, &[16, 16])];
        let mut request = request(&sequences, Container::Mp4Fragment, EncryptionScheme::Cenc);
        request.clear_lead = true;
        let out = package(&request);
        // frames stay clear, no auxiliary info
        assert_eq!(&out[out.len() - 32..], &data);
        assert!(!out.windows(4).any(|w| w == b"senc"));
        let tfhd = out.windows(4).position(|w| w == b"tfhd").unwrap();
        // flags: sample description index present
        assert_eq!(&out[tfhd + 5..tfhd + 8], &[0x02, 0x00, 0x02]);
        assert_eq!(&out[tfhd + 12..tfhd + 16], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_cenc_fragment_encrypts() {
        let data = [7u8; 32];
        let sequences = [audio(&data, &[16, 16])];
        let out = package(&request(&sequences, Container::Mp4Fragment, EncryptionScheme::Cenc));
        assert!(out.windows(4).any(|w| w == b"senc"));
        assert_ne!(&out[out.len() - 32..], &data);
    }

    #[test]
    fn test_rejected_combinations() {
        let data = [0u8; 16];
        let sequences = [audio(&data, &[16])];
        let mut out = Vec::new();
        assert_matches!(
            build_segment(&request(&sequences, Container::WebmCluster, EncryptionScheme::Cbcs), &mut out, false),
            Err(Error::BadRequest(_))
        );
        assert_matches!(
            build_segment(&request(&sequences, Container::Mp4Muxed, EncryptionScheme::Cenc), &mut out, false),
            Err(Error::BadRequest(_))
        );

        let two = [audio(&data, &[16]), audio(&data, &[16])];
        assert_matches!(
            build_segment(&request(&two, Container::Mp4Fragment, EncryptionScheme::None), &mut out, false),
            Err(Error::BadRequest(_))
        );
    }
}
