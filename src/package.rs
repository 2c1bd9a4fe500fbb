//! Packaging driver.
//!
//! A [`Packager`] owns the read cache and the source reader and turns one
//! [`PackageRequest`] into a finished segment: it builds the header, then
//! drives the frame pipeline, filling the cache whenever it reports
//! [`vodpack_media::Progress::Pending`].

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vodpack_common::EncryptionScheme;
use vodpack_media::mp4::{self, InitParams, InitProtection, InitSegment};
use vodpack_media::{
    build_segment, mkv, run_to_completion, segment_size, Container, ReadCache, SegmentRequest, Sequence,
    SourceReader, WriteBuffer,
};

use crate::config::PackagerConfig;

/// What a request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// DASH media segment of a single track.
    Mp4Fragment,
    /// Interleaved fragment of several tracks.
    Mp4Muxed,
    /// WebM cluster of a single track.
    WebmCluster,
    /// ISOBMFF initialization segment.
    Mp4Init,
    /// WebM initialization segment.
    WebmInit,
}

impl OutputFormat {
    fn container(self) -> Option<Container> {
        match self {
            Self::Mp4Fragment => Some(Container::Mp4Fragment),
            Self::Mp4Muxed => Some(Container::Mp4Muxed),
            Self::WebmCluster => Some(Container::WebmCluster),
            Self::Mp4Init | Self::WebmInit => None,
        }
    }

    /// Whether the output is an initialization segment.
    pub fn is_init(self) -> bool {
        self.container().is_none()
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Mp4Fragment => "mp4_fragment",
            Self::Mp4Muxed => "mp4_muxed",
            Self::WebmCluster => "webm_cluster",
            Self::Mp4Init => "mp4_init",
            Self::WebmInit => "webm_init",
        };
        f.write_str(name)
    }
}

/// One segment to produce.
#[derive(Debug, Clone)]
pub struct PackageRequest {
    pub sequences: Vec<Sequence>,
    pub format: OutputFormat,
    pub segment_index: u32,
    pub discontinuity: bool,
    pub scheme: EncryptionScheme,
    pub clear_lead: bool,
}

impl PackageRequest {
    /// Clear request for `sequences`.
    pub fn new(sequences: Vec<Sequence>, format: OutputFormat, segment_index: u32) -> Self {
        Self {
            sequences,
            format,
            segment_index,
            discontinuity: false,
            scheme: EncryptionScheme::None,
            clear_lead: false,
        }
    }

    pub fn with_scheme(mut self, scheme: EncryptionScheme) -> Self {
        self.scheme = scheme;
        self
    }
}

/// A produced segment.
#[derive(Debug, Clone)]
pub struct PackagedSegment {
    pub format: OutputFormat,
    pub data: Bytes,
}

impl PackagedSegment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct Packager<R> {
    config: PackagerConfig,
    cache: ReadCache,
    reader: R,
}

impl<R: SourceReader> Packager<R> {
    pub fn new(config: PackagerConfig, reader: R) -> Result<Self> {
        let mut cache = ReadCache::new(config.cache.buffer_size, config.cache.alignment)
            .context("Failed to create read cache")?;
        cache.allocate_slots(config.cache.slot_count);
        if !config.output.reuse_buffers {
            cache.disable_buffer_reuse();
        }

        Ok(Self { config, cache, reader })
    }

    pub fn config(&self) -> &PackagerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Produce the requested segment.
    pub fn run(&mut self, request: &PackageRequest) -> Result<PackagedSegment> {
        let data = match request.format.container() {
            None => self
                .init(request, false)?
                .into_bytes()
                .context("Init segment was not built")?
                .freeze(),
            Some(container) => self.media_segment(request, container)?,
        };

        info!(format = %request.format, segment = request.segment_index, size = data.len(), "Packaged segment");
        Ok(PackagedSegment {
            format: request.format,
            data,
        })
    }

    /// Size of the requested segment without producing it.
    pub fn size_only(&mut self, request: &PackageRequest) -> Result<u64> {
        let size = match request.format.container() {
            None => self.init(request, true)?.total_size() as u64,
            Some(container) => {
                let segment_request = self.segment_request(request, container);
                self.cache.allocate_slots(request.sequences.len());
                segment_size(&segment_request, &mut self.cache, &mut self.reader)?
            }
        };

        debug!(format = %request.format, size, "Computed segment size");
        Ok(size)
    }

    fn segment_request<'r>(&self, request: &'r PackageRequest, container: Container) -> SegmentRequest<'r> {
        SegmentRequest {
            sequences: &request.sequences,
            container,
            scheme: request.scheme,
            segment_index: request.segment_index,
            clear_lead: request.clear_lead,
            reuse_buffers: self.config.output.reuse_buffers,
            single_nalu_per_frame: self.config.output.single_nalu_per_frame,
            discontinuity: request.discontinuity,
        }
    }

    fn media_segment(&mut self, request: &PackageRequest, container: Container) -> Result<Bytes> {
        let segment_request = self.segment_request(request, container);
        self.cache.allocate_slots(request.sequences.len());

        let mut out = WriteBuffer::with_block_size(Vec::new(), self.config.output.write_buffer_size);
        let expected = {
            let mut segment = build_segment(&segment_request, &mut out, false)?;
            run_to_completion(&mut segment, &mut self.cache, &mut self.reader)?;
            segment.total_size()
        };
        let data = out.into_inner()?;

        if let Some(expected) = expected {
            if expected != data.len() as u64 {
                bail!("Segment size {} differs from the announced size {}", data.len(), expected);
            }
        }
        Ok(Bytes::from(data))
    }

    fn init(&self, request: &PackageRequest, size_only: bool) -> Result<InitSegment> {
        if request.format == OutputFormat::WebmInit {
            let [sequence] = request.sequences.as_slice() else {
                bail!("WebM init segments hold one track, got {}", request.sequences.len());
            };
            let key_id = match request.scheme {
                EncryptionScheme::None => None,
                EncryptionScheme::Cenc => Some(sequence.drm()?.key_id),
                EncryptionScheme::Cbcs => bail!("cbcs is not supported for WebM"),
            };
            let track_uid = u64::from(sequence.first_track()?.media_info.track_id);
            return Ok(mkv::init_segment(sequence, track_uid, key_id, size_only)?);
        }

        let protection = match request.scheme {
            EncryptionScheme::None => None,
            scheme => {
                let drm = request
                    .sequences
                    .first()
                    .context("Init segment without tracks")?
                    .drm()?;
                Some(InitProtection {
                    scheme,
                    key_id: drm.key_id,
                    constant_iv: (scheme == EncryptionScheme::Cbcs).then(|| drm.iv_seed()),
                    clear_lead: request.clear_lead,
                })
            }
        };
        let params = InitParams {
            iso5_brand: false,
            protection,
        };
        Ok(mp4::init_segment(&request.sequences, &params, size_only)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use vodpack_common::{CodecId, MediaType, SourceId};
    use vodpack_media::media::{AudioInfo, VideoInfo};
    use vodpack_media::{DrmInfo, Frame, FramePart, MediaInfo, SourceRef, Track};

    const SOURCE: SourceId = SourceId::new(0);

    fn aac_info() -> MediaInfo {
        MediaInfo {
            media_type: MediaType::Audio,
            codec: CodecId::Aac,
            track_id: 1,
            timescale: 48000,
            duration: 48000,
            duration_millis: 1000,
            codec_delay: 0,
            extra_data: vec![0x11, 0x90],
            bitrate: 128_000,
            video: VideoInfo::default(),
            audio: AudioInfo {
                channels: 2,
                bits_per_sample: 16,
                sample_rate: 48000,
                object_type_id: 0x40,
            },
        }
    }

    fn audio_sequence() -> Sequence {
        let frames = (0..4)
            .map(|i| Frame {
                offset: i * 100,
                size: 100,
                duration: 1024,
                pts_delay: 0,
                key_frame: true,
            })
            .collect();
        let track = Track::new(aac_info(), vec![FramePart::new(SourceRef::File(SOURCE), frames)]);
        Sequence::new(0, vec![track])
    }

    fn source_data() -> Vec<u8> {
        (0..400u32).map(|i| (i % 251) as u8).collect()
    }

    fn packager() -> Packager<HashMap<SourceId, Vec<u8>>> {
        let mut config = PackagerConfig::default();
        config.cache.buffer_size = 1024;
        config.cache.alignment = 16;
        config.output.write_buffer_size = 128;
        Packager::new(config, HashMap::from([(SOURCE, source_data())])).unwrap()
    }

    fn drm() -> DrmInfo {
        DrmInfo {
            key: [7; 16],
            key_id: [9; 16],
            iv: None,
        }
    }

    #[test]
    fn test_clear_fragment() {
        let mut packager = packager();
        let request = PackageRequest::new(vec![audio_sequence()], OutputFormat::Mp4Fragment, 1);

        let segment = packager.run(&request).unwrap();
        assert_eq!(&segment.data[4..8], b"styp");
        assert!(segment.data.ends_with(&source_data()));
        assert_eq!(packager.size_only(&request).unwrap(), segment.len() as u64);
        assert_eq!(packager.cache().reads_issued(), 1);
    }

    #[test]
    fn test_cenc_fragment_size_matches() {
        let mut packager = packager();
        let request = PackageRequest::new(vec![audio_sequence().with_drm(drm())], OutputFormat::Mp4Fragment, 2)
            .with_scheme(EncryptionScheme::Cenc);

        let segment = packager.run(&request).unwrap();
        assert!(!segment.data.ends_with(&source_data()));
        assert_eq!(packager.size_only(&request).unwrap(), segment.len() as u64);
    }

    #[test]
    fn test_muxed_single_track() {
        let mut packager = packager();
        let request = PackageRequest::new(vec![audio_sequence()], OutputFormat::Mp4Muxed, 1);

        let segment = packager.run(&request).unwrap();
        assert!(segment.data.ends_with(&source_data()));
        assert_eq!(packager.size_only(&request).unwrap(), segment.len() as u64);
    }

    #[test]
    fn test_webm_cluster() {
        let mut packager = packager();
        let request = PackageRequest::new(vec![audio_sequence()], OutputFormat::WebmCluster, 1);

        let segment = packager.run(&request).unwrap();
        assert_eq!(&segment.data[..4], &[0x1f, 0x43, 0xb6, 0x75]);
        assert_eq!(packager.size_only(&request).unwrap(), segment.len() as u64);
    }

    #[test]
    fn test_init_segments() {
        let mut packager = packager();

        let request = PackageRequest::new(vec![audio_sequence()], OutputFormat::Mp4Init, 0);
        let init = packager.run(&request).unwrap();
        assert_eq!(&init.data[4..8], b"ftyp");
        assert_eq!(packager.size_only(&request).unwrap(), init.len() as u64);

        let request = PackageRequest::new(vec![audio_sequence().with_drm(drm())], OutputFormat::WebmInit, 0)
            .with_scheme(EncryptionScheme::Cenc);
        let init = packager.run(&request).unwrap();
        assert_eq!(&init.data[..4], &[0x1a, 0x45, 0xdf, 0xa3]);
        assert!(init.data.windows(16).any(|w| w == [9; 16]));
    }

    #[test]
    fn test_cbcs_init_needs_drm() {
        let mut packager = packager();
        let request =
            PackageRequest::new(vec![audio_sequence()], OutputFormat::Mp4Init, 0).with_scheme(EncryptionScheme::Cbcs);
        assert!(packager.run(&request).is_err());
    }

    #[test]
    fn test_webm_init_single_track() {
        let mut packager = packager();
        let request = PackageRequest::new(vec![audio_sequence(), audio_sequence()], OutputFormat::WebmInit, 0);
        let err = packager.run(&request).unwrap_err();
        assert!(err.to_string().contains("one track"));
    }

    #[test]
    fn test_output_format_names() {
        let format: OutputFormat = serde_json::from_str(r#""webm_cluster""#).unwrap();
        assert_eq!(format, OutputFormat::WebmCluster);
        assert_eq!(OutputFormat::Mp4Init.to_string(), "mp4_init");
        assert!(OutputFormat::WebmInit.is_init());
        assert!(!OutputFormat::Mp4Muxed.is_init());
    }
}
