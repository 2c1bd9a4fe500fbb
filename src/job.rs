//! Job descriptions.
//!
//! A job is a JSON document naming the source files, the demuxed frame
//! metadata of every sequence and the segment to produce. Source paths are
//! resolved relative to the job file.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vodpack_common::{EncryptionScheme, SourceId};
use vodpack_media::{DrmInfo, FileReader, Frame, FramePart, MediaInfo, SampleProtection, Sequence, SourceRef, Track};

use crate::config::{parse_key, PackagerConfig};
use crate::package::{OutputFormat, PackageRequest};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub format: OutputFormat,

    #[serde(default)]
    pub segment_index: u32,

    #[serde(default)]
    pub discontinuity: bool,

    /// Overrides `[encryption] scheme`
    #[serde(default)]
    pub scheme: Option<EncryptionScheme>,

    /// Overrides `[encryption] clear_lead`
    #[serde(default)]
    pub clear_lead: Option<bool>,

    #[serde(default)]
    pub sources: BTreeMap<SourceId, PathBuf>,

    pub sequences: Vec<SequenceSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SequenceSpec {
    pub clips: Vec<ClipSpec>,

    #[serde(default)]
    pub drm: Option<DrmSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DrmSpec {
    pub key: String,
    pub key_id: String,
    #[serde(default)]
    pub iv: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClipSpec {
    pub media_info: MediaInfo,

    pub parts: Vec<PartSpec>,

    #[serde(default)]
    pub first_frame_index: u32,

    /// Presentation time of the first frame, media timescale
    #[serde(default)]
    pub first_frame_time_offset: u64,

    /// Start of the clip on the sequence timeline, milliseconds
    #[serde(default)]
    pub clip_start_time: u64,

    #[serde(default)]
    pub clip_sequence_offset: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartSpec {
    pub source: PartSource,

    pub frames: Vec<Frame>,

    #[serde(default)]
    pub protection: Option<ProtectionSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartSource {
    /// Frame offsets index into the source with this id.
    File(SourceId),
    /// Frame offsets index into these bytes.
    Memory(#[serde(with = "hex::serde")] Vec<u8>),
}

/// CENC parameters the frames of a part were stored with.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtectionSpec {
    pub key: String,

    #[serde(default = "default_iv_size")]
    pub iv_size: u8,

    #[serde(default)]
    pub use_subsamples: bool,

    #[serde(default)]
    pub default_aux_size: u8,

    #[serde(default)]
    pub aux_sizes: Vec<u8>,

    /// Raw `senc` sample records
    #[serde(with = "hex::serde")]
    pub aux_info: Vec<u8>,
}

fn default_iv_size() -> u8 {
    vodpack_media::media::CENC_IV_SIZE as u8
}

impl Job {
    /// Read a job file and resolve its source paths.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read job file: {:?}", path))?;
        let mut job: Job =
            serde_json::from_str(&content).with_context(|| format!("Failed to parse job file: {:?}", path))?;

        if let Some(base) = path.parent() {
            for source in job.sources.values_mut() {
                if source.is_relative() {
                    *source = base.join(&*source);
                }
            }
        }
        Ok(job)
    }

    /// Reader over the job's source files.
    pub fn reader(&self) -> FileReader {
        let mut reader = FileReader::new();
        for (id, path) in &self.sources {
            reader.add_source(*id, path);
        }
        reader
    }

    /// Build the packaging request, taking unset encryption settings from
    /// `config`.
    pub fn request(&self, config: &PackagerConfig) -> Result<PackageRequest> {
        if self.sequences.is_empty() {
            bail!("Job has no sequences");
        }

        let scheme = self.scheme.unwrap_or(config.encryption.scheme);
        let default_drm = config.encryption.drm_info()?;

        let mut sequences = Vec::with_capacity(self.sequences.len());
        for (index, spec) in self.sequences.iter().enumerate() {
            let sequence = self
                .sequence(index as u32, spec, default_drm)
                .with_context(|| format!("Invalid sequence {index}"))?;
            if scheme.is_encrypted() && sequence.drm.is_none() {
                bail!("Sequence {index} has no key for scheme '{scheme}'");
            }
            sequences.push(sequence);
        }

        Ok(PackageRequest {
            sequences,
            format: self.format,
            segment_index: self.segment_index,
            discontinuity: self.discontinuity,
            scheme,
            clear_lead: self.clear_lead.unwrap_or(config.encryption.clear_lead),
        })
    }

    fn sequence(&self, index: u32, spec: &SequenceSpec, default_drm: Option<DrmInfo>) -> Result<Sequence> {
        if spec.clips.is_empty() {
            bail!("Sequence has no clips");
        }

        let clips = spec
            .clips
            .iter()
            .map(|clip| self.track(clip))
            .collect::<Result<Vec<_>>>()?;

        let mut sequence = Sequence::new(index, clips);
        let drm = match &spec.drm {
            Some(drm) => Some(DrmInfo {
                key: parse_key("key", &drm.key)?,
                key_id: parse_key("key_id", &drm.key_id)?,
                iv: drm.iv.as_deref().map(|iv| parse_key("iv", iv)).transpose()?,
            }),
            None => default_drm,
        };
        if let Some(drm) = drm {
            sequence = sequence.with_drm(drm);
        }
        Ok(sequence)
    }

    fn track(&self, clip: &ClipSpec) -> Result<Track> {
        let parts = clip
            .parts
            .iter()
            .map(|part| self.part(part))
            .collect::<Result<Vec<_>>>()?;

        let mut track = Track::new(clip.media_info.clone(), parts);
        track.first_frame_index = clip.first_frame_index;
        track.first_frame_time_offset = clip.first_frame_time_offset;
        track.clip_start_time = clip.clip_start_time;
        track.clip_sequence_offset = clip.clip_sequence_offset;
        Ok(track)
    }

    fn part(&self, part: &PartSpec) -> Result<FramePart> {
        let source = match &part.source {
            PartSource::File(id) => {
                if !self.sources.contains_key(id) {
                    bail!("Unknown {id}");
                }
                SourceRef::File(*id)
            }
            PartSource::Memory(data) => SourceRef::Memory(Bytes::from(data.clone())),
        };

        let mut frame_part = FramePart::new(source, part.frames.clone());
        if let Some(protection) = &part.protection {
            frame_part = frame_part.with_protection(SampleProtection {
                key: parse_key("protection key", &protection.key)?,
                iv_size: protection.iv_size,
                use_subsamples: protection.use_subsamples,
                default_aux_size: protection.default_aux_size,
                aux_sizes: protection.aux_sizes.clone(),
                aux_info: Bytes::from(protection.aux_info.clone()),
            });
        }
        Ok(frame_part)
    }
}
