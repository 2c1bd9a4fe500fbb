//! Core type definitions for tracks, codecs and encryption.
//!
//! All enums serialize in lowercase so job descriptions and configuration
//! files can name them directly (`"video"`, `"hevc"`, `"cbcs"`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Kind of elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Video track.
    Video,
    /// Audio track.
    Audio,
    /// Subtitle track.
    Subtitle,
}

impl MediaType {
    /// Number of media types; sizes per-type tables such as cache slots.
    pub const COUNT: usize = 3;

    /// Dense index, used as the read cache slot id of a stream.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
            Self::Subtitle => 2,
        }
    }

    /// ISOBMFF handler type.
    #[must_use]
    pub const fn handler_type(self) -> [u8; 4] {
        match self {
            Self::Video => *b"vide",
            Self::Audio => *b"soun",
            Self::Subtitle => *b"subt",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Subtitle => write!(f, "subtitle"),
        }
    }
}

impl FromStr for MediaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "subtitle" | "text" => Ok(Self::Subtitle),
            other => Err(Error::UnknownMediaType(other.to_string())),
        }
    }
}

/// Codec of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    /// H.264 / AVC.
    Avc,
    /// H.265 / HEVC.
    Hevc,
    /// VP8.
    Vp8,
    /// VP9.
    Vp9,
    /// AV1.
    Av1,
    /// AAC.
    Aac,
    /// MPEG-1 Layer 3.
    Mp3,
    /// Dolby Digital.
    Ac3,
    /// Dolby Digital Plus.
    Eac3,
    /// DTS.
    Dts,
    /// Vorbis.
    Vorbis,
    /// Opus.
    Opus,
    /// FLAC.
    Flac,
    /// WebVTT cues.
    WebVtt,
}

/// Row of the codec table: codec, WebM `CodecID`, MP4 sample entry, whether
/// WebM carries `CodecPrivate` for it.
type CodecRow = (CodecId, Option<&'static str>, Option<[u8; 4]>, bool);

const CODEC_TABLE: &[CodecRow] = &[
    (CodecId::Avc, Some("V_MPEG4/ISO/AVC"), Some(*b"avc1"), true),
    (CodecId::Hevc, Some("V_MPEGH/ISO/HEVC"), Some(*b"hvc1"), true),
    (CodecId::Vp8, Some("V_VP8"), None, false),
    (CodecId::Vp9, Some("V_VP9"), None, false),
    (CodecId::Av1, Some("V_AV1"), None, false),
    (CodecId::Aac, Some("A_AAC"), Some(*b"mp4a"), true),
    (CodecId::Mp3, Some("A_MPEG/L3"), Some(*b"mp4a"), false),
    (CodecId::Vorbis, Some("A_VORBIS"), None, true),
    (CodecId::Opus, Some("A_OPUS"), Some(*b"Opus"), true),
    (CodecId::Ac3, Some("A_AC3"), Some(*b"ac-3"), false),
    (CodecId::Eac3, Some("A_EAC3"), Some(*b"ec-3"), false),
    (CodecId::Dts, Some("A_DTS"), None, true),
    (CodecId::Flac, Some("A_FLAC"), Some(*b"fLaC"), true),
    (CodecId::WebVtt, None, Some(*b"wvtt"), false),
];

impl CodecId {
    fn row(self) -> Option<&'static CodecRow> {
        CODEC_TABLE.iter().find(|row| row.0 == self)
    }

    /// Media type this codec belongs to.
    #[must_use]
    pub const fn media_type(self) -> MediaType {
        match self {
            Self::Avc | Self::Hevc | Self::Vp8 | Self::Vp9 | Self::Av1 => MediaType::Video,
            Self::WebVtt => MediaType::Subtitle,
            _ => MediaType::Audio,
        }
    }

    /// Matroska/WebM `CodecID` string, if the codec can be carried in WebM.
    #[must_use]
    pub fn webm_codec_id(self) -> Option<&'static str> {
        self.row().and_then(|row| row.1)
    }

    /// Whether a WebM track entry carries the codec extra data as `CodecPrivate`.
    #[must_use]
    pub fn webm_has_private_data(self) -> bool {
        self.row().is_some_and(|row| row.3)
    }

    /// ISOBMFF sample entry four-character code.
    #[must_use]
    pub fn sample_entry(self) -> Option<[u8; 4]> {
        self.row().and_then(|row| row.2)
    }

    /// Whether frames of this codec are length-prefixed NAL units.
    #[must_use]
    pub const fn is_nal_based(self) -> bool {
        matches!(self, Self::Avc | Self::Hevc)
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Avc => "avc",
            Self::Hevc => "hevc",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::Ac3 => "ac3",
            Self::Eac3 => "eac3",
            Self::Dts => "dts",
            Self::Vorbis => "vorbis",
            Self::Opus => "opus",
            Self::Flac => "flac",
            Self::WebVtt => "webvtt",
        };
        f.write_str(name)
    }
}

impl FromStr for CodecId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codec = match s.to_ascii_lowercase().as_str() {
            "avc" | "h264" | "avc1" => Self::Avc,
            "hevc" | "h265" | "hvc1" | "hev1" => Self::Hevc,
            "vp8" => Self::Vp8,
            "vp9" => Self::Vp9,
            "av1" => Self::Av1,
            "aac" | "mp4a" => Self::Aac,
            "mp3" => Self::Mp3,
            "ac3" | "ac-3" => Self::Ac3,
            "eac3" | "ec-3" => Self::Eac3,
            "dts" => Self::Dts,
            "vorbis" => Self::Vorbis,
            "opus" => Self::Opus,
            "flac" => Self::Flac,
            "webvtt" | "wvtt" => Self::WebVtt,
            other => return Err(Error::unknown_codec(other)),
        };
        Ok(codec)
    }
}

/// Content protection scheme applied to output segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionScheme {
    /// Clear output.
    #[default]
    None,
    /// Common Encryption, full-sample AES-CTR.
    Cenc,
    /// Common Encryption, pattern AES-CBC.
    Cbcs,
}

impl EncryptionScheme {
    /// `schm` scheme type, `None` for clear output.
    #[must_use]
    pub const fn scheme_type(self) -> Option<[u8; 4]> {
        match self {
            Self::None => None,
            Self::Cenc => Some(*b"cenc"),
            Self::Cbcs => Some(*b"cbcs"),
        }
    }

    /// Whether the scheme encrypts anything.
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Cenc => write!(f, "cenc"),
            Self::Cbcs => write!(f, "cbcs"),
        }
    }
}

impl FromStr for EncryptionScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "clear" => Ok(Self::None),
            "cenc" => Ok(Self::Cenc),
            "cbcs" => Ok(Self::Cbcs),
            other => Err(Error::UnknownScheme(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_serialization() {
        let json = serde_json::to_string(&MediaType::Video).unwrap();
        assert_eq!(json, r#""video""#);

        let mt: MediaType = serde_json::from_str(r#""audio""#).unwrap();
        assert_eq!(mt, MediaType::Audio);
    }

    #[test]
    fn test_media_type_index_is_dense() {
        let indexes = [MediaType::Video, MediaType::Audio, MediaType::Subtitle].map(MediaType::index);
        assert_eq!(indexes, [0, 1, 2]);
        assert!(indexes.iter().all(|&i| i < MediaType::COUNT));
    }

    #[test]
    fn test_codec_webm_table() {
        assert_eq!(CodecId::Hevc.webm_codec_id(), Some("V_MPEGH/ISO/HEVC"));
        assert_eq!(CodecId::Mp3.webm_codec_id(), Some("A_MPEG/L3"));
        assert_eq!(CodecId::WebVtt.webm_codec_id(), None);
        assert!(CodecId::Opus.webm_has_private_data());
        assert!(!CodecId::Ac3.webm_has_private_data());
    }

    #[test]
    fn test_codec_sample_entries() {
        assert_eq!(CodecId::Avc.sample_entry(), Some(*b"avc1"));
        assert_eq!(CodecId::Eac3.sample_entry(), Some(*b"ec-3"));
        assert_eq!(CodecId::Vp9.sample_entry(), None);
    }

    #[test]
    fn test_codec_parse_aliases() {
        assert_eq!("H264".parse::<CodecId>().unwrap(), CodecId::Avc);
        assert_eq!("hev1".parse::<CodecId>().unwrap(), CodecId::Hevc);
        assert!("mpeg2".parse::<CodecId>().is_err());
    }

    #[test]
    fn test_codec_media_type() {
        assert_eq!(CodecId::Av1.media_type(), MediaType::Video);
        assert_eq!(CodecId::Flac.media_type(), MediaType::Audio);
        assert_eq!(CodecId::WebVtt.media_type(), MediaType::Subtitle);
        assert!(CodecId::Hevc.is_nal_based());
        assert!(!CodecId::Vp9.is_nal_based());
    }

    #[test]
    fn test_encryption_scheme() {
        assert_eq!(EncryptionScheme::default(), EncryptionScheme::None);
        assert_eq!(EncryptionScheme::Cbcs.scheme_type(), Some(*b"cbcs"));
        assert!(!EncryptionScheme::None.is_encrypted());
        let scheme: EncryptionScheme = serde_json::from_str(r#""cenc""#).unwrap();
        assert_eq!(scheme, EncryptionScheme::Cenc);
        assert_eq!("clear".parse::<EncryptionScheme>().unwrap(), EncryptionScheme::None);
    }
}
