//! WebM initialization segment: EBML header and a Segment holding Info and
//! a single TrackEntry.

use bytes::BufMut;
use tracing::debug;
use vodpack_common::MediaType;

use super::ebml::{self, Binary, Float, Master, Uint};
use crate::error::{Error, Result};
use crate::layout::{Emitter, Layout, Measured};
use crate::media::{MediaInfo, Sequence};
use crate::mp4::init::InitSegment;

/// Nanoseconds per block timecode unit (1 ms)
pub const TIMECODE_SCALE: u64 = 1_000_000;

const WRITING_APP: &[u8] = concat!("vodpack ", env!("CARGO_PKG_VERSION")).as_bytes();

const TRACK_TYPE_VIDEO: u64 = 1;
const TRACK_TYPE_AUDIO: u64 = 2;

const CONTENT_ENCODING_SCOPE_FRAMES: u64 = 1;
const CONTENT_ENCODING_TYPE_ENCRYPTION: u64 = 1;
const CONTENT_ENC_ALGO_AES: u64 = 5;
const AES_CIPHER_MODE_CTR: u64 = 1;

#[derive(Debug, Clone)]
struct Info {
    duration_millis: f64,
}

impl Info {
    fn children(&self) -> (Uint, Float, Binary<'static>, Binary<'static>) {
        (
            Uint {
                id: ebml::ID_TIMECODE_SCALE,
                value: TIMECODE_SCALE,
            },
            Float {
                id: ebml::ID_DURATION,
                value: self.duration_millis,
            },
            Binary {
                id: ebml::ID_MUXING_APP,
                data: WRITING_APP,
            },
            Binary {
                id: ebml::ID_WRITING_APP,
                data: WRITING_APP,
            },
        )
    }
}

impl Layout for Info {
    fn size(&self) -> usize {
        self.children().size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        self.children().write(out);
    }
}

#[derive(Debug, Clone, Copy)]
struct VideoSettings {
    width: u16,
    height: u16,
}

impl VideoSettings {
    fn children(&self) -> [Uint; 2] {
        [
            Uint {
                id: ebml::ID_PIXEL_WIDTH,
                value: u64::from(self.width),
            },
            Uint {
                id: ebml::ID_PIXEL_HEIGHT,
                value: u64::from(self.height),
            },
        ]
    }
}

impl Layout for VideoSettings {
    fn size(&self) -> usize {
        self.children().size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        self.children().write(out);
    }
}

#[derive(Debug, Clone, Copy)]
struct AudioSettings {
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
}

impl AudioSettings {
    fn bit_depth(&self) -> Option<Uint> {
        (self.bits_per_sample != 0).then(|| Uint {
            id: ebml::ID_BIT_DEPTH,
            value: u64::from(self.bits_per_sample),
        })
    }

    fn frequency(&self) -> Float {
        Float {
            id: ebml::ID_SAMPLING_FREQUENCY,
            value: f64::from(self.sample_rate),
        }
    }

    fn channels(&self) -> Uint {
        Uint {
            id: ebml::ID_CHANNELS,
            value: u64::from(self.channels),
        }
    }
}

impl Layout for AudioSettings {
    fn size(&self) -> usize {
        self.frequency().size() + self.channels().size() + self.bit_depth().size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        self.frequency().write(out);
        self.channels().write(out);
        self.bit_depth().write(out);
    }
}

/// ContentEncoding announcing AES-CTR encrypted frames.
#[derive(Debug, Clone, Copy)]
struct ContentEncoding {
    key_id: [u8; 16],
}

impl ContentEncoding {
    fn encryption(&self) -> Master<(Uint, Binary<'_>, Master<Uint>)> {
        Master {
            id: ebml::ID_CONTENT_ENCRYPTION,
            body: (
                Uint {
                    id: ebml::ID_CONTENT_ENC_ALGO,
                    value: CONTENT_ENC_ALGO_AES,
                },
                Binary {
                    id: ebml::ID_CONTENT_ENC_KEY_ID,
                    data: &self.key_id,
                },
                Master {
                    id: ebml::ID_CONTENT_ENC_AES_SETTINGS,
                    body: Uint {
                        id: ebml::ID_AES_SETTINGS_CIPHER_MODE,
                        value: AES_CIPHER_MODE_CTR,
                    },
                },
            ),
        }
    }

    fn fields(&self) -> [Uint; 3] {
        [
            Uint {
                id: ebml::ID_CONTENT_ENCODING_ORDER,
                value: 0,
            },
            Uint {
                id: ebml::ID_CONTENT_ENCODING_SCOPE,
                value: CONTENT_ENCODING_SCOPE_FRAMES,
            },
            Uint {
                id: ebml::ID_CONTENT_ENCODING_TYPE,
                value: CONTENT_ENCODING_TYPE_ENCRYPTION,
            },
        ]
    }
}

impl Layout for ContentEncoding {
    fn size(&self) -> usize {
        self.fields().size() + self.encryption().size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        self.fields().write(out);
        self.encryption().write(out);
    }
}

#[derive(Debug, Clone)]
enum TrackSettings {
    Video(Master<VideoSettings>),
    Audio(Master<AudioSettings>),
}

impl TrackSettings {
    fn track_type(&self) -> Uint {
        let value = match self {
            Self::Video(_) => TRACK_TYPE_VIDEO,
            Self::Audio(_) => TRACK_TYPE_AUDIO,
        };
        Uint {
            id: ebml::ID_TRACK_TYPE,
            value,
        }
    }
}

impl Layout for TrackSettings {
    fn size(&self) -> usize {
        self.track_type().size()
            + match self {
                Self::Video(video) => video.size(),
                Self::Audio(audio) => audio.size(),
            }
    }

    fn write(&self, out: &mut Emitter<'_>) {
        self.track_type().write(out);
        match self {
            Self::Video(video) => video.write(out),
            Self::Audio(audio) => audio.write(out),
        }
    }
}

#[derive(Debug, Clone)]
struct TrackEntry {
    track_uid: u64,
    codec_id: &'static str,
    codec_delay: u64,
    codec_private: Vec<u8>,
    settings: TrackSettings,
    encoding: Option<Master<Master<ContentEncoding>>>,
}

impl TrackEntry {
    fn from_media_info(info: &MediaInfo, track_uid: u64, key_id: Option<[u8; 16]>) -> Result<Self> {
        let codec_id = info
            .codec
            .webm_codec_id()
            .ok_or_else(|| Error::unsupported(format!("codec {} cannot be carried in webm", info.codec)))?;
        if info.codec.webm_has_private_data() && info.extra_data.is_empty() {
            return Err(Error::bad_data(format!("{} track without codec private data", info.codec)));
        }

        let settings = match info.media_type {
            MediaType::Video => TrackSettings::Video(Master {
                id: ebml::ID_VIDEO,
                body: VideoSettings {
                    width: info.video.width,
                    height: info.video.height,
                },
            }),
            MediaType::Audio => TrackSettings::Audio(Master {
                id: ebml::ID_AUDIO,
                body: AudioSettings {
                    sample_rate: info.audio.sample_rate,
                    channels: info.audio.channels,
                    bits_per_sample: info.audio.bits_per_sample,
                },
            }),
            MediaType::Subtitle => return Err(Error::unsupported("subtitle tracks in webm")),
        };

        Ok(Self {
            track_uid,
            codec_id,
            codec_delay: info.codec_delay,
            codec_private: info.extra_data.clone(),
            settings,
            encoding: key_id.map(|key_id| Master {
                id: ebml::ID_CONTENT_ENCODINGS,
                body: Master {
                    id: ebml::ID_CONTENT_ENCODING,
                    body: ContentEncoding { key_id },
                },
            }),
        })
    }

    fn ids(&self) -> [Uint; 2] {
        [
            // one track per segment
            Uint {
                id: ebml::ID_TRACK_NUMBER,
                value: 1,
            },
            Uint {
                id: ebml::ID_TRACK_UID,
                value: self.track_uid,
            },
        ]
    }

    fn codec(&self) -> (Binary<'_>, Option<Uint>, Option<Binary<'_>>) {
        (
            Binary {
                id: ebml::ID_CODEC_ID,
                data: self.codec_id.as_bytes(),
            },
            (self.codec_delay != 0).then(|| Uint {
                id: ebml::ID_CODEC_DELAY,
                value: self.codec_delay,
            }),
            (!self.codec_private.is_empty()).then(|| Binary {
                id: ebml::ID_CODEC_PRIVATE,
                data: &self.codec_private,
            }),
        )
    }
}

impl Layout for TrackEntry {
    fn size(&self) -> usize {
        let (codec_id, delay, private) = self.codec();
        self.ids().size()
            + codec_id.size()
            + delay.size()
            + private.size()
            + self.settings.size()
            + self.encoding.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        let (codec_id, delay, private) = self.codec();
        self.ids().write(out);
        codec_id.write(out);
        delay.write(out);
        private.write(out);
        self.settings.write(out);
        self.encoding.write(out);
    }
}

#[derive(Debug, Clone)]
struct WebmInit {
    segment: Master<(Master<Info>, Master<Master<TrackEntry>>)>,
}

impl Layout for WebmInit {
    fn size(&self) -> usize {
        ebml::WEBM_HEADER.len() + self.segment.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        out.put_slice(&ebml::WEBM_HEADER);
        self.segment.write(out);
    }
}

/// Build the WebM init segment of one sequence. `key_id` adds the
/// ContentEncodings of an encrypted track.
pub fn init_segment(
    sequence: &Sequence,
    track_uid: u64,
    key_id: Option<[u8; 16]>,
    size_only: bool,
) -> Result<InitSegment> {
    let info = &sequence.first_track()?.media_info;
    let duration_millis: u64 = sequence.clips.iter().map(|c| c.media_info.duration_millis).sum();

    let entry = TrackEntry::from_media_info(info, track_uid, key_id)?;
    let layout = Measured::new(WebmInit {
        segment: Master {
            id: ebml::ID_SEGMENT,
            body: (
                Master {
                    id: ebml::ID_INFO,
                    body: Info {
                        duration_millis: duration_millis as f64,
                    },
                },
                Master {
                    id: ebml::ID_TRACKS,
                    body: Master {
                        id: ebml::ID_TRACK_ENTRY,
                        body: entry,
                    },
                },
            ),
        },
    });

    let total_size = layout.size();
    debug!(
        sequence = sequence.index,
        total_size,
        encrypted = key_id.is_some(),
        "webm init segment built"
    );

    let bytes = if size_only { None } else { Some(layout.emit()?) };
    Ok(InitSegment::new(bytes, total_size))
}
