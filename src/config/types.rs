use serde::{Deserialize, Serialize};
use vodpack_common::EncryptionScheme;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PackagerConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub encryption: EncryptionConfig,
}

/// Read cache sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Size of each read buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Number of read buffers; grown to one per stream for muxed output
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,

    /// Read offsets are aligned down to this boundary (power of two)
    #[serde(default = "default_alignment")]
    pub alignment: usize,
}

fn default_buffer_size() -> usize {
    256 * 1024
}
fn default_slot_count() -> usize {
    2
}
fn default_alignment() -> usize {
    512
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            slot_count: default_slot_count(),
            alignment: default_alignment(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Recycle read buffers between cache misses
    #[serde(default = "default_true")]
    pub reuse_buffers: bool,

    /// Every video frame holds exactly one NAL unit; enables the cheaper
    /// CENC video path with sizes known up front
    #[serde(default)]
    pub single_nalu_per_frame: bool,

    /// Output is handed out in blocks of this size
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

fn default_true() -> bool {
    true
}
fn default_write_buffer_size() -> usize {
    vodpack_media::write::DEFAULT_WRITE_BUFFER_SIZE
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            reuse_buffers: true,
            single_nalu_per_frame: false,
            write_buffer_size: default_write_buffer_size(),
        }
    }
}

/// Default protection applied to sequences that carry no key of their own.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub scheme: EncryptionScheme,

    /// Content key, 32 hex digits
    #[serde(default)]
    pub key: Option<String>,

    /// Key id, 32 hex digits
    #[serde(default)]
    pub key_id: Option<String>,

    /// IV seed, 32 hex digits; derived from the key id when unset
    #[serde(default)]
    pub iv: Option<String>,

    /// Write segments clear while signalling the encrypted sample entry
    #[serde(default)]
    pub clear_lead: bool,
}
