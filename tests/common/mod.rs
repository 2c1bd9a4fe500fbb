//! Shared fixtures for integration tests.
//!
//! [`Fixture`] writes a source file and a JSON job describing its frames
//! into a temporary directory, the way an upstream demuxer would hand
//! them to the packager.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tempfile::TempDir;

pub const FRAME_COUNT: u64 = 8;
pub const FRAME_SIZE: u64 = 50;

pub const KEY: &str = "00112233445566778899aabbccddeeff";
pub const KEY_ID: &str = "0123456789abcdef0123456789abcdef";

/// A job file and its source in a temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub job_path: PathBuf,
    pub source: Vec<u8>,
}

impl Fixture {
    /// Single AAC track read from `audio.bin`.
    pub fn audio(format: &str) -> Self {
        Self::with_job(format, vec![audio_sequence(2, 0)])
    }

    /// Two AAC tracks interleaved from the same source.
    pub fn two_tracks(format: &str) -> Self {
        Self::with_job(format, vec![audio_sequence(1, 0), audio_sequence(2, 10)])
    }

    pub fn with_job(format: &str, sequences: Vec<Value>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let source = source_data();
        std::fs::write(dir.path().join("audio.bin"), &source).expect("failed to write source");

        let job = json!({
            "format": format,
            "segment_index": 1,
            "sources": { "0": "audio.bin" },
            "sequences": sequences,
        });
        let job_path = dir.path().join("job.json");
        std::fs::write(&job_path, serde_json::to_vec_pretty(&job).expect("job serializes"))
            .expect("failed to write job");

        Self { dir, job_path, source }
    }

    /// Write `contents` as `vodpack.toml` next to the job.
    pub fn write_config(&self, contents: &str) -> PathBuf {
        write_config(self.dir.path(), contents)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("vodpack.toml");
    std::fs::write(&path, contents).expect("failed to write config");
    path
}

/// Config enabling CENC with the fixture key.
pub fn cenc_config() -> String {
    format!(
        r#"
        [encryption]
        scheme = "cenc"
        key = "{KEY}"
        key_id = "{KEY_ID}"
        "#
    )
}

pub fn source_data() -> Vec<u8> {
    (0..FRAME_COUNT * FRAME_SIZE).map(|i| (i * 7 % 256) as u8).collect()
}

/// AAC track whose frames are every frame of `audio.bin`, starting
/// `start_ms` into the sequence.
pub fn audio_sequence(track_id: u32, start_ms: u64) -> Value {
    let frames: Vec<Value> = (0..FRAME_COUNT)
        .map(|i| {
            json!({
                "offset": i * FRAME_SIZE,
                "size": FRAME_SIZE,
                "duration": 1024,
                "key_frame": true,
            })
        })
        .collect();

    json!({
        "clips": [{
            "media_info": {
                "media_type": "audio",
                "codec": "aac",
                "track_id": track_id,
                "timescale": 48000,
                "duration": FRAME_COUNT * 1024,
                "duration_millis": FRAME_COUNT * 1024 * 1000 / 48000,
                "extra_data": "1190",
                "audio": {
                    "channels": 2,
                    "bits_per_sample": 16,
                    "sample_rate": 48000,
                    "object_type_id": 64
                }
            },
            "first_frame_time_offset": start_ms * 48,
            "parts": [{
                "source": { "file": 0 },
                "frames": frames,
            }]
        }]
    })
}
