//! Integration tests for the packaging driver over job files on disk.

mod common;

use assert_matches::assert_matches;
use common::{Fixture, FRAME_COUNT, FRAME_SIZE};
use vodpack::config::{load_config, PackagerConfig};
use vodpack::{Job, OutputFormat, Packager};
use vodpack_common::EncryptionScheme;

fn package(fixture: &Fixture, config: PackagerConfig) -> (Vec<u8>, u64) {
    let job = Job::load(&fixture.job_path).unwrap();
    let request = job.request(&config).unwrap();
    let mut packager = Packager::new(config, job.reader()).unwrap();

    let segment = packager.run(&request).unwrap();
    let size = packager.size_only(&request).unwrap();
    (segment.data.to_vec(), size)
}

fn find(data: &[u8], kind: &[u8]) -> Option<usize> {
    data.windows(kind.len()).position(|w| w == kind)
}

#[test]
fn test_clear_fragment_from_file() {
    let fixture = Fixture::audio("mp4_fragment");
    let (data, size) = package(&fixture, PackagerConfig::default());

    assert_eq!(size, data.len() as u64);
    assert_eq!(&data[4..8], b"styp");
    assert!(find(&data, b"sidx").is_some());
    assert!(find(&data, b"trun").is_some());

    let mdat = find(&data, b"mdat").unwrap();
    assert_eq!(&data[mdat + 4..], &fixture.source[..]);
}

#[test]
fn test_small_cache_still_reads_everything() {
    let fixture = Fixture::audio("mp4_fragment");
    let mut config = PackagerConfig::default();
    config.cache.buffer_size = 64;
    config.cache.alignment = 16;
    config.output.write_buffer_size = 32;
    config.output.reuse_buffers = false;

    let (data, size) = package(&fixture, config);
    assert_eq!(size, data.len() as u64);
    assert!(data.ends_with(&fixture.source));
}

#[test]
fn test_cenc_fragment_from_config_key() {
    let fixture = Fixture::audio("mp4_fragment");
    let config = load_config(&fixture.write_config(&common::cenc_config())).unwrap();
    assert_eq!(config.encryption.scheme, EncryptionScheme::Cenc);

    let (data, size) = package(&fixture, config);
    assert_eq!(size, data.len() as u64);
    assert!(find(&data, b"senc").is_some());
    assert!(find(&data, b"saiz").is_some());
    assert!(!data.ends_with(&fixture.source));
}

#[test]
fn test_clear_lead_writes_clear_frames() {
    let fixture = Fixture::audio("mp4_fragment");
    let mut config = load_config(&fixture.write_config(&common::cenc_config())).unwrap();
    config.encryption.clear_lead = true;

    let (data, size) = package(&fixture, config);
    assert_eq!(size, data.len() as u64);
    assert!(find(&data, b"senc").is_none());
    assert!(data.ends_with(&fixture.source));
}

#[test]
fn test_muxed_tracks() {
    let fixture = Fixture::two_tracks("mp4_muxed");
    let (data, size) = package(&fixture, PackagerConfig::default());

    assert_eq!(size, data.len() as u64);
    let mdat = find(&data, b"mdat").unwrap();
    assert_eq!((data.len() - mdat - 4) as u64, 2 * FRAME_COUNT * FRAME_SIZE);
    assert_eq!(data.windows(4).filter(|w| *w == b"traf").count(), 2);
}

#[test]
fn test_webm_cluster_and_init() {
    let fixture = Fixture::audio("webm_cluster");
    let (cluster, size) = package(&fixture, PackagerConfig::default());
    assert_eq!(size, cluster.len() as u64);
    assert_eq!(&cluster[..4], &[0x1f, 0x43, 0xb6, 0x75]);
    assert!(cluster.len() as u64 > FRAME_COUNT * FRAME_SIZE);

    let config = PackagerConfig::default();
    let job = Job::load(&fixture.job_path).unwrap();
    let mut request = job.request(&config).unwrap();
    request.format = OutputFormat::WebmInit;
    let mut packager = Packager::new(config, job.reader()).unwrap();
    let init = packager.run(&request).unwrap();
    assert_eq!(&init.data[..4], &[0x1a, 0x45, 0xdf, 0xa3]);
    assert!(find(&init.data, b"A_AAC").is_some());
}

#[test]
fn test_mp4_init_with_cenc() {
    let fixture = Fixture::audio("mp4_init");
    let config = load_config(&fixture.write_config(&common::cenc_config())).unwrap();
    let (data, size) = package(&fixture, config);

    assert_eq!(size, data.len() as u64);
    assert_eq!(&data[4..8], b"ftyp");
    assert!(find(&data, b"enca").is_some());
    assert!(find(&data, b"tenc").is_some());
    assert!(find(&data, &hex::decode(common::KEY_ID).unwrap()).is_some());
}

#[test]
fn test_missing_source_file() {
    let fixture = Fixture::audio("mp4_fragment");
    std::fs::remove_file(fixture.path("audio.bin")).unwrap();

    let config = PackagerConfig::default();
    let job = Job::load(&fixture.job_path).unwrap();
    let request = job.request(&config).unwrap();
    let mut packager = Packager::new(config, job.reader()).unwrap();
    assert_matches!(packager.run(&request), Err(_));
    assert_matches!(packager.size_only(&request), Ok(size) if size > FRAME_COUNT * FRAME_SIZE);
}
