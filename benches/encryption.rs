//! Benchmarks for encrypted segment packaging
//!
//! Compares clear, CENC and cbcs output for the same audio track.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::HashMap;
use vodpack::{OutputFormat, PackageRequest, Packager, PackagerConfig};
use vodpack_common::{CodecId, EncryptionScheme, MediaType, SourceId};
use vodpack_media::media::{AudioInfo, VideoInfo};
use vodpack_media::{DrmInfo, Frame, FramePart, MediaInfo, Sequence, SourceRef, Track};

const SOURCE: SourceId = SourceId::new(0);
const FRAME_SIZE: u32 = 371;

fn audio_sequence(frame_count: u64) -> Sequence {
    let info = MediaInfo {
        media_type: MediaType::Audio,
        codec: CodecId::Aac,
        track_id: 1,
        timescale: 48000,
        duration: frame_count * 1024,
        duration_millis: frame_count * 1024 * 1000 / 48000,
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
    };
    let frames = (0..frame_count)
        .map(|i| Frame {
            offset: i * u64::from(FRAME_SIZE),
            size: FRAME_SIZE,
            duration: 1024,
            pts_delay: 0,
            key_frame: true,
        })
        .collect();
    let track = Track::new(info, vec![FramePart::new(SourceRef::File(SOURCE), frames)]);
    Sequence::new(0, vec![track]).with_drm(DrmInfo {
        key: [0x2b; 16],
        key_id: [0x7e; 16],
        iv: None,
    })
}

fn bench_schemes(c: &mut Criterion) {
    let mut group = c.benchmark_group("encryption");
    let frame_count = 470u64;
    group.throughput(Throughput::Bytes(frame_count * u64::from(FRAME_SIZE)));

    let data: Vec<u8> = (0..frame_count * u64::from(FRAME_SIZE)).map(|i| i as u8).collect();
    let mut packager = Packager::new(PackagerConfig::default(), HashMap::from([(SOURCE, data)])).unwrap();

    for scheme in [EncryptionScheme::None, EncryptionScheme::Cenc, EncryptionScheme::Cbcs] {
        let request = PackageRequest::new(vec![audio_sequence(frame_count)], OutputFormat::Mp4Fragment, 1)
            .with_scheme(scheme);
        group.bench_function(BenchmarkId::new("mp4_fragment", scheme), |b| {
            b.iter(|| packager.run(black_box(&request)).unwrap());
        });
    }

    let request = PackageRequest::new(vec![audio_sequence(frame_count)], OutputFormat::WebmCluster, 1)
        .with_scheme(EncryptionScheme::Cenc);
    group.bench_function(BenchmarkId::new("webm_cluster", EncryptionScheme::Cenc), |b| {
        b.iter(|| packager.run(black_box(&request)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_schemes);
criterion_main!(benches);
