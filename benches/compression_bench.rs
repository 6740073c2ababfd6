#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use linkwire::config::MAX_FRAME_SIZE;
use linkwire::utils::compression::{
    compress, decode_tagged, decompress, encode_tagged, CompressionKind,
};

fn sample(size: usize) -> Vec<u8> {
    b"linkwire chunk payload ".iter().copied().cycle().take(size).collect()
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");
    let sizes = [512usize, 4096, 65536, 1024 * 1024];

    for &size in &sizes {
        let data = sample(size);
        group.throughput(Throughput::Bytes(size as u64));

        for (label, kind) in [("lz4", CompressionKind::Lz4), ("zstd", CompressionKind::Zstd)] {
            group.bench_function(format!("{}_compress_{}b", label, size), |b| {
                b.iter_batched(
                    || data.clone(),
                    |d| {
                        let _ = compress(&d, kind).unwrap();
                    },
                    BatchSize::SmallInput,
                )
            });
            group.bench_function(format!("{}_decompress_{}b", label, size), |b| {
                let compressed = compress(&data, kind).unwrap();
                b.iter(|| {
                    let out = decompress(&compressed, kind, MAX_FRAME_SIZE).unwrap();
                    assert_eq!(out.len(), data.len());
                })
            });
        }

        group.bench_function(format!("tagged_roundtrip_{}b", size), |b| {
            b.iter(|| {
                let encoded = encode_tagged(&data, CompressionKind::Lz4, 512).unwrap();
                let decoded = decode_tagged(&encoded).unwrap();
                assert_eq!(decoded.len(), data.len());
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
