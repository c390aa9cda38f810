//! End-to-end codec throughput benchmarks.
//!
//! Measures `compress_stream` / `decompress_stream` throughput in MB/s for
//! the host device at a few stream counts, and for the first OpenCL GPU when
//! built with `--features opencl`.
//!
//! All groups enforce warm_up_time(2s) + measurement_time(5s) + sample_size(10)
//! to keep total runtime bounded.

#[path = "stages_common.rs"]
mod stages_common;

use std::io::Cursor;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use irans::blob::{BlobCodec, CodecOptions};
use irans::device::{ComputeContext, HostDevice};
use stages_common::{cap, get_test_data, SIZES_LARGE};

const STREAM_COUNTS: &[usize] = &[1, 16, 64];

fn host_codec(streams: usize, blob_size: usize) -> BlobCodec {
    let context = Arc::new(ComputeContext::with_devices(vec![Arc::new(HostDevice::new(0))]));
    BlobCodec::new(context, CodecOptions { streams, blob_size }).unwrap()
}

fn compress(codec: &BlobCodec, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    codec
        .compress_stream(Cursor::new(data), data.len() as u64, &mut out)
        .unwrap();
    out
}

fn bench_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress");
    cap(&mut group);
    for &size in SIZES_LARGE {
        let data = get_test_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        for &streams in STREAM_COUNTS {
            let codec = host_codec(streams, size);
            group.bench_with_input(
                BenchmarkId::new(format!("host_{streams}"), size),
                &data,
                |b, data| b.iter(|| compress(&codec, data)),
            );
        }
    }
    group.finish();
}

fn bench_decompress(c: &mut Criterion) {
    let mut group = c.benchmark_group("decompress");
    cap(&mut group);
    for &size in SIZES_LARGE {
        let data = get_test_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        for &streams in STREAM_COUNTS {
            let codec = host_codec(streams, size);
            let packed = compress(&codec, &data);
            group.bench_with_input(
                BenchmarkId::new(format!("host_{streams}"), size),
                &packed,
                |b, packed| {
                    b.iter(|| {
                        let mut out = Vec::with_capacity(size);
                        codec.decompress_stream(Cursor::new(packed), &mut out).unwrap();
                        out
                    })
                },
            );
        }
    }
    group.finish();
}

#[cfg(feature = "opencl")]
fn bench_compress_gpu(c: &mut Criterion) {
    use irans::device::DeviceClass;

    let context = ComputeContext::load(DeviceClass::Gpu);
    if context.is_empty() {
        eprintln!("no OpenCL GPU, skipping compress_gpu");
        return;
    }
    let context = Arc::new(context);

    let mut group = c.benchmark_group("compress_gpu");
    cap(&mut group);
    for &size in SIZES_LARGE {
        let data = get_test_data(size);
        let codec = BlobCodec::new(
            Arc::clone(&context),
            CodecOptions {
                streams: 1024,
                blob_size: size,
            },
        )
        .unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("opencl_1024", size), &data, |b, data| {
            b.iter(|| compress(&codec, data))
        });
    }
    group.finish();
}

#[cfg(not(feature = "opencl"))]
fn bench_compress_gpu(_c: &mut Criterion) {}

criterion_group!(benches, bench_compress, bench_decompress, bench_compress_gpu);
criterion_main!(benches);
