#[path = "stages_common.rs"]
mod stages_common;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use irans::device::{ComputeDevice, HostDevice};
use irans::frequency::{self, FrequencyTable};
use irans::rans::{self, CodingTables};
use stages_common::{cap, get_test_data, SIZES_ALL};

const STRIDE: usize = 4096;

fn tables_for(data: &[u8]) -> CodingTables {
    let mut table = FrequencyTable::new();
    table.count(data);
    table.normalize();
    CodingTables::new(&table).unwrap()
}

fn bench_histogram(c: &mut Criterion) {
    let mut group = c.benchmark_group("histogram");
    cap(&mut group);
    let device = HostDevice::new(0);
    for &size in SIZES_ALL {
        let data = get_test_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("single", size), &data, |b, data| {
            b.iter(|| frequency::histogram(data));
        });
        group.bench_with_input(BenchmarkId::new("per_stream", size), &data, |b, data| {
            b.iter(|| frequency::sample(&device, data, STRIDE).unwrap());
        });
    }
    group.finish();
}

fn bench_stream_coder(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_coder");
    cap(&mut group);
    let device = HostDevice::new(0);
    for &size in SIZES_ALL {
        let data = get_test_data(size);
        let tables = tables_for(&data);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &data, |b, data| {
            b.iter(|| device.encode_streams(data, &tables, STRIDE).unwrap());
        });

        let encoding = device.encode_streams(&data, &tables, STRIDE).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoding, |b, enc| {
            let mut out = vec![0u8; size];
            b.iter(|| device.decode_streams(enc, &tables, STRIDE, &mut out).unwrap());
        });
    }
    group.finish();
}

fn bench_residue_coder(c: &mut Criterion) {
    let mut group = c.benchmark_group("residue_coder");
    cap(&mut group);
    for &size in SIZES_ALL {
        let data = get_test_data(size);
        let tables = tables_for(&data);
        // Whole input as one residue: the sequential worst case.
        let residues = [size as u64];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &data, |b, data| {
            b.iter(|| rans::encode_residues(data, &residues, size, &tables));
        });

        let words = rans::encode_residues(&data, &residues, size, &tables);
        group.bench_with_input(BenchmarkId::new("decode", size), &words, |b, words| {
            let mut out = vec![0u8; size];
            b.iter(|| rans::decode_residues(&mut out, &residues, size, words, &tables).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_histogram, bench_stream_coder, bench_residue_coder);
criterion_main!(benches);
