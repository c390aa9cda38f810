#![allow(dead_code)]

use criterion::measurement::WallTime;
use criterion::BenchmarkGroup;
use std::path::Path;
use std::time::Duration;

pub const SIZES_SMALL: &[usize] = &[8192, 65536];
pub const SIZES_ALL: &[usize] = &[8192, 65536, 4_194_304];
pub const SIZES_LARGE: &[usize] = &[262_144, 4_194_304];

pub fn cap(group: &mut BenchmarkGroup<'_, WallTime>) {
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(10);
}

/// Corpus bytes from `samples/` when present, repeated to `size`; otherwise
/// synthetic text.
pub fn get_test_data(size: usize) -> Vec<u8> {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));

    for name in ["alice29.txt", "cantrbry.tar"] {
        let path = manifest.join("samples").join(name);
        if let Ok(base) = std::fs::read(&path) {
            if !base.is_empty() {
                return base.iter().copied().cycle().take(size).collect();
            }
        }
    }

    let pattern = b"The quick brown fox jumps over the lazy dog. ";
    let full = pattern.repeat((size / pattern.len()) + 1);
    full[..size].to_vec()
}
