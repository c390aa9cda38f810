//! How many parallel streams a file gets.

use std::fmt;

/// Bytes of input per stream the size heuristic aims for.
pub const BYTES_PER_STREAM: u64 = 1024;

/// Inputs to a stream-count decision, sampled under the budget lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub file_size: u64,
    /// Budget bytes free before this file's reservation.
    pub headroom: u64,
    pub budget: u64,
    pub max_streams: usize,
    pub workers: usize,
}

/// Chooses the stream count for one file.
pub trait StreamCountPolicy: Send + Sync + fmt::Debug {
    /// Must return a value in `1..=max(1, request.max_streams)`.
    fn stream_count(&self, request: &StreamRequest) -> usize;
}

/// Scales the stream count with the free share of the byte budget and with
/// file size, never going below an even split of `max_streams` across the
/// workers.
///
/// ```text
/// floor   = max(1, max_streams / workers)
/// scaled  = max_streams * headroom / budget
/// by_size = file_size / 1024
/// count   = clamp(min(scaled, by_size), floor, max_streams)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadroomPolicy;

impl StreamCountPolicy for HeadroomPolicy {
    fn stream_count(&self, r: &StreamRequest) -> usize {
        let max_streams = r.max_streams.max(1);
        let floor = (max_streams / r.workers.max(1)).max(1);
        let scaled = (max_streams as u128 * r.headroom as u128 / r.budget.max(1) as u128) as u64;
        let by_size = r.file_size / BYTES_PER_STREAM;
        let count = scaled.min(by_size).min(max_streams as u64) as usize;
        count.clamp(floor, max_streams)
    }
}

/// Always the same stream count, capped at `max_streams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPolicy(pub usize);

impl StreamCountPolicy for FixedPolicy {
    fn stream_count(&self, r: &StreamRequest) -> usize {
        self.0.clamp(1, r.max_streams.max(1))
    }
}
