//! Frequency analysis for the rANS model.
//!
//! A blob is modelled by a single zero-order histogram. The histogram is
//! sampled per stream on the compute device and merged here, then
//! normalized so that its entries sum to exactly [`PROB_SCALE`] with no
//! zero-probability symbols, and finally turned into a cumulative table for
//! interval lookup.

use crate::device::ComputeDevice;
use crate::IransResult;

/// Number of symbols in the byte alphabet.
pub const NUM_SYMBOLS: usize = 256;

/// Precision of the normalized table: frequencies sum to `1 << SCALE_BITS`.
pub const SCALE_BITS: u32 = 24;

/// Total probability mass of a normalized table.
pub const PROB_SCALE: u64 = 1 << SCALE_BITS;

/// Per-symbol occurrence counts, raw or normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyTable {
    counts: [u64; NUM_SYMBOLS],
}

impl FrequencyTable {
    /// Create a new, zeroed frequency table.
    pub fn new() -> Self {
        Self {
            counts: [0u64; NUM_SYMBOLS],
        }
    }

    pub fn from_counts(counts: [u64; NUM_SYMBOLS]) -> Self {
        Self { counts }
    }

    /// Add the byte counts of `input` to the table.
    pub fn count(&mut self, input: &[u8]) {
        self.merge(&histogram(input));
    }

    /// Add a partial histogram to the table.
    pub fn merge(&mut self, partial: &[u64; NUM_SYMBOLS]) {
        for (dst, &src) in self.counts.iter_mut().zip(partial.iter()) {
            *dst += src;
        }
    }

    /// Get the count for a specific byte value.
    pub fn get(&self, byte: u8) -> u64 {
        self.counts[byte as usize]
    }

    pub fn counts(&self) -> &[u64; NUM_SYMBOLS] {
        &self.counts
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Rescale the table in place so that it sums to exactly [`PROB_SCALE`]
    /// and every symbol keeps at least one slot.
    ///
    /// Every symbol receives one guaranteed unit plus a share of the
    /// remaining `PROB_SCALE - 256` proportional to `count + 1`. Flooring
    /// leaves fewer than 256 units unassigned; they go to the lowest symbol
    /// indices, one each.
    pub fn normalize(&mut self) {
        let total = NUM_SYMBOLS as u128 + self.counts.iter().map(|&c| c as u128).sum::<u128>();
        let capacity = PROB_SCALE - NUM_SYMBOLS as u64;

        let mut allocated = 0u64;
        for count in self.counts.iter_mut() {
            let share = ((*count as u128 + 1) * capacity as u128 / total) as u64;
            allocated += share;
            *count = 1 + share;
        }

        let remainder = (capacity - allocated) as usize;
        debug_assert!(remainder < NUM_SYMBOLS);
        for count in self.counts.iter_mut().take(remainder) {
            *count += 1;
        }

        debug_assert!(self.is_normalized());
    }

    /// Whether the table satisfies the normalized-form invariant.
    pub fn is_normalized(&self) -> bool {
        // Tables read back from disk may hold arbitrary values.
        let total = self
            .counts
            .iter()
            .try_fold(0u64, |acc, &c| acc.checked_add(c));
        self.counts.iter().all(|&c| c >= 1) && total == Some(PROB_SCALE)
    }

    /// Build the cumulative table for a normalized frequency table.
    pub fn cumulative(&self) -> CumulativeTable {
        CumulativeTable::build(self)
    }
}

impl Default for FrequencyTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Count byte occurrences in one chunk.
///
/// Uses four interleaved banks so consecutive equal bytes don't serialize
/// on the same counter.
pub fn histogram(input: &[u8]) -> [u64; NUM_SYMBOLS] {
    let mut banks = [[0u32; NUM_SYMBOLS]; 4];
    let mut flushed = [0u64; NUM_SYMBOLS];

    // u32 banks overflow past 4G bytes per bank; flush well before that.
    for block in input.chunks(1 << 30) {
        let mut quads = block.chunks_exact(4);
        for q in &mut quads {
            banks[0][q[0] as usize] += 1;
            banks[1][q[1] as usize] += 1;
            banks[2][q[2] as usize] += 1;
            banks[3][q[3] as usize] += 1;
        }
        for &b in quads.remainder() {
            banks[0][b as usize] += 1;
        }
        for bank in banks.iter_mut() {
            for (dst, src) in flushed.iter_mut().zip(bank.iter_mut()) {
                *dst += *src as u64;
                *src = 0;
            }
        }
    }

    flushed
}

/// Sum per-stream partial histograms into one table.
pub fn merge_histograms(partials: &[[u64; NUM_SYMBOLS]]) -> FrequencyTable {
    let mut table = FrequencyTable::new();
    for partial in partials {
        table.merge(partial);
    }
    table
}

/// Sample the raw histogram of `input` on `device`, one partial count per
/// `stride_size` chunk, merged on the host.
pub fn sample(
    device: &dyn ComputeDevice,
    input: &[u8],
    stride_size: usize,
) -> IransResult<FrequencyTable> {
    if input.is_empty() {
        return Ok(FrequencyTable::new());
    }
    let partials = device.histograms(input, stride_size)?;
    Ok(merge_histograms(&partials))
}

/// Exclusive prefix sums of a normalized frequency table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CumulativeTable {
    starts: [u64; NUM_SYMBOLS],
}

impl CumulativeTable {
    pub fn build(ftable: &FrequencyTable) -> Self {
        let mut starts = [0u64; NUM_SYMBOLS];
        let mut running = 0u64;
        for (start, &freq) in starts.iter_mut().zip(ftable.counts.iter()) {
            *start = running;
            running += freq;
        }
        Self { starts }
    }

    /// Start of the interval owned by `symbol`.
    pub fn start(&self, symbol: u8) -> u64 {
        self.starts[symbol as usize]
    }

    pub fn starts(&self) -> &[u64; NUM_SYMBOLS] {
        &self.starts
    }

    /// Find the symbol whose interval contains `bucket`.
    ///
    /// Returns the last symbol whose start is `<= bucket`. `starts[0]` is
    /// always 0, so the search never falls off the low end, and every bucket
    /// at or above `starts[255]` resolves to 255.
    pub fn symbol_for(&self, bucket: u64) -> u8 {
        let upper = self.starts.partition_point(|&start| start <= bucket);
        (upper.max(1) - 1) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(input: &[u8]) -> FrequencyTable {
        let mut table = FrequencyTable::new();
        table.count(input);
        table.normalize();
        table
    }

    #[test]
    fn test_empty_input() {
        let mut table = FrequencyTable::new();
        table.count(&[]);
        assert_eq!(table.total(), 0);
        assert!(table.counts().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_known_frequencies() {
        let mut table = FrequencyTable::new();
        table.count(b"aaabbc");
        assert_eq!(table.get(b'a'), 3);
        assert_eq!(table.get(b'b'), 2);
        assert_eq!(table.get(b'c'), 1);
        assert_eq!(table.total(), 6);
    }

    #[test]
    fn test_histogram_unaligned_tail() {
        let input: Vec<u8> = (0..=255u8).cycle().take(1027).collect();
        let hist = histogram(&input);
        assert_eq!(hist.iter().sum::<u64>(), 1027);
        assert_eq!(hist[0], 5);
        assert_eq!(hist[2], 5);
        assert_eq!(hist[3], 4);
    }

    #[test]
    fn test_merge_histograms_sums_partials() {
        let parts: Vec<[u64; NUM_SYMBOLS]> = b"hello world"
            .chunks(3)
            .map(histogram)
            .collect();
        let merged = merge_histograms(&parts);
        let mut direct = FrequencyTable::new();
        direct.count(b"hello world");
        assert_eq!(merged, direct);
    }

    #[test]
    fn test_normalize_empty_is_uniform() {
        let mut table = FrequencyTable::new();
        table.normalize();
        assert!(table.counts().iter().all(|&c| c == 65536));
        assert_eq!(table.total(), PROB_SCALE);
    }

    #[test]
    fn test_normalize_skewed() {
        let table = normalized(&[7u8; 100_000]);
        assert!(table.is_normalized());
        assert!(table.get(7) > PROB_SCALE / 2);
        assert_eq!(table.counts().iter().filter(|&&c| c >= 1).count(), NUM_SYMBOLS);
    }

    #[test]
    fn test_normalize_preserves_order() {
        let table = normalized(b"aaaaabbbcc");
        assert!(table.get(b'a') > table.get(b'b'));
        assert!(table.get(b'b') > table.get(b'c'));
        assert!(table.get(b'c') > table.get(b'd'));
    }

    #[test]
    fn test_normalize_remainder_goes_to_low_symbols() {
        // Three equally frequent symbols leave a rounding shortfall that is
        // dispersed from symbol 0 upward.
        let mut counts = [0u64; NUM_SYMBOLS];
        counts[10] = 1;
        counts[20] = 1;
        counts[30] = 1;
        let mut table = FrequencyTable::from_counts(counts);
        table.normalize();
        assert!(table.is_normalized());
        assert!(table.get(0) >= table.get(255));
        assert!(table.get(0) - table.get(255) <= 1);
    }

    #[test]
    fn test_normalize_large_counts() {
        let mut counts = [0u64; NUM_SYMBOLS];
        counts[0] = u32::MAX as u64 * 16;
        counts[255] = 3;
        let mut table = FrequencyTable::from_counts(counts);
        table.normalize();
        assert!(table.is_normalized());
    }

    #[test]
    fn test_cumulative_invariants() {
        let table = normalized(b"the quick brown fox jumps over the lazy dog");
        let cum = table.cumulative();
        assert_eq!(cum.start(0), 0);
        for s in 0..NUM_SYMBOLS - 1 {
            assert_eq!(cum.starts()[s + 1] - cum.starts()[s], table.counts()[s]);
        }
        assert_eq!(cum.start(255) + table.get(255), PROB_SCALE);
    }

    #[test]
    fn test_symbol_for_interval_edges() {
        let table = normalized(b"aaaabbbbccccdddd");
        let cum = table.cumulative();
        for s in 0..=255u8 {
            let start = cum.start(s);
            let end = start + table.get(s);
            assert_eq!(cum.symbol_for(start), s);
            assert_eq!(cum.symbol_for(end - 1), s);
        }
    }

    #[test]
    fn test_symbol_for_top_interval() {
        let table = normalized(&[255u8; 64]);
        let cum = table.cumulative();
        assert_eq!(cum.symbol_for(cum.start(255)), 255);
        assert_eq!(cum.symbol_for(PROB_SCALE - 1), 255);
        assert_eq!(cum.symbol_for(cum.start(255) - 1), 254);
    }
}
