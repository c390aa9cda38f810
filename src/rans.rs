//! 64-bit range ANS (rANS) with 32-bit renormalization words.
//!
//! The state lives in `[RANS64_L, RANS64_L << 32)`. Encoding a symbol with
//! frequency `f` and interval start `c` is
//!
//! ```text
//! if x >= ((L >> 24) << 32) * f: emit low32(x); x >>= 32
//! x = (x / f) << 24 + x % f + c
//! ```
//!
//! and decoding is the exact inverse:
//!
//! ```text
//! slot = x & (2^24 - 1);  s = symbol_for(slot)
//! x = f[s] * (x >> 24) + slot - c[s]
//! if x < L: x = (x << 32) | pop_word()
//! ```
//!
//! Words come out of the encoder in the order the decoder needs them
//! reversed, so both coders below treat the word sequence as a stack: the
//! final state is pushed last (low word, then high word) and the decoder
//! pops from the end.
//!
//! Two coders share this core:
//!
//! - [`encode_stream`] / [`decode_stream`]: the per-stream coder that the
//!   compute device runs once per stream, fully independently. It covers a
//!   suffix of the stream, four symbols at a time, and never lets a stream's
//!   output outgrow the stream. What it leaves uncovered is the stream's
//!   residue.
//! - [`encode_residues`] / [`decode_residues`]: one sequential state shared
//!   by the residues of every stream in a blob.

use crate::frequency::{CumulativeTable, FrequencyTable, NUM_SYMBOLS, PROB_SCALE, SCALE_BITS};
use crate::{IransError, IransResult};

/// Lower bound of the normalized rANS state.
pub const RANS64_L: u64 = 1 << 31;

/// Renormalization granularity: the state streams out 32 bits at a time.
const IO_BITS: u32 = 32;

const SCALE_MASK: u64 = PROB_SCALE - 1;

/// Bytes of input per word of per-stream output. Also the group size in
/// which the per-stream coder advances.
pub const WORD_BYTES: usize = 4;

/// Words reserved at the end of every coded sequence for the final state.
const STATE_WORDS: usize = 2;

/// A normalized frequency table together with its cumulative table, in
/// the form the coders consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingTables {
    freq: [u64; NUM_SYMBOLS],
    cum: CumulativeTable,
}

impl CodingTables {
    /// Build coding tables from a normalized frequency table.
    pub fn new(ftable: &FrequencyTable) -> IransResult<Self> {
        if !ftable.is_normalized() {
            return Err(IransError::corrupt(
                "frequency table is not normalized to 2^24",
            ));
        }
        Ok(Self {
            freq: *ftable.counts(),
            cum: ftable.cumulative(),
        })
    }

    #[inline]
    pub fn freq(&self, symbol: u8) -> u64 {
        self.freq[symbol as usize]
    }

    pub fn frequencies(&self) -> &[u64; NUM_SYMBOLS] {
        &self.freq
    }

    pub fn cumulative(&self) -> &CumulativeTable {
        &self.cum
    }
}

/// Renormalization threshold for a symbol of frequency `freq`.
#[inline]
fn upper_bound(freq: u64) -> u64 {
    ((RANS64_L >> SCALE_BITS) << IO_BITS) * freq
}

#[inline]
fn encode_step(state: u64, freq: u64, start: u64) -> u64 {
    ((state / freq) << SCALE_BITS) + (state % freq) + start
}

#[inline]
fn decode_step(state: u64, tables: &CodingTables) -> (u8, u64) {
    let bucket = state & SCALE_MASK;
    let symbol = tables.cum.symbol_for(bucket);
    let next = tables.freq(symbol) * (state >> SCALE_BITS) + bucket - tables.cum.start(symbol);
    (symbol, next)
}

#[inline]
fn push_state(words: &mut [u32], at: usize, state: u64) {
    words[at] = state as u32;
    words[at + 1] = (state >> IO_BITS) as u32;
}

/// Reverse reader over a coded word sequence.
struct WordStack<'a> {
    words: &'a [u32],
    cursor: usize,
}

impl<'a> WordStack<'a> {
    /// Pop the final state off the end of `words`.
    fn open(words: &'a [u32]) -> IransResult<(Self, u64)> {
        if words.len() < STATE_WORDS {
            return Err(IransError::corrupt("coded sequence shorter than its final state"));
        }
        let n = words.len();
        let state = ((words[n - 1] as u64) << IO_BITS) | words[n - 2] as u64;
        if !(RANS64_L..RANS64_L << IO_BITS).contains(&state) {
            return Err(IransError::corrupt("final rANS state out of range"));
        }
        Ok((
            WordStack {
                words,
                cursor: n - STATE_WORDS,
            },
            state,
        ))
    }

    #[inline]
    fn pop(&mut self) -> IransResult<u32> {
        if self.cursor == 0 {
            return Err(IransError::corrupt("rANS word sequence exhausted"));
        }
        self.cursor -= 1;
        Ok(self.words[self.cursor])
    }

    #[inline]
    fn decode(&mut self, state: u64, tables: &CodingTables) -> IransResult<(u8, u64)> {
        let (symbol, mut next) = decode_step(state, tables);
        if next < RANS64_L {
            next = (next << IO_BITS) | self.pop()? as u64;
        }
        Ok((symbol, next))
    }

    /// A well-formed sequence decodes back to the initial state with every
    /// word consumed.
    fn finish(self, state: u64) -> IransResult<()> {
        if self.cursor != 0 {
            return Err(IransError::corrupt(format!(
                "{} rANS words left unconsumed",
                self.cursor
            )));
        }
        if state != RANS64_L {
            return Err(IransError::corrupt("rANS state did not return to its initial value"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-stream coder
// ---------------------------------------------------------------------------

/// Number of output words in a stream slot of `stride_size` bytes.
pub fn slot_words(stride_size: usize) -> usize {
    stride_size / WORD_BYTES
}

/// Number of streams a buffer of `len` bytes splits into.
pub fn stream_count(len: usize, stride_size: usize) -> usize {
    len.div_ceil(stride_size.max(1))
}

/// Outcome of coding one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCode {
    /// Words written to the stream's slot, final state included.
    pub words: usize,
    /// Leading symbols of the stream that were not coded.
    pub residue: usize,
}

/// Encode one stream into `slot`.
///
/// Symbols are consumed from the end of the stream backwards in groups of
/// [`WORD_BYTES`]. The output may use at most `stream.len() / 4` words, two
/// of which hold the final state; a group that would overrun that is
/// discarded and coding stops there. A stream with nothing covered writes
/// no words at all.
pub fn encode_stream(stream: &[u8], tables: &CodingTables, slot: &mut [u32]) -> StreamCode {
    let capacity = slot_words(stream.len()).min(slot.len());
    if capacity <= STATE_WORDS {
        return StreamCode {
            words: 0,
            residue: stream.len(),
        };
    }
    let limit = capacity - STATE_WORDS;
    let aligned = stream.len() - stream.len() % WORD_BYTES;

    let mut state = RANS64_L;
    let mut used = 0usize;
    let mut covered = 0usize;

    'groups: while covered < aligned {
        let end = stream.len() - covered;
        let mut next_state = state;
        let mut next_used = used;
        for &byte in stream[end - WORD_BYTES..end].iter().rev() {
            let freq = tables.freq(byte);
            if next_state >= upper_bound(freq) {
                if next_used == limit {
                    break 'groups;
                }
                slot[next_used] = next_state as u32;
                next_used += 1;
                next_state >>= IO_BITS;
            }
            next_state = encode_step(next_state, freq, tables.cum.start(byte));
        }
        state = next_state;
        used = next_used;
        covered += WORD_BYTES;
    }

    if covered == 0 {
        return StreamCode {
            words: 0,
            residue: stream.len(),
        };
    }

    push_state(slot, used, state);
    StreamCode {
        words: used + STATE_WORDS,
        residue: stream.len() - covered,
    }
}

/// Decode one stream's covered suffix into `out`.
///
/// `words` is exactly the stream's coded words; `out` is the part of the
/// stream after its residue.
pub fn decode_stream(words: &[u32], tables: &CodingTables, out: &mut [u8]) -> IransResult<()> {
    if words.is_empty() {
        if out.is_empty() {
            return Ok(());
        }
        return Err(IransError::corrupt("stream has symbols but no coded words"));
    }
    let (mut stack, mut state) = WordStack::open(words)?;
    for dst in out.iter_mut() {
        let (symbol, next) = stack.decode(state, tables)?;
        *dst = symbol;
        state = next;
    }
    stack.finish(state)
}

// ---------------------------------------------------------------------------
// Sequential residue coder
// ---------------------------------------------------------------------------

/// Encode the residues of every stream of a blob with one shared state.
///
/// Streams are visited in increasing index order; the residue of stream `i`
/// (offsets `[i * stride, i * stride + r)`) is fed from its highest offset
/// down. The final state is appended as two words, low then high.
pub fn encode_residues(
    input: &[u8],
    residues: &[u64],
    stride_size: usize,
    tables: &CodingTables,
) -> Vec<u32> {
    let total: u64 = residues.iter().sum();
    let mut words = Vec::with_capacity(total as usize / WORD_BYTES + STATE_WORDS);
    let mut state = RANS64_L;

    for (i, &residue) in residues.iter().enumerate() {
        let start = i * stride_size;
        for &byte in input[start..start + residue as usize].iter().rev() {
            let freq = tables.freq(byte);
            if state >= upper_bound(freq) {
                words.push(state as u32);
                state >>= IO_BITS;
            }
            state = encode_step(state, freq, tables.cum.start(byte));
        }
    }

    let at = words.len();
    words.resize(at + STATE_WORDS, 0);
    push_state(&mut words, at, state);
    words
}

/// Decode the residues of a blob into `output`.
///
/// The exact mirror of [`encode_residues`]: streams in decreasing index
/// order, each residue from its lowest offset up, words popped from the end.
pub fn decode_residues(
    output: &mut [u8],
    residues: &[u64],
    stride_size: usize,
    words: &[u32],
    tables: &CodingTables,
) -> IransResult<()> {
    let (mut stack, mut state) = WordStack::open(words)?;

    for (i, &residue) in residues.iter().enumerate().rev() {
        let start = i * stride_size;
        let end = start
            .checked_add(residue as usize)
            .filter(|&end| end <= output.len())
            .ok_or_else(|| IransError::corrupt(format!("residue of stream {i} out of bounds")))?;
        for dst in output[start..end].iter_mut() {
            let (symbol, next) = stack.decode(state, tables)?;
            *dst = symbol;
            state = next;
        }
    }

    stack.finish(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random bytes (xorshift64).
    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut x = seed | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect()
    }

    fn text(len: usize) -> Vec<u8> {
        let pattern = b"The quick brown fox jumps over the lazy dog. ";
        pattern.iter().copied().cycle().take(len).collect()
    }

    fn tables_for(input: &[u8]) -> CodingTables {
        let mut table = FrequencyTable::new();
        table.count(input);
        table.normalize();
        CodingTables::new(&table).unwrap()
    }

    fn stream_round_trip(stream: &[u8], tables: &CodingTables) -> StreamCode {
        let mut slot = vec![0u32; slot_words(stream.len())];
        let code = encode_stream(stream, tables, &mut slot);
        assert!(code.words <= slot_words(stream.len()));
        assert_eq!((stream.len() - code.residue) % WORD_BYTES, 0);

        let mut out = vec![0u8; stream.len() - code.residue];
        decode_stream(&slot[..code.words], tables, &mut out).unwrap();
        assert_eq!(out, &stream[code.residue..]);
        code
    }

    #[test]
    fn test_tables_reject_raw_histogram() {
        let mut table = FrequencyTable::new();
        table.count(b"abc");
        assert!(matches!(
            CodingTables::new(&table),
            Err(IransError::CorruptFrame(_))
        ));
    }

    #[test]
    fn test_single_step_inverse() {
        let tables = tables_for(b"aaaabbbcc");
        for &byte in b"abcz\xff\x00" {
            let state = RANS64_L + 12345;
            let encoded = encode_step(state, tables.freq(byte), tables.cum.start(byte));
            let (symbol, decoded) = decode_step(encoded, &tables);
            assert_eq!(symbol, byte);
            assert_eq!(decoded, state);
        }
    }

    #[test]
    fn test_stream_compressible_fully_covered() {
        let input = text(4096);
        let tables = tables_for(&input);
        let code = stream_round_trip(&input, &tables);
        assert_eq!(code.residue, 0);
        assert!(code.words * WORD_BYTES < input.len());
    }

    #[test]
    fn test_stream_unaligned_length_leaves_prefix() {
        let input = text(4099);
        let tables = tables_for(&input);
        let code = stream_round_trip(&input, &tables);
        assert_eq!(code.residue, 3);
    }

    #[test]
    fn test_stream_incompressible_stops_at_capacity() {
        // Noise coded with a text model costs far more than 8 bits a symbol.
        let input = noise(2048, 7);
        let tables = tables_for(&text(4096));
        let code = stream_round_trip(&input, &tables);
        assert!(code.residue > 0);
        assert!(code.words <= slot_words(input.len()));
    }

    #[test]
    fn test_stream_too_short_is_all_residue() {
        let tables = tables_for(b"abcdefgh");
        for len in 0..12 {
            let input = text(len);
            let mut slot = vec![0u32; 4];
            let code = encode_stream(&input, &tables, &mut slot);
            assert_eq!(code.words, 0);
            assert_eq!(code.residue, len);
        }
    }

    #[test]
    fn test_stream_truncated_words_rejected() {
        let input = text(1024);
        let tables = tables_for(&input);
        let mut slot = vec![0u32; slot_words(input.len())];
        let code = encode_stream(&input, &tables, &mut slot);
        assert!(code.words > 3);

        let mut out = vec![0u8; input.len() - code.residue];
        let result = decode_stream(&slot[1..code.words], &tables, &mut out);
        assert!(matches!(result, Err(IransError::CorruptFrame(_))));
    }

    #[test]
    fn test_stream_missing_words_rejected() {
        let tables = tables_for(b"abc");
        let mut out = [0u8; 4];
        assert!(decode_stream(&[], &tables, &mut out).is_err());
        assert!(decode_stream(&[], &tables, &mut []).is_ok());
    }

    fn residue_round_trip(input: &[u8], residues: &[u64], stride: usize) {
        let tables = tables_for(input);
        let words = encode_residues(input, residues, stride, &tables);

        let mut out = vec![0u8; input.len()];
        decode_residues(&mut out, residues, stride, &words, &tables).unwrap();
        for (i, &r) in residues.iter().enumerate() {
            let start = i * stride;
            let end = start + r as usize;
            assert_eq!(&out[start..end], &input[start..end], "stream {i}");
        }
    }

    #[test]
    fn test_residues_all_zero() {
        let input = text(1000);
        let tables = tables_for(&input);
        let residues = vec![0u64; 10];
        let words = encode_residues(&input, &residues, 100, &tables);
        assert_eq!(words.len(), 2);
        let mut out = vec![0u8; input.len()];
        decode_residues(&mut out, &residues, 100, &words, &tables).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_residues_single_stream_full_stride() {
        let input = noise(777, 3);
        residue_round_trip(&input, &[777], 777);
    }

    #[test]
    fn test_residues_mixed_distribution() {
        let input = noise(1000, 11);
        let residues = [0u64, 3, 100, 0, 1, 57, 99, 100, 2, 0];
        residue_round_trip(&input, &residues, 100);
    }

    #[test]
    fn test_residues_short_last_stream() {
        let input = text(250);
        residue_round_trip(&input, &[7, 100, 50], 100);
    }

    #[test]
    fn test_residues_out_of_bounds_rejected() {
        let input = text(100);
        let tables = tables_for(&input);
        let words = encode_residues(&input, &[10], 100, &tables);
        let mut out = vec![0u8; 50];
        let result = decode_residues(&mut out, &[0, 10], 100, &words, &tables);
        assert!(matches!(result, Err(IransError::CorruptFrame(_))));
    }

    #[test]
    fn test_residues_wrong_counts_detected() {
        let input = noise(400, 5);
        let tables = tables_for(&input);
        let words = encode_residues(&input, &[100, 100], 200, &tables);
        let mut out = vec![0u8; input.len()];
        // Claiming fewer residues than were coded leaves words behind.
        let result = decode_residues(&mut out, &[50, 100], 200, &words, &tables);
        assert!(result.is_err());
    }
}
