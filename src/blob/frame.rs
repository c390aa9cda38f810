//! On-disk framing of compressed files.
//!
//! ```text
//! u64 blob_count
//! per blob:
//!   u64 stream_count, u64 stride_size, u64 input_size
//!   256 x u64 normalized frequencies
//!   stream_count x u64 output_ns
//!   stream_count x u64 input_residues
//!   sum(output_ns) x u32 stream words, packed in stream order
//!   u64 residual_size
//!   residual_size x u32 residue words
//! ```
//!
//! All integers are little-endian. Every length is checked against the
//! others before anything is allocated from it.

use std::io::{self, Read, Write};

use super::{EncodedBlob, MAX_BLOB_SIZE};
use crate::frequency::{FrequencyTable, NUM_SYMBOLS};
use crate::rans::{slot_words, stream_count};
use crate::{IransError, IransResult};

/// Fixed bytes of a blob frame ahead of its variable sections.
pub const BLOB_HEADER_SIZE: usize = 3 * 8 + NUM_SYMBOLS * 8;

/// Words written per `write_all` call when serializing word arrays.
const WORD_CHUNK: usize = 16 * 1024;

pub(crate) fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_u64s<W: Write>(writer: &mut W, values: &[u64]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(WORD_CHUNK * 8);
    for chunk in values.chunks(WORD_CHUNK) {
        buf.clear();
        for v in chunk {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        writer.write_all(&buf)?;
    }
    Ok(())
}

fn write_u32s<W: Write>(writer: &mut W, values: &[u32]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(WORD_CHUNK * 4);
    for chunk in values.chunks(WORD_CHUNK) {
        buf.clear();
        for v in chunk {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        writer.write_all(&buf)?;
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes; running out of input is a corrupt frame.
fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> IransResult<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            IransError::corrupt(format!("truncated {what}"))
        } else {
            IransError::Io(e)
        }
    })
}

pub(crate) fn read_u64<R: Read>(reader: &mut R, what: &str) -> IransResult<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, what)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u64s<R: Read>(reader: &mut R, count: usize, what: &str) -> IransResult<Vec<u64>> {
    let mut bytes = vec![0u8; count * 8];
    read_exact(reader, &mut bytes, what)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect())
}

fn read_u32s<R: Read>(reader: &mut R, count: usize, what: &str) -> IransResult<Vec<u32>> {
    let mut bytes = vec![0u8; count * 4];
    read_exact(reader, &mut bytes, what)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Serialize one blob. Returns the number of bytes written.
pub fn write_blob<W: Write>(writer: &mut W, blob: &EncodedBlob) -> IransResult<u64> {
    write_u64(writer, blob.stream_count() as u64)?;
    write_u64(writer, blob.stride_size as u64)?;
    write_u64(writer, blob.input_size as u64)?;
    write_u64s(writer, blob.ftable.counts())?;
    write_u64s(writer, &blob.output_ns)?;
    write_u64s(writer, &blob.residues)?;
    write_u32s(writer, &blob.words)?;
    write_u64(writer, blob.residual.len() as u64)?;
    write_u32s(writer, &blob.residual)?;
    Ok(blob.frame_size())
}

/// Parse one blob, rejecting any frame whose fields disagree.
pub fn read_blob<R: Read>(reader: &mut R) -> IransResult<EncodedBlob> {
    let n = read_u64(reader, "blob header")?;
    let stride_size = read_u64(reader, "blob header")?;
    let input_size = read_u64(reader, "blob header")?;

    if input_size > MAX_BLOB_SIZE as u64 {
        return Err(IransError::corrupt(format!(
            "blob of {input_size} bytes exceeds the {MAX_BLOB_SIZE} byte limit"
        )));
    }
    if stride_size == 0 || stride_size > MAX_BLOB_SIZE as u64 {
        return Err(IransError::corrupt(format!("stride size {stride_size} out of range")));
    }
    let input_size = input_size as usize;
    let stride_size = stride_size as usize;
    let expected = stream_count(input_size, stride_size);
    if n != expected as u64 {
        return Err(IransError::corrupt(format!(
            "{n} streams recorded for a {input_size} byte blob with stride {stride_size} \
             (expected {expected})"
        )));
    }
    let n = expected;

    let mut counts = [0u64; NUM_SYMBOLS];
    counts.copy_from_slice(&read_u64s(reader, NUM_SYMBOLS, "frequency table")?);
    let ftable = FrequencyTable::from_counts(counts);
    if !ftable.is_normalized() {
        return Err(IransError::corrupt("frequency table is not normalized"));
    }

    let output_ns = read_u64s(reader, n, "stream word counts")?;
    let residues = read_u64s(reader, n, "stream residues")?;

    let slot = slot_words(stride_size) as u64;
    let mut total_words = 0u64;
    let mut total_residue = 0u64;
    for (i, (&words, &residue)) in output_ns.iter().zip(residues.iter()).enumerate() {
        let len = stream_len(i, input_size, stride_size) as u64;
        if words > slot || residue > len {
            return Err(IransError::corrupt(format!("stream {i} header out of range")));
        }
        total_words += words;
        total_residue += residue;
    }
    let words = read_u32s(reader, total_words as usize, "stream words")?;

    // One residue symbol emits at most one word, plus the final state.
    let residual_size = read_u64(reader, "residual size")?;
    if residual_size > total_residue + 2 {
        return Err(IransError::corrupt(format!(
            "{residual_size} residue words for {total_residue} residue symbols"
        )));
    }
    let residual = read_u32s(reader, residual_size as usize, "residue words")?;

    Ok(EncodedBlob {
        stride_size,
        input_size,
        ftable,
        output_ns,
        residues,
        words,
        residual,
    })
}

/// Length of stream `index` in a blob of `input_size` bytes.
pub(crate) fn stream_len(index: usize, input_size: usize, stride_size: usize) -> usize {
    let start = index * stride_size;
    input_size.saturating_sub(start).min(stride_size)
}

/// Uncompressed size of the first blob of a compressed stream, read from
/// its header alone.
///
/// Every blob but the last holds the same number of bytes, so this bounds
/// the memory one blob of the stream decodes into. An empty stream is 0.
pub fn first_blob_size<R: Read>(reader: &mut R) -> IransResult<u64> {
    if read_u64(reader, "blob count")? == 0 {
        return Ok(0);
    }
    let _streams = read_u64(reader, "blob header")?;
    let _stride = read_u64(reader, "blob header")?;
    let input_size = read_u64(reader, "blob header")?;
    if input_size > MAX_BLOB_SIZE as u64 {
        return Err(IransError::corrupt(format!(
            "blob of {input_size} bytes exceeds the {MAX_BLOB_SIZE} byte limit"
        )));
    }
    Ok(input_size)
}

/// Fail if `reader` has any bytes left.
pub(crate) fn expect_eof<R: Read>(reader: &mut R) -> IransResult<()> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(()),
            Ok(_) => return Err(IransError::corrupt("trailing bytes after the last blob")),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(IransError::Io(e)),
        }
    }
}
