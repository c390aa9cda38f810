//! Blob codec: splits a file into fixed-size blobs and codes each one with
//! the device-parallel stream coder plus the sequential residue coder.
//!
//! ```text
//!   blob bytes
//!       │
//!       ▼
//!  ┌──────────┐ per-stream ┌───────────┐  tables  ┌───────────────┐
//!  │  device  │───────────▶│ normalize │─────────▶│ device stream │──▶ words
//!  │ histogram│ partials   │ + cumul.  │          │ coder         │──▶ residues
//!  └──────────┘            └───────────┘          └───────────────┘       │
//!                                                                         ▼
//!                                                       host residue coder ──▶ residual
//! ```
//!
//! Only one blob is resident at a time; a file of `k * blob_size + r` bytes
//! becomes `k` full blobs and, when `r > 0`, one short trailing blob.

pub mod frame;

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::{ComputeContext, StreamEncoding};
use crate::frequency::{self, FrequencyTable};
use crate::rans::{self, slot_words, stream_count, CodingTables};
use crate::{IransError, IransResult};

pub use frame::{first_blob_size, read_blob, write_blob, BLOB_HEADER_SIZE};

/// Largest blob the codec writes or accepts.
pub const MAX_BLOB_SIZE: usize = 1 << 32;

/// Default number of parallel streams per blob.
pub const DEFAULT_STREAMS: usize = 64;

/// Default blob size (100 MiB).
pub const DEFAULT_BLOB_SIZE: usize = 100 << 20;

/// Options controlling how files are split and coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// Streams per full blob.
    pub streams: usize,
    /// Bytes per blob; the last blob of a file may be shorter.
    pub blob_size: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        CodecOptions {
            streams: DEFAULT_STREAMS,
            blob_size: DEFAULT_BLOB_SIZE,
        }
    }
}

impl CodecOptions {
    /// Bytes per stream: `ceil(blob_size / streams)`, at least 1.
    pub fn stride_size(&self) -> usize {
        self.blob_size.div_ceil(self.streams.max(1)).max(1)
    }

    fn validate(&self) -> IransResult<()> {
        if self.streams == 0 {
            return Err(IransError::invalid("stream count must be at least 1"));
        }
        if self.blob_size == 0 || self.blob_size > MAX_BLOB_SIZE {
            return Err(IransError::invalid(format!(
                "blob size must be between 1 and {MAX_BLOB_SIZE} bytes"
            )));
        }
        Ok(())
    }
}

/// One coded blob, as framed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlob {
    pub stride_size: usize,
    pub input_size: usize,
    /// Normalized frequency table shared by both coders.
    pub ftable: FrequencyTable,
    /// Coded words per stream.
    pub output_ns: Vec<u64>,
    /// Uncoded leading symbols per stream.
    pub residues: Vec<u64>,
    /// Stream words, packed back to back in stream order.
    pub words: Vec<u32>,
    /// Residue coder output, final state last.
    pub residual: Vec<u32>,
}

impl EncodedBlob {
    pub fn stream_count(&self) -> usize {
        self.output_ns.len()
    }

    /// Bytes this blob occupies on disk.
    pub fn frame_size(&self) -> u64 {
        let n = self.stream_count() as u64;
        BLOB_HEADER_SIZE as u64
            + 16 * n
            + 4 * self.words.len() as u64
            + 8
            + 4 * self.residual.len() as u64
    }

    /// Symbols left to the residue coder.
    pub fn residue_symbols(&self) -> u64 {
        self.residues.iter().sum()
    }
}

/// Totals for one compress or decompress call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecReport {
    pub blobs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Time spent coding blobs, excluding I/O.
    pub coding_time: Duration,
    pub elapsed: Duration,
}

impl CodecReport {
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            return 1.0;
        }
        self.bytes_out as f64 / self.bytes_in as f64
    }
}

/// Codes blobs and files on the devices of a shared [`ComputeContext`].
#[derive(Debug, Clone)]
pub struct BlobCodec {
    context: Arc<ComputeContext>,
    options: CodecOptions,
}

impl BlobCodec {
    pub fn new(context: Arc<ComputeContext>, options: CodecOptions) -> IransResult<Self> {
        options.validate()?;
        Ok(BlobCodec { context, options })
    }

    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    /// Encode one in-memory blob with the given stream width.
    pub fn encode_blob(&self, input: &[u8], stride_size: usize) -> IransResult<EncodedBlob> {
        if input.len() > MAX_BLOB_SIZE {
            return Err(IransError::invalid(format!(
                "blob of {} bytes exceeds the {MAX_BLOB_SIZE} byte limit",
                input.len()
            )));
        }
        let stride_size = stride_size.max(1);
        let device = self.context.device()?;

        let mut ftable = frequency::sample(device.as_ref(), input, stride_size)?;
        ftable.normalize();
        let tables = CodingTables::new(&ftable)?;

        let encoding = device.encode_streams(input, &tables, stride_size)?;
        let residual = rans::encode_residues(input, &encoding.residues, stride_size, &tables);
        let words = pack_words(&encoding, slot_words(stride_size));

        Ok(EncodedBlob {
            stride_size,
            input_size: input.len(),
            ftable,
            output_ns: encoding.output_ns,
            residues: encoding.residues,
            words,
            residual,
        })
    }

    /// Decode one blob back to its original bytes.
    pub fn decode_blob(&self, blob: &EncodedBlob) -> IransResult<Vec<u8>> {
        let stride_size = blob.stride_size;
        if stride_size == 0 {
            return Err(IransError::corrupt("stride size of zero"));
        }
        let n = stream_count(blob.input_size, stride_size);
        if blob.stream_count() != n || blob.residues.len() != n {
            return Err(IransError::corrupt(format!(
                "blob records {} streams, expected {n}",
                blob.stream_count()
            )));
        }
        let tables = CodingTables::new(&blob.ftable)?;
        let encoding = unpack_words(blob, slot_words(stride_size))?;

        let device = self.context.device()?;
        let mut output = vec![0u8; blob.input_size];
        device.decode_streams(&encoding, &tables, stride_size, &mut output)?;
        rans::decode_residues(
            &mut output,
            &blob.residues,
            stride_size,
            &blob.residual,
            &tables,
        )?;
        Ok(output)
    }

    /// Compress `src` into a new file at `dst`.
    pub fn compress_file(&self, src: &Path, dst: &Path) -> IransResult<CodecReport> {
        check_paths(src, dst)?;
        let len = fs::metadata(src)?.len();
        let reader = BufReader::new(File::open(src)?);
        let mut writer = BufWriter::new(File::create(dst)?);
        let report = self.compress_stream(reader, len, &mut writer)?;
        writer.flush()?;
        tracing::debug!(
            src = %src.display(),
            blobs = report.blobs,
            bytes_in = report.bytes_in,
            bytes_out = report.bytes_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "compressed file"
        );
        Ok(report)
    }

    /// Decompress `src` into a new file at `dst`.
    pub fn decompress_file(&self, src: &Path, dst: &Path) -> IransResult<CodecReport> {
        check_paths(src, dst)?;
        let reader = BufReader::new(File::open(src)?);
        let mut writer = BufWriter::new(File::create(dst)?);
        let report = self.decompress_stream(reader, &mut writer)?;
        writer.flush()?;
        tracing::debug!(
            src = %src.display(),
            blobs = report.blobs,
            bytes_in = report.bytes_in,
            bytes_out = report.bytes_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "decompressed file"
        );
        Ok(report)
    }

    /// Compress exactly `len` bytes from `reader`, one blob at a time.
    pub fn compress_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        len: u64,
        writer: &mut W,
    ) -> IransResult<CodecReport> {
        let start = Instant::now();
        let blob_size = self.options.blob_size;
        let stride_size = self.options.stride_size();
        let blob_count = len.div_ceil(blob_size as u64);

        let mut report = CodecReport {
            bytes_in: len,
            bytes_out: 8,
            ..CodecReport::default()
        };
        frame::write_u64(writer, blob_count)?;

        let mut remaining = len;
        let mut buf = Vec::new();
        while remaining > 0 {
            let take = remaining.min(blob_size as u64) as usize;
            buf.resize(take, 0);
            reader.read_exact(&mut buf).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    IransError::invalid("input ended before its reported length")
                } else {
                    IransError::Io(e)
                }
            })?;
            remaining -= take as u64;
            report.blobs += 1;

            let coded = Instant::now();
            let blob = self.encode_blob(&buf, stride_size)?;
            let took = coded.elapsed();
            report.coding_time += took;
            tracing::debug!(
                blob = report.blobs,
                of = blob_count,
                bytes = take,
                streams = blob.stream_count(),
                residue = blob.residue_symbols(),
                ms = took.as_secs_f64() * 1e3,
                "encoded blob"
            );

            report.bytes_out += write_blob(writer, &blob)?;
        }

        report.elapsed = start.elapsed();
        Ok(report)
    }

    /// Decompress a framed stream, rejecting trailing bytes.
    pub fn decompress_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        writer: &mut W,
    ) -> IransResult<CodecReport> {
        let start = Instant::now();
        let blob_count = frame::read_u64(&mut reader, "blob count")?;
        let mut report = CodecReport {
            bytes_in: 8,
            ..CodecReport::default()
        };

        for index in 1..=blob_count {
            let blob = read_blob(&mut reader)?;
            report.bytes_in += blob.frame_size();

            let coded = Instant::now();
            let bytes = self.decode_blob(&blob)?;
            let took = coded.elapsed();
            report.coding_time += took;
            tracing::debug!(
                blob = index,
                of = blob_count,
                bytes = bytes.len(),
                ms = took.as_secs_f64() * 1e3,
                "decoded blob"
            );

            writer.write_all(&bytes)?;
            report.bytes_out += bytes.len() as u64;
            report.blobs += 1;
        }
        frame::expect_eof(&mut reader)?;

        report.elapsed = start.elapsed();
        Ok(report)
    }
}

/// Preconditions shared by file compression and decompression.
fn check_paths(src: &Path, dst: &Path) -> IransResult<()> {
    if src == dst {
        return Err(IransError::invalid(
            "source and destination cannot be the same",
        ));
    }
    if dst.exists() {
        return Err(IransError::invalid(format!(
            "destination {} already exists",
            dst.display()
        )));
    }
    if !src.is_file() {
        return Err(IransError::invalid(format!(
            "source file {} not found",
            src.display()
        )));
    }
    Ok(())
}

/// Pack each stream's coded words back to back.
fn pack_words(encoding: &StreamEncoding, slot: usize) -> Vec<u32> {
    let total: u64 = encoding.output_ns.iter().sum();
    let mut words = Vec::with_capacity(total as usize);
    for i in 0..encoding.stream_count() {
        words.extend_from_slice(encoding.stream_words(i, slot));
    }
    words
}

/// Spread packed words back into one slot per stream.
fn unpack_words(blob: &EncodedBlob, slot: usize) -> IransResult<StreamEncoding> {
    let n = blob.stream_count();
    let mut words = vec![0u32; n * slot];
    let mut cursor = 0usize;
    for (i, &count) in blob.output_ns.iter().enumerate() {
        let count = count as usize;
        if count > slot {
            return Err(IransError::corrupt(format!(
                "stream {i} has {count} words, slot holds {slot}"
            )));
        }
        let src = blob
            .words
            .get(cursor..cursor + count)
            .ok_or_else(|| IransError::corrupt("stream words shorter than recorded"))?;
        words[i * slot..i * slot + count].copy_from_slice(src);
        cursor += count;
    }
    if cursor != blob.words.len() {
        return Err(IransError::corrupt("stream words longer than recorded"));
    }
    Ok(StreamEncoding {
        words,
        output_ns: blob.output_ns.clone(),
        residues: blob.residues.clone(),
    })
}
