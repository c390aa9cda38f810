//! Host implementation of the device contract.
//!
//! Streams are split into contiguous batches, one per worker, and each
//! batch runs on a scoped thread. Every stream writes only its own slice of
//! the output buffers, so batches never share mutable state.

use super::{ComputeDevice, DeviceInfo, StreamEncoding};
use crate::frequency::{histogram, NUM_SYMBOLS};
use crate::rans::{decode_stream, encode_stream, slot_words, stream_count, CodingTables};
use crate::{IransError, IransResult};

/// The CPU the process runs on, driven by scoped threads.
#[derive(Debug)]
pub struct HostDevice {
    info: DeviceInfo,
    threads: usize,
}

impl HostDevice {
    /// `threads == 0` uses all available cores.
    pub fn new(threads: usize) -> Self {
        let threads = resolve_thread_count(threads);
        Self::named(&format!("host ({threads} threads)"), threads)
    }

    pub fn named(name: &str, threads: usize) -> Self {
        HostDevice {
            info: DeviceInfo {
                name: name.to_string(),
                vendor: "host".to_string(),
                is_gpu: false,
                compute_units: threads.max(1),
            },
            threads: threads.max(1),
        }
    }

    /// Streams per worker batch.
    fn batch_len(&self, streams: usize) -> usize {
        streams.div_ceil(self.threads).max(1)
    }
}

pub(crate) fn resolve_thread_count(threads: usize) -> usize {
    if threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        threads
    }
}

impl ComputeDevice for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn histograms(
        &self,
        input: &[u8],
        stride_size: usize,
    ) -> IransResult<Vec<[u64; NUM_SYMBOLS]>> {
        let stride_size = stride_size.max(1);
        let n = stream_count(input.len(), stride_size);
        let mut partials = vec![[0u64; NUM_SYMBOLS]; n];
        let batch = self.batch_len(n);

        std::thread::scope(|scope| {
            for (dst, src) in partials
                .chunks_mut(batch)
                .zip(input.chunks(stride_size * batch))
            {
                scope.spawn(move || {
                    for (hist, stream) in dst.iter_mut().zip(src.chunks(stride_size)) {
                        *hist = histogram(stream);
                    }
                });
            }
        });

        Ok(partials)
    }

    fn encode_streams(
        &self,
        input: &[u8],
        tables: &CodingTables,
        stride_size: usize,
    ) -> IransResult<StreamEncoding> {
        let stride_size = stride_size.max(1);
        let n = stream_count(input.len(), stride_size);
        let slot = slot_words(stride_size);

        if slot == 0 {
            // Streams narrower than one word are left entirely to the
            // residue coder.
            return Ok(StreamEncoding {
                words: Vec::new(),
                output_ns: vec![0; n],
                residues: input.chunks(stride_size).map(|s| s.len() as u64).collect(),
            });
        }

        let mut encoding = StreamEncoding {
            words: vec![0u32; n * slot],
            output_ns: vec![0; n],
            residues: vec![0; n],
        };
        let batch = self.batch_len(n);

        std::thread::scope(|scope| {
            let batches = input
                .chunks(stride_size * batch)
                .zip(encoding.words.chunks_mut(slot * batch))
                .zip(encoding.output_ns.chunks_mut(batch))
                .zip(encoding.residues.chunks_mut(batch));
            for (((src, words), output_ns), residues) in batches {
                scope.spawn(move || {
                    for (i, (stream, dst)) in src
                        .chunks(stride_size)
                        .zip(words.chunks_mut(slot))
                        .enumerate()
                    {
                        let code = encode_stream(stream, tables, dst);
                        output_ns[i] = code.words as u64;
                        residues[i] = code.residue as u64;
                    }
                });
            }
        });

        Ok(encoding)
    }

    fn decode_streams(
        &self,
        encoding: &StreamEncoding,
        tables: &CodingTables,
        stride_size: usize,
        output: &mut [u8],
    ) -> IransResult<()> {
        let stride_size = stride_size.max(1);
        let n = stream_count(output.len(), stride_size);
        let slot = slot_words(stride_size);
        if encoding.stream_count() != n || encoding.residues.len() != n {
            return Err(IransError::corrupt(format!(
                "expected {n} streams, found {}",
                encoding.stream_count()
            )));
        }
        if encoding.words.len() < n * slot {
            return Err(IransError::corrupt("stream word buffer too short"));
        }
        if output.is_empty() {
            return Ok(());
        }

        let batch = self.batch_len(n);
        let results: Vec<IransResult<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = output
                .chunks_mut(stride_size * batch)
                .enumerate()
                .map(|(b, dst)| {
                    scope.spawn(move || -> IransResult<()> {
                        for (j, stream) in dst.chunks_mut(stride_size).enumerate() {
                            let i = b * batch + j;
                            let residue = encoding.residues[i] as usize;
                            let words = encoding.output_ns[i] as usize;
                            if residue > stream.len() || words > slot {
                                return Err(IransError::corrupt(format!(
                                    "stream {i} header out of range"
                                )));
                            }
                            decode_stream(
                                encoding.stream_words(i, slot),
                                tables,
                                &mut stream[residue..],
                            )?;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(IransError::Device("host decode worker panicked".into()))
                    })
                })
                .collect()
        });

        results.into_iter().collect()
    }
}
