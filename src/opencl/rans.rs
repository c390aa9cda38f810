//! Device contract on OpenCL: per-stream histograms and the per-stream rANS
//! coder, one work-item per stream.

use std::ptr;

use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::types::{cl_int, cl_uint, cl_ulong, CL_BLOCKING};

use super::{device_err, OpenClDevice, FREQ_DIST, INTERLACED_RANS64};
use crate::device::{ComputeDevice, DeviceInfo, StreamEncoding};
use crate::frequency::NUM_SYMBOLS;
use crate::rans::{slot_words, stream_count, CodingTables};
use crate::{IransError, IransResult};

impl OpenClDevice {
    /// Allocate a device buffer of `len` elements (at least one) and, when
    /// `data` is given, upload it.
    fn buffer<T>(&self, flags: u64, len: usize, data: Option<&[T]>) -> IransResult<Buffer<T>> {
        let mut buf = unsafe {
            Buffer::<T>::create(&self.context, flags, len.max(1), ptr::null_mut())
                .map_err(device_err("buffer allocation failed"))?
        };
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            let ev = unsafe {
                self.queue
                    .enqueue_write_buffer(&mut buf, CL_BLOCKING, 0, data, &[])
                    .map_err(device_err("upload failed"))?
            };
            ev.wait().map_err(device_err("upload failed"))?;
            self.profile_event("upload", &ev);
        }
        Ok(buf)
    }

    fn download<T>(&self, buf: &Buffer<T>, out: &mut [T]) -> IransResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        let ev = unsafe {
            self.queue
                .enqueue_read_buffer(buf, CL_BLOCKING, 0, out, &[])
                .map_err(device_err("download failed"))?
        };
        ev.wait().map_err(device_err("download failed"))?;
        self.profile_event("download", &ev);
        Ok(())
    }

    fn kernel(&self, program: &str, entry: &str) -> IransResult<Kernel> {
        let program = self.program(program)?;
        Kernel::create(&program, entry).map_err(device_err("kernel creation failed"))
    }
}

impl ComputeDevice for OpenClDevice {
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
        if n == 0 {
            return Ok(Vec::new());
        }

        let kernel = self.kernel(FREQ_DIST, "run")?;
        let input_buf = self.buffer(CL_MEM_READ_ONLY, input.len(), Some(input))?;
        let output_buf = self.buffer::<cl_ulong>(CL_MEM_WRITE_ONLY, n * NUM_SYMBOLS, None)?;

        let true_size = n as cl_ulong;
        let stride_arg = stride_size as cl_ulong;
        let len_arg = input.len() as cl_ulong;
        let ev = unsafe {
            ExecuteKernel::new(&kernel)
                .set_arg(&input_buf)
                .set_arg(&output_buf)
                .set_arg(&true_size)
                .set_arg(&stride_arg)
                .set_arg(&len_arg)
                .set_global_work_size(n)
                .enqueue_nd_range(&self.queue)
                .map_err(device_err("freq_dist dispatch failed"))?
        };
        ev.wait().map_err(device_err("freq_dist failed"))?;
        self.profile_event("freq_dist", &ev);

        let mut flat = vec![0 as cl_ulong; n * NUM_SYMBOLS];
        self.download(&output_buf, &mut flat)?;

        Ok(flat
            .chunks_exact(NUM_SYMBOLS)
            .map(|chunk| {
                let mut hist = [0u64; NUM_SYMBOLS];
                hist.copy_from_slice(chunk);
                hist
            })
            .collect())
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
        if n == 0 || slot == 0 {
            return Ok(StreamEncoding {
                words: Vec::new(),
                output_ns: vec![0; n],
                residues: input.chunks(stride_size).map(|s| s.len() as u64).collect(),
            });
        }

        let kernel = self.kernel(INTERLACED_RANS64, "encode")?;
        let input_buf = self.buffer(CL_MEM_READ_ONLY, input.len(), Some(input))?;
        let ftable_buf = self.buffer(
            CL_MEM_READ_ONLY,
            NUM_SYMBOLS,
            Some(&tables.frequencies()[..]),
        )?;
        let ctable_buf = self.buffer(
            CL_MEM_READ_ONLY,
            NUM_SYMBOLS,
            Some(&tables.cumulative().starts()[..]),
        )?;
        let words_buf = self.buffer::<cl_uint>(CL_MEM_WRITE_ONLY, n * slot, None)?;
        let ns_buf = self.buffer::<cl_ulong>(CL_MEM_WRITE_ONLY, n, None)?;
        let residues_buf = self.buffer::<cl_ulong>(CL_MEM_WRITE_ONLY, n, None)?;

        let len_arg = input.len() as cl_ulong;
        let true_size = n as cl_ulong;
        let stride_arg = stride_size as cl_ulong;
        let ev = unsafe {
            ExecuteKernel::new(&kernel)
                .set_arg(&input_buf)
                .set_arg(&len_arg)
                .set_arg(&ftable_buf)
                .set_arg(&ctable_buf)
                .set_arg(&words_buf)
                .set_arg(&ns_buf)
                .set_arg(&residues_buf)
                .set_arg(&true_size)
                .set_arg(&stride_arg)
                .set_global_work_size(n)
                .enqueue_nd_range(&self.queue)
                .map_err(device_err("encode dispatch failed"))?
        };
        ev.wait().map_err(device_err("encode failed"))?;
        self.profile_event("interlaced_rans64::encode", &ev);

        let mut encoding = StreamEncoding {
            words: vec![0; n * slot],
            output_ns: vec![0; n],
            residues: vec![0; n],
        };
        self.download(&words_buf, &mut encoding.words)?;
        self.download(&ns_buf, &mut encoding.output_ns)?;
        self.download(&residues_buf, &mut encoding.residues)?;

        // Words past each stream's count are never written or hold scratch
        // from a rolled-back group.
        for (i, &count) in encoding.output_ns.iter().enumerate() {
            let used = (count as usize).min(slot);
            encoding.words[i * slot + used..(i + 1) * slot].fill(0);
        }
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
        if n == 0 {
            return Ok(());
        }

        let kernel = self.kernel(INTERLACED_RANS64, "decode")?;
        let words_buf = self.buffer(
            CL_MEM_READ_ONLY,
            encoding.words.len(),
            Some(&encoding.words[..]),
        )?;
        let ns_buf = self.buffer(CL_MEM_READ_ONLY, n, Some(&encoding.output_ns[..]))?;
        let residues_buf = self.buffer(CL_MEM_READ_ONLY, n, Some(&encoding.residues[..]))?;
        let ftable_buf = self.buffer(
            CL_MEM_READ_ONLY,
            NUM_SYMBOLS,
            Some(&tables.frequencies()[..]),
        )?;
        let ctable_buf = self.buffer(
            CL_MEM_READ_ONLY,
            NUM_SYMBOLS,
            Some(&tables.cumulative().starts()[..]),
        )?;
        // Residue prefixes are left untouched by the kernel, so the buffer
        // starts as a copy of the caller's output.
        let output_buf = self.buffer(CL_MEM_READ_WRITE, output.len(), Some(&*output))?;
        let status_buf = self.buffer::<cl_int>(CL_MEM_WRITE_ONLY, n, None)?;

        let len_arg = output.len() as cl_ulong;
        let true_size = n as cl_ulong;
        let stride_arg = stride_size as cl_ulong;
        let ev = unsafe {
            ExecuteKernel::new(&kernel)
                .set_arg(&words_buf)
                .set_arg(&ns_buf)
                .set_arg(&residues_buf)
                .set_arg(&ftable_buf)
                .set_arg(&ctable_buf)
                .set_arg(&output_buf)
                .set_arg(&len_arg)
                .set_arg(&true_size)
                .set_arg(&stride_arg)
                .set_arg(&status_buf)
                .set_global_work_size(n)
                .enqueue_nd_range(&self.queue)
                .map_err(device_err("decode dispatch failed"))?
        };
        ev.wait().map_err(device_err("decode failed"))?;
        self.profile_event("interlaced_rans64::decode", &ev);

        let mut status = vec![0 as cl_int; n];
        self.download(&status_buf, &mut status)?;
        if let Some((i, &code)) = status.iter().enumerate().find(|(_, &code)| code != 0) {
            let reason = match code {
                1 => "header out of range",
                2 => "coded words exhausted",
                _ => "final state mismatch",
            };
            return Err(IransError::corrupt(format!("stream {i}: {reason}")));
        }

        self.download(&output_buf, output)
    }
}
