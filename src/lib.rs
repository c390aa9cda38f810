//! Interlaced rANS: a byte-oriented entropy codec whose hot path runs as many
//! independent rANS streams on a compute device, with a sequential host-side
//! coder for the symbols the parallel stage leaves behind.
//!
//! Layers, bottom up:
//!
//! - [`frequency`]: sampling, normalization and cumulative tables.
//! - [`rans`]: the 64-bit rANS core, the per-stream coder and the residue coder.
//! - [`device`]: the compute context and the device contract.
//! - [`blob`]: per-blob coding and the on-disk framing of compressed files.
//! - [`backup`]: concurrent directory backup/restore with a hash ledger.

pub mod backup;
pub mod blob;
pub mod device;
pub mod digest;
pub mod frequency;
pub mod manifest;
pub mod rans;

#[cfg(feature = "opencl")]
pub mod opencl;

use thiserror::Error;

/// Error types for irans operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IransError {
    /// A precondition of the requested operation does not hold.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Compressed data is truncated or internally inconsistent.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
    /// The hash ledger cannot be parsed.
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),
    /// A compute device call failed.
    #[error("device error: {0}")]
    Device(String),
    /// A compute program failed to build. The build log has already been logged.
    #[error("program '{program}' failed to build on {device}")]
    Build { program: String, device: String },
    /// A pipeline worker panicked.
    #[error("worker failed: {0}")]
    Worker(String),
    /// Filesystem or stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Directory traversal failed.
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

impl IransError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        IransError::InvalidOperation(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        IransError::CorruptFrame(msg.into())
    }
}

pub type IransResult<T> = Result<T, IransError>;
