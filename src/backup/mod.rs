//! Concurrent directory backup and restore.
//!
//! `backup` mirrors a source tree into a new target directory, compressing
//! every regular file to `<name>.irans` and recording a hash ledger
//! ([`MANIFEST_FILE`]). `restore` reverses it and checks every restored file
//! against the ledger.
//!
//! ```text
//!  scan tree ─▶ dispatcher ──permit──▶ worker ──reserve──▶ ByteBudget
//!                   │  (WorkerGate)       │   (policy picks stream count
//!                   │                     │    under the budget lock)
//!                   │                     ▼
//!                   │               BlobCodec on a device from the context
//!                   │                     │
//!                   └─ stops on first ◀───┴─▶ ledger records / validation
//!                      error                  failures, merged under a lock
//! ```
//!
//! Two limits bound the work: a worker count and a budget of uncompressed
//! bytes in flight. Files complete in no particular order.

mod budget;
mod gate;
mod policy;

pub use budget::{ByteBudget, Reservation};
pub use gate::{Permit, WorkerGate};
pub use policy::{FixedPolicy, HeadroomPolicy, StreamCountPolicy, StreamRequest};

use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use walkdir::WalkDir;

use crate::blob::{
    first_blob_size, BlobCodec, CodecOptions, DEFAULT_BLOB_SIZE, DEFAULT_STREAMS, MAX_BLOB_SIZE,
};
use crate::device::{resolve_thread_count, ComputeContext};
use crate::digest::{hash_file, hash_relative_path, Digest};
use crate::manifest::{Manifest, Verdict, MANIFEST_FILE};
use crate::{IransError, IransResult};

/// Extension appended to every backed-up file.
pub const BACKUP_EXTENSION: &str = "irans";

/// Default budget of uncompressed bytes in flight (1 GiB).
pub const DEFAULT_MEMORY_BUDGET: u64 = 1 << 30;

/// Options controlling a backup or restore run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Upper bound on streams per blob.
    pub max_streams: usize,
    /// Blob size used for compression.
    pub blob_size: usize,
    /// Concurrent file workers. `0` uses all available cores.
    pub workers: usize,
    /// Bytes of uncompressed data allowed in flight across workers.
    pub memory_budget: u64,
    /// Stream-count strategy.
    pub policy: Arc<dyn StreamCountPolicy>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            max_streams: DEFAULT_STREAMS,
            blob_size: DEFAULT_BLOB_SIZE,
            workers: 0,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            policy: Arc::new(HeadroomPolicy),
        }
    }
}

/// Why a restored file failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Content digest differs from the recorded one.
    Mismatch { expected: Digest, actual: Digest },
    /// The ledger has no record for this path.
    Missing,
}

/// A restored file that did not validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Path relative to the restore root.
    pub path: PathBuf,
    pub reason: FailureReason,
}

/// Totals for one backup or restore run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub files: u64,
    pub directories: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Highest number of uncompressed bytes in flight.
    pub peak_in_flight: u64,
    pub elapsed: Duration,
    /// Files that failed validation. Always empty after a backup.
    pub failed: Vec<ValidationFailure>,
}

/// One file to process.
#[derive(Debug, Clone)]
struct FileJob {
    source: PathBuf,
    destination: PathBuf,
    /// Path of the original file relative to its tree root.
    relative: PathBuf,
    /// Uncompressed bytes: the file size on backup, the largest blob on
    /// restore.
    size: u64,
}

/// Directories and regular files below a root, relative to it.
#[derive(Debug, Default)]
struct Tree {
    directories: Vec<PathBuf>,
    files: Vec<(PathBuf, u64)>,
}

/// Backup and restore driver over a shared compute context.
#[derive(Debug, Clone)]
pub struct Backup {
    context: Arc<ComputeContext>,
    options: BackupOptions,
}

impl Backup {
    pub fn new(context: Arc<ComputeContext>, options: BackupOptions) -> IransResult<Self> {
        if options.max_streams == 0 {
            return Err(IransError::invalid("max streams must be at least 1"));
        }
        if options.blob_size == 0 || options.blob_size > MAX_BLOB_SIZE {
            return Err(IransError::invalid(format!(
                "blob size must be between 1 and {MAX_BLOB_SIZE} bytes"
            )));
        }
        if options.memory_budget == 0 {
            return Err(IransError::invalid("memory budget must be at least 1 byte"));
        }
        Ok(Backup { context, options })
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    /// Blob size actually used: never larger than the budget, so one blob
    /// always fits.
    fn effective_blob_size(&self) -> usize {
        (self.options.blob_size as u64).min(self.options.memory_budget) as usize
    }

    /// Compress every file under `source_dir` into the new directory
    /// `target_dir` and write its hash ledger.
    pub fn backup(&self, source_dir: &Path, target_dir: &Path) -> IransResult<PipelineReport> {
        let start = Instant::now();
        check_dirs(source_dir, target_dir)?;
        let tree = scan(source_dir)?;
        if tree.directories.iter().any(|d| d.as_os_str() == MANIFEST_FILE) {
            return Err(IransError::invalid(format!(
                "{} has a directory named {MANIFEST_FILE}, which would shadow the ledger",
                source_dir.display()
            )));
        }
        create_tree(target_dir, &tree.directories)?;
        tracing::info!(
            source = %source_dir.display(),
            target = %target_dir.display(),
            files = tree.files.len(),
            directories = tree.directories.len(),
            "starting backup"
        );

        let jobs: Vec<FileJob> = tree
            .files
            .into_iter()
            .map(|(relative, size)| FileJob {
                source: source_dir.join(&relative),
                destination: target_dir.join(with_backup_extension(&relative)),
                relative,
                size,
            })
            .collect();

        let blob_size = self.effective_blob_size();
        let manifest = Mutex::new(Manifest::new());
        let report = Mutex::new(PipelineReport {
            directories: tree.directories.len() as u64,
            ..PipelineReport::default()
        });

        let peak = self.dispatch(
            &jobs,
            |job| job.size.min(blob_size as u64),
            |job, streams| {
                // A file smaller than a blob is one blob of its own size.
                let options = CodecOptions {
                    streams,
                    blob_size: (job.size.min(blob_size as u64) as usize).max(1),
                };
                let codec = BlobCodec::new(Arc::clone(&self.context), options)?;
                let coded = codec.compress_file(&job.source, &job.destination)?;

                let mut record = Manifest::new();
                record.insert(hash_relative_path(&job.relative), hash_file(&job.source)?);
                lock(&manifest).extend(record);

                let mut report = lock(&report);
                report.files += 1;
                report.bytes_in += coded.bytes_in;
                report.bytes_out += coded.bytes_out;
                tracing::info!(
                    file = %job.relative.display(),
                    streams,
                    bytes_in = coded.bytes_in,
                    bytes_out = coded.bytes_out,
                    "backed up file"
                );
                Ok(())
            },
        )?;

        let manifest = manifest.into_inner().unwrap_or_else(|e| e.into_inner());
        manifest.write(&target_dir.join(MANIFEST_FILE))?;

        let mut report = report.into_inner().unwrap_or_else(|e| e.into_inner());
        report.peak_in_flight = peak;
        report.elapsed = start.elapsed();
        tracing::info!(
            files = report.files,
            bytes_in = report.bytes_in,
            bytes_out = report.bytes_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "backup completed"
        );
        Ok(report)
    }

    /// Decompress a backup at `source_dir` into the new directory
    /// `target_dir`, checking each file against the ledger.
    ///
    /// Digest mismatches and missing ledger records are collected in the
    /// report; they do not stop the run.
    pub fn restore(&self, source_dir: &Path, target_dir: &Path) -> IransResult<PipelineReport> {
        let start = Instant::now();
        check_dirs(source_dir, target_dir)?;
        let manifest_path = source_dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(IransError::invalid(format!(
                "{} has no {MANIFEST_FILE}",
                source_dir.display()
            )));
        }
        let manifest = Manifest::read(&manifest_path)?;
        let tree = scan(source_dir)?;

        let mut jobs = Vec::with_capacity(tree.files.len());
        for (relative, _) in tree.files {
            if relative.as_os_str() == MANIFEST_FILE {
                continue;
            }
            let Some(original) = without_backup_extension(&relative) else {
                tracing::warn!(file = %relative.display(), "skipping file without .irans extension");
                continue;
            };
            let source = source_dir.join(&relative);
            let size = first_blob_size(&mut File::open(&source)?)?;
            jobs.push(FileJob {
                source,
                destination: target_dir.join(&original),
                relative: original,
                size,
            });
        }
        create_tree(target_dir, &tree.directories)?;
        tracing::info!(
            source = %source_dir.display(),
            target = %target_dir.display(),
            files = jobs.len(),
            records = manifest.len(),
            "starting restore"
        );

        let report = Mutex::new(PipelineReport {
            directories: tree.directories.len() as u64,
            ..PipelineReport::default()
        });

        let peak = self.dispatch(
            &jobs,
            |job| job.size,
            |job, _| {
                let codec = BlobCodec::new(Arc::clone(&self.context), CodecOptions::default())?;
                let coded = codec.decompress_file(&job.source, &job.destination)?;
                let failure = validate(&manifest, &job.relative, &job.destination)?;

                let mut report = lock(&report);
                report.files += 1;
                report.bytes_in += coded.bytes_in;
                report.bytes_out += coded.bytes_out;
                if let Some(failure) = failure {
                    report.failed.push(failure);
                }
                tracing::info!(
                    file = %job.relative.display(),
                    bytes_out = coded.bytes_out,
                    "restored file"
                );
                Ok(())
            },
        )?;

        let mut report = report.into_inner().unwrap_or_else(|e| e.into_inner());
        report.failed.sort_by(|a, b| a.path.cmp(&b.path));
        report.peak_in_flight = peak;
        report.elapsed = start.elapsed();
        tracing::info!(
            files = report.files,
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "restore completed"
        );
        Ok(report)
    }

    /// Check every file under `restored_dir` against the ledger of the
    /// backup at `backup_dir`.
    pub fn verify(backup_dir: &Path, restored_dir: &Path) -> IransResult<Vec<ValidationFailure>> {
        let manifest = Manifest::read(&backup_dir.join(MANIFEST_FILE))?;
        let mut failed = Vec::new();
        for (relative, _) in scan(restored_dir)?.files {
            let path = restored_dir.join(&relative);
            if let Some(failure) = validate(&manifest, &relative, &path)? {
                failed.push(failure);
            }
        }
        Ok(failed)
    }

    /// Run `work` over `jobs` under the worker gate and the byte budget.
    ///
    /// Each job reserves `reservation(job)` bytes and receives the stream
    /// count the policy chose under the budget lock. After the first error
    /// no further jobs start; running ones finish and the first error is
    /// returned. Returns the peak number of bytes in flight.
    fn dispatch<R, F>(&self, jobs: &[FileJob], reservation: R, work: F) -> IransResult<u64>
    where
        R: Fn(&FileJob) -> u64 + Sync,
        F: Fn(&FileJob, usize) -> IransResult<()> + Sync,
    {
        let workers = resolve_thread_count(self.options.workers);
        let gate = WorkerGate::new(workers);
        let budget = ByteBudget::new(self.options.memory_budget);
        let first_error: Mutex<Option<IransError>> = Mutex::new(None);
        let policy = self.options.policy.as_ref();
        let max_streams = self.options.max_streams;

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(jobs.len());
            for job in jobs {
                let permit = gate.acquire();
                if lock(&first_error).is_some() {
                    break;
                }
                let (budget, first_error) = (&budget, &first_error);
                let (reservation, work) = (&reservation, &work);
                handles.push(scope.spawn(move || {
                    let _permit = permit;
                    let (_held, streams) = budget.reserve_with(reservation(job), |headroom| {
                        policy.stream_count(&StreamRequest {
                            file_size: job.size,
                            headroom,
                            budget: budget.limit(),
                            max_streams,
                            workers,
                        })
                    });
                    if let Err(e) = work(job, streams) {
                        tracing::warn!(file = %job.source.display(), error = %e, "file failed");
                        lock(first_error).get_or_insert(e);
                    }
                }));
            }
            for handle in handles {
                if handle.join().is_err() {
                    lock(&first_error)
                        .get_or_insert_with(|| IransError::Worker("file worker panicked".into()));
                }
            }
        });

        match first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            Some(e) => Err(e),
            None => Ok(budget.peak()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hash `path` and check it against the ledger record for `relative`.
fn validate(
    manifest: &Manifest,
    relative: &Path,
    path: &Path,
) -> IransResult<Option<ValidationFailure>> {
    let actual = hash_file(path)?;
    let reason = match manifest.verify(&hash_relative_path(relative), actual) {
        Verdict::Match => return Ok(None),
        Verdict::Mismatch { expected, actual } => FailureReason::Mismatch { expected, actual },
        Verdict::Missing => FailureReason::Missing,
    };
    tracing::warn!(file = %relative.display(), ?reason, "validation failed");
    Ok(Some(ValidationFailure {
        path: relative.to_path_buf(),
        reason,
    }))
}

fn check_dirs(source_dir: &Path, target_dir: &Path) -> IransResult<()> {
    if !source_dir.is_dir() {
        return Err(IransError::invalid(format!(
            "source directory {} not found",
            source_dir.display()
        )));
    }
    if target_dir.exists() {
        return Err(IransError::invalid(format!(
            "target {} already exists",
            target_dir.display()
        )));
    }
    Ok(())
}

/// Collect the tree below `root` before anything is written, so a target
/// nested inside the source is never walked.
fn scan(root: &Path) -> IransResult<Tree> {
    let mut tree = Tree::default();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| IransError::invalid("walked outside the source root"))?
            .to_path_buf();
        let file_type = entry.file_type();
        if file_type.is_dir() {
            tree.directories.push(relative);
        } else if file_type.is_file() {
            tree.files.push((relative, entry.metadata()?.len()));
        } else {
            tracing::warn!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(tree)
}

/// Create `target_dir` and every directory of the tree below it.
fn create_tree(target_dir: &Path, directories: &[PathBuf]) -> IransResult<()> {
    fs::create_dir_all(target_dir)?;
    for dir in directories {
        fs::create_dir_all(target_dir.join(dir))?;
    }
    Ok(())
}

fn with_backup_extension(relative: &Path) -> PathBuf {
    let mut name = OsString::from(relative.as_os_str());
    name.push(".");
    name.push(BACKUP_EXTENSION);
    PathBuf::from(name)
}

fn without_backup_extension(relative: &Path) -> Option<PathBuf> {
    if relative.extension()? != BACKUP_EXTENSION {
        return None;
    }
    Some(relative.with_extension(""))
}
