//! irans: interlaced rANS codec and directory backup tool.
//!
//! ```bash
//! irans compress big.log big.log.irans
//! irans -x gpu --preferred-gpu "RTX" decompress big.log.irans big.log
//! irans backup ./photos ./photos.bak --max-memory 536870912 -w 8
//! irans restore ./photos.bak ./photos.restored
//! irans -x all devices
//! ```
//!
//! Logging goes to stderr and honors `RUST_LOG`; `-v` raises the default
//! level to `debug` and prints per-blob timings.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use irans::backup::{Backup, BackupOptions, FailureReason, PipelineReport};
use irans::blob::{BlobCodec, CodecOptions, CodecReport, DEFAULT_BLOB_SIZE, DEFAULT_STREAMS};
use irans::device::{ComputeContext, DeviceClass};
use irans::{IransError, IransResult};

/// Interlaced rANS codec with device-parallel stream coding.
#[derive(Parser, Debug)]
#[command(name = "irans", version)]
struct Cli {
    /// Device class to run the codec on (cpu, gpu or all).
    #[arg(short = 'x', long, global = true, default_value = "cpu")]
    executor: DeviceClass,

    /// Pin work to the first device whose name contains this string.
    #[arg(long, global = true)]
    preferred_gpu: Option<String>,

    /// Verbose output (debug logging with per-blob timings).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress a single file.
    Compress {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        codec: CodecArgs,
    },
    /// Decompress a single file.
    Decompress { input: PathBuf, output: PathBuf },
    /// Compress a directory tree into a new backup directory.
    Backup {
        source: PathBuf,
        target: PathBuf,
        #[command(flatten)]
        codec: CodecArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Restore a backup directory and verify it against its ledger.
    Restore {
        source: PathBuf,
        target: PathBuf,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// List the devices of the selected class.
    Devices,
}

#[derive(Args, Debug)]
struct CodecArgs {
    /// Parallel streams per blob (upper bound for backups).
    #[arg(short = 'j', long, default_value_t = DEFAULT_STREAMS)]
    jobs: usize,

    /// Blob size in bytes.
    #[arg(short = 'b', long, default_value_t = DEFAULT_BLOB_SIZE)]
    blob_size: usize,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Budget of uncompressed bytes in flight across workers.
    #[arg(long, default_value_t = irans::backup::DEFAULT_MEMORY_BUDGET)]
    max_memory: u64,

    /// Concurrent file workers (0 = number of cores).
    #[arg(short = 'w', long, default_value_t = 0)]
    workers: usize,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "irans=debug" } else { "irans=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_context(cli: &Cli) -> IransResult<Arc<ComputeContext>> {
    let context = ComputeContext::load(cli.executor);
    if context.is_empty() {
        return Err(IransError::InvalidOperation(format!(
            "no {} devices found",
            cli.executor
        )));
    }
    if let Some(name) = &cli.preferred_gpu {
        if !context.set_preferred_device(name)? {
            tracing::warn!(device = %name, "preferred device not found, using round-robin");
        }
    }
    Ok(Arc::new(context))
}

fn print_codec_report(report: &CodecReport) {
    eprintln!(
        "{} blob(s), {} -> {} bytes ({:.1}%), coding {:.3}s, total {:.3}s",
        report.blobs,
        report.bytes_in,
        report.bytes_out,
        report.ratio() * 100.0,
        report.coding_time.as_secs_f64(),
        report.elapsed.as_secs_f64()
    );
}

fn print_pipeline_report(report: &PipelineReport) {
    eprintln!(
        "{} file(s), {} director(ies), {} -> {} bytes, peak in flight {} bytes, {:.3}s",
        report.files,
        report.directories,
        report.bytes_in,
        report.bytes_out,
        report.peak_in_flight,
        report.elapsed.as_secs_f64()
    );
    for failure in &report.failed {
        match failure.reason {
            FailureReason::Mismatch { expected, actual } => eprintln!(
                "FAILED {}: digest {actual} does not match recorded {expected}",
                failure.path.display()
            ),
            FailureReason::Missing => {
                eprintln!("FAILED {}: no ledger record", failure.path.display())
            }
        }
    }
}

fn run(cli: Cli) -> IransResult<ExitCode> {
    match &cli.command {
        Command::Devices => {
            let context = ComputeContext::load(cli.executor);
            for (i, device) in context.devices().iter().enumerate() {
                println!(
                    "{i}: {} ({}, {}, {} compute units)",
                    device.name,
                    device.vendor,
                    if device.is_gpu { "gpu" } else { "cpu" },
                    device.compute_units
                );
            }
        }
        Command::Compress {
            input,
            output,
            codec,
        } => {
            let options = CodecOptions {
                streams: codec.jobs,
                blob_size: codec.blob_size,
            };
            let codec = BlobCodec::new(load_context(&cli)?, options)?;
            print_codec_report(&codec.compress_file(input, output)?);
        }
        Command::Decompress { input, output } => {
            let codec = BlobCodec::new(load_context(&cli)?, CodecOptions::default())?;
            print_codec_report(&codec.decompress_file(input, output)?);
        }
        Command::Backup {
            source,
            target,
            codec,
            pipeline,
        } => {
            let options = BackupOptions {
                max_streams: codec.jobs,
                blob_size: codec.blob_size,
                workers: pipeline.workers,
                memory_budget: pipeline.max_memory,
                ..BackupOptions::default()
            };
            let backup = Backup::new(load_context(&cli)?, options)?;
            print_pipeline_report(&backup.backup(source, target)?);
        }
        Command::Restore {
            source,
            target,
            pipeline,
        } => {
            let options = BackupOptions {
                workers: pipeline.workers,
                memory_budget: pipeline.max_memory,
                ..BackupOptions::default()
            };
            let backup = Backup::new(load_context(&cli)?, options)?;
            let report = backup.restore(source, target)?;
            print_pipeline_report(&report);
            if !report.failed.is_empty() {
                return Ok(ExitCode::from(2));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
