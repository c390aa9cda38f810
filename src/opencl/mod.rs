//! OpenCL backend for the device contract.
//!
//! Each OpenCL device found at load time becomes one [`OpenClDevice`] with
//! its own context, command queue and program cache. Programs are compiled
//! lazily on first use; kernels are created per call, since argument setting
//! on a shared kernel object is not thread-safe.
//!
//! ```text
//! ┌──────────────┐ upload ┌───────────────────────┐ download ┌────────────┐
//! │  Host (CPU)  │───────▶│ freq_dist::run        │─────────▶│ merge +    │
//! │  blob bytes  │        │ interlaced_rans64::   │          │ residues + │
//! │              │        │   encode / decode     │          │ framing    │
//! └──────────────┘        └───────────────────────┘          └────────────┘
//! ```
//!
//! This module is only compiled with the `opencl` feature:
//! ```bash
//! cargo build --features opencl
//! ```

mod rans;

use std::sync::Arc;

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{
    get_all_devices, Device, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::event::Event;
use opencl3::program::Program;
use opencl3::types::cl_device_type;

use crate::device::{ComputeDevice, DeviceClass, DeviceInfo, ProgramCache};
use crate::{IransError, IransResult};

/// Per-stream histogram kernel source.
const FREQ_DIST_SOURCE: &str = include_str!("../../kernels/freq_dist.cl");

/// Per-stream rANS encode/decode kernel source.
const INTERLACED_RANS64_SOURCE: &str = include_str!("../../kernels/interlaced_rans64.cl");

pub(crate) const FREQ_DIST: &str = "freq_dist";
pub(crate) const INTERLACED_RANS64: &str = "interlaced_rans64";

const BUILD_OPTIONS: &str = "-cl-std=CL1.2";

/// Enumerate the OpenCL devices matching `class`.
///
/// Returns an empty list when no OpenCL runtime is installed. Devices whose
/// context or queue cannot be created are skipped with a warning.
pub fn enumerate(class: DeviceClass) -> Vec<Arc<dyn ComputeDevice>> {
    let device_type = match class {
        DeviceClass::Cpu => CL_DEVICE_TYPE_CPU,
        DeviceClass::Gpu => CL_DEVICE_TYPE_GPU,
        DeviceClass::All => CL_DEVICE_TYPE_ALL,
    };
    let ids = match get_all_devices(device_type) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::debug!(error = ?e, "no OpenCL devices available");
            return Vec::new();
        }
    };

    ids.into_iter()
        .filter_map(|id| match OpenClDevice::new(Device::new(id)) {
            Ok(device) => Some(Arc::new(device) as Arc<dyn ComputeDevice>),
            Err(e) => {
                tracing::warn!(error = %e, "skipping OpenCL device");
                None
            }
        })
        .collect()
}

/// One OpenCL device with its context, queue and compiled programs.
pub struct OpenClDevice {
    context: Context,
    queue: CommandQueue,
    programs: ProgramCache<Program>,
    info: DeviceInfo,
    profiling: bool,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context, command queue,
// program and memory objects; the raw handles in opencl3 types are opaque
// and the runtime serializes access internally. Kernel objects, which are
// not thread-safe, are never stored here.
unsafe impl Send for OpenClDevice {}
unsafe impl Sync for OpenClDevice {}

impl std::fmt::Debug for OpenClDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClDevice")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl OpenClDevice {
    pub fn new(device: Device) -> IransResult<Self> {
        let name = device.name().unwrap_or_default().trim().to_string();
        let vendor = device.vendor().unwrap_or_default().trim().to_string();
        let dev_type: cl_device_type = device.dev_type().unwrap_or(0);
        let compute_units = device.max_compute_units().unwrap_or(1) as usize;

        let context = Context::from_device(&device)
            .map_err(|e| IransError::Device(format!("{name}: context creation failed: {e:?}")))?;

        let profiling = tracing::enabled!(tracing::Level::TRACE);
        let queue_props = if profiling {
            CL_QUEUE_PROFILING_ENABLE
        } else {
            0
        };
        // The 1.2 entry point keeps macOS drivers working.
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, queue_props)
            .map_err(|e| IransError::Device(format!("{name}: queue creation failed: {e:?}")))?;

        let programs = ProgramCache::new();
        programs.register(FREQ_DIST, FREQ_DIST_SOURCE);
        programs.register(INTERLACED_RANS64, INTERLACED_RANS64_SOURCE);

        tracing::debug!(device = %name, %vendor, compute_units, "opened OpenCL device");

        Ok(OpenClDevice {
            context,
            queue,
            programs,
            info: DeviceInfo {
                name,
                vendor,
                is_gpu: (dev_type & CL_DEVICE_TYPE_GPU) != 0,
                compute_units: compute_units.max(1),
            },
            profiling,
        })
    }

    /// Compiled program `name`, built on first use.
    ///
    /// A failed build logs the compiler output and reports
    /// [`IransError::Build`].
    fn program(&self, name: &str) -> IransResult<Arc<Program>> {
        self.programs.get_or_build(name, |source| {
            Program::create_and_build_from_source(&self.context, source, BUILD_OPTIONS).map_err(
                |log| {
                    tracing::error!(
                        program = name,
                        device = %self.info.name,
                        "program build failed:\n{log}"
                    );
                    IransError::Build {
                        program: name.to_string(),
                        device: self.info.name.clone(),
                    }
                },
            )
        })
    }

    fn profile_event(&self, label: &str, event: &Event) {
        if !self.profiling {
            return;
        }
        if let (Ok(start), Ok(end)) = (
            event.profiling_command_start(),
            event.profiling_command_end(),
        ) {
            let ms = end.saturating_sub(start) as f64 / 1_000_000.0;
            tracing::trace!(device = %self.info.name, "{label}: {ms:.3} ms");
        }
    }
}

fn device_err<E: std::fmt::Debug>(what: &'static str) -> impl FnOnce(E) -> IransError {
    move |e| IransError::Device(format!("{what}: {e:?}"))
}
