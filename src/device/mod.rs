//! Compute devices and the context that owns them.
//!
//! A [`ComputeDevice`] runs the data-parallel half of the codec: per-stream
//! histograms and the per-stream rANS coder. The host device is always
//! available and runs the same contract on scoped OS threads; with the
//! `opencl` feature, OpenCL devices are enumerated alongside it.
//!
//! ```text
//! ┌────────────────┐  round-robin   ┌──────────────┐
//! │ ComputeContext │───────────────▶│ HostDevice   │
//! │ (device ring,  │                ├──────────────┤
//! │  preferred)    │───────────────▶│ OpenClDevice │──▶ ProgramCache
//! └────────────────┘                └──────────────┘
//! ```
//!
//! The context is an ordinary value: create one at startup, share it via
//! `Arc`, drop it at exit. Reloading it drops every device, and with them
//! every compiled program.

mod host;
mod program;

pub use host::HostDevice;
pub(crate) use host::resolve_thread_count;
pub use program::ProgramCache;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::frequency::NUM_SYMBOLS;
use crate::rans::CodingTables;
use crate::{IransError, IransResult};

/// Which kind of devices to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// CPU-like devices, including the host device.
    #[default]
    Cpu,
    /// GPU-like devices only.
    Gpu,
    /// Every device found.
    All,
}

impl FromStr for DeviceClass {
    type Err = IransError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceClass::Cpu),
            "gpu" => Ok(DeviceClass::Gpu),
            "all" | "any" => Ok(DeviceClass::All),
            other => Err(IransError::invalid(format!(
                "unknown device class '{other}' (expected cpu, gpu or all)"
            ))),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Cpu => write!(f, "cpu"),
            DeviceClass::Gpu => write!(f, "gpu"),
            DeviceClass::All => write!(f, "all"),
        }
    }
}

/// Information about a loaded device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable device name, matched by preferred-device selection.
    pub name: String,
    pub vendor: String,
    pub is_gpu: bool,
    /// Parallel execution units (threads for the host device).
    pub compute_units: usize,
}

/// Output of the parallel stage for one blob.
///
/// `words` holds one slot of `stride_size / 4` words per stream; only the
/// first `output_ns[i]` words of slot `i` are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEncoding {
    pub words: Vec<u32>,
    pub output_ns: Vec<u64>,
    pub residues: Vec<u64>,
}

impl StreamEncoding {
    pub fn stream_count(&self) -> usize {
        self.output_ns.len()
    }

    /// Coded words of stream `index` given the slot width.
    pub fn stream_words(&self, index: usize, slot: usize) -> &[u32] {
        let start = index * slot;
        &self.words[start..start + self.output_ns[index] as usize]
    }
}

/// The data-parallel contract a compute device implements.
///
/// Streams are `stride_size`-byte slices of the input (the last one may be
/// shorter) and are processed independently of one another.
pub trait ComputeDevice: Send + Sync + fmt::Debug {
    fn info(&self) -> &DeviceInfo;

    /// One 256-bucket histogram per stream.
    fn histograms(&self, input: &[u8], stride_size: usize)
        -> IransResult<Vec<[u64; NUM_SYMBOLS]>>;

    /// Run the per-stream coder over every stream of `input`.
    fn encode_streams(
        &self,
        input: &[u8],
        tables: &CodingTables,
        stride_size: usize,
    ) -> IransResult<StreamEncoding>;

    /// Decode the covered suffix of every stream into `output`, leaving
    /// each stream's residue prefix untouched.
    fn decode_streams(
        &self,
        encoding: &StreamEncoding,
        tables: &CodingTables,
        stride_size: usize,
        output: &mut [u8],
    ) -> IransResult<()>;
}

struct DeviceRing {
    devices: Vec<Arc<dyn ComputeDevice>>,
    next: usize,
    preferred: Option<usize>,
}

/// Owned device list with round-robin assignment.
pub struct ComputeContext {
    ring: Mutex<DeviceRing>,
}

impl fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("devices", &self.devices())
            .finish()
    }
}

impl ComputeContext {
    /// A context over an explicit device list.
    pub fn with_devices(devices: Vec<Arc<dyn ComputeDevice>>) -> Self {
        ComputeContext {
            ring: Mutex::new(DeviceRing {
                devices,
                next: 0,
                preferred: None,
            }),
        }
    }

    /// A context holding only the host device, using all available cores.
    pub fn host() -> Self {
        Self::with_devices(vec![Arc::new(HostDevice::new(0))])
    }

    /// Enumerate every device of `class`.
    pub fn load(class: DeviceClass) -> Self {
        Self::with_devices(enumerate(class))
    }

    /// Replace the device list with a fresh enumeration of `class`.
    ///
    /// Devices from the previous load are dropped together with their
    /// compiled programs; handles already given out stay valid until their
    /// holders finish with them.
    pub fn reload(&self, class: DeviceClass) {
        let devices = enumerate(class);
        let mut ring = self.lock();
        ring.devices = devices;
        ring.next = 0;
        ring.preferred = None;
    }

    /// Pin assignment to the first device whose name contains `name`.
    ///
    /// Returns `Ok(false)` and keeps round-robin assignment when no device
    /// matches.
    pub fn set_preferred_device(&self, name: &str) -> IransResult<bool> {
        let mut ring = self.lock();
        if ring.devices.is_empty() {
            return Err(IransError::invalid("no devices were loaded"));
        }
        ring.preferred = ring
            .devices
            .iter()
            .position(|device| device.info().name.contains(name));
        Ok(ring.preferred.is_some())
    }

    /// Hand out the next device.
    pub fn device(&self) -> IransResult<Arc<dyn ComputeDevice>> {
        let mut ring = self.lock();
        if ring.devices.is_empty() {
            return Err(IransError::invalid("no devices were loaded"));
        }
        if let Some(index) = ring.preferred {
            return Ok(Arc::clone(&ring.devices[index]));
        }
        let index = ring.next;
        ring.next = (index + 1) % ring.devices.len();
        Ok(Arc::clone(&ring.devices[index]))
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.lock()
            .devices
            .iter()
            .map(|device| device.info().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceRing> {
        // The ring holds no invariant a panicking holder could break.
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn enumerate(class: DeviceClass) -> Vec<Arc<dyn ComputeDevice>> {
    let mut devices: Vec<Arc<dyn ComputeDevice>> = Vec::new();
    if class != DeviceClass::Gpu {
        devices.push(Arc::new(HostDevice::new(0)));
    }
    #[cfg(feature = "opencl")]
    devices.extend(crate::opencl::enumerate(class));
    tracing::debug!(%class, count = devices.len(), "loaded compute devices");
    devices
}
