//! Hardware description of an emulated accelerator.

use std::env;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

const MEMORY_ENV: &str = "TESSERA_ACCEL_MEMORY_MB";
const WORKERS_ENV: &str = "TESSERA_ACCEL_WORKERS";
const DEVICES_ENV: &str = "TESSERA_ACCEL_DEVICES";

const DEFAULT_MEMORY_BYTES: usize = 1 << 30;
const DEFAULT_DEVICE_COUNT: usize = 2;

static MEMORY_OVERRIDE: OnceLock<Option<usize>> = OnceLock::new();
static WORKERS_OVERRIDE: OnceLock<Option<usize>> = OnceLock::new();
static DEVICE_COUNT: OnceLock<usize> = OnceLock::new();

/// Resources of one accelerator.
///
/// The occupancy fields mirror what a real runtime reports per device and
/// feed the launch-geometry calculation in [`crate::launch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Memory budget in bytes. Allocations beyond it fail with `OutOfMemory`.
    pub memory_bytes: usize,

    /// Upper bound on threads in a single block.
    pub max_threads_per_block: usize,

    /// Register file size of one multiprocessor.
    pub registers_per_multiprocessor: usize,

    /// Resident thread limit of one multiprocessor.
    pub max_threads_per_multiprocessor: usize,

    /// Resident block limit of one multiprocessor.
    pub max_blocks_per_multiprocessor: usize,

    /// Threads scheduled together; block sizes are rounded to a multiple of it.
    pub warp_size: usize,

    /// Number of multiprocessors, i.e. host worker threads backing the device.
    pub multiprocessors: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            max_threads_per_block: 1024,
            registers_per_multiprocessor: 65536,
            max_threads_per_multiprocessor: 2048,
            max_blocks_per_multiprocessor: 32,
            warp_size: 32,
            multiprocessors: default_workers(),
        }
    }
}

impl DeviceConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(bytes) = memory_override() {
            config.memory_bytes = bytes;
        }
        if let Some(workers) = workers_override() {
            config.multiprocessors = workers;
        }
        config
    }

    /// Same hardware with a different memory budget.
    pub fn with_memory_bytes(mut self, memory_bytes: usize) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    pub fn with_multiprocessors(mut self, multiprocessors: usize) -> Self {
        self.multiprocessors = multiprocessors.max(1);
        self
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

fn parse_positive(name: &str) -> Option<usize> {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|&value| value > 0)
}

fn memory_override() -> Option<usize> {
    *MEMORY_OVERRIDE.get_or_init(|| parse_positive(MEMORY_ENV).map(|mb| mb.saturating_mul(1 << 20)))
}

fn workers_override() -> Option<usize> {
    *WORKERS_OVERRIDE.get_or_init(|| parse_positive(WORKERS_ENV))
}

/// Number of accelerators the registry exposes.
pub fn configured_device_count() -> usize {
    *DEVICE_COUNT.get_or_init(|| parse_positive(DEVICES_ENV).unwrap_or(DEFAULT_DEVICE_COUNT))
}
