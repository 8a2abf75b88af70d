//! Launch geometry selection and grid-stride kernel launches.
//!
//! The block size for a kernel is derived once per (device, kernel, dtype)
//! from an occupancy estimate and cached; the grid size is recomputed per
//! call by ceiling division, so `grid * block >= n` always holds.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;
use rayon::prelude::*;
use tessera_core::{DType, Result};
use tracing::trace;

use crate::config::DeviceConfig;
use crate::context::AccelDevice;
use crate::indexer::Indexer;

/// Static description of a kernel, used for occupancy sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSpec {
    pub name: &'static str,
    /// Registers each thread of the kernel needs.
    pub registers_per_thread: usize,
}

impl KernelSpec {
    pub const fn new(name: &'static str, registers_per_thread: usize) -> Self {
        Self {
            name,
            registers_per_thread,
        }
    }
}

/// Grid and block dimensions of a 1-D launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: usize,
    pub block: usize,
}

impl LaunchConfig {
    /// Total lanes launched; also the grid-stride step.
    pub fn total_threads(&self) -> usize {
        self.grid * self.block
    }
}

/// Cache of occupancy-maximizing block sizes.
/// Key: (device uid, kernel name, dtype)
static BLOCK_SIZES: OnceLock<Mutex<HashMap<(usize, &'static str, DType), usize>>> = OnceLock::new();

fn block_sizes() -> &'static Mutex<HashMap<(usize, &'static str, DType), usize>> {
    BLOCK_SIZES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Block size maximizing resident warps per multiprocessor.
///
/// Ties go to the larger block. Kernels too heavy for any block to fit fall
/// back to a single warp.
pub fn max_block_size(config: &DeviceConfig, spec: &KernelSpec) -> usize {
    let warp = config.warp_size.max(1);
    let regs_per_warp = spec.registers_per_thread.max(1) * warp;
    let warps_by_regs = config.registers_per_multiprocessor / regs_per_warp;
    let warps_by_threads = config.max_threads_per_multiprocessor / warp;

    let mut best = (0usize, warp);
    let mut block = warp;
    while block <= config.max_threads_per_block {
        let warps_per_block = block / warp;
        let resident_blocks = (warps_by_regs / warps_per_block)
            .min(warps_by_threads / warps_per_block)
            .min(config.max_blocks_per_multiprocessor);
        let active = resident_blocks * warps_per_block;
        if active > 0 && active >= best.0 {
            best = (active, block);
        }
        block += warp;
    }
    best.1
}

/// Cached block-size limit for `spec` on `device`.
pub fn cached_block_size(device: &AccelDevice, spec: &KernelSpec, dtype: DType) -> usize {
    let key = (device.uid(), spec.name, dtype);
    if let Some(&block) = block_sizes().lock().get(&key) {
        return block;
    }
    let block = max_block_size(device.config(), spec);
    block_sizes().lock().insert(key, block);
    block
}

/// Compute grid dimensions for a 1-D launch over `n > 0` elements.
pub fn grid_1d(n: usize, max_block: usize) -> LaunchConfig {
    let block = max_block.min(n).max(1);
    LaunchConfig {
        grid: (n + block - 1) / block,
        block,
    }
}

/// Geometry for `spec` over `n > 0` elements on `device`.
pub fn select(device: &AccelDevice, spec: &KernelSpec, dtype: DType, n: usize) -> LaunchConfig {
    grid_1d(n, cached_block_size(device, spec, dtype))
}

/// Enqueue `kernel` once per position of `indexer`'s shape.
///
/// Blocks run in parallel on the device pool. Each lane walks a grid-stride
/// sequence of flat positions with its own copy of the indexer, so results
/// do not depend on the chosen geometry. Returns once the launch is queued.
pub fn launch_elementwise<K>(
    device: &AccelDevice,
    spec: &KernelSpec,
    dtype: DType,
    indexer: Indexer,
    kernel: K,
) -> Result<()>
where
    K: Fn(&Indexer) + Send + Sync + 'static,
{
    let n = indexer.total_size();
    if n == 0 {
        return Ok(());
    }
    let cfg = select(device, spec, dtype, n);
    trace!(
        kernel = spec.name,
        %dtype,
        n,
        grid = cfg.grid,
        block = cfg.block,
        "launch"
    );
    let pool = device.pool();
    device.enqueue(move || {
        let stride = cfg.total_threads();
        pool.install(|| {
            (0..cfg.grid).into_par_iter().for_each(|block_idx| {
                let mut it = indexer.clone();
                for thread_idx in 0..cfg.block {
                    let tid = block_idx * cfg.block + thread_idx;
                    for flat in (tid..n).step_by(stride) {
                        it.set(flat);
                        kernel(&it);
                    }
                }
            });
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_grid_covers_n() {
        for n in [1usize, 7, 255, 256, 257, 100_000] {
            let cfg = grid_1d(n, 256);
            assert!(cfg.total_threads() >= n, "n={n}");
            assert!(cfg.block <= 256);
            assert!((cfg.grid - 1) * cfg.block < n);
        }
    }

    #[test]
    fn test_small_n_shrinks_block() {
        let cfg = grid_1d(10, 512);
        assert_eq!(cfg, LaunchConfig { grid: 1, block: 10 });
    }

    #[test]
    fn test_occupancy_limits_block_size() {
        let config = DeviceConfig::default();
        let light = max_block_size(&config, &KernelSpec::new("light", 16));
        assert_eq!(light, config.max_threads_per_block);

        // 256 registers per thread leaves room for 8 warps per multiprocessor.
        let heavy = max_block_size(&config, &KernelSpec::new("heavy", 256));
        assert_eq!(heavy, 256);

        let impossible = max_block_size(&config, &KernelSpec::new("huge", 1 << 20));
        assert_eq!(impossible, config.warp_size);
    }

    #[test]
    fn test_block_size_cached_per_device() {
        let dev = AccelDevice::new(0, DeviceConfig::default().with_multiprocessors(1)).unwrap();
        let spec = KernelSpec::new("cached_probe", 32);
        let a = cached_block_size(&dev, &spec, DType::F32);
        let b = cached_block_size(&dev, &spec, DType::F32);
        assert_eq!(a, b);
        assert!(block_sizes().lock().contains_key(&(dev.uid(), "cached_probe", DType::F32)));
    }

    #[test]
    fn test_every_position_visited_once() {
        let dev = AccelDevice::new(0, DeviceConfig::default().with_multiprocessors(4)).unwrap();
        let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..3000).map(|_| AtomicUsize::new(0)).collect());
        let counter = Arc::clone(&hits);
        launch_elementwise(
            &dev,
            &KernelSpec::new("visit", 8),
            DType::U8,
            Indexer::new(&[30, 100]),
            move |it| {
                counter[it.raw_index()].fetch_add(1, Ordering::Relaxed);
            },
        )
        .unwrap();
        dev.synchronize().unwrap();
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }
}
