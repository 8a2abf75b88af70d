//! Accelerator device handles, the device registry and the command queue.
//!
//! Every device owns one in-order queue drained by a dedicated host thread,
//! plus a worker pool standing in for its multiprocessors. Operators enqueue
//! work and return immediately; [`AccelDevice::synchronize`] is the only call
//! that waits for queued work and reports asynchronous faults.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tessera_core::{Device, Result, TesseraError};
use tracing::{debug, error, info};

use crate::config::{configured_device_count, DeviceConfig};

/// Global registry of device handles (one per accelerator index).
static DEVICES: OnceLock<Mutex<HashMap<usize, Arc<AccelDevice>>>> = OnceLock::new();

static NEXT_UID: AtomicUsize = AtomicUsize::new(0);

fn devices() -> &'static Mutex<HashMap<usize, Arc<AccelDevice>>> {
    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the shared handle for accelerator `device_idx`.
///
/// The device is lazily initialized on first access and cached for reuse.
pub fn get_device(device_idx: usize) -> Result<Arc<AccelDevice>> {
    let count = device_count();
    if device_idx >= count {
        return Err(TesseraError::InvalidDevice(format!(
            "accel:{device_idx} requested but only {count} accelerators are configured"
        )));
    }
    let mut map = devices().lock();
    if let Some(dev) = map.get(&device_idx) {
        return Ok(Arc::clone(dev));
    }
    let dev = AccelDevice::new(device_idx, DeviceConfig::from_env())?;
    map.insert(device_idx, Arc::clone(&dev));
    Ok(dev)
}

/// Number of accelerators exposed by the registry.
pub fn device_count() -> usize {
    configured_device_count()
}

/// Check if any accelerator is available.
pub fn is_available() -> bool {
    device_count() > 0
}

type Command = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    pending: usize,
    fault: Option<String>,
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
}

/// In-order command queue backed by one host thread.
struct CommandQueue {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    fn spawn(device_idx: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("tessera-accel-{device_idx}"))
            .spawn(move || {
                for command in rx {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(command));
                    let mut state = worker_shared.state.lock();
                    if let Err(payload) = outcome {
                        let msg = panic_message(payload.as_ref());
                        error!(device = device_idx, fault = %msg, "accelerator command failed");
                        if state.fault.is_none() {
                            state.fault = Some(msg);
                        }
                    }
                    state.pending -= 1;
                    if state.pending == 0 {
                        worker_shared.idle.notify_all();
                    }
                }
            })
            .map_err(|e| TesseraError::RuntimeFailure(format!("queue thread for accel:{device_idx}: {e}")))?;
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.shared.state.lock().pending += 1;
        let sent = match self.sender.lock().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        };
        if !sent {
            let mut state = self.shared.state.lock();
            state.pending -= 1;
            if state.pending == 0 {
                self.shared.idle.notify_all();
            }
            return Err(TesseraError::RuntimeFailure("command queue is shut down".into()));
        }
        Ok(())
    }

    fn wait_idle(&self) -> parking_lot::MutexGuard<'_, QueueState> {
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            self.shared.idle.wait(&mut state);
        }
        state
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            // The last handle may be released by a command running on the worker itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown fault".to_string()
    }
}

/// Handle to one emulated accelerator.
pub struct AccelDevice {
    index: usize,
    uid: usize,
    config: DeviceConfig,
    allocated: AtomicUsize,
    pool: Arc<rayon::ThreadPool>,
    queue: CommandQueue,
}

impl std::fmt::Debug for AccelDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelDevice")
            .field("index", &self.index)
            .field("allocated", &self.allocated_bytes())
            .field("memory_budget", &self.config.memory_bytes)
            .finish()
    }
}

impl AccelDevice {
    /// Create a standalone device handle outside the registry.
    pub fn new(index: usize, config: DeviceConfig) -> Result<Arc<Self>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.multiprocessors.max(1))
            .thread_name(move |i| format!("tessera-accel-{index}-mp{i}"))
            .build()
            .map_err(|e| TesseraError::RuntimeFailure(format!("worker pool for accel:{index}: {e}")))?;
        let queue = CommandQueue::spawn(index)?;
        info!(
            device = index,
            memory_bytes = config.memory_bytes,
            multiprocessors = config.multiprocessors,
            "accelerator initialized"
        );
        Ok(Arc::new(Self {
            index,
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            config,
            allocated: AtomicUsize::new(0),
            pool: Arc::new(pool),
            queue,
        }))
    }

    /// Ordinal in the device registry.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Device identifier as seen by arrays.
    pub fn id(&self) -> Device {
        Device::Accel(self.index)
    }

    /// Hardware description this device was built with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Bytes currently allocated on this device.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Total bytes allocations may claim.
    pub fn memory_budget(&self) -> usize {
        self.config.memory_bytes
    }

    pub(crate) fn uid(&self) -> usize {
        self.uid
    }

    pub(crate) fn pool(&self) -> Arc<rayon::ThreadPool> {
        Arc::clone(&self.pool)
    }

    /// Account `nbytes` against the budget, failing without side effects.
    pub(crate) fn reserve(&self, nbytes: usize) -> Result<()> {
        let budget = self.config.memory_bytes;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(nbytes).filter(|&total| total <= budget)
            })
            .map(|_| ())
            .map_err(|used| TesseraError::OutOfMemory {
                device: self.id(),
                requested: nbytes,
                available: budget.saturating_sub(used),
            })
    }

    pub(crate) fn release(&self, nbytes: usize) {
        self.allocated.fetch_sub(nbytes, Ordering::AcqRel);
    }

    /// Append a command to the in-order queue. Returns once it is queued.
    pub(crate) fn enqueue<F>(&self, command: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.submit(Box::new(command))
    }

    /// Enqueue a host callback that runs in queue order with kernels.
    ///
    /// A panic inside `f` is treated like a faulting kernel: it is reported
    /// by the next [`synchronize`](Self::synchronize), not here.
    pub fn launch_host_fn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(f)
    }

    /// Block until every command issued to this device has completed.
    ///
    /// Faults raised by queued work after the previous synchronize are
    /// reported here as [`TesseraError::RuntimeFailure`], then cleared.
    pub fn synchronize(&self) -> Result<()> {
        let mut state = self.queue.wait_idle();
        match state.fault.take() {
            Some(msg) => Err(TesseraError::RuntimeFailure(format!("accel:{}: {msg}", self.index))),
            None => {
                debug!(device = self.index, "synchronized");
                Ok(())
            }
        }
    }

    /// Wait for queued work to finish without consuming a pending fault.
    /// Transfers use this to observe completed writes.
    pub(crate) fn drain(&self) {
        drop(self.queue.wait_idle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn small_device() -> Arc<AccelDevice> {
        AccelDevice::new(0, DeviceConfig::default().with_memory_bytes(1024).with_multiprocessors(2)).unwrap()
    }

    #[test]
    fn test_registry_caches_handles() {
        let a = get_device(0).unwrap();
        let b = get_device(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), Device::Accel(0));
        assert!(is_available());
    }

    #[test]
    fn test_invalid_device_index() {
        let err = get_device(device_count()).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidDevice(_)));
    }

    #[test]
    fn test_reserve_respects_budget() {
        let dev = small_device();
        dev.reserve(1000).unwrap();
        let err = dev.reserve(100).unwrap_err();
        assert!(matches!(err, TesseraError::OutOfMemory { available: 24, .. }));
        assert_eq!(dev.allocated_bytes(), 1000);
        dev.release(1000);
        assert_eq!(dev.allocated_bytes(), 0);
    }

    #[test]
    fn test_commands_run_in_order() {
        let dev = small_device();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            dev.enqueue(move || log.lock().push(i)).unwrap();
        }
        dev.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_fault_reported_once_at_synchronize() {
        let dev = small_device();
        let ran_after = Arc::new(AtomicBool::new(false));
        dev.launch_host_fn(|| panic!("illegal address")).unwrap();
        let flag = Arc::clone(&ran_after);
        dev.launch_host_fn(move || flag.store(true, Ordering::SeqCst)).unwrap();

        let err = dev.synchronize().unwrap_err();
        assert!(err.to_string().contains("illegal address"));
        assert!(ran_after.load(Ordering::SeqCst));
        dev.synchronize().unwrap();
    }
}
