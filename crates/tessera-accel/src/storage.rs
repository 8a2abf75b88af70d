use std::sync::Arc;

use tessera_core::{Device, NativeBuffer, Result};

use crate::memory::DeviceBuffer;

/// Backing storage for array data.
///
/// Storage is reference-counted (`Arc`) so multiple arrays can share the same
/// underlying bytes (views from reshape/transpose).
#[derive(Debug, Clone)]
pub enum Storage {
    /// Host memory owned by the native peer backend.
    Native(Arc<NativeBuffer>),
    /// Accelerator memory.
    Accel(Arc<DeviceBuffer>),
}

impl Storage {
    /// Device the bytes live on.
    pub fn device(&self) -> Device {
        match self {
            Storage::Native(_) => Device::Native,
            Storage::Accel(buf) => buf.device().id(),
        }
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        match self {
            Storage::Native(buf) => buf.nbytes(),
            Storage::Accel(buf) => buf.nbytes(),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` to the host.
    ///
    /// Accelerator storage is read after queued work on its device drains.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        match self {
            Storage::Native(buf) => buf.read_at(offset, dst),
            Storage::Accel(buf) => {
                buf.device().drain();
                buf.read_raw(offset, dst)
            }
        }
    }

    /// Whether both storages refer to the same allocation.
    pub fn same_allocation(&self, other: &Storage) -> bool {
        match (self, other) {
            (Storage::Native(a), Storage::Native(b)) => Arc::ptr_eq(a, b),
            (Storage::Accel(a), Storage::Accel(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<NativeBuffer> for Storage {
    fn from(buf: NativeBuffer) -> Self {
        Storage::Native(Arc::new(buf))
    }
}

impl From<Arc<DeviceBuffer>> for Storage {
    fn from(buf: Arc<DeviceBuffer>) -> Self {
        Storage::Accel(buf)
    }
}
