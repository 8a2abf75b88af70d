//! Accelerator memory allocation and host/device/device transfers.
//!
//! Buffers are reference-counted; the native free runs exactly once, when
//! the last `Arc<DeviceBuffer>` drops. Queued commands hold their own
//! references, so a buffer always outlives the kernels that use it.
//!
//! Transfers run synchronously on the calling thread. They wait for work
//! already queued on the devices involved so that they observe completed
//! writes, but they never consume a pending fault.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use tessera_core::{Device, NativeBuffer, Result, TesseraError};
use tracing::{debug, trace};

use crate::context::{get_device, AccelDevice};
use crate::storage::Storage;

/// Alignment of every device allocation, matching typical device allocators.
pub const ALIGNMENT: usize = 256;

/// A block of accelerator memory on a specific device.
pub struct DeviceBuffer {
    ptr: NonNull<u8>,
    nbytes: usize,
    device: Arc<AccelDevice>,
}

// SAFETY: the buffer is plain bytes; access goes through raw pointers whose
// ordering is serialized by the device queue and the transfer drain.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device.id())
            .field("nbytes", &self.nbytes)
            .finish()
    }
}

impl DeviceBuffer {
    /// Allocate `nbytes` of zeroed memory on `device`.
    ///
    /// `nbytes == 0` yields an empty owner that holds no allocation.
    pub fn allocate(device: &Arc<AccelDevice>, nbytes: usize) -> Result<Arc<Self>> {
        if nbytes == 0 {
            return Ok(Arc::new(Self {
                ptr: NonNull::dangling(),
                nbytes: 0,
                device: Arc::clone(device),
            }));
        }
        let layout = Layout::from_size_align(nbytes, ALIGNMENT).map_err(|_| TesseraError::OutOfMemory {
            device: device.id(),
            requested: nbytes,
            available: device.memory_budget().saturating_sub(device.allocated_bytes()),
        })?;
        device.reserve(nbytes)?;
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            device.release(nbytes);
            return Err(TesseraError::OutOfMemory {
                device: device.id(),
                requested: nbytes,
                available: 0,
            });
        };
        debug!(device = device.index(), nbytes, "allocated device buffer");
        Ok(Arc::new(Self {
            ptr,
            nbytes,
            device: Arc::clone(device),
        }))
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    pub fn device(&self) -> &Arc<AccelDevice> {
        &self.device
    }

    /// Base address of the allocation. Dangling for an empty owner.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.nbytes => Ok(()),
            _ => Err(TesseraError::InvalidView(format!(
                "byte range {offset}+{len} exceeds device buffer of {} bytes",
                self.nbytes
            ))),
        }
    }

    /// Raw copy out of the buffer. Does not wait for queued work.
    pub(crate) fn read_raw(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        if !dst.is_empty() {
            // SAFETY: the range was checked against the allocation.
            unsafe { std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len()) };
        }
        Ok(())
    }

    /// Raw copy into the buffer. Does not wait for queued work.
    pub(crate) fn write_raw(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        if !src.is_empty() {
            // SAFETY: the range was checked against the allocation.
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len()) };
        }
        Ok(())
    }

    fn copy_device_to_device(&self, dst_offset: usize, src: &DeviceBuffer, src_offset: usize, nbytes: usize) -> Result<()> {
        self.check_range(dst_offset, nbytes)?;
        src.check_range(src_offset, nbytes)?;
        if nbytes > 0 {
            // SAFETY: both ranges were checked; `copy` tolerates overlap within one buffer.
            unsafe { std::ptr::copy(src.as_ptr().add(src_offset), self.as_ptr().add(dst_offset), nbytes) };
        }
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.nbytes == 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(self.nbytes, ALIGNMENT) {
            // SAFETY: allocated in `allocate` with this exact layout and freed only here.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
        self.device.release(self.nbytes);
        trace!(device = self.device.index(), nbytes = self.nbytes, "released device buffer");
    }
}

/// Allocate a buffer on `device`.
pub fn allocate(device: &Arc<AccelDevice>, nbytes: usize) -> Result<Arc<DeviceBuffer>> {
    DeviceBuffer::allocate(device, nbytes)
}

/// Copy `nbytes` into accelerator memory from another accelerator buffer
/// (device to device) or from the native peer (host to device).
pub fn copy_within_or_from_peer(
    dst: &DeviceBuffer,
    dst_offset: usize,
    src: &Storage,
    src_offset: usize,
    nbytes: usize,
) -> Result<()> {
    dst.device().drain();
    match src {
        Storage::Accel(src) => {
            src.device().drain();
            trace!(from = src.device().index(), to = dst.device().index(), nbytes, "dtod copy");
            dst.copy_device_to_device(dst_offset, src, src_offset, nbytes)
        }
        Storage::Native(src) => {
            trace!(to = dst.device().index(), nbytes, "htod copy");
            dst.check_range(dst_offset, nbytes)?;
            src.with_bytes(|bytes| {
                let end = checked_end(src_offset, nbytes, bytes.len())?;
                dst.write_raw(dst_offset, &bytes[src_offset..end])
            })
        }
    }
}

/// Copy `nbytes` out of accelerator memory into another accelerator buffer
/// (device to device) or into the native peer (device to host).
pub fn copy_to_peer_or_within(
    src: &DeviceBuffer,
    src_offset: usize,
    dst: &Storage,
    dst_offset: usize,
    nbytes: usize,
) -> Result<()> {
    src.device().drain();
    match dst {
        Storage::Accel(dst) => {
            dst.device().drain();
            trace!(from = src.device().index(), to = dst.device().index(), nbytes, "dtod copy");
            dst.copy_device_to_device(dst_offset, src, src_offset, nbytes)
        }
        Storage::Native(dst) => {
            trace!(from = src.device().index(), nbytes, "dtoh copy");
            src.check_range(src_offset, nbytes)?;
            dst.with_bytes_mut(|bytes| {
                let end = checked_end(dst_offset, nbytes, bytes.len())?;
                src.read_raw(src_offset, &mut bytes[dst_offset..end])
            })
        }
    }
}

/// Allocate on `device` and copy `nbytes` from `src` starting at `src_offset`.
pub fn transfer_from(
    device: &Arc<AccelDevice>,
    src: &Storage,
    src_offset: usize,
    nbytes: usize,
) -> Result<Arc<DeviceBuffer>> {
    let dst = DeviceBuffer::allocate(device, nbytes)?;
    copy_within_or_from_peer(&dst, 0, src, src_offset, nbytes)?;
    debug!(from = %src.device(), to = device.index(), nbytes, "transfer_from");
    Ok(dst)
}

/// Allocate on `target` and copy `nbytes` of `src` starting at `src_offset`.
///
/// Accelerator targets resolve through the registry.
pub fn transfer_to(src: &DeviceBuffer, src_offset: usize, nbytes: usize, target: Device) -> Result<Storage> {
    let dst = match target {
        Device::Native => Storage::Native(Arc::new(NativeBuffer::zeros(nbytes))),
        Device::Accel(idx) => Storage::Accel(DeviceBuffer::allocate(&get_device(idx)?, nbytes)?),
    };
    copy_to_peer_or_within(src, src_offset, &dst, 0, nbytes)?;
    debug!(from = src.device().index(), to = %target, nbytes, "transfer_to");
    Ok(dst)
}

/// Allocate on `device` and copy an entire host byte slice into it.
pub fn import_from_host(device: &Arc<AccelDevice>, host: &[u8]) -> Result<Arc<DeviceBuffer>> {
    let dst = DeviceBuffer::allocate(device, host.len())?;
    dst.write_raw(0, host)?;
    trace!(to = device.index(), nbytes = host.len(), "import_from_host");
    Ok(dst)
}

fn checked_end(offset: usize, len: usize, extent: usize) -> Result<usize> {
    match offset.checked_add(len) {
        Some(end) if end <= extent => Ok(end),
        _ => Err(TesseraError::InvalidView(format!(
            "byte range {offset}+{len} exceeds native buffer of {extent} bytes"
        ))),
    }
}
