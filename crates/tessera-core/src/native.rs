//! Host-resident byte buffers for the native (non-accelerator) backend.
//!
//! The accelerator backend only needs the native side as a transfer peer,
//! so this is deliberately thin: a lock-protected byte vector with ranged
//! reads and writes.

use parking_lot::RwLock;

use crate::error::TesseraError;
use crate::Result;

/// A host-memory buffer owned by the native backend.
#[derive(Debug, Default)]
pub struct NativeBuffer {
    bytes: RwLock<Vec<u8>>,
}

impl NativeBuffer {
    /// Zero-initialized buffer of `nbytes` bytes.
    pub fn zeros(nbytes: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; nbytes]),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Buffer holding the raw native-endian bytes of `data`.
    pub fn from_slice<T: bytemuck::NoUninit>(data: &[T]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(data).to_vec())
    }

    pub fn nbytes(&self) -> usize {
        self.bytes.read().len()
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let range = checked_range(offset, dst.len(), bytes.len())?;
        dst.copy_from_slice(&bytes[range]);
        Ok(())
    }

    /// Overwrite `src.len()` bytes starting at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let len = bytes.len();
        let range = checked_range(offset, src.len(), len)?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }

    /// Run `f` over the whole buffer under a shared lock.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read())
    }

    /// Run `f` over the whole buffer under an exclusive lock.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.write())
    }
}

fn checked_range(offset: usize, len: usize, extent: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= extent => Ok(offset..end),
        _ => Err(TesseraError::InvalidView(format!(
            "byte range {offset}+{len} exceeds native buffer of {extent} bytes"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranged_read_write() {
        let buf = NativeBuffer::zeros(8);
        buf.write_at(2, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 4];
        buf.read_at(1, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3]);
    }

    #[test]
    fn test_out_of_range() {
        let buf = NativeBuffer::zeros(4);
        assert!(buf.write_at(3, &[0, 0]).is_err());
        let mut out = [0u8; 1];
        assert!(buf.read_at(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn test_from_slice() {
        let buf = NativeBuffer::from_slice(&[1.0f32, -2.0]);
        assert_eq!(buf.nbytes(), 8);
        let floats: Vec<f32> = buf.with_bytes(|b| {
            b.chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect()
        });
        assert_eq!(floats, vec![1.0, -2.0]);
    }

    #[test]
    fn test_zero_sized() {
        let buf = NativeBuffer::zeros(0);
        assert_eq!(buf.nbytes(), 0);
        buf.write_at(0, &[]).unwrap();
    }
}
