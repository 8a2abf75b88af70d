use std::sync::Arc;

use tessera_core::shape::{permute_strides, Strides};
use tessera_core::{DType, Device, Element, NativeBuffer, Result, Scalar, Shape, TesseraError};

use crate::context::{get_device, AccelDevice};
use crate::indexer::Indexer;
use crate::memory::{self, DeviceBuffer};
use crate::ops;
use crate::storage::Storage;

/// An n-dimensional strided array over native or accelerator storage.
///
/// Strides and offset are in bytes. Construction checks that every reachable
/// element lies inside the storage; kernels rely on this and never
/// bounds-check per element.
#[derive(Debug, Clone)]
pub struct Array {
    storage: Storage,
    dtype: DType,
    shape: Shape,
    strides: Strides,
    offset: usize,
}

impl Array {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Wrap existing storage, validating that the layout stays in bounds.
    pub fn from_parts(
        storage: Storage,
        dtype: DType,
        shape: impl Into<Shape>,
        strides: &[isize],
        offset: usize,
    ) -> Result<Self> {
        let shape = shape.into();
        if strides.len() != shape.ndim() {
            return Err(TesseraError::InvalidView(format!(
                "{} strides for {}D shape {}",
                strides.len(),
                shape.ndim(),
                shape
            )));
        }
        let nbytes = storage.nbytes();
        let in_bounds = match byte_extent(shape.dims(), strides, offset, dtype.element_size()) {
            Some((_, hi)) => hi <= nbytes,
            None => false,
        };
        if !in_bounds {
            return Err(TesseraError::InvalidView(format!(
                "shape {shape} with strides {strides:?} at offset {offset} exceeds {nbytes} bytes"
            )));
        }
        Ok(Self {
            storage,
            dtype,
            shape,
            strides: Strides::from_slice(strides),
            offset,
        })
    }

    fn contiguous_on(storage: Storage, dtype: DType, shape: Shape) -> Self {
        let strides = shape.contiguous_strides(dtype.element_size());
        Self {
            storage,
            dtype,
            shape,
            strides,
            offset: 0,
        }
    }

    /// Uninitialized-by-contract (zeroed in practice) contiguous array on `device`.
    pub fn empty(device: &Arc<AccelDevice>, shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        let buf = memory::allocate(device, dtype.storage_bytes(shape.numel()))?;
        Ok(Self::contiguous_on(Storage::Accel(buf), dtype, shape))
    }

    /// Contiguous array on `device` holding a copy of `data`.
    pub fn from_slice<T: Element>(device: &Arc<AccelDevice>, shape: impl Into<Shape>, data: &[T]) -> Result<Self> {
        let shape = check_len(shape.into(), data.len())?;
        let buf = memory::import_from_host(device, bytemuck::cast_slice(data))?;
        Ok(Self::contiguous_on(Storage::Accel(buf), T::DTYPE, shape))
    }

    /// Contiguous array in native (host) memory holding a copy of `data`.
    pub fn from_native_slice<T: Element>(shape: impl Into<Shape>, data: &[T]) -> Result<Self> {
        let shape = check_len(shape.into(), data.len())?;
        Ok(Self::contiguous_on(
            Storage::Native(Arc::new(NativeBuffer::from_slice(data))),
            T::DTYPE,
            shape,
        ))
    }

    /// Array on `device` with every element set to `value`.
    pub fn full(device: &Arc<AccelDevice>, shape: impl Into<Shape>, dtype: DType, value: impl Into<Scalar>) -> Result<Self> {
        let out = Self::empty(device, shape, dtype)?;
        ops::fill(&out, value.into())?;
        Ok(out)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Backing storage, shared with every view of it.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Logical shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Per-axis sizes.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Per-axis strides in bytes.
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Byte offset of the first element inside the storage.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Bytes per element.
    pub fn item_size(&self) -> usize {
        self.dtype.element_size()
    }

    /// Device holding the storage.
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// The accelerator this array lives on, if any.
    pub fn accel_device(&self) -> Option<&Arc<AccelDevice>> {
        match &self.storage {
            Storage::Accel(buf) => Some(buf.device()),
            Storage::Native(_) => None,
        }
    }

    /// The backing device buffer; fails for native arrays.
    pub fn accel_buffer(&self) -> Result<&Arc<DeviceBuffer>> {
        match &self.storage {
            Storage::Accel(buf) => Ok(buf),
            Storage::Native(_) => Err(TesseraError::InvalidDevice(
                "array is resident in native memory, not on an accelerator".into(),
            )),
        }
    }

    /// Row-major contiguous. Axes of length one are ignored.
    pub fn is_contiguous(&self) -> bool {
        self.numel() == 0 || is_dense(self.dims().iter().rev().zip(self.strides.iter().rev()), self.item_size())
    }

    /// Column-major contiguous. Axes of length one are ignored.
    pub fn is_column_major(&self) -> bool {
        self.numel() == 0 || is_dense(self.dims().iter().zip(self.strides.iter()), self.item_size())
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// A view over the same storage with a different layout.
    pub fn as_strided(&self, shape: impl Into<Shape>, strides: &[isize], offset: usize) -> Result<Array> {
        Self::from_parts(self.storage.clone(), self.dtype, shape, strides, offset)
    }

    /// Reverse the axis order (a 2-D transpose for matrices).
    pub fn transpose(&self) -> Array {
        let mut dims = self.dims().to_vec();
        dims.reverse();
        let mut strides = self.strides.clone();
        strides.reverse();
        Self {
            storage: self.storage.clone(),
            dtype: self.dtype,
            shape: Shape::from(dims),
            strides,
            offset: self.offset,
        }
    }

    /// Reorder axes by `perm`.
    pub fn permute(&self, perm: &[usize]) -> Result<Array> {
        Ok(Self {
            storage: self.storage.clone(),
            dtype: self.dtype,
            shape: self.shape.permute(perm)?,
            strides: permute_strides(&self.strides, perm)?,
            offset: self.offset,
        })
    }

    /// Reinterpret a contiguous array with a new shape of equal size.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Array> {
        let shape = shape.into();
        if shape.numel() != self.numel() {
            return Err(TesseraError::ShapeMismatch {
                op: "reshape",
                lhs: self.shape.clone(),
                rhs: shape,
            });
        }
        if !self.is_contiguous() {
            return Err(TesseraError::InvalidView(
                "cannot reshape a non-contiguous array without a copy".into(),
            ));
        }
        Ok(Self {
            storage: self.storage.clone(),
            dtype: self.dtype,
            strides: shape.contiguous_strides(self.item_size()),
            shape,
            offset: self.offset,
        })
    }

    // =========================================================================
    // Device transfer
    // =========================================================================

    /// Copy to `target`. No-op if already there.
    ///
    /// Accelerator targets resolve through the device registry.
    pub fn to_device(&self, target: Device) -> Result<Array> {
        match target {
            Device::Native => self.to_native(),
            Device::Accel(idx) => self.to_accel(&get_device(idx)?),
        }
    }

    /// Copy onto a specific accelerator handle.
    pub fn to_accel(&self, device: &Arc<AccelDevice>) -> Result<Array> {
        if let Some(current) = self.accel_device() {
            if Arc::ptr_eq(current, device) {
                return Ok(self.clone());
            }
        }
        let src = self.packed()?;
        let nbytes = src.dtype.storage_bytes(src.numel());
        let buf = memory::transfer_from(device, &src.storage, src.offset, nbytes)?;
        Ok(Self::contiguous_on(Storage::Accel(buf), self.dtype, self.shape.clone()))
    }

    /// Copy into native memory. No-op for native arrays.
    pub fn to_native(&self) -> Result<Array> {
        match &self.storage {
            Storage::Native(_) => Ok(self.clone()),
            Storage::Accel(_) => {
                let src = self.packed()?;
                let nbytes = src.dtype.storage_bytes(src.numel());
                let buf = src.accel_buffer()?;
                let storage = memory::transfer_to(buf, src.offset, nbytes, Device::Native)?;
                Ok(Self::contiguous_on(storage, self.dtype, self.shape.clone()))
            }
        }
    }

    /// Contiguous equivalent of `self`, sharing storage when already contiguous.
    fn packed(&self) -> Result<Array> {
        if self.is_contiguous() {
            return Ok(Self {
                strides: self.shape.contiguous_strides(self.item_size()),
                ..self.clone()
            });
        }
        match self.accel_device() {
            Some(device) => {
                let out = Self::empty(device, self.shape.clone(), self.dtype)?;
                ops::copy(self, &out)?;
                Ok(out)
            }
            None => {
                let bytes = self.gather_bytes()?;
                Ok(Self::contiguous_on(
                    Storage::Native(Arc::new(NativeBuffer::from_bytes(bytes))),
                    self.dtype,
                    self.shape.clone(),
                ))
            }
        }
    }

    // =========================================================================
    // Host inspection
    // =========================================================================

    /// Copy all elements to the host in row-major order.
    ///
    /// Synchronizes the owning accelerator first, so faults raised by earlier
    /// asynchronous work surface here.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(TesseraError::DtypeMismatch {
                op: "to_vec",
                lhs: self.dtype,
                rhs: T::DTYPE,
            });
        }
        if let Some(device) = self.accel_device() {
            device.synchronize()?;
        }
        let bytes = self.gather_bytes()?;
        Ok(bytes
            .chunks_exact(self.item_size())
            .map(T::from_ne_slice)
            .collect())
    }

    /// Single element of a one-element array, converted to a scalar.
    pub fn item(&self) -> Result<Scalar> {
        if self.numel() != 1 {
            return Err(TesseraError::ShapeMismatch {
                op: "item",
                lhs: self.shape.clone(),
                rhs: Shape::scalar(),
            });
        }
        tessera_core::dispatch_dtype!(self.dtype, T, {
            Ok(self.to_vec::<T>()?[0].to_scalar())
        })
    }

    fn gather_bytes(&self) -> Result<Vec<u8>> {
        let item = self.item_size();
        let numel = self.numel();
        if numel == 0 {
            return Ok(Vec::new());
        }
        let (lo, hi) = byte_extent(self.dims(), &self.strides, self.offset, item).ok_or_else(|| {
            TesseraError::InvalidView("array layout is out of bounds".into())
        })?;
        let mut span = vec![0u8; hi - lo];
        self.storage.read_bytes(lo, &mut span)?;
        if self.is_contiguous() {
            return Ok(span);
        }
        let base = (self.offset - lo) as isize;
        let mut out = Vec::with_capacity(numel * item);
        let mut it = Indexer::new(self.dims());
        for flat in 0..numel {
            it.set(flat);
            let at = base
                + it.index()
                    .iter()
                    .zip(self.strides.iter())
                    .map(|(&i, &s)| i as isize * s)
                    .sum::<isize>();
            let at = at as usize;
            out.extend_from_slice(&span[at..at + item]);
        }
        Ok(out)
    }
}

fn check_len(shape: Shape, len: usize) -> Result<Shape> {
    if shape.numel() != len {
        return Err(TesseraError::ShapeMismatch {
            op: "from_slice",
            lhs: shape,
            rhs: Shape::new(&[len]),
        });
    }
    Ok(shape)
}

fn is_dense<'a>(axes: impl Iterator<Item = (&'a usize, &'a isize)>, item: usize) -> bool {
    let mut expected = item as isize;
    for (&dim, &stride) in axes {
        if dim != 1 && stride != expected {
            return false;
        }
        expected *= dim as isize;
    }
    true
}

/// Smallest and one-past-largest byte touched by a layout, or `None` if a
/// negative stride reaches below the start of the storage.
fn byte_extent(dims: &[usize], strides: &[isize], offset: usize, item: usize) -> Option<(usize, usize)> {
    if dims.iter().any(|&d| d == 0) {
        return Some((offset, offset));
    }
    let mut lo = offset as i128;
    let mut hi = offset as i128;
    for (&dim, &stride) in dims.iter().zip(strides) {
        let span = (dim as i128 - 1) * stride as i128;
        if span < 0 {
            lo += span;
        } else {
            hi += span;
        }
    }
    hi += item as i128;
    if lo < 0 {
        return None;
    }
    Some((usize::try_from(lo).ok()?, usize::try_from(hi).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn device() -> Arc<AccelDevice> {
        AccelDevice::new(0, DeviceConfig::default().with_multiprocessors(2)).unwrap()
    }

    #[test]
    fn test_from_slice_layout() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.strides(), &[12, 4]);
        assert!(a.is_contiguous());
        assert!(!a.is_column_major());
        assert_eq!(a.device(), Device::Accel(0));
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_from_slice_length_checked() {
        let dev = device();
        assert!(matches!(
            Array::from_slice(&dev, [2, 2], &[1i32, 2, 3]),
            Err(TesseraError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_transpose_is_column_major_view() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 3], &[1i64, 2, 3, 4, 5, 6]).unwrap();
        let t = a.transpose();
        assert_eq!(t.dims(), &[3, 2]);
        assert!(!t.is_contiguous());
        assert!(t.is_column_major());
        assert_eq!(t.to_vec::<i64>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_reshape_requires_contiguity() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 3], &[0u8; 6]).unwrap();
        assert_eq!(a.reshape([3, 2]).unwrap().strides(), &[2, 1]);
        assert!(a.transpose().reshape([6]).is_err());
        assert!(a.reshape([4]).is_err());
    }

    #[test]
    fn test_out_of_bounds_layout_rejected() {
        let storage = Storage::Native(Arc::new(NativeBuffer::zeros(16)));
        assert!(Array::from_parts(storage.clone(), DType::F32, [4], &[4], 0).is_ok());
        assert!(Array::from_parts(storage.clone(), DType::F32, [4], &[4], 4).is_err());
        assert!(Array::from_parts(storage.clone(), DType::F32, [2], &[-4], 0).is_err());
        assert!(Array::from_parts(storage.clone(), DType::F32, [2], &[-4], 4).is_ok());
        assert!(Array::from_parts(storage, DType::F32, [0, 9], &[36, 4], 16).is_ok());
    }

    #[test]
    fn test_negative_stride_view_reads_reversed() {
        let a = Array::from_native_slice([3], &[1i16, 2, 3]).unwrap();
        let rev = a.as_strided([3], &[-2], 4).unwrap();
        assert_eq!(rev.to_vec::<i16>().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_device_round_trip_of_strided_native_array() {
        let dev = device();
        let a = Array::from_native_slice([2, 2], &[1u8, 2, 3, 4]).unwrap().transpose();
        let on_dev = a.to_accel(&dev).unwrap();
        assert!(on_dev.is_contiguous());
        let back = on_dev.to_native().unwrap();
        assert_eq!(back.to_vec::<u8>().unwrap(), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_item_and_dtype_check() {
        let dev = device();
        let a = Array::full(&dev, [1, 1], DType::I32, 7).unwrap();
        assert_eq!(a.item().unwrap(), Scalar::Int(7));
        assert!(a.to_vec::<f32>().is_err());
    }
}
