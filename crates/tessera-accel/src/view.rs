//! Typed strided views over accelerator buffers, as captured by kernels.
//!
//! A view is a base pointer plus one `(size, byte stride)` pair per axis.
//! Arrays validate their extents on construction, so element access here is
//! unchecked in release builds and therefore crate-private: only kernels,
//! which address positions of the launch shape, read and write through it. Each view keeps its buffer alive for as long as a queued kernel
//! holds it.

use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;
use tessera_core::{Element, Result, TesseraError};

use crate::array::Array;
use crate::indexer::{Indexer, MAX_INLINE_DIMS};
use crate::memory::DeviceBuffer;

#[derive(Debug, Clone)]
struct RawView {
    base: *mut u8,
    dims: SmallVec<[(usize, isize); MAX_INLINE_DIMS]>,
    owner: Arc<DeviceBuffer>,
}

impl RawView {
    fn from_array<T: Element>(array: &Array) -> Result<Self> {
        if array.dtype() != T::DTYPE {
            return Err(TesseraError::DtypeMismatch {
                op: "view",
                lhs: array.dtype(),
                rhs: T::DTYPE,
            });
        }
        let owner = Arc::clone(array.accel_buffer()?);
        Ok(Self {
            base: owner.as_ptr().wrapping_add(array.offset()),
            dims: array
                .dims()
                .iter()
                .copied()
                .zip(array.strides().iter().copied())
                .collect(),
            owner,
        })
    }

    fn permuted(&self, perm: &[usize]) -> Self {
        Self {
            base: self.base,
            dims: perm.iter().map(|&p| self.dims[p]).collect(),
            owner: Arc::clone(&self.owner),
        }
    }

    /// Debug-build check that `index` addresses an element of this view.
    #[inline]
    fn debug_check(&self, index: &[usize]) {
        debug_assert_eq!(index.len(), self.dims.len(), "coordinate rank does not match view rank");
        debug_assert!(
            index.iter().zip(self.dims.iter()).all(|(&i, &(size, _))| i < size),
            "coordinate {index:?} out of range for view of shape {:?}",
            self.dims.iter().map(|&(size, _)| size).collect::<Vec<_>>()
        );
    }

    #[inline]
    fn offset_of(&self, index: &[usize]) -> isize {
        self.debug_check(index);
        index
            .iter()
            .zip(self.dims.iter())
            .map(|(&i, &(_, stride))| i as isize * stride)
            .sum()
    }

    #[inline]
    fn offset_of2(&self, head: &[usize], tail: &[usize]) -> isize {
        #[cfg(debug_assertions)]
        self.debug_check(&[head, tail].concat());
        let (head_dims, tail_dims) = self.dims.split_at(head.len());
        let a: isize = head.iter().zip(head_dims).map(|(&i, &(_, s))| i as isize * s).sum();
        let b: isize = tail.iter().zip(tail_dims).map(|(&i, &(_, s))| i as isize * s).sum();
        a + b
    }

    #[inline]
    unsafe fn read<T: Element>(&self, offset: isize) -> T {
        let ptr = self.base.offset(offset);
        T::from_ne_slice(std::slice::from_raw_parts(ptr, std::mem::size_of::<T>()))
    }

    #[inline]
    unsafe fn write<T: Element>(&self, offset: isize, value: T) {
        std::ptr::write_unaligned(self.base.offset(offset) as *mut T, value);
    }
}

/// Read-only typed view.
#[derive(Debug, Clone)]
pub struct StridedView<T> {
    raw: RawView,
    _marker: PhantomData<fn() -> T>,
}

// SAFETY: the view only reads plain element bytes of a buffer kept alive by
// `owner`; conflicting writers are excluded by queue ordering.
unsafe impl<T: Element> Send for StridedView<T> {}
unsafe impl<T: Element> Sync for StridedView<T> {}

impl<T: Element> StridedView<T> {
    pub fn from_array(array: &Array) -> Result<Self> {
        Ok(Self {
            raw: RawView::from_array::<T>(array)?,
            _marker: PhantomData,
        })
    }

    pub fn ndim(&self) -> usize {
        self.raw.dims.len()
    }

    pub fn shape(&self) -> SmallVec<[usize; MAX_INLINE_DIMS]> {
        self.raw.dims.iter().map(|&(size, _)| size).collect()
    }

    /// View with axes reordered by `perm`. `perm` must be a permutation.
    pub fn permuted(&self, perm: &[usize]) -> Self {
        Self {
            raw: self.raw.permuted(perm),
            _marker: PhantomData,
        }
    }

    /// Element at the indexer's current coordinate.
    #[inline]
    pub(crate) fn get(&self, it: &Indexer) -> T {
        self.at(it.index())
    }

    /// Element at `index`. Coordinates are only checked in debug builds;
    /// kernels pass positions of the launch shape, which is the view's shape.
    #[inline]
    pub(crate) fn at(&self, index: &[usize]) -> T {
        // SAFETY: in-range coordinates of a validated array stay inside `owner`.
        unsafe { self.raw.read(self.raw.offset_of(index)) }
    }

    /// Element at the coordinate formed by `head` followed by `tail`.
    #[inline]
    pub(crate) fn get2(&self, head: &[usize], tail: &[usize]) -> T {
        // SAFETY: as for `at`.
        unsafe { self.raw.read(self.raw.offset_of2(head, tail)) }
    }
}

/// Writable typed view.
///
/// Lanes of one launch write disjoint positions, so writes take `&self`.
#[derive(Debug, Clone)]
pub struct StridedViewMut<T> {
    raw: RawView,
    _marker: PhantomData<fn() -> T>,
}

// SAFETY: as for `StridedView`; each position is written by one lane only.
unsafe impl<T: Element> Send for StridedViewMut<T> {}
unsafe impl<T: Element> Sync for StridedViewMut<T> {}

impl<T: Element> StridedViewMut<T> {
    pub fn from_array(array: &Array) -> Result<Self> {
        Ok(Self {
            raw: RawView::from_array::<T>(array)?,
            _marker: PhantomData,
        })
    }

    pub fn ndim(&self) -> usize {
        self.raw.dims.len()
    }

    /// Store `value` at the indexer's current coordinate.
    #[inline]
    pub(crate) fn set(&self, it: &Indexer, value: T) {
        self.set_at(it.index(), value)
    }

    #[inline]
    pub(crate) fn set_at(&self, index: &[usize], value: T) {
        // SAFETY: in-range coordinates of a validated array stay inside `owner`.
        unsafe { self.raw.write(self.raw.offset_of(index), value) }
    }
}
