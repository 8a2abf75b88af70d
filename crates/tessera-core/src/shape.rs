use smallvec::SmallVec;
use std::fmt;

use crate::error::TesseraError;
use crate::Result;

/// Byte strides, one per axis. Negative strides are allowed.
pub type Strides = SmallVec<[isize; 4]>;

/// Array shape with inline storage for up to four axes.
///
/// A shape with any zero-length axis has zero elements; the empty shape is a
/// scalar with one element.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Shape with the given per-axis sizes.
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Rank-0 shape holding a single element.
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Per-axis sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Size along `axis`, or `None` past the rank.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// True for rank 0.
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Row-major byte strides for elements of `item_size` bytes.
    pub fn contiguous_strides(&self, item_size: usize) -> Strides {
        let ndim = self.dims.len();
        let mut strides: Strides = SmallVec::from_elem(0isize, ndim);
        let mut acc = item_size as isize;
        for i in (0..ndim).rev() {
            strides[i] = acc;
            acc *= self.dims[i].max(1) as isize;
        }
        strides
    }

    /// Shape with the axes reordered by `perm`.
    pub fn permute(&self, perm: &[usize]) -> Result<Shape> {
        check_permutation(perm, self.ndim())?;
        Ok(Shape {
            dims: perm.iter().map(|&p| self.dims[p]).collect(),
        })
    }

    /// Shape with the listed axes removed.
    pub fn without_axes(&self, axes: &[usize]) -> Shape {
        Shape {
            dims: self
                .dims
                .iter()
                .enumerate()
                .filter(|(i, _)| !axes.contains(i))
                .map(|(_, &d)| d)
                .collect(),
        }
    }

    /// Shape with the listed axes kept at length one.
    pub fn with_unit_axes(&self, axes: &[usize]) -> Shape {
        Shape {
            dims: self
                .dims
                .iter()
                .enumerate()
                .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
                .collect(),
        }
    }
}

/// Validate a list of axes against `ndim`: every entry in range and no repeats.
pub fn check_axes(axes: &[usize], ndim: usize) -> Result<()> {
    for (i, &axis) in axes.iter().enumerate() {
        if axis >= ndim || axes[..i].contains(&axis) {
            return Err(TesseraError::InvalidAxis {
                axes: axes.to_vec(),
                ndim,
            });
        }
    }
    Ok(())
}

fn check_permutation(perm: &[usize], ndim: usize) -> Result<()> {
    if perm.len() != ndim {
        return Err(TesseraError::InvalidAxis {
            axes: perm.to_vec(),
            ndim,
        });
    }
    check_axes(perm, ndim)
}

/// Reorder a stride vector with `perm`.
pub fn permute_strides(strides: &[isize], perm: &[usize]) -> Result<Strides> {
    check_permutation(perm, strides.len())?;
    Ok(perm.iter().map(|&p| strides[p]).collect())
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for Shape {
                fn from(dims: [usize; $n]) -> Self {
                    Shape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(0, 1, 2, 3, 4, 5, 6);
