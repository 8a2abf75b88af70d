use smallvec::SmallVec;

/// Inline capacity for per-axis data carried into kernels.
pub const MAX_INLINE_DIMS: usize = 8;

/// Maps flat positions in `[0, total)` to row-major coordinates of a shape.
///
/// One indexer is built per launch; each lane works on its own clone, so the
/// cursor is never shared between parallel units.
#[derive(Debug, Clone)]
pub struct Indexer {
    shape: SmallVec<[usize; MAX_INLINE_DIMS]>,
    total: usize,
    index: SmallVec<[usize; MAX_INLINE_DIMS]>,
    raw: usize,
}

impl Indexer {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: SmallVec::from_slice(shape),
            total: shape.iter().product(),
            index: SmallVec::from_elem(0, shape.len()),
            raw: 0,
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn total_size(&self) -> usize {
        self.total
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Current coordinate, one entry per axis.
    #[inline]
    pub fn index(&self) -> &[usize] {
        &self.index
    }

    /// Flat position last passed to [`set`](Self::set).
    #[inline]
    pub fn raw_index(&self) -> usize {
        self.raw
    }

    /// Move the cursor to `flat`, last axis varying fastest.
    ///
    /// `flat` must be below [`total_size`](Self::total_size).
    #[inline]
    pub fn set(&mut self, flat: usize) {
        debug_assert!(flat < self.total, "flat position {flat} out of {}", self.total);
        self.raw = flat;
        let mut rem = flat;
        for axis in (0..self.shape.len()).rev() {
            let dim = self.shape[axis];
            self.index[axis] = rem % dim;
            rem /= dim;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_decomposition() {
        let mut it = Indexer::new(&[2, 3, 4]);
        assert_eq!(it.total_size(), 24);
        it.set(0);
        assert_eq!(it.index(), &[0, 0, 0]);
        it.set(5);
        assert_eq!(it.index(), &[0, 1, 1]);
        it.set(23);
        assert_eq!(it.index(), &[1, 2, 3]);
        assert_eq!(it.raw_index(), 23);
    }

    #[test]
    fn test_scalar_shape() {
        let mut it = Indexer::new(&[]);
        assert_eq!(it.total_size(), 1);
        it.set(0);
        assert!(it.index().is_empty());
    }

    #[test]
    fn test_zero_extent() {
        let it = Indexer::new(&[4, 0]);
        assert_eq!(it.total_size(), 0);
    }

    #[test]
    fn test_clones_are_independent() {
        let mut a = Indexer::new(&[3, 3]);
        let mut b = a.clone();
        a.set(4);
        b.set(8);
        assert_eq!(a.index(), &[1, 1]);
        assert_eq!(b.index(), &[2, 2]);
    }
}
