//! Reduction framework and the sum, max and arg-max reductions.
//!
//! A reduction is four primitives over an accumulator: `identity`, `map_in`
//! (element plus its flat index within the reduced block), `reduce`
//! (merge `next` into the running accumulator) and `map_out`. The engine
//! visits every retained-axis coordinate and folds the cross-product of the
//! reduced axes into it.

use std::marker::PhantomData;

use rayon::prelude::*;
use smallvec::SmallVec;
use tessera_core::dispatch_dtype;
use tessera_core::shape::check_axes;
use tessera_core::{DType, Element, Result, TesseraError};
use tracing::trace;

use super::{check_device, check_dtype, out_device};
use crate::array::Array;
use crate::context::AccelDevice;
use crate::indexer::{Indexer, MAX_INLINE_DIMS};
use crate::launch::{launch_elementwise, KernelSpec};
use crate::view::{StridedView, StridedViewMut};

/// Reduced extent from which a single output position is worth splitting
/// across lanes.
const SPLIT_THRESHOLD: usize = 1 << 14;

const SUM: KernelSpec = KernelSpec::new("sum", 24);
const AMAX: KernelSpec = KernelSpec::new("amax", 24);
const ARGMAX: KernelSpec = KernelSpec::new("argmax", 32);

/// The four primitives of a reduction.
pub trait Reduction: Send + Sync + 'static {
    type In: Element;
    type Acc: Copy + Send + Sync + 'static;
    type Out: Element;

    fn identity(&self) -> Self::Acc;
    fn map_in(&self, value: Self::In, index: i64) -> Self::Acc;
    fn reduce(&self, next: Self::Acc, accum: &mut Self::Acc);
    fn map_out(&self, accum: Self::Acc) -> Self::Out;
}

/// Input and output views prepared for the engine.
///
/// The input is permuted so retained axes come first and reduced axes last;
/// the output carries only the retained axes, which line up positionally
/// with the leading input axes.
pub struct ReductionArg<In, Out> {
    input: StridedView<In>,
    output: StridedViewMut<Out>,
    out_shape: SmallVec<[usize; MAX_INLINE_DIMS]>,
    reduce_shape: SmallVec<[usize; MAX_INLINE_DIMS]>,
}

impl<In: Element, Out: Element> ReductionArg<In, Out> {
    /// Reduce `input` over `axes` into `output`.
    ///
    /// `output` may either drop the reduced axes or keep them with length one.
    pub fn new(op: &'static str, input: &Array, axes: &[usize], output: &Array) -> Result<Self> {
        let ndim = input.ndim();
        check_axes(axes, ndim)?;
        let mut reduced: SmallVec<[usize; MAX_INLINE_DIMS]> = SmallVec::from_slice(axes);
        reduced.sort_unstable();
        let kept: SmallVec<[usize; MAX_INLINE_DIMS]> = (0..ndim).filter(|a| !reduced.contains(a)).collect();

        let squeezed = input.shape().without_axes(&reduced);
        let out = if output.shape() == &squeezed {
            output.clone()
        } else if output.shape() == &input.shape().with_unit_axes(&reduced) {
            let strides: Vec<isize> = kept.iter().map(|&a| output.strides()[a]).collect();
            output.as_strided(squeezed, &strides, output.offset())?
        } else {
            return Err(TesseraError::ShapeMismatch {
                op,
                lhs: squeezed,
                rhs: output.shape().clone(),
            });
        };

        let perm: SmallVec<[usize; MAX_INLINE_DIMS]> = kept.iter().chain(reduced.iter()).copied().collect();
        Ok(Self {
            input: StridedView::from_array(input)?.permuted(&perm),
            output: StridedViewMut::from_array(&out)?,
            out_shape: kept.iter().map(|&a| input.dims()[a]).collect(),
            reduce_shape: reduced.iter().map(|&a| input.dims()[a]).collect(),
        })
    }

    pub fn out_size(&self) -> usize {
        self.out_shape.iter().product()
    }

    pub fn reduce_size(&self) -> usize {
        self.reduce_shape.iter().product()
    }
}

/// Run `op` over `arg` on `device`.
///
/// Each output position is normally folded serially by one lane. When there
/// are fewer outputs than workers and the reduced extent is large, each
/// output is instead split into contiguous chunks reduced in parallel; the
/// partial accumulators are merged left to right, so order-sensitive
/// reductions such as arg-max keep their first-occurrence tie-break.
pub fn reduce<R: Reduction>(
    device: &AccelDevice,
    spec: &KernelSpec,
    arg: ReductionArg<R::In, R::Out>,
    op: R,
) -> Result<()> {
    let out_size = arg.out_size();
    let reduce_size = arg.reduce_size();
    if out_size == 0 {
        return Ok(());
    }
    let workers = device.config().multiprocessors.max(1);
    if out_size < workers && reduce_size >= SPLIT_THRESHOLD {
        return reduce_split(device, spec, arg, op, workers);
    }

    let ReductionArg {
        input,
        output,
        out_shape,
        reduce_shape,
    } = arg;
    let reduce_it = Indexer::new(&reduce_shape);
    launch_elementwise(device, spec, <R::In as Element>::DTYPE, Indexer::new(&out_shape), move |it| {
        let mut rit = reduce_it.clone();
        let mut accum = op.identity();
        for j in 0..reduce_size {
            rit.set(j);
            let value = input.get2(it.index(), rit.index());
            op.reduce(op.map_in(value, j as i64), &mut accum);
        }
        output.set(it, op.map_out(accum));
    })
}

fn reduce_split<R: Reduction>(
    device: &AccelDevice,
    spec: &KernelSpec,
    arg: ReductionArg<R::In, R::Out>,
    op: R,
    workers: usize,
) -> Result<()> {
    let ReductionArg {
        input,
        output,
        out_shape,
        reduce_shape,
    } = arg;
    let reduce_size: usize = reduce_shape.iter().product();
    let chunk = (reduce_size + workers - 1) / workers;
    let lanes = (reduce_size + chunk - 1) / chunk;
    trace!(kernel = spec.name, reduce_size, lanes, chunk, "split reduction");
    let pool = device.pool();
    device.enqueue(move || {
        let reduce_it = Indexer::new(&reduce_shape);
        let mut out_it = Indexer::new(&out_shape);
        for o in 0..out_it.total_size() {
            out_it.set(o);
            let head = out_it.index();
            let partials: Vec<R::Acc> = pool.install(|| {
                (0..lanes)
                    .into_par_iter()
                    .map(|lane| {
                        let mut rit = reduce_it.clone();
                        let mut accum = op.identity();
                        let end = ((lane + 1) * chunk).min(reduce_size);
                        for j in lane * chunk..end {
                            rit.set(j);
                            op.reduce(op.map_in(input.get2(head, rit.index()), j as i64), &mut accum);
                        }
                        accum
                    })
                    .collect()
            });
            let mut accum = op.identity();
            for partial in partials {
                op.reduce(partial, &mut accum);
            }
            output.set(&out_it, op.map_out(accum));
        }
    })
}

// =========================================================================
// Reductions
// =========================================================================

pub struct SumImpl<T>(PhantomData<fn() -> T>);

impl<T: Element> Reduction for SumImpl<T> {
    type In = T;
    type Acc = T;
    type Out = T;

    fn identity(&self) -> T {
        T::zero()
    }

    #[inline]
    fn map_in(&self, value: T, _index: i64) -> T {
        value
    }

    #[inline]
    fn reduce(&self, next: T, accum: &mut T) {
        *accum = accum.add_elem(next);
    }

    fn map_out(&self, accum: T) -> T {
        accum
    }
}

pub struct AMaxImpl<T>(PhantomData<fn() -> T>);

impl<T: Element> Reduction for AMaxImpl<T> {
    type In = T;
    type Acc = T;
    type Out = T;

    fn identity(&self) -> T {
        T::lowest()
    }

    #[inline]
    fn map_in(&self, value: T, _index: i64) -> T {
        value
    }

    #[inline]
    fn reduce(&self, next: T, accum: &mut T) {
        if *accum < next {
            *accum = next;
        }
    }

    fn map_out(&self, accum: T) -> T {
        accum
    }
}

/// Running maximum and where it was seen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgMaxAcc<T> {
    pub value: T,
    pub index: i64,
}

pub struct ArgMaxImpl<T>(PhantomData<fn() -> T>);

impl<T: Element> Reduction for ArgMaxImpl<T> {
    type In = T;
    type Acc = ArgMaxAcc<T>;
    type Out = i64;

    fn identity(&self) -> ArgMaxAcc<T> {
        ArgMaxAcc {
            value: T::zero(),
            index: -1,
        }
    }

    #[inline]
    fn map_in(&self, value: T, index: i64) -> ArgMaxAcc<T> {
        ArgMaxAcc { value, index }
    }

    // Strict comparison: ties keep the running (earlier) index.
    #[inline]
    fn reduce(&self, next: ArgMaxAcc<T>, accum: &mut ArgMaxAcc<T>) {
        if accum.index < 0 || accum.value < next.value {
            *accum = next;
        }
    }

    fn map_out(&self, accum: ArgMaxAcc<T>) -> i64 {
        accum.index
    }
}

// =========================================================================
// Entry points
// =========================================================================

fn prepare_reduction<'a>(op: &'static str, input: &Array, out: &'a Array) -> Result<&'a std::sync::Arc<AccelDevice>> {
    let device = out_device(op, out)?;
    check_device(device, input)?;
    Ok(device)
}

/// Sum of `input` over `axes`, written to `out` (same dtype as `input`).
pub fn sum(input: &Array, axes: &[usize], out: &Array) -> Result<()> {
    let device = prepare_reduction("sum", input, out)?;
    check_dtype("sum", input.dtype(), out.dtype())?;
    dispatch_dtype!(input.dtype(), T, {
        let arg = ReductionArg::<T, T>::new("sum", input, axes, out)?;
        reduce(device, &SUM, arg, SumImpl::<T>(PhantomData))
    })
}

/// Maximum of `input` over `axes`, written to `out` (same dtype as `input`).
///
/// Reducing an empty extent yields the dtype's lowest value.
pub fn amax(input: &Array, axes: &[usize], out: &Array) -> Result<()> {
    let device = prepare_reduction("amax", input, out)?;
    check_dtype("amax", input.dtype(), out.dtype())?;
    dispatch_dtype!(input.dtype(), T, {
        let arg = ReductionArg::<T, T>::new("amax", input, axes, out)?;
        reduce(device, &AMAX, arg, AMaxImpl::<T>(PhantomData))
    })
}

/// Flat index (within the reduced axes) of the first maximum, written to an
/// `I64` output.
pub fn argmax(input: &Array, axes: &[usize], out: &Array) -> Result<()> {
    let device = prepare_reduction("argmax", input, out)?;
    check_dtype("argmax", DType::I64, out.dtype())?;
    dispatch_dtype!(input.dtype(), T, {
        let arg = ReductionArg::<T, i64>::new("argmax", input, axes, out)?;
        if arg.reduce_size() == 0 && arg.out_size() > 0 {
            return Err(TesseraError::InvalidView("argmax of an empty sequence".into()));
        }
        reduce(device, &ARGMAX, arg, ArgMaxImpl::<T>(PhantomData))
    })
}
