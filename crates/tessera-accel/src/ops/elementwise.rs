//! Element-wise operators.
//!
//! One grid-stride kernel per operator, iterating the output's shape and
//! addressing every operand through its own strided view.

use std::sync::Arc;

use tessera_core::{dispatch_dtype, dispatch_float_dtype};
use tessera_core::{DType, Element, FloatElement, Result, Scalar, TesseraError};

use super::{check_dtype, prepare};
use crate::array::Array;
use crate::context::AccelDevice;
use crate::indexer::Indexer;
use crate::launch::{launch_elementwise, KernelSpec};
use crate::view::{StridedView, StridedViewMut};

const FILL: KernelSpec = KernelSpec::new("fill", 8);
const COPY: KernelSpec = KernelSpec::new("copy", 16);
const ARANGE: KernelSpec = KernelSpec::new("arange", 12);
const ASTYPE: KernelSpec = KernelSpec::new("astype", 16);
const EQUAL: KernelSpec = KernelSpec::new("equal", 20);
const MULTIPLY_SCALAR: KernelSpec = KernelSpec::new("multiply_scalar", 16);
const IF_LESS_ELSE: KernelSpec = KernelSpec::new("if_less_else_array_select", 24);
const EXP: KernelSpec = KernelSpec::new("exp", 32);
const LOG: KernelSpec = KernelSpec::new("log", 32);

/// `out[i] = value` for every position.
pub fn fill(out: &Array, value: Scalar) -> Result<()> {
    let device = prepare("fill", out, &[])?;
    dispatch_dtype!(out.dtype(), T, {
        let value = T::from_scalar(value);
        let y = StridedViewMut::<T>::from_array(out)?;
        launch_elementwise(device, &FILL, T::DTYPE, Indexer::new(out.dims()), move |it| {
            y.set(it, value)
        })
    })
}

/// Element-for-element copy between arrays of the same dtype and shape.
pub fn copy(input: &Array, out: &Array) -> Result<()> {
    let device = prepare("copy", out, &[input])?;
    check_dtype("copy", out.dtype(), input.dtype())?;
    dispatch_dtype!(out.dtype(), T, {
        let x = StridedView::<T>::from_array(input)?;
        let y = StridedViewMut::<T>::from_array(out)?;
        launch_elementwise(device, &COPY, T::DTYPE, Indexer::new(out.dims()), move |it| {
            y.set(it, x.get(it))
        })
    })
}

/// `out[i] = start + step * i`, with `i` the flat position.
///
/// Only meaningful for outputs that are contiguous and 1-D in effect.
pub fn arange(start: Scalar, step: Scalar, out: &Array) -> Result<()> {
    let device = prepare("arange", out, &[])?;
    dispatch_dtype!(out.dtype(), T, {
        let start = T::from_scalar(start);
        let step = T::from_scalar(step);
        let y = StridedViewMut::<T>::from_array(out)?;
        launch_elementwise(device, &ARANGE, T::DTYPE, Indexer::new(out.dims()), move |it| {
            let i = T::from_scalar(Scalar::Int(it.raw_index() as i64));
            y.set(it, start.add_elem(step.mul_elem(i)))
        })
    })
}

/// Static conversion from the input's dtype to the output's dtype.
pub fn astype(input: &Array, out: &Array) -> Result<()> {
    let device = prepare("astype", out, &[input])?;
    dispatch_dtype!(input.dtype(), S, {
        dispatch_dtype!(out.dtype(), D, {
            let x = StridedView::<S>::from_array(input)?;
            let y = StridedViewMut::<D>::from_array(out)?;
            launch_elementwise(device, &ASTYPE, D::DTYPE, Indexer::new(out.dims()), move |it| {
                y.set(it, x.get(it).cast::<D>())
            })
        })
    })
}

/// `out[i] = x1[i] == x2[i]`; `out` is always boolean.
pub fn equal(x1: &Array, x2: &Array, out: &Array) -> Result<()> {
    let device = prepare("equal", out, &[x1, x2])?;
    check_dtype("equal", x1.dtype(), x2.dtype())?;
    check_dtype("equal", DType::Bool, out.dtype())?;
    dispatch_dtype!(x1.dtype(), T, {
        let a = StridedView::<T>::from_array(x1)?;
        let b = StridedView::<T>::from_array(x2)?;
        let y = StridedViewMut::<bool>::from_array(out)?;
        launch_elementwise(device, &EQUAL, T::DTYPE, Indexer::new(out.dims()), move |it| {
            y.set(it, a.get(it) == b.get(it))
        })
    })
}

/// A binary arithmetic kernel over elements of one dtype.
trait BinaryKernel: 'static {
    const SPEC: KernelSpec;
    fn apply<T: Element>(a: T, b: T) -> T;
}

struct AddKernel;
struct SubtractKernel;
struct MultiplyKernel;
struct DivideKernel;

impl BinaryKernel for AddKernel {
    const SPEC: KernelSpec = KernelSpec::new("add", 20);
    #[inline]
    fn apply<T: Element>(a: T, b: T) -> T {
        a.add_elem(b)
    }
}

impl BinaryKernel for SubtractKernel {
    const SPEC: KernelSpec = KernelSpec::new("subtract", 20);
    #[inline]
    fn apply<T: Element>(a: T, b: T) -> T {
        a.sub_elem(b)
    }
}

impl BinaryKernel for MultiplyKernel {
    const SPEC: KernelSpec = KernelSpec::new("multiply", 20);
    #[inline]
    fn apply<T: Element>(a: T, b: T) -> T {
        a.mul_elem(b)
    }
}

impl BinaryKernel for DivideKernel {
    const SPEC: KernelSpec = KernelSpec::new("divide", 24);
    #[inline]
    fn apply<T: Element>(a: T, b: T) -> T {
        a.div_elem(b)
    }
}

fn binary<K: BinaryKernel>(x1: &Array, x2: &Array, out: &Array) -> Result<()> {
    let op = K::SPEC.name;
    let device = prepare(op, out, &[x1, x2])?;
    check_dtype(op, out.dtype(), x1.dtype())?;
    check_dtype(op, out.dtype(), x2.dtype())?;
    dispatch_dtype!(out.dtype(), T, { binary_typed::<T, K>(device, x1, x2, out) })
}

fn binary_typed<T: Element, K: BinaryKernel>(
    device: &Arc<AccelDevice>,
    x1: &Array,
    x2: &Array,
    out: &Array,
) -> Result<()> {
    let a = StridedView::<T>::from_array(x1)?;
    let b = StridedView::<T>::from_array(x2)?;
    let y = StridedViewMut::<T>::from_array(out)?;
    launch_elementwise(device, &K::SPEC, T::DTYPE, Indexer::new(out.dims()), move |it| {
        y.set(it, K::apply(a.get(it), b.get(it)))
    })
}

pub fn add(x1: &Array, x2: &Array, out: &Array) -> Result<()> {
    binary::<AddKernel>(x1, x2, out)
}

pub fn subtract(x1: &Array, x2: &Array, out: &Array) -> Result<()> {
    binary::<SubtractKernel>(x1, x2, out)
}

pub fn multiply(x1: &Array, x2: &Array, out: &Array) -> Result<()> {
    binary::<MultiplyKernel>(x1, x2, out)
}

/// Element-wise division. Iterates the output's shape like every other
/// binary operator; integer division by zero yields zero.
pub fn divide(x1: &Array, x2: &Array, out: &Array) -> Result<()> {
    binary::<DivideKernel>(x1, x2, out)
}

/// `out[i] = x1[i] * value`.
pub fn multiply_scalar(x1: &Array, value: Scalar, out: &Array) -> Result<()> {
    let device = prepare("multiply_scalar", out, &[x1])?;
    check_dtype("multiply_scalar", out.dtype(), x1.dtype())?;
    dispatch_dtype!(out.dtype(), T, {
        let value = T::from_scalar(value);
        let a = StridedView::<T>::from_array(x1)?;
        let y = StridedViewMut::<T>::from_array(out)?;
        launch_elementwise(device, &MULTIPLY_SCALAR, T::DTYPE, Indexer::new(out.dims()), move |it| {
            y.set(it, a.get(it).mul_elem(value))
        })
    })
}

/// `out[i] = pos if x1[i] < threshold else neg[i]`.
pub fn if_less_else_array_select(
    x1: &Array,
    threshold: Scalar,
    pos: Scalar,
    neg: &Array,
    out: &Array,
) -> Result<()> {
    let op = "if_less_else_array_select";
    let device = prepare(op, out, &[x1, neg])?;
    check_dtype(op, out.dtype(), x1.dtype())?;
    check_dtype(op, out.dtype(), neg.dtype())?;
    dispatch_dtype!(out.dtype(), T, {
        let threshold = T::from_scalar(threshold);
        let pos = T::from_scalar(pos);
        let a = StridedView::<T>::from_array(x1)?;
        let n = StridedView::<T>::from_array(neg)?;
        let y = StridedViewMut::<T>::from_array(out)?;
        launch_elementwise(device, &IF_LESS_ELSE, T::DTYPE, Indexer::new(out.dims()), move |it| {
            let value = if a.get(it) < threshold { pos } else { n.get(it) };
            y.set(it, value)
        })
    })
}

fn transcendental<T: FloatElement>(
    device: &Arc<AccelDevice>,
    spec: &KernelSpec,
    x: &Array,
    out: &Array,
    f: fn(T) -> T,
) -> Result<()> {
    let a = StridedView::<T>::from_array(x)?;
    let y = StridedViewMut::<T>::from_array(out)?;
    launch_elementwise(device, spec, T::DTYPE, Indexer::new(out.dims()), move |it| {
        y.set(it, f(a.get(it)))
    })
}

/// `out[i] = e^x[i]`. Floating-point dtypes only.
pub fn exp(x: &Array, out: &Array) -> Result<()> {
    let device = prepare("exp", out, &[x])?;
    check_dtype("exp", out.dtype(), x.dtype())?;
    dispatch_float_dtype!(
        out.dtype(),
        T,
        { transcendental::<T>(device, &EXP, x, out, <T as num_traits::Float>::exp) },
        fallback Err(TesseraError::UnsupportedDtype { op: "exp", dtype: out.dtype() })
    )
}

/// `out[i] = ln(x[i])`. Non-positive inputs give NaN or negative infinity.
pub fn log(x: &Array, out: &Array) -> Result<()> {
    let device = prepare("log", out, &[x])?;
    check_dtype("log", out.dtype(), x.dtype())?;
    dispatch_float_dtype!(
        out.dtype(),
        T,
        { transcendental::<T>(device, &LOG, x, out, <T as num_traits::Float>::ln) },
        fallback Err(TesseraError::UnsupportedDtype { op: "log", dtype: out.dtype() })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn device() -> Arc<AccelDevice> {
        AccelDevice::new(0, DeviceConfig::default().with_multiprocessors(3)).unwrap()
    }

    #[test]
    fn test_fill_converts_scalar() {
        let dev = device();
        let out = Array::empty(&dev, [2, 3], DType::I16).unwrap();
        fill(&out, Scalar::Float(-2.7)).unwrap();
        assert_eq!(out.to_vec::<i16>().unwrap(), vec![-2; 6]);
    }

    #[test]
    fn test_copy_into_transposed_output() {
        let dev = device();
        let x = Array::from_slice(&dev, [2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let base = Array::empty(&dev, [2, 2], DType::F32).unwrap();
        copy(&x, &base.transpose()).unwrap();
        assert_eq!(base.to_vec::<f32>().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_arange_uses_flat_position() {
        let dev = device();
        let out = Array::empty(&dev, [5], DType::F64).unwrap();
        arange(Scalar::Float(1.0), Scalar::Float(0.5), &out).unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![1.0, 1.5, 2.0, 2.5, 3.0]);
    }

    #[test]
    fn test_astype_truncates_and_wraps() {
        let dev = device();
        let x = Array::from_slice(&dev, [4], &[1.9f32, -1.9, 300.0, 0.0]).unwrap();
        let out = Array::empty(&dev, [4], DType::U8).unwrap();
        astype(&x, &out).unwrap();
        assert_eq!(out.to_vec::<u8>().unwrap(), vec![1, 0, 255, 0]);

        let flags = Array::empty(&dev, [4], DType::Bool).unwrap();
        astype(&x, &flags).unwrap();
        assert_eq!(flags.to_vec::<bool>().unwrap(), vec![true, true, true, false]);
    }

    #[test]
    fn test_equal_writes_bool() {
        let dev = device();
        let a = Array::from_slice(&dev, [3], &[1i32, 2, 3]).unwrap();
        let b = Array::from_slice(&dev, [3], &[1i32, 0, 3]).unwrap();
        let out = Array::empty(&dev, [3], DType::Bool).unwrap();
        equal(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<bool>().unwrap(), vec![true, false, true]);

        let wrong = Array::empty(&dev, [3], DType::I32).unwrap();
        assert!(matches!(equal(&a, &b, &wrong), Err(TesseraError::DtypeMismatch { .. })));
    }

    #[test]
    fn test_binary_arithmetic() {
        let dev = device();
        let a = Array::from_slice(&dev, [4], &[7i64, -3, 10, 5]).unwrap();
        let b = Array::from_slice(&dev, [4], &[2i64, 2, 0, -5]).unwrap();
        let out = Array::empty(&dev, [4], DType::I64).unwrap();

        add(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![9, -1, 10, 0]);
        subtract(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![5, -5, 10, 10]);
        multiply(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![14, -6, 0, -25]);
        divide(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![3, -1, 0, -1]);
    }

    #[test]
    fn test_in_place_add() {
        let dev = device();
        let a = Array::from_slice(&dev, [3], &[1.0f32, 2.0, 3.0]).unwrap();
        add(&a, &a, &a).unwrap();
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_multiply_scalar() {
        let dev = device();
        let a = Array::from_slice(&dev, [3], &[1.5f64, -2.0, 0.0]).unwrap();
        let out = Array::empty(&dev, [3], DType::F64).unwrap();
        multiply_scalar(&a, Scalar::Int(4), &out).unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![6.0, -8.0, 0.0]);
    }

    #[test]
    fn test_if_less_else_array_select() {
        let dev = device();
        let x = Array::from_slice(&dev, [4], &[-1.0f32, 0.5, -3.0, 2.0]).unwrap();
        let neg = Array::from_slice(&dev, [4], &[10.0f32, 20.0, 30.0, 40.0]).unwrap();
        let out = Array::empty(&dev, [4], DType::F32).unwrap();
        if_less_else_array_select(&x, Scalar::Float(0.0), Scalar::Float(-7.0), &neg, &out).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![-7.0, 20.0, -7.0, 40.0]);
    }

    #[test]
    fn test_exp_and_log() {
        let dev = device();
        let x = Array::from_slice(&dev, [3], &[0.0f64, 1.0, -1.0]).unwrap();
        let e = Array::empty(&dev, [3], DType::F64).unwrap();
        exp(&x, &e).unwrap();
        let got = e.to_vec::<f64>().unwrap();
        assert!((got[1] - std::f64::consts::E).abs() < 1e-12);
        assert_eq!(got[0], 1.0);

        let l = Array::empty(&dev, [3], DType::F64).unwrap();
        log(&x, &l).unwrap();
        let got = l.to_vec::<f64>().unwrap();
        assert_eq!(got[0], f64::NEG_INFINITY);
        assert_eq!(got[1], 0.0);
        assert!(got[2].is_nan());
    }

    #[test]
    fn test_transcendental_rejects_integers() {
        let dev = device();
        let x = Array::from_slice(&dev, [2], &[1i32, 2]).unwrap();
        let out = Array::empty(&dev, [2], DType::I32).unwrap();
        assert!(matches!(
            exp(&x, &out),
            Err(TesseraError::UnsupportedDtype { op: "exp", dtype: DType::I32 })
        ));
        assert!(matches!(log(&x, &out), Err(TesseraError::UnsupportedDtype { .. })));
    }

    #[test]
    fn test_shape_and_device_preconditions() {
        let dev = device();
        let other = device();
        let a = Array::from_slice(&dev, [3], &[1u8, 2, 3]).unwrap();
        let short = Array::empty(&dev, [2], DType::U8).unwrap();
        assert!(matches!(copy(&a, &short), Err(TesseraError::ShapeMismatch { .. })));

        let foreign = Array::empty(&other, [3], DType::U8).unwrap();
        assert!(matches!(add(&a, &foreign, &a), Err(TesseraError::DeviceMismatch { .. })));

        let host = Array::from_native_slice([3], &[1u8, 2, 3]).unwrap();
        assert!(matches!(copy(&host, &a), Err(TesseraError::DeviceMismatch { .. })));
        assert!(matches!(copy(&a, &host), Err(TesseraError::InvalidDevice(_))));
    }

    #[test]
    fn test_empty_output_is_a_no_op() {
        let dev = device();
        let out = Array::empty(&dev, [0, 4], DType::F32).unwrap();
        fill(&out, Scalar::Float(1.0)).unwrap();
        assert!(out.to_vec::<f32>().unwrap().is_empty());
    }
}
