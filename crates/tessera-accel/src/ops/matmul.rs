//! Row-major matrix multiply on top of the column-major GEMM primitive.
//!
//! A row-major matrix read as column-major is its own transpose, so
//! `out = a · b` is issued as `outᵀ = bᵀ · aᵀ`. An operand already laid out
//! row-major (possibly with padded rows) or column-major is passed through
//! without a copy; anything else is first copied into a dense row-major
//! scratch array.

use std::sync::Arc;

use tessera_core::{dispatch_float_dtype, DType, FloatElement, Result, Scalar, Shape, TesseraError};

use super::elementwise::{astype, copy, fill, multiply};
use super::reduce::sum;
use super::{check_device, out_device};
use crate::array::Array;
use crate::blas::{gemm, GemmConfig, MatrixRef, Transpose};
use crate::context::AccelDevice;

/// How a 2-D array is handed to the primitive.
struct GemmOperand {
    matrix: MatrixRef,
    ld: usize,
    trans: Transpose,
}

/// Leading dimension of `arr` read column-major as its own transpose, if it
/// is row-major with unit element stride.
fn row_major_ld(arr: &Array) -> Option<usize> {
    let (rows, cols) = (arr.dims()[0], arr.dims()[1]);
    let item = arr.item_size() as isize;
    let (s0, s1) = (arr.strides()[0], arr.strides()[1]);
    if cols > 1 && s1 != item {
        return None;
    }
    if rows <= 1 {
        return Some(cols.max(1));
    }
    if s0 <= 0 || s0 % item != 0 || (s0 / item) < cols as isize {
        return None;
    }
    Some((s0 / item) as usize)
}

/// Leading dimension of `arr` if it is column-major with unit element stride.
fn column_major_ld(arr: &Array) -> Option<usize> {
    let (rows, cols) = (arr.dims()[0], arr.dims()[1]);
    let item = arr.item_size() as isize;
    let (s0, s1) = (arr.strides()[0], arr.strides()[1]);
    if rows > 1 && s0 != item {
        return None;
    }
    if cols <= 1 {
        return Some(rows.max(1));
    }
    if s1 <= 0 || s1 % item != 0 || (s1 / item) < rows as isize {
        return None;
    }
    Some((s1 / item) as usize)
}

impl GemmOperand {
    fn new(device: &Arc<AccelDevice>, arr: &Array) -> Result<Self> {
        if let Some(ld) = row_major_ld(arr) {
            return Self::direct(arr, ld, Transpose::N);
        }
        if let Some(ld) = column_major_ld(arr) {
            return Self::direct(arr, ld, Transpose::T);
        }
        let dense = Array::empty(device, arr.shape().clone(), arr.dtype())?;
        copy(arr, &dense)?;
        Self::direct(&dense, arr.dims()[1].max(1), Transpose::N)
    }

    fn direct(arr: &Array, ld: usize, trans: Transpose) -> Result<Self> {
        Ok(Self {
            matrix: MatrixRef::new(Arc::clone(arr.accel_buffer()?), arr.offset()),
            ld,
            trans,
        })
    }
}

fn check_matmul_shapes(a: &Array, b: &Array, out: &Array) -> Result<(usize, usize, usize)> {
    for arr in [a, b, out] {
        if arr.ndim() != 2 {
            return Err(TesseraError::InvalidView(format!(
                "matmul expects 2-D operands, got shape {}",
                arr.shape()
            )));
        }
    }
    let (m, k) = (a.dims()[0], a.dims()[1]);
    let n = b.dims()[1];
    if b.dims()[0] != k {
        return Err(TesseraError::ShapeMismatch {
            op: "matmul",
            lhs: a.shape().clone(),
            rhs: b.shape().clone(),
        });
    }
    if out.dims() != [m, n].as_slice() {
        return Err(TesseraError::ShapeMismatch {
            op: "matmul",
            lhs: Shape::new(&[m, n]),
            rhs: out.shape().clone(),
        });
    }
    Ok((m, n, k))
}

/// `out = a · b` for 2-D arrays. `out` must be `f32` or `f64`; operands of
/// another dtype are converted first.
pub fn matmul(a: &Array, b: &Array, out: &Array) -> Result<()> {
    let device = out_device("matmul", out)?;
    check_device(device, a)?;
    check_device(device, b)?;
    let (m, n, k) = check_matmul_shapes(a, b, out)?;
    let dtype = out.dtype();
    if !dtype.is_float() {
        return Err(TesseraError::NotImplemented(format!("matmul for dtype {dtype}")));
    }
    if m == 0 || n == 0 {
        return Ok(());
    }
    if k == 0 {
        return fill(out, Scalar::Float(0.0));
    }

    let a = cast_to(device, a, dtype)?;
    let b = cast_to(device, b, dtype)?;

    if m == 1 && n == 1 {
        return dot(device, &a, &b, out, k);
    }

    dispatch_float_dtype!(
        dtype,
        T,
        { gemm_into::<T>(device, &a, &b, out, m, n, k) },
        fallback Err(TesseraError::NotImplemented(format!("matmul for dtype {dtype}")))
    )
}

fn cast_to(device: &Arc<AccelDevice>, arr: &Array, dtype: DType) -> Result<Array> {
    if arr.dtype() == dtype {
        return Ok(arr.clone());
    }
    let converted = Array::empty(device, arr.shape().clone(), dtype)?;
    astype(arr, &converted)?;
    Ok(converted)
}

/// `[1, k] · [k, 1]`: element-wise product summed into the single output.
fn dot(device: &Arc<AccelDevice>, a: &Array, b: &Array, out: &Array, k: usize) -> Result<()> {
    let a_flat = a.as_strided([k], &[a.strides()[1]], a.offset())?;
    let b_flat = b.as_strided([k], &[b.strides()[0]], b.offset())?;
    let products = Array::empty(device, [k], out.dtype())?;
    multiply(&a_flat, &b_flat, &products)?;
    let out_scalar = out.as_strided(Shape::scalar(), &[], out.offset())?;
    sum(&products, &[0], &out_scalar)
}

fn gemm_into<T: FloatElement>(
    device: &Arc<AccelDevice>,
    a: &Array,
    b: &Array,
    out: &Array,
    m: usize,
    n: usize,
    k: usize,
) -> Result<()> {
    let a_op = GemmOperand::new(device, a)?;
    let b_op = GemmOperand::new(device, b)?;

    let direct_out = row_major_ld(out);
    let scratch = match direct_out {
        Some(_) => None,
        None => Some(Array::empty(device, [m, n], out.dtype())?),
    };
    let target = scratch.as_ref().unwrap_or(out);
    let ldc = direct_out.unwrap_or(n);

    let cfg = GemmConfig {
        transa: b_op.trans,
        transb: a_op.trans,
        m: n,
        n: m,
        k,
        alpha: T::one(),
        lda: b_op.ld,
        ldb: a_op.ld,
        beta: <T as num_traits::Zero>::zero(),
        ldc,
    };
    gemm(
        device,
        cfg,
        b_op.matrix,
        a_op.matrix,
        MatrixRef::new(Arc::clone(target.accel_buffer()?), target.offset()),
    )?;

    if let Some(scratch) = scratch {
        copy(&scratch, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn device() -> Arc<AccelDevice> {
        AccelDevice::new(0, DeviceConfig::default().with_multiprocessors(2)).unwrap()
    }

    #[test]
    fn test_matmul_basic() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Array::from_slice(&dev, [3, 2], &[7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let out = Array::empty(&dev, [2, 2], DType::F32).unwrap();
        matmul(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_layout_detection() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 3], &[0.0f64; 6]).unwrap();
        assert_eq!(row_major_ld(&a), Some(3));
        assert_eq!(column_major_ld(&a), None);
        let t = a.transpose();
        assert_eq!(row_major_ld(&t), None);
        assert_eq!(column_major_ld(&t), Some(3));

        // Every other column of a [2, 6] buffer.
        let base = Array::from_slice(&dev, [2, 6], &[0.0f64; 12]).unwrap();
        let strided = base.as_strided([2, 3], &[48, 16], 0).unwrap();
        assert_eq!(row_major_ld(&strided), None);
        assert_eq!(column_major_ld(&strided), None);

        // Padded rows: [2, 3] window inside [2, 6].
        let padded = base.as_strided([2, 3], &[48, 8], 8).unwrap();
        assert_eq!(row_major_ld(&padded), Some(6));
    }

    #[test]
    fn test_matmul_transposed_and_strided_operands() {
        let dev = device();
        // a = [[1, 2], [3, 4], [5, 6]]ᵀ = [[1, 3, 5], [2, 4, 6]]
        let a_src = Array::from_slice(&dev, [3, 2], &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let a = a_src.transpose();
        // b: every other row of a [6, 2] buffer -> [[1, 0], [0, 1], [1, 1]]
        let b_src = Array::from_slice(
            &dev,
            [6, 2],
            &[1.0f64, 0.0, 9.0, 9.0, 0.0, 1.0, 9.0, 9.0, 1.0, 1.0, 9.0, 9.0],
        )
        .unwrap();
        let b = b_src.as_strided([3, 2], &[32, 8], 0).unwrap();
        let out = Array::empty(&dev, [2, 2], DType::F64).unwrap();
        matmul(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![6.0, 8.0, 8.0, 10.0]);
    }

    #[test]
    fn test_matmul_into_transposed_output() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let b = Array::from_slice(&dev, [2, 2], &[5.0f32, 6.0, 7.0, 8.0]).unwrap();
        let storage = Array::empty(&dev, [2, 2], DType::F32).unwrap();
        matmul(&a, &b, &storage.transpose()).unwrap();
        // a·b = [[19, 22], [43, 50]], stored transposed.
        assert_eq!(storage.to_vec::<f32>().unwrap(), vec![19.0, 43.0, 22.0, 50.0]);
    }

    #[test]
    fn test_dot_product_path() {
        let dev = device();
        let a = Array::from_slice(&dev, [1, 4], &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
        let b = Array::from_slice(&dev, [4, 1], &[4.0f64, 3.0, 2.0, 1.0]).unwrap();
        let out = Array::empty(&dev, [1, 1], DType::F64).unwrap();
        matmul(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![20.0]);
    }

    #[test]
    fn test_integer_operands_cast_to_float_output() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 2], &[1i32, 0, 0, 1]).unwrap();
        let b = Array::from_slice(&dev, [2, 2], &[2i32, 3, 4, 5]).unwrap();
        let out = Array::empty(&dev, [2, 2], DType::F64).unwrap();
        matmul(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_zero_inner_dimension_fills_zero() {
        let dev = device();
        let a = Array::empty(&dev, [2, 0], DType::F32).unwrap();
        let b = Array::empty(&dev, [0, 3], DType::F32).unwrap();
        let out = Array::full(&dev, [2, 3], DType::F32, 5.0f32).unwrap();
        matmul(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![0.0; 6]);
    }

    #[test]
    fn test_matmul_rejects_non_float_output() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 2], &[1i64, 2, 3, 4]).unwrap();
        let out = Array::empty(&dev, [2, 2], DType::I64).unwrap();
        assert!(matches!(matmul(&a, &a, &out), Err(TesseraError::NotImplemented(_))));
    }

    #[test]
    fn test_matmul_shape_checks() {
        let dev = device();
        let a = Array::from_slice(&dev, [2, 3], &[0.0f32; 6]).unwrap();
        let out = Array::empty(&dev, [2, 2], DType::F32).unwrap();
        assert!(matches!(matmul(&a, &a, &out), Err(TesseraError::ShapeMismatch { .. })));
        let v = Array::from_slice(&dev, [3], &[0.0f32; 3]).unwrap();
        match matmul(&a, &v, &out) {
            Err(TesseraError::InvalidView(msg)) => assert!(msg.contains("2-D") && msg.contains("[3]"), "{msg}"),
            other => panic!("expected a rank error, got {other:?}"),
        }
    }
}
