//! Column-major dense matrix multiply on the accelerator.
//!
//! `C = alpha * op(A) * op(B) + beta * C` with BLAS conventions: every
//! matrix is column-major with an explicit leading dimension, and `op(X)` is
//! `X` or `Xᵀ` per its [`Transpose`] flag. Only `f32` and `f64` are
//! supported. Parameters are validated when the call is issued; the
//! multiply itself is queued like any kernel.

use std::sync::Arc;

use rayon::prelude::*;
use tessera_core::{FloatElement, Result, TesseraError};
use tracing::trace;

use crate::context::AccelDevice;
use crate::memory::DeviceBuffer;

/// Column tile handled by one task. A tile of `f64` columns for a few
/// hundred rows fits comfortably in L1/L2.
const TILE_N: usize = 16;
const TILE_K: usize = 64;

/// Whether an operand is used as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    /// `op(X) = X`
    N,
    /// `op(X) = Xᵀ`
    T,
}

/// Shape, scaling and leading dimensions of a GEMM call.
#[derive(Debug, Clone, Copy)]
pub struct GemmConfig<T> {
    pub transa: Transpose,
    pub transb: Transpose,
    /// Rows of `op(A)` and `C`.
    pub m: usize,
    /// Columns of `op(B)` and `C`.
    pub n: usize,
    /// Columns of `op(A)`, rows of `op(B)`.
    pub k: usize,
    pub alpha: T,
    pub lda: usize,
    pub ldb: usize,
    pub beta: T,
    pub ldc: usize,
}

/// A matrix operand: buffer plus the byte offset of its first entry.
#[derive(Debug, Clone)]
pub struct MatrixRef {
    pub buffer: Arc<DeviceBuffer>,
    pub offset: usize,
}

impl MatrixRef {
    pub fn new(buffer: Arc<DeviceBuffer>, offset: usize) -> Self {
        Self { buffer, offset }
    }
}

fn invalid(msg: String) -> TesseraError {
    TesseraError::RuntimeFailure(format!("gemm: {msg}"))
}

/// Check a stored `rows x cols` column-major matrix against its buffer.
fn check_operand<T>(name: &str, mat: &MatrixRef, rows: usize, cols: usize, ld: usize) -> Result<()> {
    if ld < rows.max(1) {
        return Err(invalid(format!("ld{name} = {ld} is less than max(1, {rows})")));
    }
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    let elems = (cols - 1)
        .checked_mul(ld)
        .and_then(|e| e.checked_add(rows))
        .ok_or_else(|| invalid(format!("{name} extent overflows")))?;
    let needed = elems
        .checked_mul(std::mem::size_of::<T>())
        .and_then(|b| b.checked_add(mat.offset))
        .ok_or_else(|| invalid(format!("{name} extent overflows")))?;
    if needed > mat.buffer.nbytes() {
        return Err(invalid(format!(
            "{name} needs {needed} bytes but its buffer holds {}",
            mat.buffer.nbytes()
        )));
    }
    Ok(())
}

fn stored_dims(trans: Transpose, rows: usize, cols: usize) -> (usize, usize) {
    match trans {
        Transpose::N => (rows, cols),
        Transpose::T => (cols, rows),
    }
}

/// Issue `C = alpha * op(A) * op(B) + beta * C` on `device`.
///
/// Invalid parameters fail here with `RuntimeFailure`, mirroring a BLAS
/// status code. When `beta` is zero the prior contents of `C` are ignored.
pub fn gemm<T: FloatElement>(
    device: &AccelDevice,
    cfg: GemmConfig<T>,
    a: MatrixRef,
    b: MatrixRef,
    c: MatrixRef,
) -> Result<()> {
    for (name, mat) in [("A", &a), ("B", &b), ("C", &c)] {
        if mat.buffer.device().uid() != device.uid() {
            return Err(invalid(format!("operand {name} is not resident on accel:{}", device.index())));
        }
    }
    let (a_rows, a_cols) = stored_dims(cfg.transa, cfg.m, cfg.k);
    let (b_rows, b_cols) = stored_dims(cfg.transb, cfg.k, cfg.n);
    check_operand::<T>("a", &a, a_rows, a_cols, cfg.lda)?;
    check_operand::<T>("b", &b, b_rows, b_cols, cfg.ldb)?;
    check_operand::<T>("c", &c, cfg.m, cfg.n, cfg.ldc)?;
    if cfg.m == 0 || cfg.n == 0 {
        return Ok(());
    }

    let dtype = T::DTYPE;
    trace!(
        m = cfg.m,
        n = cfg.n,
        k = cfg.k,
        transa = ?cfg.transa,
        transb = ?cfg.transb,
        %dtype,
        "gemm"
    );
    let pool = device.pool();
    device.enqueue(move || {
        let tiles = (cfg.n + TILE_N - 1) / TILE_N;
        pool.install(|| {
            (0..tiles)
                .into_par_iter()
                .for_each(|tile| gemm_column_tile(&cfg, &a, &b, &c, tile * TILE_N));
        });
    })
}

#[inline]
fn load<T: FloatElement>(mat: &MatrixRef, elem: usize) -> T {
    let at = mat.offset + elem * std::mem::size_of::<T>();
    // SAFETY: `gemm` checked every reachable element against the buffer.
    unsafe { std::ptr::read_unaligned(mat.buffer.as_ptr().add(at) as *const T) }
}

#[inline]
fn store<T: FloatElement>(mat: &MatrixRef, elem: usize, value: T) {
    let at = mat.offset + elem * std::mem::size_of::<T>();
    // SAFETY: as for `load`; each column of C is written by one task only.
    unsafe { std::ptr::write_unaligned(mat.buffer.as_ptr().add(at) as *mut T, value) }
}

/// Element `(row, col)` of `op(X)`.
#[inline]
fn op_at<T: FloatElement>(mat: &MatrixRef, trans: Transpose, ld: usize, row: usize, col: usize) -> T {
    match trans {
        Transpose::N => load(mat, row + col * ld),
        Transpose::T => load(mat, col + row * ld),
    }
}

/// Compute columns `[j0, j0 + TILE_N)` of C.
fn gemm_column_tile<T: FloatElement>(cfg: &GemmConfig<T>, a: &MatrixRef, b: &MatrixRef, c: &MatrixRef, j0: usize) {
    let m = cfg.m;
    let j_end = (j0 + TILE_N).min(cfg.n);
    let width = j_end - j0;
    let mut acc = vec![<T as num_traits::Zero>::zero(); m * width];

    for p0 in (0..cfg.k).step_by(TILE_K) {
        let p_end = (p0 + TILE_K).min(cfg.k);
        for (jj, j) in (j0..j_end).enumerate() {
            let column = &mut acc[jj * m..(jj + 1) * m];
            for p in p0..p_end {
                let b_val: T = op_at(b, cfg.transb, cfg.ldb, p, j);
                for (i, slot) in column.iter_mut().enumerate() {
                    let a_val: T = op_at(a, cfg.transa, cfg.lda, i, p);
                    *slot = a_val.mul_add(b_val, *slot);
                }
            }
        }
    }

    let beta_is_zero = cfg.beta == <T as num_traits::Zero>::zero();
    for (jj, j) in (j0..j_end).enumerate() {
        for i in 0..m {
            let elem = i + j * cfg.ldc;
            let mut value = cfg.alpha * acc[jj * m + i];
            if !beta_is_zero {
                value = value + cfg.beta * load::<T>(c, elem);
            }
            store(c, elem, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::memory::import_from_host;

    fn device() -> Arc<AccelDevice> {
        AccelDevice::new(0, DeviceConfig::default().with_multiprocessors(2)).unwrap()
    }

    fn upload(dev: &Arc<AccelDevice>, data: &[f64]) -> MatrixRef {
        MatrixRef::new(import_from_host(dev, bytemuck::cast_slice(data)).unwrap(), 0)
    }

    fn download(dev: &Arc<AccelDevice>, mat: &MatrixRef, len: usize) -> Vec<f64> {
        dev.synchronize().unwrap();
        let mut bytes = vec![0u8; len * 8];
        mat.buffer.read_raw(mat.offset, &mut bytes).unwrap();
        bytes.chunks_exact(8).map(bytemuck::pod_read_unaligned::<f64>).collect()
    }

    fn config(transa: Transpose, transb: Transpose, m: usize, n: usize, k: usize, lda: usize, ldb: usize) -> GemmConfig<f64> {
        GemmConfig {
            transa,
            transb,
            m,
            n,
            k,
            alpha: 1.0,
            lda,
            ldb,
            beta: 0.0,
            ldc: m,
        }
    }

    #[test]
    fn test_column_major_product() {
        let dev = device();
        // A = [[1, 3], [2, 4]] and B = [[5, 7], [6, 8]] stored column-major.
        let a = upload(&dev, &[1.0, 2.0, 3.0, 4.0]);
        let b = upload(&dev, &[5.0, 6.0, 7.0, 8.0]);
        let c = upload(&dev, &[0.0; 4]);
        gemm(&dev, config(Transpose::N, Transpose::N, 2, 2, 2, 2, 2), a, b, c.clone()).unwrap();
        assert_eq!(download(&dev, &c, 4), vec![23.0, 34.0, 31.0, 46.0]);
    }

    #[test]
    fn test_transposed_operands() {
        let dev = device();
        let a = upload(&dev, &[1.0, 2.0, 3.0, 4.0]);
        let b = upload(&dev, &[5.0, 6.0, 7.0, 8.0]);
        let c = upload(&dev, &[0.0; 4]);
        // Aᵀ·Bᵀ = (B·A)ᵀ
        gemm(&dev, config(Transpose::T, Transpose::T, 2, 2, 2, 2, 2), a, b, c.clone()).unwrap();
        assert_eq!(download(&dev, &c, 4), vec![19.0, 43.0, 22.0, 50.0]);
    }

    #[test]
    fn test_alpha_beta_accumulate() {
        let dev = device();
        let a = upload(&dev, &[1.0, 0.0, 0.0, 1.0]);
        let b = upload(&dev, &[2.0, 3.0, 4.0, 5.0]);
        let c = upload(&dev, &[1.0, 1.0, 1.0, 1.0]);
        let mut cfg = config(Transpose::N, Transpose::N, 2, 2, 2, 2, 2);
        cfg.alpha = 2.0;
        cfg.beta = 10.0;
        gemm(&dev, cfg, a, b, c.clone()).unwrap();
        assert_eq!(download(&dev, &c, 4), vec![14.0, 16.0, 18.0, 20.0]);
    }

    #[test]
    fn test_beta_zero_ignores_nan_in_c() {
        let dev = device();
        let a = upload(&dev, &[2.0]);
        let b = upload(&dev, &[3.0]);
        let c = upload(&dev, &[f64::NAN]);
        gemm(&dev, config(Transpose::N, Transpose::N, 1, 1, 1, 1, 1), a, b, c.clone()).unwrap();
        assert_eq!(download(&dev, &c, 1), vec![6.0]);
    }

    #[test]
    fn test_invalid_leading_dimension() {
        let dev = device();
        let a = upload(&dev, &[0.0; 6]);
        let b = upload(&dev, &[0.0; 6]);
        let c = upload(&dev, &[0.0; 4]);
        let err = gemm(&dev, config(Transpose::N, Transpose::N, 2, 2, 3, 1, 3), a, b, c).unwrap_err();
        assert!(matches!(err, TesseraError::RuntimeFailure(_)));
    }

    #[test]
    fn test_operand_extent_checked() {
        let dev = device();
        let a = upload(&dev, &[0.0; 3]);
        let b = upload(&dev, &[0.0; 6]);
        let c = upload(&dev, &[0.0; 4]);
        assert!(gemm(&dev, config(Transpose::N, Transpose::N, 2, 2, 3, 2, 3), a, b, c).is_err());
    }
}
