//! Operator entry points.
//!
//! Every operator writes into a caller-supplied output array and runs on the
//! accelerator that owns that output. Device, dtype and shape preconditions
//! are checked once, before anything is queued; the work itself is queued
//! and the call returns without waiting for it.

pub mod elementwise;
pub mod matmul;
pub mod reduce;
pub mod take;

use std::sync::Arc;

use tessera_core::{DType, Result, TesseraError};

use crate::array::Array;
use crate::context::AccelDevice;

pub use elementwise::{
    add, arange, astype, copy, divide, equal, exp, fill, if_less_else_array_select, log, multiply,
    multiply_scalar, subtract,
};
pub use matmul::matmul;
pub use reduce::{amax, argmax, sum};
pub use take::take;

/// The accelerator that executes an operator writing `out`.
pub(crate) fn out_device<'a>(op: &'static str, out: &'a Array) -> Result<&'a Arc<AccelDevice>> {
    out.accel_device().ok_or_else(|| {
        TesseraError::InvalidDevice(format!(
            "{op}: output must be accelerator-resident, got {}",
            out.device()
        ))
    })
}

/// Operands of compute operators must live on the executing device itself.
pub(crate) fn check_device(device: &Arc<AccelDevice>, operand: &Array) -> Result<()> {
    match operand.accel_device() {
        Some(d) if Arc::ptr_eq(d, device) => Ok(()),
        _ => Err(TesseraError::DeviceMismatch {
            expected: device.id(),
            got: operand.device(),
        }),
    }
}

pub(crate) fn check_dtype(op: &'static str, expected: DType, got: DType) -> Result<()> {
    if expected != got {
        return Err(TesseraError::DtypeMismatch {
            op,
            lhs: expected,
            rhs: got,
        });
    }
    Ok(())
}

pub(crate) fn check_shape(op: &'static str, out: &Array, operand: &Array) -> Result<()> {
    if out.shape() != operand.shape() {
        return Err(TesseraError::ShapeMismatch {
            op,
            lhs: out.shape().clone(),
            rhs: operand.shape().clone(),
        });
    }
    Ok(())
}

/// Resolve the executing device and check every operand against it and
/// against the output shape.
pub(crate) fn prepare<'a>(op: &'static str, out: &'a Array, operands: &[&Array]) -> Result<&'a Arc<AccelDevice>> {
    let device = out_device(op, out)?;
    for operand in operands {
        check_device(device, operand)?;
    }
    for operand in operands {
        check_shape(op, out, operand)?;
    }
    Ok(device)
}

/// Block until all outstanding work on `device` completes; see
/// [`AccelDevice::synchronize`].
pub fn synchronize(device: &AccelDevice) -> Result<()> {
    device.synchronize()
}
