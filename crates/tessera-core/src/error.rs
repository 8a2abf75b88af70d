use crate::{DType, Device, Shape};

/// Errors raised by tessera operations.
///
/// Precondition errors are raised synchronously before any work is queued.
/// [`TesseraError::RuntimeFailure`] may additionally surface later, from the
/// `synchronize` call that observes a failed asynchronous command.
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    #[error("Device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    #[error("Unsupported dtype {dtype} for {op}")]
    UnsupportedDtype { op: &'static str, dtype: DType },

    #[error("Dtype mismatch in {op}: {lhs} vs {rhs}")]
    DtypeMismatch {
        op: &'static str,
        lhs: DType,
        rhs: DType,
    },

    #[error("Shape mismatch in {op}: {lhs} vs {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    #[error("Invalid axes {axes:?} for {ndim}D array")]
    InvalidAxis { axes: Vec<usize>, ndim: usize },

    #[error("Invalid view: {0}")]
    InvalidView(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Out of memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: Device,
        requested: usize,
        available: usize,
    },

    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    #[error("Accelerator runtime failure: {0}")]
    RuntimeFailure(String),
}
