use tessera_core::{Result, TesseraError};
use tracing::warn;

use crate::array::Array;

/// Gather along `axis` by `indices`. Not available on the accelerator.
pub fn take(a: &Array, indices: &Array, axis: usize, out: &Array) -> Result<()> {
    warn!(
        input = %a.shape(),
        indices = %indices.shape(),
        axis,
        out = %out.shape(),
        "take requested on accelerator"
    );
    Err(TesseraError::NotImplemented("take is not supported on accelerator devices".into()))
}
