//! # tessera-accel
//!
//! Accelerator-resident arrays and their operators.
//!
//! Provides:
//! - Device handles with an in-order command queue (`context`)
//! - Device memory, peer and host transfers (`memory`, `storage`)
//! - Strided views and the multi-dimensional indexer used by kernels
//! - Occupancy-based launch sizing and a grid-stride launcher (`launch`)
//! - Element-wise operators, reductions and matrix multiply (`ops`)
//! - A column-major GEMM primitive (`blas`)
//!
//! Operators return once their work is queued. Call [`synchronize`] (or read
//! an array back to the host) to wait and to observe asynchronous faults.

pub mod array;
pub mod blas;
pub mod config;
pub mod context;
pub mod indexer;
pub mod launch;
pub mod memory;
pub mod ops;
pub mod storage;
pub mod view;

pub use array::Array;
pub use config::DeviceConfig;
pub use context::{device_count, get_device, is_available, AccelDevice};
pub use indexer::Indexer;
pub use memory::DeviceBuffer;
pub use ops::synchronize;
pub use storage::Storage;
pub use view::{StridedView, StridedViewMut};

pub use tessera_core::{DType, Device, Element, Result, Scalar, Shape, TesseraError};
