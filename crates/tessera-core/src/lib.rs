//! # tessera-core
//!
//! Shared vocabulary for the tessera array backends:
//! - The closed element-type set (`DType`) and its `Element` trait
//! - Tagged scalars and static conversion between element types
//! - Device identifiers and array shapes
//! - The `TesseraError` taxonomy
//! - `dispatch_dtype!` / `dispatch_float_dtype!` for runtime-tag dispatch
//! - The native (host) peer buffer

#[macro_use]
mod macros;

pub mod device;
pub mod dtype;
pub mod error;
pub mod native;
pub mod prelude;
pub mod scalar;
pub mod shape;

pub use device::Device;
pub use dtype::{DType, Element, FloatElement};
pub use error::TesseraError;
pub use native::NativeBuffer;
pub use scalar::Scalar;
pub use shape::{Shape, Strides};

pub type Result<T> = std::result::Result<T, TesseraError>;
