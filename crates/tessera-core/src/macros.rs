/// Dispatch a [`DType`](crate::DType) to its element type.
///
/// The body is instantiated once per dtype with `$T` bound to the matching
/// Rust type. Every dtype is covered, so there is no fallback arm.
///
/// ```
/// # use tessera_core::{dtype::DType, dispatch_dtype};
/// let dtype = DType::I16;
/// let size = dispatch_dtype!(dtype, Ty, {
///     std::mem::size_of::<Ty>()
/// });
/// assert_eq!(size, 2);
/// ```
#[macro_export]
macro_rules! dispatch_dtype {
    ($dtype:expr, $T:ident, $body:block) => {{
        #[allow(non_snake_case)]
        match $dtype {
            $crate::dtype::DType::Bool => {
                type $T = bool;
                $body
            }
            $crate::dtype::DType::I8 => {
                type $T = i8;
                $body
            }
            $crate::dtype::DType::I16 => {
                type $T = i16;
                $body
            }
            $crate::dtype::DType::I32 => {
                type $T = i32;
                $body
            }
            $crate::dtype::DType::I64 => {
                type $T = i64;
                $body
            }
            $crate::dtype::DType::U8 => {
                type $T = u8;
                $body
            }
            $crate::dtype::DType::F32 => {
                type $T = f32;
                $body
            }
            $crate::dtype::DType::F64 => {
                type $T = f64;
                $body
            }
        }
    }};
}

/// Dispatch to the floating-point element types (`f32`, `f64`).
///
/// Any other dtype evaluates `$fallback`.
#[macro_export]
macro_rules! dispatch_float_dtype {
    ($dtype:expr, $T:ident, $body:block, fallback $fallback:expr) => {{
        #[allow(non_snake_case)]
        match $dtype {
            $crate::dtype::DType::F32 => {
                type $T = f32;
                $body
            }
            $crate::dtype::DType::F64 => {
                type $T = f64;
                $body
            }
            _ => $fallback,
        }
    }};
}
