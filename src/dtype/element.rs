//! Element trait for mapping Rust types to DType

use super::DType;
use super::complex::{Complex64, Complex128};
use bytemuck::Pod;
use half::{bf16, f16};
use std::fmt::Debug;

/// Trait for types that can be elements of a tensor view
///
/// This trait connects Rust's type system to the runtime dtype tags. It is
/// implemented for every storage type the copy engine moves.
///
/// # Bounds
/// - `Copy + Send + Sync + 'static` - Basic trait requirements
/// - `Pod` - Safe reinterpretation as bytes (bytemuck)
/// - `PartialEq + Debug` - Test assertions over copied data
///
/// `DType::Bool` has no Rust element type: bool views are built over `u8`
/// storage with [`crate::tensor::TensorView::from_bytes`].
pub trait Element: Copy + Send + Sync + Pod + PartialEq + Debug + 'static {
    /// The corresponding DType for this Rust type
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;
            }
        )*
    };
}

impl_element!(
    f64 => F64,
    f32 => F32,
    f16 => F16,
    bf16 => BF16,
    i64 => I64,
    i32 => I32,
    i16 => I16,
    i8 => I8,
    u64 => U64,
    u32 => U32,
    u16 => U16,
    u8 => U8,
    Complex64 => Complex64,
    Complex128 => Complex128,
);
