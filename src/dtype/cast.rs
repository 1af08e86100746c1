//! Elementwise type conversion
//!
//! Every supported (source, destination) pair maps to a kernel in a fixed
//! table indexed by [`DType::index`]. Kernels convert a strided run of
//! elements and are total: out-of-range values wrap, saturate or round as
//! described below, so a cast never fails at runtime.
//!
//! | From \ To        | Rule |
//! |------------------|------|
//! | same type        | raw copy |
//! | int → int        | two's-complement truncation / sign extension |
//! | float → int      | truncate toward zero, clamp to range, NaN → 0 |
//! | float → float    | round to nearest, ties to even |
//! | int → float      | round to nearest |
//! | numeric → bool   | `x != 0` |
//! | bool → numeric   | 0 or 1 |
//! | complex → complex| per component, float rules |
//! | complex ↔ other  | unsupported |

use super::complex::{Complex64, Complex128};
use super::{DType, Element};
use crate::error::{CopyError, Result};
use half::{bf16, f16};
use std::fmt;
use std::sync::OnceLock;

/// Kernel converting a run of `len` elements.
///
/// `src_stride` and `dst_stride` are in elements of the respective dtype and
/// may be zero (source broadcast) or negative.
pub type CastKernel =
    unsafe fn(src: *const u8, src_stride: isize, dst: *mut u8, dst_stride: isize, len: usize);

/// Value conversion with the engine's cast semantics
trait CastInto<D> {
    fn cast_into(self) -> D;
}

// Rust `as` already implements the required rules between primitives:
// integer truncation, saturating float→int, round-to-nearest float narrowing.
macro_rules! impl_as_cast {
    ($($src:ty),*) => {
        $( impl_as_cast!(@to $src => u8, u16, u32, u64, i8, i16, i32, i64, f32, f64); )*
    };
    (@to $src:ty => $($dst:ty),*) => {
        $(
            impl CastInto<$dst> for $src {
                #[inline(always)]
                fn cast_into(self) -> $dst {
                    self as $dst
                }
            }
        )*
    };
}

impl_as_cast!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Widening to f64 ahead of a single rounding step into a half type
trait Widen: Copy {
    fn widen(self) -> f64;
}

macro_rules! impl_widen_exact {
    ($($ty:ty),*) => {
        $(
            impl Widen for $ty {
                #[inline(always)]
                fn widen(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_widen_exact!(u8, u16, u32, i8, i16, i32, f32, f64);

impl Widen for u64 {
    #[inline(always)]
    fn widen(self) -> f64 {
        sticky_f64(self)
    }
}

impl Widen for i64 {
    #[inline(always)]
    fn widen(self) -> f64 {
        let magnitude = sticky_f64(self.unsigned_abs());
        if self < 0 { -magnitude } else { magnitude }
    }
}

/// `x` as f64, with the bits below a 53-bit mantissa folded into its lowest
/// bit so a later narrowing rounds as if from the exact integer
#[inline]
fn sticky_f64(x: u64) -> f64 {
    let bits = u64::BITS - x.leading_zeros();
    if bits <= f64::MANTISSA_DIGITS {
        return x as f64;
    }
    let shift = bits - f64::MANTISSA_DIGITS;
    let sticky = u64::from(x & ((1u64 << shift) - 1) != 0);
    ((x >> shift) | sticky) as f64 * (1u64 << shift) as f64
}

// f16/bf16 → f32 is exact, and every primitive widens to f64 before a single
// rounding step into the half type.
macro_rules! impl_half_cast {
    ($half:ty => $($prim:ty),*) => {
        $(
            impl CastInto<$prim> for $half {
                #[inline(always)]
                fn cast_into(self) -> $prim {
                    self.to_f32() as $prim
                }
            }

            impl CastInto<$half> for $prim {
                #[inline(always)]
                fn cast_into(self) -> $half {
                    <$half>::from_f64(self.widen())
                }
            }
        )*

        impl CastInto<$half> for $half {
            #[inline(always)]
            fn cast_into(self) -> $half {
                self
            }
        }
    };
}

impl_half_cast!(f16 => u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);
impl_half_cast!(bf16 => u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl CastInto<bf16> for f16 {
    #[inline(always)]
    fn cast_into(self) -> bf16 {
        bf16::from_f32(self.to_f32())
    }
}

impl CastInto<f16> for bf16 {
    #[inline(always)]
    fn cast_into(self) -> f16 {
        f16::from_f32(self.to_f32())
    }
}

impl CastInto<Complex128> for Complex64 {
    #[inline(always)]
    fn cast_into(self) -> Complex128 {
        self.into()
    }
}

impl CastInto<Complex64> for Complex128 {
    #[inline(always)]
    fn cast_into(self) -> Complex64 {
        self.into()
    }
}

/// Truth value used when casting into `DType::Bool`
trait Truthy: Copy {
    fn is_nonzero(self) -> bool;
}

macro_rules! impl_truthy {
    (int: $($ty:ty),*) => {
        $(
            impl Truthy for $ty {
                #[inline(always)]
                fn is_nonzero(self) -> bool {
                    self != 0
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Truthy for $ty {
                #[inline(always)]
                fn is_nonzero(self) -> bool {
                    (self as f64) != 0.0
                }
            }
        )*
    };
    (half: $($ty:ty),*) => {
        $(
            impl Truthy for $ty {
                #[inline(always)]
                fn is_nonzero(self) -> bool {
                    self.to_f32() != 0.0
                }
            }
        )*
    };
}

impl_truthy!(int: u8, u16, u32, u64, i8, i16, i32, i64);
impl_truthy!(float: f32, f64);
impl_truthy!(half: f16, bf16);

/// Convert a strided run from `S` to `D`.
///
/// # Safety
/// - `src` must address `len` readable elements of `S` spaced by `src_stride`
/// - `dst` must address `len` writable elements of `D` spaced by `dst_stride`
/// - both must be aligned for their element type and must not overlap
unsafe fn cast_run<S, D>(src: *const u8, src_stride: isize, dst: *mut u8, dst_stride: isize, len: usize)
where
    S: CastInto<D> + Copy,
    D: Copy,
{
    let mut s = src.cast::<S>();
    let mut d = dst.cast::<D>();
    unsafe {
        if src_stride == 1 && dst_stride == 1 {
            let src = std::slice::from_raw_parts(s, len);
            let dst = std::slice::from_raw_parts_mut(d, len);
            for (out, &value) in dst.iter_mut().zip(src) {
                *out = value.cast_into();
            }
            return;
        }
        for _ in 0..len {
            d.write(s.read().cast_into());
            s = s.wrapping_offset(src_stride);
            d = d.wrapping_offset(dst_stride);
        }
    }
}

/// Convert a strided run from `S` into one-byte booleans.
///
/// # Safety
/// Same requirements as [`cast_run`] with `D = u8`.
unsafe fn to_bool_run<S: Truthy>(
    src: *const u8,
    src_stride: isize,
    dst: *mut u8,
    dst_stride: isize,
    len: usize,
) {
    let mut s = src.cast::<S>();
    let mut d = dst;
    unsafe {
        for _ in 0..len {
            d.write(u8::from(s.read().is_nonzero()));
            s = s.wrapping_offset(src_stride);
            d = d.wrapping_offset(dst_stride);
        }
    }
}

/// Copy a strided run of `T` without conversion.
///
/// # Safety
/// Same requirements as [`cast_run`] with `S = D = T`.
unsafe fn copy_run<T: Copy>(src: *const u8, src_stride: isize, dst: *mut u8, dst_stride: isize, len: usize) {
    unsafe {
        if src_stride == 1 && dst_stride == 1 {
            std::ptr::copy_nonoverlapping(src, dst, len * size_of::<T>());
            return;
        }
        let mut s = src.cast::<T>();
        let mut d = dst.cast::<T>();
        for _ in 0..len {
            d.write(s.read());
            s = s.wrapping_offset(src_stride);
            d = d.wrapping_offset(dst_stride);
        }
    }
}

fn identity_kernel(dtype: DType) -> CastKernel {
    match dtype {
        DType::F64 => copy_run::<f64>,
        DType::F32 => copy_run::<f32>,
        DType::F16 => copy_run::<f16>,
        DType::BF16 => copy_run::<bf16>,
        DType::I64 => copy_run::<i64>,
        DType::I32 => copy_run::<i32>,
        DType::I16 => copy_run::<i16>,
        DType::I8 => copy_run::<i8>,
        DType::U64 => copy_run::<u64>,
        DType::U32 => copy_run::<u32>,
        DType::U16 => copy_run::<u16>,
        DType::U8 | DType::Bool => copy_run::<u8>,
        DType::Complex64 => copy_run::<Complex64>,
        DType::Complex128 => copy_run::<Complex128>,
    }
}

fn conversion_kernel(src: DType, dst: DType) -> Option<CastKernel> {
    if src == dst {
        return Some(identity_kernel(src));
    }

    // Real source type: every real destination is defined, complex is not.
    macro_rules! from_real {
        ($src_ty:ty) => {
            match dst {
                DType::F64 => Some(cast_run::<$src_ty, f64> as CastKernel),
                DType::F32 => Some(cast_run::<$src_ty, f32> as CastKernel),
                DType::F16 => Some(cast_run::<$src_ty, f16> as CastKernel),
                DType::BF16 => Some(cast_run::<$src_ty, bf16> as CastKernel),
                DType::I64 => Some(cast_run::<$src_ty, i64> as CastKernel),
                DType::I32 => Some(cast_run::<$src_ty, i32> as CastKernel),
                DType::I16 => Some(cast_run::<$src_ty, i16> as CastKernel),
                DType::I8 => Some(cast_run::<$src_ty, i8> as CastKernel),
                DType::U64 => Some(cast_run::<$src_ty, u64> as CastKernel),
                DType::U32 => Some(cast_run::<$src_ty, u32> as CastKernel),
                DType::U16 => Some(cast_run::<$src_ty, u16> as CastKernel),
                DType::U8 => Some(cast_run::<$src_ty, u8> as CastKernel),
                DType::Bool => Some(to_bool_run::<$src_ty> as CastKernel),
                DType::Complex64 | DType::Complex128 => None,
            }
        };
    }

    match src {
        DType::F64 => from_real!(f64),
        DType::F32 => from_real!(f32),
        DType::F16 => from_real!(f16),
        DType::BF16 => from_real!(bf16),
        DType::I64 => from_real!(i64),
        DType::I32 => from_real!(i32),
        DType::I16 => from_real!(i16),
        DType::I8 => from_real!(i8),
        DType::U64 => from_real!(u64),
        DType::U32 => from_real!(u32),
        DType::U16 => from_real!(u16),
        // Bool storage is canonical 0/1 bytes, so it converts like u8.
        DType::U8 | DType::Bool => from_real!(u8),
        DType::Complex64 => match dst {
            DType::Complex128 => Some(cast_run::<Complex64, Complex128> as CastKernel),
            _ => None,
        },
        DType::Complex128 => match dst {
            DType::Complex64 => Some(cast_run::<Complex128, Complex64> as CastKernel),
            _ => None,
        },
    }
}

struct CastTable {
    kernels: [[Option<CastKernel>; DType::COUNT]; DType::COUNT],
}

impl CastTable {
    fn build() -> Self {
        let mut kernels = [[None; DType::COUNT]; DType::COUNT];
        for src in DType::ALL {
            for dst in DType::ALL {
                kernels[src.index()][dst.index()] = conversion_kernel(src, dst);
            }
        }
        Self { kernels }
    }
}

fn cast_table() -> &'static CastTable {
    static TABLE: OnceLock<CastTable> = OnceLock::new();
    TABLE.get_or_init(CastTable::build)
}

/// A selected elementwise conversion
#[derive(Clone, Copy)]
pub struct CastFn {
    src: DType,
    dst: DType,
    kernel: CastKernel,
}

impl CastFn {
    /// Source element type
    #[inline]
    pub fn src(&self) -> DType {
        self.src
    }

    /// Destination element type
    #[inline]
    pub fn dst(&self) -> DType {
        self.dst
    }

    /// True when no conversion happens (raw byte copy)
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.src == self.dst
    }

    /// The raw kernel, for executors that drive it themselves
    #[inline]
    pub fn kernel(&self) -> CastKernel {
        self.kernel
    }

    /// Convert a strided run of `len` elements.
    ///
    /// # Safety
    /// - `src` must address `len` readable, aligned elements of `self.src()`
    ///   spaced by `src_stride` elements
    /// - `dst` must address `len` writable, aligned elements of `self.dst()`
    ///   spaced by `dst_stride` elements
    /// - the two regions must not overlap
    #[inline]
    pub unsafe fn run(&self, src: *const u8, src_stride: isize, dst: *mut u8, dst_stride: isize, len: usize) {
        unsafe { (self.kernel)(src, src_stride, dst, dst_stride, len) }
    }

    /// Convert a typed slice into another typed slice of the same length
    pub fn apply<S: Element, D: Element>(&self, src: &[S], dst: &mut [D]) -> Result<()> {
        if S::DTYPE != self.src || D::DTYPE != self.dst {
            return Err(CopyError::invalid_view(format!(
                "cast {}->{} applied to {}->{} slices",
                self.src,
                self.dst,
                S::DTYPE,
                D::DTYPE
            )));
        }
        if src.len() != dst.len() {
            return Err(CopyError::invalid_view(format!(
                "cast length mismatch: {} source vs {} destination elements",
                src.len(),
                dst.len()
            )));
        }
        unsafe {
            self.run(
                src.as_ptr().cast(),
                1,
                dst.as_mut_ptr().cast(),
                1,
                src.len(),
            )
        };
        Ok(())
    }
}

impl fmt::Debug for CastFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CastFn({} -> {})", self.src, self.dst)
    }
}

impl PartialEq for CastFn {
    fn eq(&self, other: &Self) -> bool {
        self.src == other.src && self.dst == other.dst
    }
}

/// Select the conversion from `src` to `dst`.
///
/// Returns [`CopyError::UnsupportedCast`] when the pair has no defined rule.
pub fn select_cast(src: DType, dst: DType) -> Result<CastFn> {
    cast_table().kernels[src.index()][dst.index()]
        .map(|kernel| CastFn { src, dst, kernel })
        .ok_or_else(|| CopyError::unsupported_cast(src, dst))
}

/// Check whether a conversion rule exists between two dtypes
pub fn can_cast(src: DType, dst: DType) -> bool {
    cast_table().kernels[src.index()][dst.index()].is_some()
}
