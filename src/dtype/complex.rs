//! Complex number element types
//!
//! Complex numbers are stored in interleaved format (re, im, re, im...),
//! matching numpy, FFTW and cuFFT conventions. The copy engine only moves and
//! converts them, so no arithmetic is provided here.

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Macro to define a complex storage type
///
/// This avoids code duplication between Complex64 and Complex128.
macro_rules! impl_complex {
    ($name:ident, $float:ty, $doc_bits:literal, $doc_float_bits:literal) => {
        #[doc = concat!($doc_bits, "-bit complex number with ", $doc_float_bits, " real and imaginary parts")]
        ///
        #[doc = concat!("Memory layout: ", stringify!($name), " is ", stringify!($float), " × 2, interleaved format.")]
        #[repr(C)]
        #[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
        pub struct $name {
            /// Real part
            pub re: $float,
            /// Imaginary part
            pub im: $float,
        }

        impl $name {
            /// Zero complex number
            pub const ZERO: Self = Self { re: 0.0, im: 0.0 };

            /// Create a new complex number
            #[inline]
            pub const fn new(re: $float, im: $float) -> Self {
                Self { re, im }
            }

            /// Complex conjugate: conj(a + bi) = a - bi
            #[inline]
            pub fn conj(self) -> Self {
                Self {
                    re: self.re,
                    im: -self.im,
                }
            }
        }

        impl From<($float, $float)> for $name {
            #[inline]
            fn from((re, im): ($float, $float)) -> Self {
                Self { re, im }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.im >= 0.0 {
                    write!(f, "{}+{}i", self.re, self.im)
                } else {
                    write!(f, "{}{}i", self.re, self.im)
                }
            }
        }
    };
}

impl_complex!(Complex64, f32, "64", "f32");
impl_complex!(Complex128, f64, "128", "f64");

impl From<Complex64> for Complex128 {
    #[inline]
    fn from(z: Complex64) -> Self {
        Self::new(z.re as f64, z.im as f64)
    }
}

impl From<Complex128> for Complex64 {
    /// Each component rounds to nearest, ties to even
    #[inline]
    fn from(z: Complex128) -> Self {
        Self::new(z.re as f32, z.im as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complex_layout() {
        assert_eq!(std::mem::size_of::<Complex64>(), 8);
        assert_eq!(std::mem::size_of::<Complex128>(), 16);
        let z = Complex64::new(1.0, -2.0);
        let words: [f32; 2] = bytemuck::cast(z);
        assert_eq!(words, [1.0, -2.0]);
    }

    #[test]
    fn test_complex_conversions() {
        let wide = Complex128::from(Complex64::new(0.5, 1.5));
        assert_eq!(wide, Complex128::new(0.5, 1.5));
        let narrow = Complex64::from(Complex128::new(2.6, -0.1));
        assert_eq!(narrow, Complex64::new(2.6f32, -0.1f32));
        assert_eq!(Complex64::new(3.0, 4.0).conj().im, -4.0);
    }

    #[test]
    fn test_complex_display() {
        assert_eq!(Complex64::new(1.0, -2.0).to_string(), "1-2i");
        assert_eq!(Complex128::new(1.0, 2.0).to_string(), "1+2i");
    }
}
