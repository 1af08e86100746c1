//! Borrowed tensor views: the operands of a copy

use super::Layout;
use crate::dtype::{DType, Element};
use crate::error::{CopyError, Result};
use crate::runtime::Placement;
use std::fmt;
use std::marker::PhantomData;

/// Read-only view over an allocation
///
/// A view never owns memory. It records the element type, the layout and
/// where the allocation lives, and borrows the allocation for `'a`. Every
/// index reachable through the layout is checked to fall inside the
/// allocation when the view is built.
#[derive(Clone)]
pub struct TensorView<'a> {
    addr: u64,
    len_bytes: usize,
    dtype: DType,
    layout: Layout,
    placement: Placement,
    _borrow: PhantomData<&'a [u8]>,
}

/// Writable view over an allocation
///
/// Same invariants as [`TensorView`], with exclusive access for `'a`.
pub struct TensorViewMut<'a> {
    addr: u64,
    len_bytes: usize,
    dtype: DType,
    layout: Layout,
    placement: Placement,
    _borrow: PhantomData<&'a mut [u8]>,
}

fn validate(addr: u64, len_bytes: usize, dtype: DType, layout: &Layout) -> Result<()> {
    if layout.shape().len() != layout.strides().len() {
        return Err(CopyError::invalid_view(format!(
            "shape rank {} does not match stride rank {}",
            layout.shape().len(),
            layout.strides().len()
        )));
    }
    if addr % dtype.align() as u64 != 0 {
        return Err(CopyError::invalid_view(format!(
            "address {addr:#x} is not aligned for {dtype}"
        )));
    }
    if let Some((_, max)) = layout.extent()? {
        let needed = max
            .checked_add(1)
            .and_then(|n| n.checked_mul(dtype.size_in_bytes()))
            .ok_or_else(|| CopyError::invalid_view(format!("{layout:?} overflows")))?;
        if needed > len_bytes {
            return Err(CopyError::invalid_view(format!(
                "{layout:?} of {dtype} needs {needed} bytes but the allocation has {len_bytes}"
            )));
        }
    }
    Ok(())
}

macro_rules! impl_view_common {
    ($view:ident) => {
        impl<'a> $view<'a> {
            /// Element type
            #[inline]
            pub fn dtype(&self) -> DType {
                self.dtype
            }

            /// Shape, strides and offset
            #[inline]
            pub fn layout(&self) -> &Layout {
                &self.layout
            }

            /// Shape of the view
            #[inline]
            pub fn shape(&self) -> &[usize] {
                self.layout.shape()
            }

            /// Strides of the view, in elements
            #[inline]
            pub fn strides(&self) -> &[isize] {
                self.layout.strides()
            }

            /// Where the allocation lives
            #[inline]
            pub fn placement(&self) -> Placement {
                self.placement
            }

            /// Base address of the allocation (element offset not applied)
            #[inline]
            pub fn addr(&self) -> u64 {
                self.addr
            }

            /// Allocation length in bytes
            #[inline]
            pub fn len_bytes(&self) -> usize {
                self.len_bytes
            }

            /// Number of elements addressed by the layout
            #[inline]
            pub fn elem_count(&self) -> usize {
                self.layout.elem_count()
            }

            /// Address of the element at the layout offset
            #[inline]
            pub fn origin(&self) -> u64 {
                self.addr + (self.layout.offset() * self.dtype.size_in_bytes()) as u64
            }

            /// Replace the layout, re-validating against the allocation
            pub fn with_layout(self, layout: Layout) -> Result<Self> {
                validate(self.addr, self.len_bytes, self.dtype, &layout)?;
                Ok(Self { layout, ..self })
            }
        }

        impl fmt::Debug for $view<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($view))
                    .field("dtype", &self.dtype)
                    .field("layout", &self.layout)
                    .field("placement", &self.placement)
                    .field("addr", &format_args!("{:#x}", self.addr))
                    .field("len_bytes", &self.len_bytes)
                    .finish()
            }
        }
    };
}

impl_view_common!(TensorView);
impl_view_common!(TensorViewMut);

impl<'a> TensorView<'a> {
    /// View a host slice through `layout`
    pub fn from_slice<T: Element>(data: &'a [T], layout: Layout) -> Result<Self> {
        let addr = data.as_ptr() as usize as u64;
        let len_bytes = std::mem::size_of_val(data);
        validate(addr, len_bytes, T::DTYPE, &layout)?;
        Ok(Self {
            addr,
            len_bytes,
            dtype: T::DTYPE,
            layout,
            placement: Placement::Host,
            _borrow: PhantomData,
        })
    }

    /// View a host slice as a contiguous tensor of `shape`
    pub fn contiguous<T: Element>(data: &'a [T], shape: &[usize]) -> Result<Self> {
        Self::from_slice(data, Layout::contiguous(shape))
    }

    /// View raw host bytes as elements of `dtype`
    ///
    /// This is the only way to build `DType::Bool` views.
    pub fn from_bytes(bytes: &'a [u8], dtype: DType, layout: Layout) -> Result<Self> {
        let addr = bytes.as_ptr() as usize as u64;
        validate(addr, bytes.len(), dtype, &layout)?;
        Ok(Self {
            addr,
            len_bytes: bytes.len(),
            dtype,
            layout,
            placement: Placement::Host,
            _borrow: PhantomData,
        })
    }

    /// View memory identified by address, typically a device allocation
    ///
    /// # Safety
    /// `addr..addr + len_bytes` must be a live allocation at `placement`
    /// that is not written by anyone else for `'a`.
    pub unsafe fn from_raw(
        addr: u64,
        len_bytes: usize,
        dtype: DType,
        layout: Layout,
        placement: Placement,
    ) -> Result<Self> {
        validate(addr, len_bytes, dtype, &layout)?;
        Ok(Self {
            addr,
            len_bytes,
            dtype,
            layout,
            placement,
            _borrow: PhantomData,
        })
    }
}

impl<'a> TensorViewMut<'a> {
    /// View a mutable host slice through `layout`
    pub fn from_slice<T: Element>(data: &'a mut [T], layout: Layout) -> Result<Self> {
        let addr = data.as_mut_ptr() as usize as u64;
        let len_bytes = std::mem::size_of_val(data);
        validate(addr, len_bytes, T::DTYPE, &layout)?;
        Ok(Self {
            addr,
            len_bytes,
            dtype: T::DTYPE,
            layout,
            placement: Placement::Host,
            _borrow: PhantomData,
        })
    }

    /// View a mutable host slice as a contiguous tensor of `shape`
    pub fn contiguous<T: Element>(data: &'a mut [T], shape: &[usize]) -> Result<Self> {
        Self::from_slice(data, Layout::contiguous(shape))
    }

    /// View raw mutable host bytes as elements of `dtype`
    pub fn from_bytes(bytes: &'a mut [u8], dtype: DType, layout: Layout) -> Result<Self> {
        let addr = bytes.as_mut_ptr() as usize as u64;
        validate(addr, bytes.len(), dtype, &layout)?;
        Ok(Self {
            addr,
            len_bytes: bytes.len(),
            dtype,
            layout,
            placement: Placement::Host,
            _borrow: PhantomData,
        })
    }

    /// Writable view over memory identified by address
    ///
    /// # Safety
    /// `addr..addr + len_bytes` must be a live allocation at `placement`
    /// that nobody else reads or writes for `'a`.
    pub unsafe fn from_raw(
        addr: u64,
        len_bytes: usize,
        dtype: DType,
        layout: Layout,
        placement: Placement,
    ) -> Result<Self> {
        validate(addr, len_bytes, dtype, &layout)?;
        Ok(Self {
            addr,
            len_bytes,
            dtype,
            layout,
            placement,
            _borrow: PhantomData,
        })
    }

    /// Read-only reborrow
    pub fn as_view(&self) -> TensorView<'_> {
        TensorView {
            addr: self.addr,
            len_bytes: self.len_bytes,
            dtype: self.dtype,
            layout: self.layout.clone(),
            placement: self.placement,
            _borrow: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::DeviceId;

    #[test]
    fn test_slice_view_bounds() {
        let data = [0f32; 12];
        let view = TensorView::contiguous(&data, &[3, 4]).unwrap();
        assert_eq!(view.elem_count(), 12);
        assert_eq!(view.dtype(), DType::F32);
        assert!(TensorView::contiguous(&data, &[4, 4]).is_err());

        let t = Layout::contiguous(&[3, 4]).transpose(0, 1).unwrap();
        assert!(TensorView::from_slice(&data, t).is_ok());
    }

    #[test]
    fn test_view_offset_and_origin() {
        let data = [0u16; 10];
        let layout = Layout::strided(&[2, 2], &[4, 1], 3).unwrap();
        let view = TensorView::from_slice(&data, layout).unwrap();
        assert_eq!(view.origin() - view.addr(), 6);

        let too_far = Layout::strided(&[2, 2], &[4, 1], 6).unwrap();
        assert!(matches!(
            TensorView::from_slice(&data, too_far),
            Err(CopyError::InvalidView { .. })
        ));
    }

    #[test]
    fn test_bytes_view_alignment() {
        let words = [0u64; 4];
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        assert!(TensorView::from_bytes(bytes, DType::Bool, Layout::contiguous(&[32])).is_ok());
        assert!(TensorView::from_bytes(&bytes[1..], DType::F32, Layout::contiguous(&[2])).is_err());
    }

    #[test]
    fn test_empty_view_needs_no_storage() {
        let data: [f64; 0] = [];
        let view = TensorView::contiguous(&data, &[0, 5]).unwrap();
        assert_eq!(view.elem_count(), 0);
    }

    #[test]
    fn test_raw_device_view() {
        let view = unsafe {
            TensorView::from_raw(
                0x1000,
                64,
                DType::F64,
                Layout::contiguous(&[8]),
                Placement::Device(DeviceId(1)),
            )
        }
        .unwrap();
        assert_eq!(view.placement(), Placement::Device(DeviceId(1)));
        let err = unsafe {
            TensorView::from_raw(0x1000, 63, DType::F64, Layout::contiguous(&[8]), Placement::Host)
        };
        assert!(err.is_err());
    }

    #[test]
    fn test_mut_reborrow() {
        let mut data = [0i32; 6];
        let view = TensorViewMut::contiguous(&mut data, &[2, 3]).unwrap();
        let read = view.as_view();
        assert_eq!(read.shape(), &[2, 3]);
        assert_eq!(read.addr(), view.addr());
    }
}
