//! Borrowed tensor views.
//!
//! A view is a byte buffer, a byte offset into it, and the [`TensorLayout`]
//! that addresses elements from that offset. Sub-tensors are expressed by
//! moving the offset rather than slicing the buffer, so a strided slice of a
//! larger tensor (one group's channels, say) needs no copy and no raw pointer.

use crate::error::{ConvError, Result};
use crate::layout::TensorLayout;

/// Read-only tensor view.
#[derive(Debug, Clone, Copy)]
pub struct TensorRef<'a> {
    pub data: &'a [u8],
    pub offset: usize,
    pub layout: &'a TensorLayout,
}

/// Writable tensor view.
#[derive(Debug)]
pub struct TensorMut<'a> {
    pub data: &'a mut [u8],
    pub offset: usize,
    pub layout: &'a TensorLayout,
}

fn check_bounds(len: usize, offset: usize, layout: &TensorLayout) -> Result<()> {
    let span = layout
        .span_in_bytes()
        .ok_or_else(|| ConvError::layout(format!("{layout} has no addressable byte span")))?;
    match offset.checked_add(span) {
        Some(end) if end <= len => Ok(()),
        _ => Err(ConvError::layout(format!(
            "{layout} at byte offset {offset} overruns a {len} byte buffer"
        ))),
    }
}

impl<'a> TensorRef<'a> {
    /// Views `data` from byte `offset` through `layout`.
    ///
    /// # Errors
    /// - [`ConvError::InvalidLayout`] if the layout has no byte span (see
    ///   [`TensorLayout::span_in_bytes`]) or reaches past the end of `data`.
    pub fn new(data: &'a [u8], offset: usize, layout: &'a TensorLayout) -> Result<Self> {
        check_bounds(data.len(), offset, layout)?;
        Ok(Self { data, offset, layout })
    }

    /// Reads the element at multi-index `idx` as `f64`.
    #[inline]
    pub(crate) fn get(&self, idx: &[usize]) -> f64 {
        let at = self.offset + self.layout.byte_offset(idx);
        self.layout.dtype.read(self.data, at)
    }
}

impl<'a> TensorMut<'a> {
    /// Views `data` mutably from byte `offset` through `layout`.
    ///
    /// # Errors
    /// - [`ConvError::InvalidLayout`] if the layout has no byte span (see
    ///   [`TensorLayout::span_in_bytes`]) or reaches past the end of `data`.
    pub fn new(data: &'a mut [u8], offset: usize, layout: &'a TensorLayout) -> Result<Self> {
        check_bounds(data.len(), offset, layout)?;
        Ok(Self { data, offset, layout })
    }

    /// Reborrows the view for a shorter lifetime.
    pub fn reborrow(&mut self) -> TensorMut<'_> {
        TensorMut {
            data: &mut *self.data,
            offset: self.offset,
            layout: self.layout,
        }
    }

    /// Writes `value` at multi-index `idx`, narrowing to the view's dtype.
    #[inline]
    pub(crate) fn set(&mut self, idx: &[usize], value: f64) {
        let at = self.offset + self.layout.byte_offset(idx);
        self.layout.dtype.write(self.data, at, value);
    }
}
