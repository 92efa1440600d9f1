//! Tensor layout descriptors.
//!
//! A [`TensorLayout`] describes how a tensor's elements sit in a byte buffer:
//! the extent of every axis, the distance between neighbouring elements along
//! each axis (in elements, not bytes), and the element type. Layouts never own
//! data; they are cheap to clone and are passed by value between the planner
//! and the algorithms.
//!
//! ## Limitations
//! - Strides must be non-negative for a layout to be executable
//! - Only floating point element types are modelled

use core::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DType {
    /// IEEE-754 single precision.
    #[default]
    Float32 = 0,
    /// IEEE-754 double precision.
    Float64 = 1,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    /// Rounds `value` to the precision of the element type.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn round(self, value: f64) -> f64 {
        match self {
            Self::Float32 => f64::from(value as f32),
            Self::Float64 => value,
        }
    }

    /// Reads the element starting at `bytes[at]`.
    #[inline]
    pub(crate) fn read(self, bytes: &[u8], at: usize) -> f64 {
        match self {
            Self::Float32 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes[at..at + 4]);
                f64::from(f32::from_ne_bytes(raw))
            }
            Self::Float64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[at..at + 8]);
                f64::from_ne_bytes(raw)
            }
        }
    }

    /// Writes `value` into `bytes[at..]`, narrowing to the element type.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn write(self, bytes: &mut [u8], at: usize, value: f64) {
        match self {
            Self::Float32 => bytes[at..at + 4].copy_from_slice(&(value as f32).to_ne_bytes()),
            Self::Float64 => bytes[at..at + 8].copy_from_slice(&value.to_ne_bytes()),
        }
    }
}

/// Shape, per-axis element strides and element type of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorLayout {
    pub shape: Vec<usize>,
    pub stride: Vec<isize>,
    pub dtype: DType,
}

impl TensorLayout {
    /// Creates a layout from explicit shape and strides.
    ///
    /// # Panics
    /// Panics if `shape` and `stride` have different lengths.
    pub fn new(shape: impl Into<Vec<usize>>, stride: impl Into<Vec<isize>>, dtype: DType) -> Self {
        let shape = shape.into();
        let stride = stride.into();
        assert_eq!(
            shape.len(),
            stride.len(),
            "shape {shape:?} and stride {stride:?} have different ranks"
        );
        Self { shape, stride, dtype }
    }

    /// Creates a packed row-major layout.
    ///
    /// # Example
    /// ```
    /// use briny_conv::layout::{DType, TensorLayout};
    /// let l = TensorLayout::contiguous([2, 3, 4], DType::Float32);
    /// assert_eq!(l.stride, vec![12, 4, 1]);
    /// ```
    #[allow(clippy::cast_possible_wrap)]
    pub fn contiguous(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        let shape = shape.into();
        let mut stride = vec![0isize; shape.len()];
        let mut acc = 1usize;
        for d in (0..shape.len()).rev() {
            stride[d] = acc as isize;
            acc *= shape[d];
        }
        Self { shape, stride, dtype }
    }

    /// Number of axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of addressable elements.
    #[must_use]
    pub fn total_nr_elems(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the layout is packed row-major (unit-extent axes are ignored).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1isize;
        for d in (0..self.ndim()).rev() {
            if self.shape[d] == 1 {
                continue;
            }
            if self.stride[d] != expected {
                return false;
            }
            expected *= self.shape[d] as isize;
        }
        true
    }

    /// Bytes between the first element and one past the furthest element.
    ///
    /// Returns `None` for layouts with negative strides or a span that does
    /// not fit in `usize`. Empty layouts span zero bytes.
    #[must_use]
    pub fn span_in_bytes(&self) -> Option<usize> {
        if self.shape.contains(&0) {
            return Some(0);
        }
        let mut last = 0usize;
        for (&extent, &stride) in self.shape.iter().zip(&self.stride) {
            let stride = usize::try_from(stride).ok()?;
            last = last.checked_add((extent - 1).checked_mul(stride)?)?;
        }
        last.checked_add(1)?.checked_mul(self.dtype.size())
    }

    /// Byte offset of the element at `idx`, relative to the layout origin.
    ///
    /// `idx` must have one entry per axis and strides must be non-negative.
    #[inline]
    #[allow(clippy::cast_sign_loss)]
    pub(crate) fn byte_offset(&self, idx: &[usize]) -> usize {
        let mut elems = 0usize;
        for (&i, &s) in idx.iter().zip(&self.stride) {
            elems += i * s as usize;
        }
        elems * self.dtype.size()
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{{", self.shape)?;
        for (i, s) in self.stride.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{s}")?;
        }
        write!(f, "}} {:?}", self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_are_row_major() {
        let l = TensorLayout::contiguous([2, 6, 3, 4, 5], DType::Float32);
        assert_eq!(l.stride, vec![360, 60, 20, 5, 1]);
        assert!(l.is_contiguous());
        assert_eq!(l.total_nr_elems(), 720);
        assert_eq!(l.span_in_bytes(), Some(720 * 4));
    }

    #[test]
    fn channel_slice_keeps_parent_strides() {
        let mut l = TensorLayout::contiguous([2, 6, 3, 4, 5], DType::Float32);
        l.shape[1] = 3;
        assert!(!l.is_contiguous());
        // last element: 1*360 + 2*60 + 2*20 + 3*5 + 4 = 539
        assert_eq!(l.span_in_bytes(), Some(540 * 4));
    }

    #[test]
    fn negative_stride_has_no_span() {
        let l = TensorLayout::new([3], [-1], DType::Float64);
        assert_eq!(l.span_in_bytes(), None);
    }

    #[test]
    fn overflowing_span_is_none() {
        let l = TensorLayout::new([3], [isize::MAX / 2], DType::Float32);
        assert_eq!(l.span_in_bytes(), None);
        let l = TensorLayout::new([2, 2], [isize::MAX / 4, isize::MAX / 4], DType::Float64);
        assert_eq!(l.span_in_bytes(), None);
    }

    #[test]
    fn unit_axes_do_not_break_contiguity() {
        let l = TensorLayout::new([1, 4, 1], [99, 1, 7], DType::Float32);
        assert!(l.is_contiguous());
    }

    #[test]
    fn dtype_roundtrips_through_bytes() {
        let mut buf = [0u8; 12];
        DType::Float32.write(&mut buf, 4, 1.5);
        assert_eq!(DType::Float32.read(&buf, 4), 1.5);
        let mut buf = [0u8; 8];
        DType::Float64.write(&mut buf, 0, -2.25);
        assert_eq!(DType::Float64.read(&buf, 0), -2.25);
    }

    #[test]
    #[should_panic(expected = "different ranks")]
    fn mismatched_rank_panics() {
        let _ = TensorLayout::new([2, 2], [1], DType::Float32);
    }
}
