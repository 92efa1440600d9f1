//! Scratch memory sizing and allocation.

use crate::error::{ConvError, Result};

/// Alignment of every region after the first.
pub const REGION_ALIGN: usize = 64;

/// An ordered set of scratch regions carved out of one caller-owned buffer.
///
/// Only interior regions are padded to [`REGION_ALIGN`]; the last region ends
/// exactly at [`WorkspaceBundle::total_size_in_bytes`], so a single-region
/// bundle is exactly as large as its region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceBundle {
    sizes: Vec<usize>,
}

impl WorkspaceBundle {
    pub fn new(sizes: impl Into<Vec<usize>>) -> Self {
        Self { sizes: sizes.into() }
    }

    #[must_use]
    pub fn nr_workspace(&self) -> usize {
        self.sizes.len()
    }

    #[must_use]
    pub fn get_size(&self, i: usize) -> usize {
        self.sizes[i]
    }

    fn offset_of(&self, i: usize) -> usize {
        self.sizes[..i]
            .iter()
            .fold(0, |acc, &s| (acc + s).next_multiple_of(REGION_ALIGN))
    }

    /// Bytes the caller must provide.
    #[must_use]
    pub fn total_size_in_bytes(&self) -> usize {
        match self.sizes.len() {
            0 => 0,
            n => self.offset_of(n - 1) + self.sizes[n - 1],
        }
    }

    /// Returns region `i` of `raw`.
    ///
    /// # Errors
    /// - [`ConvError::WorkspaceTooSmall`] if `raw` is shorter than the bundle.
    ///
    /// # Panics
    /// Panics if `i` is not a region index.
    pub fn get_workspace<'a>(&self, raw: &'a mut [u8], i: usize) -> Result<&'a mut [u8]> {
        let required = self.total_size_in_bytes();
        if raw.len() < required {
            return Err(ConvError::WorkspaceTooSmall {
                required,
                provided: raw.len(),
            });
        }
        let start = self.offset_of(i);
        Ok(&mut raw[start..start + self.sizes[i]])
    }
}

/// An owned, zero-initialised scratch buffer.
#[derive(Debug, Default)]
pub struct Workspace {
    buf: Vec<u8>,
}

impl Workspace {
    /// Allocates `bytes` of scratch memory.
    ///
    /// # Errors
    /// - [`ConvError::ResourceExhaustion`] if the allocator refuses.
    pub fn alloc(bytes: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes).map_err(|e| {
            ConvError::ResourceExhaustion(format!("workspace of {bytes} bytes: {e}"))
        })?;
        buf.resize(bytes, 0);
        Ok(Self { buf })
    }

    /// Allocates a buffer large enough for `bundle`.
    ///
    /// # Errors
    /// - [`ConvError::ResourceExhaustion`] if the allocator refuses.
    pub fn for_bundle(bundle: &WorkspaceBundle) -> Result<Self> {
        Self::alloc(bundle.total_size_in_bytes())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_region_has_no_padding() {
        let b = WorkspaceBundle::new([1000]);
        assert_eq!(b.total_size_in_bytes(), 1000);
        let mut raw = vec![0u8; 1000];
        assert_eq!(b.get_workspace(&mut raw, 0).unwrap().len(), 1000);
    }

    #[test]
    fn interior_regions_are_aligned() {
        let b = WorkspaceBundle::new([10, 100, 3]);
        // 10 -> 64, 64 + 100 = 164 -> 192, 192 + 3
        assert_eq!(b.total_size_in_bytes(), 195);
        let mut raw = vec![0u8; 195];
        assert_eq!(b.get_workspace(&mut raw, 2).unwrap().len(), 3);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let b = WorkspaceBundle::new([32]);
        let mut raw = vec![0u8; 31];
        assert!(matches!(
            b.get_workspace(&mut raw, 0),
            Err(ConvError::WorkspaceTooSmall {
                required: 32,
                provided: 31
            })
        ));
    }

    #[test]
    fn empty_bundle_needs_nothing() {
        let b = WorkspaceBundle::new(Vec::new());
        assert_eq!(b.total_size_in_bytes(), 0);
        assert!(Workspace::for_bundle(&b).unwrap().is_empty());
    }
}
