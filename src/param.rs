//! Convolution parameter block and canonized filter metadata.
//!
//! # POD Encoding
//!
//! [`Param::serialize_pod`] writes the block as twelve little-endian `u32`
//! words. The encoding is the lookup key autotuning caches store next to the
//! sub-problem layouts, so it is fixed and unversioned:
//!
//! ```text
//! ┌──────┬──────────────┬──────────────┬──────────────┬────────┬────────┐
//! │ mode │ pad d,h,w    │ stride d,h,w │ dilate d,h,w │ sparse │ format │
//! ├──────┼──────────────┼──────────────┼──────────────┼────────┼────────┤
//! │ u32  │ [u32; 3]     │ [u32; 3]     │ [u32; 3]     │ u32    │ u32    │
//! └──────┴──────────────┴──────────────┴──────────────┴────────┴────────┘
//! ```

use crate::error::{ConvError, Result};
use crate::layout::TensorLayout;
use briny::prelude::{TrustedData, Validate, ValidationError};

/// Number of bytes produced by [`Param::serialize_pod`].
pub const PARAM_POD_SIZE: usize = 12 * 4;

/// Whether the filter is applied as written or spatially flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Mode {
    /// Filter index runs with the input index.
    #[default]
    CrossCorrelation = 0,
    /// Filter index runs against the input index.
    Convolution = 1,
}

/// Dense or grouped filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Sparse {
    /// All input channels feed all output channels.
    #[default]
    Dense = 0,
    /// Channels are split into independent groups; the filter carries a
    /// leading group axis.
    Group = 1,
}

/// Memory order of activations and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Format {
    /// Channels before the spatial axes.
    #[default]
    Ncdhw = 0,
    /// Channels after the spatial axes.
    Ndhwc = 1,
}

/// Parameters of a 3D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Param {
    pub mode: Mode,
    /// Zero padding on each side, depth/height/width.
    pub pad: [u32; 3],
    pub stride: [u32; 3],
    pub dilate: [u32; 3],
    pub sparse: Sparse,
    pub format: Format,
}

impl Default for Param {
    fn default() -> Self {
        Self {
            mode: Mode::CrossCorrelation,
            pad: [0; 3],
            stride: [1; 3],
            dilate: [1; 3],
            sparse: Sparse::Dense,
            format: Format::Ncdhw,
        }
    }
}

/// The raw POD words before they have been checked.
struct PackedParam {
    words: [u32; 12],
}

impl Validate for PackedParam {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        let w = &self.words;
        let enums_ok = w[0] <= 1 && w[10] <= 1 && w[11] <= 1;
        let steps_ok = w[4..10].iter().all(|&x| x > 0);
        if enums_ok && steps_ok {
            Ok(())
        } else {
            Err(ValidationError)
        }
    }
}

impl Param {
    /// Encodes the parameter block as fixed-width plain old data.
    #[must_use]
    pub fn serialize_pod(&self) -> Vec<u8> {
        let mut words = [0u32; 12];
        words[0] = self.mode as u32;
        words[1..4].copy_from_slice(&self.pad);
        words[4..7].copy_from_slice(&self.stride);
        words[7..10].copy_from_slice(&self.dilate);
        words[10] = self.sparse as u32;
        words[11] = self.format as u32;

        let mut out = Vec::with_capacity(PARAM_POD_SIZE);
        for w in words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Decodes a block written by [`Param::serialize_pod`].
    ///
    /// # Errors
    /// - [`ConvError::InvalidParam`] if the length is wrong, an enum tag is
    ///   unknown, or a stride/dilation is zero.
    pub fn deserialize_pod(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PARAM_POD_SIZE {
            return Err(ConvError::InvalidParam(format!(
                "expected {PARAM_POD_SIZE} bytes, found {}",
                bytes.len()
            )));
        }
        let mut words = [0u32; 12];
        for (w, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(chunk);
            *w = u32::from_le_bytes(raw);
        }

        let trusted = TrustedData::new(PackedParam { words })
            .map_err(|_| ConvError::InvalidParam("parameter words out of range".into()))?;
        let w = trusted.into_inner().words;

        let mode = match w[0] {
            0 => Mode::CrossCorrelation,
            _ => Mode::Convolution,
        };
        let sparse = match w[10] {
            0 => Sparse::Dense,
            _ => Sparse::Group,
        };
        let format = match w[11] {
            0 => Format::Ncdhw,
            _ => Format::Ndhwc,
        };
        Ok(Self {
            mode,
            pad: [w[1], w[2], w[3]],
            stride: [w[4], w[5], w[6]],
            dilate: [w[7], w[8], w[9]],
            sparse,
            format,
        })
    }
}

/// Filter geometry derived from a gradient layout and a [`Param`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterMeta {
    pub group: usize,
    /// Input channels per group.
    pub icpg: usize,
    /// Output channels per group.
    pub ocpg: usize,
    /// Kernel extents, depth/height/width.
    pub spatial: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
    pub format: Format,
    pub should_flip: bool,
}

impl FilterMeta {
    /// Canonizes the filter described by `grad` under `param`.
    ///
    /// Dense filters are 5-D, grouped filters carry an extra leading group
    /// axis. For `Ncdhw` the channel axes precede the kernel axes, for
    /// `Ndhwc` the input-channel axis comes last.
    ///
    /// # Errors
    /// - [`ConvError::InvalidLayout`] if the rank does not match `param.sparse`
    ///   or any extent is zero.
    pub fn from_grad_layout(grad: &TensorLayout, param: &Param) -> Result<Self> {
        let (group, rest) = match (param.sparse, grad.ndim()) {
            (Sparse::Dense, 5) => (1, &grad.shape[..]),
            (Sparse::Group, 6) => (grad.shape[0], &grad.shape[1..]),
            (sparse, n) => {
                return Err(ConvError::layout(format!(
                    "{sparse:?} filter gradient must not have rank {n}"
                )));
            }
        };
        if group == 0 || rest.contains(&0) {
            return Err(ConvError::layout(format!("empty filter gradient {grad}")));
        }
        let (ocpg, icpg, spatial) = match param.format {
            Format::Ncdhw => (rest[0], rest[1], [rest[2], rest[3], rest[4]]),
            Format::Ndhwc => (rest[0], rest[4], [rest[1], rest[2], rest[3]]),
        };
        let widen = |v: [u32; 3]| v.map(|x| x as usize);
        Ok(Self {
            group,
            icpg,
            ocpg,
            spatial,
            stride: widen(param.stride),
            padding: widen(param.pad),
            dilation: widen(param.dilate),
            format: param.format,
            should_flip: param.mode == Mode::Convolution,
        })
    }

    /// Product of the kernel extents.
    #[must_use]
    pub fn kernel_volume(&self) -> usize {
        self.spatial.iter().product()
    }

    /// Output extent along spatial axis `axis` for an input of extent `input`.
    ///
    /// Returns `None` when the dilated kernel does not fit the padded input.
    #[must_use]
    pub fn output_extent(&self, axis: usize, input: usize) -> Option<usize> {
        let padded = input + 2 * self.padding[axis];
        let reach = self.dilation[axis] * (self.spatial[axis] - 1) + 1;
        if padded < reach || self.stride[axis] == 0 {
            return None;
        }
        Some((padded - reach) / self.stride[axis] + 1)
    }
}
