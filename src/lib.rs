//! briny_conv: grouped 3D convolution backward filter by dense decomposition.
//!
//! A grouped convolution splits its channels into independent blocks. This
//! crate computes the filter gradient of such a convolution by running a dense
//! (ungrouped) backward-filter operator once per group over strided views of
//! the full tensors, with no copies and one shared workspace.
//!
//! # Features
//!
//! - Algorithm registry with a four-method contract (`is_available`,
//!   `get_workspace_in_bytes`, `exec`, `get_subopr_list`)
//! - Execution policies that pin an algorithm and propagate to sub-operators
//! - Workspace planning that reports exactly what one group needs
//! - Dense CPU reference algorithms parallelised with `rayon`
//! - Sub-problem enumeration with a fixed POD parameter encoding for autotuners
//!
//! # Modules
//!
//! - [`handle`]: Execution context and operator factory.
//! - [`opr`]: The backward-filter operator and execution policies.
//! - [`algo`]: Algorithm contract and the built-in algorithms.
//! - [`layout`], [`tensor`], [`param`], [`workspace`]: Descriptors and views.
//! - [`config`], [`backend`], [`error`]: Configuration and errors.
//!
//! # Example
//!
//! ```rust
//! use briny_conv::config::HandleConfig;
//! use briny_conv::handle::Handle;
//! use briny_conv::layout::{DType, TensorLayout};
//! use briny_conv::param::Sparse;
//! use briny_conv::tensor::{TensorMut, TensorRef};
//! use briny_conv::workspace::Workspace;
//!
//! let handle = Handle::new(HandleConfig::default());
//! let mut opr = handle.create_operator()?;
//! opr.param_mut().sparse = Sparse::Group;
//!
//! let src = TensorLayout::contiguous([1, 4, 3, 3, 3], DType::Float32);
//! let diff = TensorLayout::contiguous([1, 2, 1, 1, 1], DType::Float32);
//! let grad = TensorLayout::contiguous([2, 1, 2, 3, 3, 3], DType::Float32);
//!
//! let src_buf = vec![0u8; src.span_in_bytes().unwrap_or(0)];
//! let diff_buf = vec![0u8; diff.span_in_bytes().unwrap_or(0)];
//! let mut grad_buf = vec![0u8; grad.span_in_bytes().unwrap_or(0)];
//!
//! let mut ws = Workspace::alloc(opr.get_workspace_in_bytes(&src, &diff, &grad)?)?;
//! opr.exec(
//!     TensorRef::new(&src_buf, 0, &src)?,
//!     TensorRef::new(&diff_buf, 0, &diff)?,
//!     TensorMut::new(&mut grad_buf, 0, &grad)?,
//!     ws.as_mut_slice(),
//! )?;
//! # Ok::<(), briny_conv::error::ConvError>(())
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::many_single_char_names,
    clippy::similar_names,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![deny(unsafe_code)]

pub mod algo;
pub mod backend;
pub mod config;
pub mod error;
pub mod handle;
pub mod layout;
pub mod opr;
pub mod param;
pub mod tensor;
pub mod workspace;
