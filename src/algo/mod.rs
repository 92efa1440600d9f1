//! # Backward-Filter Algorithms
//!
//! Every way of computing a 3D convolution filter gradient implements
//! [`AlgoBase`]. The [`AlgoPack`] held by a [`Handle`](crate::handle::Handle)
//! orders them; operators walk the pack and pick the first algorithm that is
//! available for the layouts at hand and fits the workspace limit.
//!
//! ## Built-in algorithms, in pack order
//!
//! - [`group_conv::AlgoGroupConvGeneral`]: runs a dense sub-operator once per group
//! - [`accumulate::AlgoAccumulate`]: dense, accumulates in an `f64` workspace
//! - [`naive::AlgoNaive`]: dense, accumulates in the tensor dtype, no workspace
//!
//! ## Adding an algorithm
//!
//! 1. Implement [`AlgoBase`] (give it a unique name)
//! 2. Register it with [`HandleBuilder::register`](crate::handle::HandleBuilder::register)
//! 3. Force it through an [`ExecutionPolicy`](crate::opr::ExecutionPolicy) or
//!    let the heuristic reach it after the built-ins

use std::sync::Arc;

use crate::error::Result;
use crate::layout::TensorLayout;
use crate::opr::Convolution3dBackwardFilter;
use crate::param::FilterMeta;
use crate::tensor::{TensorMut, TensorRef};

pub mod accumulate;
pub mod group_conv;
pub mod naive;

/// Name-based identity of an algorithm inside an [`AlgoPack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgorithmDesc {
    pub name: &'static str,
}

/// Operator family a [`SearchItem`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OprType {
    Convolution3dBackwardFilter = 0,
}

/// One sub-problem an autotuner should search algorithms for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchItem {
    pub opr_type: OprType,
    /// [`Param::serialize_pod`](crate::param::Param::serialize_pod) of the
    /// sub-operator's parameter block.
    pub param: Vec<u8>,
    pub layouts: Vec<TensorLayout>,
}

/// Shapes and configuration of one backward-filter problem.
///
/// Only constructible through [`SizeArgs::new`], which validates the layouts,
/// so algorithms may rely on the shape relations documented there.
#[derive(Debug, Clone, Copy)]
pub struct SizeArgs<'a> {
    pub opr: &'a Convolution3dBackwardFilter,
    pub src_layout: &'a TensorLayout,
    pub diff_layout: &'a TensorLayout,
    pub grad_layout: &'a TensorLayout,
    pub grad_filter_meta: FilterMeta,
}

impl<'a> SizeArgs<'a> {
    /// Checks the layouts against `opr`'s param and canonizes the filter.
    ///
    /// # Errors
    /// - [`ConvError::InvalidLayout`](crate::error::ConvError::InvalidLayout)
    ///   when the layouts disagree with each other or with the param.
    pub fn new(
        opr: &'a Convolution3dBackwardFilter,
        src_layout: &'a TensorLayout,
        diff_layout: &'a TensorLayout,
        grad_layout: &'a TensorLayout,
    ) -> Result<Self> {
        let grad_filter_meta = opr.check_layouts(src_layout, diff_layout, grad_layout)?;
        Ok(Self {
            opr,
            src_layout,
            diff_layout,
            grad_layout,
            grad_filter_meta,
        })
    }
}

/// A validated problem plus the buffers to run it on.
#[derive(Debug)]
pub struct ExecArgs<'a> {
    pub size: SizeArgs<'a>,
    pub src_tensor: TensorRef<'a>,
    pub diff_tensor: TensorRef<'a>,
    pub grad_tensor: TensorMut<'a>,
    /// At least `get_workspace_in_bytes(&size)` bytes.
    pub workspace: &'a mut [u8],
}

/// The contract every backward-filter algorithm implements.
pub trait AlgoBase: Send + Sync {
    /// Unique name within a pack.
    fn name(&self) -> &'static str;

    /// Whether the algorithm can run `args` at all.
    fn is_available(&self, args: &SizeArgs<'_>) -> bool;

    /// [`is_available`](Self::is_available) for callers that must tell "not
    /// applicable" apart from a failure while finding out.
    ///
    /// # Errors
    /// Failures that leave availability unknown, such as an exhausted
    /// operator cap.
    fn try_is_available(&self, args: &SizeArgs<'_>) -> Result<bool> {
        Ok(self.is_available(args))
    }

    /// Scratch bytes `exec` needs for `args`.
    ///
    /// # Errors
    /// Algorithm specific; planning failures are propagated.
    fn get_workspace_in_bytes(&self, args: &SizeArgs<'_>) -> Result<usize>;

    /// Computes the filter gradient into `args.grad_tensor`.
    ///
    /// # Errors
    /// Algorithm specific; the gradient contents are unspecified on error.
    fn exec(&self, args: ExecArgs<'_>) -> Result<()>;

    /// Sub-problems this algorithm delegates to, for offline search.
    ///
    /// # Errors
    /// Algorithm specific.
    fn get_subopr_list(
        &self,
        _opr: &Convolution3dBackwardFilter,
        _layouts: &[TensorLayout; 3],
    ) -> Result<Vec<SearchItem>> {
        Ok(Vec::new())
    }

    fn desc(&self) -> AlgorithmDesc {
        AlgorithmDesc { name: self.name() }
    }
}

/// Ordered set of algorithms owned by a handle.
#[derive(Clone)]
pub struct AlgoPack {
    algos: Vec<Arc<dyn AlgoBase>>,
}

impl AlgoPack {
    /// The built-in CPU algorithms.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            algos: vec![
                Arc::new(group_conv::AlgoGroupConvGeneral),
                Arc::new(accumulate::AlgoAccumulate),
                Arc::new(naive::AlgoNaive),
            ],
        }
    }

    pub(crate) fn push(&mut self, algo: Arc<dyn AlgoBase>) {
        self.algos.push(algo);
    }

    #[must_use]
    pub fn all(&self) -> &[Arc<dyn AlgoBase>] {
        &self.algos
    }

    /// First algorithm registered under `desc.name`.
    #[must_use]
    pub fn find(&self, desc: AlgorithmDesc) -> Option<&Arc<dyn AlgoBase>> {
        self.algos.iter().find(|a| a.name() == desc.name)
    }
}

impl core::fmt::Debug for AlgoPack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.algos.iter().map(|a| a.name()))
            .finish()
    }
}
