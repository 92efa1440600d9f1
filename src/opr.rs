//! The 3D convolution backward-filter operator.
//!
//! An operator owns its [`Param`], its [`ExecutionPolicy`] and a cache of the
//! last heuristic choice. It computes
//!
//! ```text
//! grad[g, oc, ic, k] = Σ_n Σ_o diff[n, g·ocpg + oc, o] · src[n, g·icpg + ic, o·s + k·d − p]
//! ```
//!
//! with the kernel index `k` mirrored when `Mode::Convolution` is selected.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::algo::{AlgoBase, AlgorithmDesc, ExecArgs, SizeArgs};
use crate::error::{ConvError, Result};
use crate::handle::Handle;
use crate::layout::TensorLayout;
use crate::param::{FilterMeta, Format, Param};
use crate::tensor::{TensorMut, TensorRef};

/// Which algorithm an operator must use.
///
/// With `algo` unset, the operator runs the heuristic. `sub_policy` carries
/// the policies of the sub-operators the chosen algorithm creates, in creation
/// order; it only takes effect when `algo` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub algo: Option<AlgorithmDesc>,
    pub sub_policy: Vec<ExecutionPolicy>,
}

impl ExecutionPolicy {
    /// Forces `algo` with no sub-policies.
    #[must_use]
    pub fn forced(algo: AlgorithmDesc) -> Self {
        Self {
            algo: Some(algo),
            sub_policy: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_sub_policy(mut self, sub: ExecutionPolicy) -> Self {
        self.sub_policy.push(sub);
        self
    }
}

/// Copies `outer`'s sub-policies onto `subs`, one each, in order.
///
/// Nothing is copied when `outer` has no chosen algorithm or no sub-policies,
/// leaving the sub-operators on their own heuristic.
///
/// # Errors
/// - [`ConvError::UnsupportedConfiguration`] if the number of sub-policies
///   differs from the number of sub-operators.
pub fn set_execution_policy(
    outer: &Convolution3dBackwardFilter,
    subs: &mut [&mut Convolution3dBackwardFilter],
) -> Result<()> {
    let policy = outer.execution_policy();
    if policy.algo.is_none() || policy.sub_policy.is_empty() {
        return Ok(());
    }
    if policy.sub_policy.len() != subs.len() {
        return Err(ConvError::unsupported(format!(
            "{} sub-policies for {} sub-operators",
            policy.sub_policy.len(),
            subs.len()
        )));
    }
    for (sub, p) in subs.iter_mut().zip(&policy.sub_policy) {
        *sub.execution_policy_mut() = p.clone();
    }
    Ok(())
}

type CacheKey = (Param, [TensorLayout; 3]);

/// Backward-filter operator bound to a [`Handle`].
pub struct Convolution3dBackwardFilter {
    handle: Handle,
    param: Param,
    policy: ExecutionPolicy,
    best_algo: Mutex<Option<(CacheKey, AlgorithmDesc)>>,
}

impl Convolution3dBackwardFilter {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            param: Param::default(),
            policy: ExecutionPolicy::default(),
            best_algo: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    #[must_use]
    pub fn param(&self) -> &Param {
        &self.param
    }

    pub fn param_mut(&mut self) -> &mut Param {
        &mut self.param
    }

    #[must_use]
    pub fn execution_policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn execution_policy_mut(&mut self) -> &mut ExecutionPolicy {
        &mut self.policy
    }

    /// The algorithm this operator would run for the given layouts.
    ///
    /// A forced algorithm is returned only if it is registered and available;
    /// there is no fallback to the heuristic. Otherwise the first available
    /// algorithm in pack order within the handle's workspace limit is chosen
    /// and remembered for the same param and layouts. Errors raised while
    /// probing algorithms are logged and reported as `None`; use
    /// [`get_workspace_in_bytes`](Self::get_workspace_in_bytes) to see them.
    #[must_use]
    pub fn get_algorithm(
        &self,
        src: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
    ) -> Option<Arc<dyn AlgoBase>> {
        let selected =
            SizeArgs::new(self, src, diff, grad).and_then(|args| self.try_select(&args));
        match selected {
            Ok(algo) => algo,
            Err(err) => {
                debug!(%err, "no algorithm selected");
                None
            }
        }
    }

    /// Names of every algorithm available for the given layouts, in pack order.
    #[must_use]
    pub fn available_algorithms(
        &self,
        src: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
    ) -> Vec<AlgorithmDesc> {
        let Ok(args) = SizeArgs::new(self, src, diff, grad) else {
            return Vec::new();
        };
        self.handle
            .algo_pack()
            .all()
            .iter()
            .filter(|a| a.is_available(&args))
            .map(|a| a.desc())
            .collect()
    }

    /// Selects an algorithm for `args`.
    ///
    /// `Ok(None)` means no algorithm applies. Errors from
    /// [`AlgoBase::try_is_available`] and workspace queries are propagated, so
    /// an exhausted resource is never mistaken for an unsupported problem.
    pub(crate) fn try_select(&self, args: &SizeArgs<'_>) -> Result<Option<Arc<dyn AlgoBase>>> {
        let pack = self.handle.algo_pack();

        if let Some(desc) = self.policy.algo {
            let Some(algo) = pack.find(desc) else {
                warn!(algo = desc.name, "forced algorithm is not registered");
                return Ok(None);
            };
            if !algo.try_is_available(args)? {
                warn!(algo = desc.name, "forced algorithm is not available");
                return Ok(None);
            }
            return Ok(Some(Arc::clone(algo)));
        }

        let key: CacheKey = (
            self.param,
            [
                args.src_layout.clone(),
                args.diff_layout.clone(),
                args.grad_layout.clone(),
            ],
        );
        let cached = self
            .best_algo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|(k, desc)| (*k == key).then_some(*desc));
        if let Some(desc) = cached {
            return Ok(pack.find(desc).cloned());
        }

        let limit = self.handle.config().workspace_limit;
        for algo in pack.all() {
            if !algo.try_is_available(args)? || algo.get_workspace_in_bytes(args)? > limit {
                continue;
            }
            debug!(
                algo = algo.name(),
                src = %args.src_layout,
                grad = %args.grad_layout,
                "heuristic selected algorithm"
            );
            *self.best_algo.lock().unwrap_or_else(PoisonError::into_inner) =
                Some((key, algo.desc()));
            return Ok(Some(Arc::clone(algo)));
        }
        Ok(None)
    }

    fn select_or_fail(&self, args: &SizeArgs<'_>) -> Result<Arc<dyn AlgoBase>> {
        self.try_select(args)?.ok_or_else(|| {
            ConvError::unsupported(format!(
                "no algorithm for src {} diff {} grad {}",
                args.src_layout, args.diff_layout, args.grad_layout
            ))
        })
    }

    /// Scratch bytes [`exec`](Self::exec) needs for these layouts.
    ///
    /// # Errors
    /// - [`ConvError::InvalidLayout`] if the layouts are inconsistent.
    /// - [`ConvError::UnsupportedConfiguration`] if no algorithm applies.
    /// - [`ConvError::ResourceExhaustion`] if probing an algorithm needs an
    ///   operator the handle cannot create.
    pub fn get_workspace_in_bytes(
        &self,
        src: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
    ) -> Result<usize> {
        let args = SizeArgs::new(self, src, diff, grad)?;
        self.select_or_fail(&args)?.get_workspace_in_bytes(&args)
    }

    /// Computes the filter gradient of `src` and `diff` into `grad`.
    ///
    /// # Errors
    /// - [`ConvError::InvalidLayout`] if the layouts are inconsistent.
    /// - [`ConvError::UnsupportedConfiguration`] if no algorithm applies.
    /// - [`ConvError::WorkspaceTooSmall`] if `workspace` is shorter than
    ///   [`get_workspace_in_bytes`](Self::get_workspace_in_bytes).
    /// - Whatever the selected algorithm reports.
    pub fn exec(
        &self,
        src: TensorRef<'_>,
        diff: TensorRef<'_>,
        grad: TensorMut<'_>,
        workspace: &mut [u8],
    ) -> Result<()> {
        let size = SizeArgs::new(self, src.layout, diff.layout, grad.layout)?;
        let algo = self.select_or_fail(&size)?;
        let required = algo.get_workspace_in_bytes(&size)?;
        if workspace.len() < required {
            return Err(ConvError::WorkspaceTooSmall {
                required,
                provided: workspace.len(),
            });
        }
        algo.exec(ExecArgs {
            size,
            src_tensor: src,
            diff_tensor: diff,
            grad_tensor: grad,
            workspace,
        })
    }

    /// Validates the three layouts against the param and canonizes the filter.
    ///
    /// # Errors
    /// - [`ConvError::InvalidLayout`] on any mismatch.
    pub fn check_layouts(
        &self,
        src: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
    ) -> Result<FilterMeta> {
        if src.dtype != diff.dtype || src.dtype != grad.dtype {
            return Err(ConvError::layout(format!(
                "dtype mismatch: src {:?} diff {:?} grad {:?}",
                src.dtype, diff.dtype, grad.dtype
            )));
        }
        let fm = FilterMeta::from_grad_layout(grad, &self.param)?;
        if src.ndim() != 5 || diff.ndim() != 5 {
            return Err(ConvError::layout(format!(
                "src {src} and diff {diff} must both be 5-D"
            )));
        }
        let (c_pos, spatial_pos) = match self.param.format {
            Format::Ncdhw => (1, 2),
            Format::Ndhwc => (4, 1),
        };
        if src.shape[0] != diff.shape[0] {
            return Err(ConvError::layout(format!(
                "batch mismatch between src {src} and diff {diff}"
            )));
        }
        if src.shape[c_pos] != fm.group * fm.icpg {
            return Err(ConvError::layout(format!(
                "src {src} has {} channels, filter expects {} x {}",
                src.shape[c_pos], fm.group, fm.icpg
            )));
        }
        if diff.shape[c_pos] != fm.group * fm.ocpg {
            return Err(ConvError::layout(format!(
                "diff {diff} has {} channels, filter expects {} x {}",
                diff.shape[c_pos], fm.group, fm.ocpg
            )));
        }
        for axis in 0..3 {
            let expected = fm.output_extent(axis, src.shape[spatial_pos + axis]);
            if expected != Some(diff.shape[spatial_pos + axis]) {
                return Err(ConvError::layout(format!(
                    "diff {diff} spatial axis {axis} should be {expected:?} for src {src}"
                )));
            }
        }
        Ok(fm)
    }
}

impl Drop for Convolution3dBackwardFilter {
    fn drop(&mut self) {
        self.handle.release_operator();
    }
}

impl core::fmt::Debug for Convolution3dBackwardFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Convolution3dBackwardFilter")
            .field("param", &self.param)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
