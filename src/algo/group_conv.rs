//! Grouped backward filter by repeated dense sub-operator calls.
//!
//! A grouped problem with `G` groups is `G` independent dense problems over
//! disjoint channel ranges. All of them share one shape, so a single dense
//! sub-operator is created, planned once, and executed `G` times over views
//! that move through src, diff and grad by a fixed byte stride per group.
//!
//! # Group order
//!
//! Groups run strictly in ascending order `0..G` against one shared workspace
//! region. Group `g` writes the filter gradient slice starting at byte
//! `g * GroupStrides::grad` of the gradient buffer.

use tracing::{debug, trace};

use super::{AlgoBase, ExecArgs, OprType, SearchItem, SizeArgs};
use crate::error::{ConvError, Result};
use crate::layout::TensorLayout;
use crate::opr::{set_execution_policy, Convolution3dBackwardFilter};
use crate::param::{FilterMeta, Format, Param, Sparse};
use crate::tensor::{TensorMut, TensorRef};
use crate::workspace::WorkspaceBundle;

/// Channel axis of NCDHW activations.
const C_POS: usize = 1;

/// One group's dense sub-problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubOprConfig {
    /// Sliced src, diff and grad layouts, in that order.
    pub layouts: [TensorLayout; 3],
    /// The caller's param with `sparse` forced to [`Sparse::Dense`].
    pub param: Param,
}

/// Derives the dense sub-problem for one group.
///
/// The grad layout loses its leading group axis when it has one more axis than
/// src. The channel extents of src and diff are divided by the group count;
/// their strides are kept, so the sliced layouts address one group's channels
/// inside the full tensors.
///
/// # Errors
/// - [`ConvError::InvalidLayout`] if the group count does not divide a
///   channel extent.
pub fn sub_opr_config(args: &SizeArgs<'_>) -> Result<SubOprConfig> {
    let grad = args.grad_layout;
    let skip = usize::from(grad.ndim() > args.src_layout.ndim());
    let grad_pg = TensorLayout::new(&grad.shape[skip..], &grad.stride[skip..], grad.dtype);

    let group = args.grad_filter_meta.group;
    let mut src_pg = args.src_layout.clone();
    let mut diff_pg = args.diff_layout.clone();
    for l in [&mut src_pg, &mut diff_pg] {
        if l.ndim() <= C_POS || group == 0 || l.shape[C_POS] % group != 0 {
            return Err(ConvError::layout(format!(
                "{group} groups do not divide the channels of {l}"
            )));
        }
        l.shape[C_POS] /= group;
    }

    let param = Param {
        sparse: Sparse::Dense,
        ..*args.opr.param()
    };
    Ok(SubOprConfig {
        layouts: [src_pg, diff_pg, grad_pg],
        param,
    })
}

/// Slices `args` and creates the dense sub-operator that runs each group.
///
/// The sub-operator shares the caller's handle, inherits its sub-policy and
/// carries the dense param.
///
/// # Errors
/// - [`ConvError::InvalidLayout`] from slicing.
/// - [`ConvError::ResourceExhaustion`] if the handle cannot create an operator.
/// - [`ConvError::UnsupportedConfiguration`] if the caller's sub-policies do
///   not match the single sub-operator.
pub fn prepare_sub_opr(args: &SizeArgs<'_>) -> Result<(SubOprConfig, Convolution3dBackwardFilter)> {
    let config = sub_opr_config(args)?;
    let mut sub = args.opr.handle().create_operator()?;
    set_execution_policy(args.opr, &mut [&mut sub])?;
    *sub.param_mut() = config.param;
    Ok((config, sub))
}

/// Byte distance between the tensors of consecutive groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStrides {
    pub src: usize,
    pub diff: usize,
    pub grad: usize,
}

impl GroupStrides {
    /// Strides for the sliced layouts of `config`.
    ///
    /// The grad stride assumes one group's filter gradient is packed, which
    /// [`AlgoGroupConvGeneral::is_available`] checks.
    ///
    /// # Errors
    /// - [`ConvError::InvalidLayout`] if a channel stride is negative or a
    ///   stride overflows `usize`.
    pub fn new(config: &SubOprConfig, fm: &FilterMeta) -> Result<Self> {
        let [src, diff, grad] = &config.layouts;
        let channel_stride = |l: &TensorLayout| {
            usize::try_from(l.stride[C_POS])
                .map_err(|_| ConvError::layout(format!("negative channel stride in {l}")))
        };
        let bytes = |parts: &[usize]| {
            parts
                .iter()
                .try_fold(1usize, |acc, &p| acc.checked_mul(p))
                .ok_or_else(|| ConvError::layout(format!("group stride {parts:?} overflows")))
        };
        Ok(Self {
            src: bytes(&[src.dtype.size(), channel_stride(src)?, fm.icpg])?,
            diff: bytes(&[diff.dtype.size(), channel_stride(diff)?, fm.ocpg])?,
            grad: bytes(&[grad.dtype.size(), fm.icpg, fm.ocpg, fm.kernel_volume()])?,
        })
    }

    /// Byte offsets of group `g` relative to the base of each tensor, or
    /// `None` if one does not fit in `usize`.
    #[must_use]
    pub fn offsets(&self, g: usize) -> Option<(usize, usize, usize)> {
        Some((
            g.checked_mul(self.src)?,
            g.checked_mul(self.diff)?,
            g.checked_mul(self.grad)?,
        ))
    }
}

/// `base + by`, or [`ConvError::InvalidLayout`] when the sum overflows.
fn shifted(base: usize, by: usize) -> Result<usize> {
    base.checked_add(by)
        .ok_or_else(|| ConvError::layout(format!("byte offset {base} + {by} overflows")))
}

/// Whether consecutive groups' filter gradients sit back to back, as the
/// fixed grad stride requires.
fn grad_is_packed(args: &SizeArgs<'_>, config: &SubOprConfig) -> bool {
    let fm = &args.grad_filter_meta;
    let per_group = fm.icpg * fm.ocpg * fm.kernel_volume();
    let grad = args.grad_layout;
    let group_axis_ok = grad.ndim() == config.layouts[2].ndim()
        || grad.shape[0] == 1
        || usize::try_from(grad.stride[0]).is_ok_and(|s| s == per_group);
    config.layouts[2].is_contiguous() && group_axis_ok
}

/// Grouped backward filter over one reused dense sub-operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlgoGroupConvGeneral;

impl AlgoGroupConvGeneral {
    /// Single region sized by the sub-operator's own requirement.
    ///
    /// # Errors
    /// Propagates sub-operator creation and planning failures.
    pub fn get_workspace_bundle(&self, args: &SizeArgs<'_>) -> Result<WorkspaceBundle> {
        let (config, sub) = prepare_sub_opr(args)?;
        let [src, diff, grad] = &config.layouts;
        let bytes = sub.get_workspace_in_bytes(src, diff, grad)?;
        debug!(bytes, "grouped workspace planned");
        Ok(WorkspaceBundle::new([bytes]))
    }
}

impl AlgoBase for AlgoGroupConvGeneral {
    fn name(&self) -> &'static str {
        "GROUP_CONV_GENERAL"
    }

    fn is_available(&self, args: &SizeArgs<'_>) -> bool {
        self.try_is_available(args).unwrap_or_else(|err| {
            debug!(%err, "grouped availability unknown");
            false
        })
    }

    fn try_is_available(&self, args: &SizeArgs<'_>) -> Result<bool> {
        let fm = &args.grad_filter_meta;
        if fm.group <= 1 || fm.format != Format::Ncdhw {
            return Ok(false);
        }
        let (config, sub) = match prepare_sub_opr(args) {
            Ok(prepared) => prepared,
            Err(err @ ConvError::InvalidLayout(_)) => {
                debug!(%err, "grouped decomposition not applicable");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        if !grad_is_packed(args, &config) {
            debug!(grad = %args.grad_layout, "per-group filter gradient is not packed");
            return Ok(false);
        }
        let [src, diff, grad] = &config.layouts;
        let sub_args = SizeArgs::new(&sub, src, diff, grad)?;
        Ok(sub.try_select(&sub_args)?.is_some())
    }

    fn get_workspace_in_bytes(&self, args: &SizeArgs<'_>) -> Result<usize> {
        Ok(self.get_workspace_bundle(args)?.total_size_in_bytes())
    }

    fn exec(&self, args: ExecArgs<'_>) -> Result<()> {
        let ExecArgs {
            size,
            src_tensor,
            diff_tensor,
            mut grad_tensor,
            workspace,
        } = args;
        let fm = size.grad_filter_meta;

        let (config, sub) = prepare_sub_opr(&size)?;
        let [src_pg, diff_pg, grad_pg] = &config.layouts;
        let bundle = WorkspaceBundle::new([sub.get_workspace_in_bytes(src_pg, diff_pg, grad_pg)?]);
        let scratch = bundle.get_workspace(workspace, 0)?;
        let strides = GroupStrides::new(&config, &fm)?;
        debug!(group = fm.group, ?strides, "running grouped backward filter");

        for g in 0..fm.group {
            let (s, d, f) = strides
                .offsets(g)
                .ok_or_else(|| ConvError::layout(format!("group {g} offset overflows")))?;
            let src = TensorRef::new(src_tensor.data, shifted(src_tensor.offset, s)?, src_pg)?;
            let diff = TensorRef::new(diff_tensor.data, shifted(diff_tensor.offset, d)?, diff_pg)?;
            let grad_view = grad_tensor.reborrow();
            let grad = TensorMut::new(grad_view.data, shifted(grad_view.offset, f)?, grad_pg)?;
            trace!(group = g, src = src.offset, diff = diff.offset, grad = grad.offset, "group");
            sub.exec(src, diff, grad, &mut *scratch)
                .map_err(|e| ConvError::SubOperatorFailure {
                    group: g,
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    fn get_subopr_list(
        &self,
        opr: &Convolution3dBackwardFilter,
        layouts: &[TensorLayout; 3],
    ) -> Result<Vec<SearchItem>> {
        let args = SizeArgs::new(opr, &layouts[0], &layouts[1], &layouts[2])?;
        let config = sub_opr_config(&args)?;
        Ok(vec![SearchItem {
            opr_type: OprType::Convolution3dBackwardFilter,
            param: config.param.serialize_pod(),
            layouts: config.layouts.to_vec(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandleConfig;
    use crate::handle::Handle;
    use crate::layout::DType;

    fn grouped(handle: &Handle) -> Convolution3dBackwardFilter {
        let mut opr = handle.create_operator().unwrap();
        opr.param_mut().sparse = Sparse::Group;
        opr
    }

    #[test]
    fn slicing_strips_group_axis_and_divides_channels() {
        let handle = Handle::new(HandleConfig::default());
        let opr = grouped(&handle);
        let src = TensorLayout::contiguous([2, 6, 5, 5, 5], DType::Float32);
        let diff = TensorLayout::contiguous([2, 8, 3, 3, 3], DType::Float32);
        let grad = TensorLayout::contiguous([2, 4, 3, 3, 3, 3], DType::Float32);
        let args = SizeArgs::new(&opr, &src, &diff, &grad).unwrap();

        let config = sub_opr_config(&args).unwrap();
        let [s, d, f] = &config.layouts;
        assert_eq!(s.shape, vec![2, 3, 5, 5, 5]);
        assert_eq!(s.stride, src.stride);
        assert_eq!(d.shape, vec![2, 4, 3, 3, 3]);
        assert_eq!(f.shape, vec![4, 3, 3, 3, 3]);
        assert_eq!(f.stride, grad.stride[1..].to_vec());
        assert_eq!(config.param.sparse, Sparse::Dense);
        assert_eq!(config.param.pad, opr.param().pad);
    }

    #[test]
    fn strides_follow_channel_counts_and_kernel_volume() {
        let handle = Handle::new(HandleConfig::default());
        let opr = grouped(&handle);
        let src = TensorLayout::contiguous([1, 6, 4, 4, 4], DType::Float32);
        let diff = TensorLayout::contiguous([1, 8, 2, 2, 2], DType::Float32);
        let grad = TensorLayout::contiguous([2, 4, 3, 3, 3, 3], DType::Float32);
        let args = SizeArgs::new(&opr, &src, &diff, &grad).unwrap();
        let config = sub_opr_config(&args).unwrap();

        let strides = GroupStrides::new(&config, &args.grad_filter_meta).unwrap();
        assert_eq!(strides.src, 4 * 64 * 3);
        assert_eq!(strides.diff, 4 * 8 * 4);
        assert_eq!(strides.grad, 3 * 4 * 27 * 4);
        assert_eq!(strides.offsets(1), Some((768, 128, 1296)));
    }

    #[test]
    fn overflowing_group_offsets_are_reported() {
        let strides = GroupStrides {
            src: usize::MAX / 2 + 1,
            diff: 8,
            grad: 8,
        };
        assert_eq!(strides.offsets(1), Some((usize::MAX / 2 + 1, 8, 8)));
        assert_eq!(strides.offsets(2), None);
        assert!(matches!(shifted(usize::MAX, 1), Err(ConvError::InvalidLayout(_))));
        assert_eq!(shifted(16, 1296).unwrap(), 1312);
    }

    #[test]
    fn unpacked_group_axis_is_not_available() {
        let handle = Handle::new(HandleConfig::default());
        let opr = grouped(&handle);
        let src = TensorLayout::contiguous([1, 6, 4, 4, 4], DType::Float32);
        let diff = TensorLayout::contiguous([1, 8, 2, 2, 2], DType::Float32);
        let mut grad = TensorLayout::contiguous([2, 4, 3, 3, 3, 3], DType::Float32);
        grad.stride[0] += 16;
        let args = SizeArgs::new(&opr, &src, &diff, &grad).unwrap();
        assert!(!AlgoGroupConvGeneral.is_available(&args));

        grad.stride[0] -= 16;
        let args = SizeArgs::new(&opr, &src, &diff, &grad).unwrap();
        assert!(AlgoGroupConvGeneral.is_available(&args));
    }

    #[test]
    fn sub_operator_is_released_after_planning() {
        let handle = Handle::new(HandleConfig::default());
        let opr = grouped(&handle);
        let src = TensorLayout::contiguous([1, 4, 3, 3, 3], DType::Float64);
        let diff = TensorLayout::contiguous([1, 2, 3, 3, 3], DType::Float64);
        let grad = TensorLayout::contiguous([2, 1, 2, 1, 1, 1], DType::Float64);
        let args = SizeArgs::new(&opr, &src, &diff, &grad).unwrap();
        assert!(AlgoGroupConvGeneral.is_available(&args));
        assert_eq!(handle.live_operators(), 1);
    }
}
