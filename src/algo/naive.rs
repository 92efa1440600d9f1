//! Dense reference backward filter.
//!
//! Walks every filter element and accumulates over batch and output
//! positions, rounding the running sum to the tensor dtype after every step.
//! Output channels are spread over the `rayon` pool; each element is summed in
//! a fixed order, so results do not depend on scheduling.

use rayon::prelude::*;

use super::{AlgoBase, ExecArgs, SizeArgs};
use crate::error::Result;
use crate::layout::DType;
use crate::param::{FilterMeta, Format, Sparse};
use crate::tensor::{TensorMut, TensorRef};

/// Whether a dense NCDHW problem can be walked by the kernels in this module.
pub(crate) fn dense_available(args: &SizeArgs<'_>) -> bool {
    let fm = &args.grad_filter_meta;
    args.opr.param().sparse == Sparse::Dense
        && fm.group == 1
        && fm.format == Format::Ncdhw
        && [args.src_layout, args.diff_layout, args.grad_layout]
            .iter()
            .all(|l| l.span_in_bytes().is_some())
}

/// Input position read by output position `o` through kernel tap `tap`.
#[inline]
fn input_index(fm: &FilterMeta, axis: usize, o: usize, tap: usize, extent: usize) -> Option<usize> {
    let pos = o * fm.stride[axis] + tap * fm.dilation[axis];
    let idx = pos.checked_sub(fm.padding[axis])?;
    (idx < extent).then_some(idx)
}

/// Gradient of every filter element feeding output channel `oc`.
///
/// The result is laid out `[ic][kd][kh][kw]`. With `narrow` set, the running
/// sum is rounded to that dtype after each multiply-add.
pub(crate) fn channel_gradient(
    src: &TensorRef<'_>,
    diff: &TensorRef<'_>,
    fm: &FilterMeta,
    oc: usize,
    narrow: Option<DType>,
) -> Vec<f64> {
    let batch = src.layout.shape[0];
    let inp = [src.layout.shape[2], src.layout.shape[3], src.layout.shape[4]];
    let out = [diff.layout.shape[2], diff.layout.shape[3], diff.layout.shape[4]];
    let [kd_n, kh_n, kw_n] = fm.spatial;
    let tap = |axis: usize, k: usize| {
        if fm.should_flip {
            fm.spatial[axis] - 1 - k
        } else {
            k
        }
    };

    let mut acc = Vec::with_capacity(fm.icpg * fm.kernel_volume());
    for ic in 0..fm.icpg {
        for kd in 0..kd_n {
            for kh in 0..kh_n {
                for kw in 0..kw_n {
                    let t = [tap(0, kd), tap(1, kh), tap(2, kw)];
                    let mut sum = 0.0f64;
                    for n in 0..batch {
                        for od in 0..out[0] {
                            let Some(id) = input_index(fm, 0, od, t[0], inp[0]) else {
                                continue;
                            };
                            for oh in 0..out[1] {
                                let Some(ih) = input_index(fm, 1, oh, t[1], inp[1]) else {
                                    continue;
                                };
                                for ow in 0..out[2] {
                                    let Some(iw) = input_index(fm, 2, ow, t[2], inp[2]) else {
                                        continue;
                                    };
                                    let d = diff.get(&[n, oc, od, oh, ow]);
                                    sum += d * src.get(&[n, ic, id, ih, iw]);
                                    if let Some(dtype) = narrow {
                                        sum = dtype.round(sum);
                                    }
                                }
                            }
                        }
                    }
                    acc.push(sum);
                }
            }
        }
    }
    acc
}

/// Stores one output channel produced by [`channel_gradient`].
pub(crate) fn write_channel(grad: &mut TensorMut<'_>, fm: &FilterMeta, oc: usize, values: &[f64]) {
    let [kd_n, kh_n, kw_n] = fm.spatial;
    let mut it = values.iter();
    for ic in 0..fm.icpg {
        for kd in 0..kd_n {
            for kh in 0..kh_n {
                for kw in 0..kw_n {
                    if let Some(&v) = it.next() {
                        grad.set(&[oc, ic, kd, kh, kw], v);
                    }
                }
            }
        }
    }
}

/// Dense backward filter without scratch memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlgoNaive;

impl AlgoBase for AlgoNaive {
    fn name(&self) -> &'static str {
        "NAIVE"
    }

    fn is_available(&self, args: &SizeArgs<'_>) -> bool {
        dense_available(args)
    }

    fn get_workspace_in_bytes(&self, _args: &SizeArgs<'_>) -> Result<usize> {
        Ok(0)
    }

    fn exec(&self, args: ExecArgs<'_>) -> Result<()> {
        let ExecArgs {
            size,
            src_tensor,
            diff_tensor,
            mut grad_tensor,
            ..
        } = args;
        let fm = size.grad_filter_meta;
        let dtype = grad_tensor.layout.dtype;

        let rows: Vec<Vec<f64>> = (0..fm.ocpg)
            .into_par_iter()
            .map(|oc| channel_gradient(&src_tensor, &diff_tensor, &fm, oc, Some(dtype)))
            .collect();
        for (oc, row) in rows.iter().enumerate() {
            write_channel(&mut grad_tensor, &fm, oc, row);
        }
        Ok(())
    }
}
