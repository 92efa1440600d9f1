//! Dense backward filter accumulating in double precision.
//!
//! Sums are kept as `f64` in the workspace, one slot per filter element, and
//! narrowed to the gradient dtype only when copied out. The workspace is split
//! per output channel, so the `rayon` workers never share a slot.

use rayon::prelude::*;

use super::naive::{channel_gradient, dense_available, write_channel};
use super::{AlgoBase, ExecArgs, SizeArgs};
use crate::error::{ConvError, Result};

const SLOT: usize = size_of::<f64>();

#[derive(Debug, Clone, Copy, Default)]
pub struct AlgoAccumulate;

impl AlgoBase for AlgoAccumulate {
    fn name(&self) -> &'static str {
        "ACCUMULATE_F64"
    }

    fn is_available(&self, args: &SizeArgs<'_>) -> bool {
        dense_available(args)
    }

    fn get_workspace_in_bytes(&self, args: &SizeArgs<'_>) -> Result<usize> {
        let fm = &args.grad_filter_meta;
        Ok(fm.ocpg * fm.icpg * fm.kernel_volume() * SLOT)
    }

    fn exec(&self, args: ExecArgs<'_>) -> Result<()> {
        let required = self.get_workspace_in_bytes(&args.size)?;
        let ExecArgs {
            size,
            src_tensor,
            diff_tensor,
            mut grad_tensor,
            workspace,
        } = args;
        if workspace.len() < required {
            return Err(ConvError::WorkspaceTooSmall {
                required,
                provided: workspace.len(),
            });
        }
        let fm = size.grad_filter_meta;
        let per_channel = fm.icpg * fm.kernel_volume() * SLOT;
        let slots = &mut workspace[..required];

        slots
            .par_chunks_mut(per_channel)
            .enumerate()
            .for_each(|(oc, chunk)| {
                let values = channel_gradient(&src_tensor, &diff_tensor, &fm, oc, None);
                for (cell, v) in chunk.chunks_exact_mut(SLOT).zip(values) {
                    cell.copy_from_slice(&v.to_ne_bytes());
                }
            });

        let mut row = Vec::with_capacity(per_channel / SLOT);
        for (oc, chunk) in slots.chunks_exact(per_channel).enumerate() {
            row.clear();
            row.extend(chunk.chunks_exact(SLOT).map(|cell| {
                let mut raw = [0u8; SLOT];
                raw.copy_from_slice(cell);
                f64::from_ne_bytes(raw)
            }));
            write_channel(&mut grad_tensor, &fm, oc, &row);
        }
        Ok(())
    }
}
