use specs::InitCellSpec;

use super::{CellContext, InitCell, layers::Conv};
use crate::{error::Result, graph::NodeId};

/// A single convolution with ReLU from the raw image channels to the starting channel width.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvInit;

impl InitCell for ConvInit {
    fn build(
        &self,
        ctx: &mut CellContext<'_>,
        images: NodeId,
        spec: &InitCellSpec,
    ) -> Result<NodeId> {
        Conv::new(spec.kernel, spec.outputs)
            .stddev(spec.stddev)
            .weight_decay(spec.weight_decay)
            .build(ctx, images, "init")
    }
}
