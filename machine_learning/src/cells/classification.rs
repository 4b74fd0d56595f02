use log::debug;
use specs::ClassificationCellSpec;

use super::{CellContext, ClassificationCell, layers};
use crate::{error::Result, graph::NodeId};

/// Global average pooling followed by a linear layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearClassification;

impl ClassificationCell for LinearClassification {
    fn build(
        &self,
        ctx: &mut CellContext<'_>,
        input: NodeId,
        spec: &ClassificationCellSpec,
        stage: usize,
    ) -> Result<NodeId> {
        debug!(stage = stage, classes = spec.classes; "building classification cell");

        let pooled = ctx.graph().global_avg_pool(input)?;
        layers::dense(
            ctx,
            pooled,
            "classification",
            spec.classes,
            spec.stddev,
            spec.weight_decay,
        )
    }
}
