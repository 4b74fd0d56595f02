use std::collections::BTreeMap;

use log::debug;
use specs::{ArchSpec, CellDescriptor, FilterSet, InputSelection};

use super::{SpatialExtent, StageArena, StageOutput};
use crate::{
    cells::{CellContext, EnvelopeCell, layers::Conv},
    error::{MlErr, Result},
    graph::NodeId,
};

/// The result of assembling an architecture on top of an init cell output.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    /// The tensor of the last non terminal stage.
    pub output: NodeId,
    /// Diagnostic tensors reported by the envelopes, by name.
    pub end_points: BTreeMap<String, NodeId>,
    /// Every stage output, the init cell's included.
    pub stages: StageArena,
    /// The channel width after the last stage.
    pub channel_width: usize,
}

/// Interprets an `ArchSpec`, one stage per descriptor.
pub struct Assembler<'e> {
    envelope: &'e dyn EnvelopeCell,
    stages: StageArena,
    channel_width: usize,
    end_points: BTreeMap<String, NodeId>,
}

impl<'e> Assembler<'e> {
    /// Assembles `arch` on top of `init`.
    ///
    /// # Arguments
    /// * `ctx` - The context of the tower being built.
    /// * `envelope` - The cell that builds the body of filter stages.
    /// * `init` - The init cell's output, stage `0`, its channel count is the starting width.
    /// * `arch` - The validated architecture.
    ///
    /// # Returns
    /// The assembled network or an error if a skip connection can't be reconciled or a cell
    /// fails to build.
    pub fn assemble(
        ctx: &mut CellContext<'_>,
        envelope: &'e dyn EnvelopeCell,
        init: NodeId,
        arch: &ArchSpec,
    ) -> Result<Assembly> {
        let init = StageOutput::of(ctx, init)?;

        let mut assembler = Self {
            envelope,
            channel_width: init.channels,
            stages: StageArena::new(init),
            end_points: BTreeMap::new(),
        };

        for (i, cell) in arch.iter().enumerate() {
            let stage = i + 1;
            let output = ctx.nested(&format!("stage_{stage}"), |ctx| {
                assembler.build_stage(ctx, stage, cell)
            })?;

            debug!(
                stage = stage,
                kind = cell.kind(),
                extent:% = output.extent,
                channels = output.channels,
                channel_width = assembler.channel_width;
                "assembled stage"
            );

            assembler.stages.push(output);
        }

        Ok(Assembly {
            output: assembler.stages.last().tensor,
            end_points: assembler.end_points,
            stages: assembler.stages,
            channel_width: assembler.channel_width,
        })
    }

    fn build_stage(
        &mut self,
        ctx: &mut CellContext<'_>,
        stage: usize,
        cell: &CellDescriptor,
    ) -> Result<StageOutput> {
        let current = *self.stages.last();

        match cell {
            CellDescriptor::Filter {
                filters,
                outputs,
                inputs,
            } => self.filter_stage(ctx, stage, current, filters, *outputs, inputs),
            CellDescriptor::Widener => {
                let pooled = ctx.graph().max_pool(current.tensor, 2, 2)?;
                let conv = Conv::new(3, self.channel_width)
                    .stride(2)
                    .build(ctx, current.tensor, "widener_conv3x3")?;
                let tensor = ctx.graph().concat(&[pooled, conv])?;

                self.channel_width *= 2;
                StageOutput::of(ctx, tensor)
            }
            CellDescriptor::Widener2 { inputs } => {
                let resolved = self.reconcile(ctx, stage, inputs, current.extent)?;
                let joined = concat(ctx, &resolved)?;
                let tensor = ctx.graph().max_pool(joined, 2, 2)?;

                self.channel_width *= 2;
                StageOutput::of(ctx, tensor)
            }
            CellDescriptor::Output => Ok(current),
        }
    }

    fn filter_stage(
        &mut self,
        ctx: &mut CellContext<'_>,
        stage: usize,
        current: StageOutput,
        filters: &FilterSet,
        outputs: usize,
        inputs: &InputSelection,
    ) -> Result<StageOutput> {
        let references: Vec<_> = match inputs {
            InputSelection::All => (0..stage).collect(),
            InputSelection::Stages(stages) if !stages.is_empty() => stages.clone(),
            _ => vec![stage - 1],
        };

        let resolved = self.reconcile(ctx, stage, &references, current.extent)?;

        let input = match resolved.as_slice() {
            &[single] => single,
            _ => {
                let joined = concat(ctx, &resolved)?;
                Conv::new(1, current.channels).build(ctx, joined, "bottleneck_1x1")?
            }
        };

        let per_branch = outputs / filters.len().max(1);
        let envelope = self.envelope.build(
            ctx,
            input,
            self.channel_width,
            filters,
            per_branch,
            stage,
        )?;

        self.end_points.extend(envelope.end_points);
        StageOutput::of(ctx, envelope.tensor)
    }

    /// Brings every referenced stage down to `target` with 2x2 max poolings.
    ///
    /// Every reference is checked before any pooling is added to the graph.
    fn reconcile(
        &self,
        ctx: &mut CellContext<'_>,
        stage: usize,
        references: &[usize],
        target: SpatialExtent,
    ) -> Result<Vec<NodeId>> {
        let plans = references
            .iter()
            .map(|&reference| {
                let source = self
                    .stages
                    .get(reference)
                    .ok_or(MlErr::UnknownStage { stage, reference })?;

                let halvings =
                    source
                        .extent
                        .halvings_to(target)
                        .ok_or(MlErr::Topology {
                            stage,
                            reference,
                            reference_extent: source.extent,
                            target_extent: target,
                        })?;

                Ok((source.tensor, halvings))
            })
            .collect::<Result<Vec<_>>>()?;

        plans
            .into_iter()
            .map(|(mut tensor, halvings)| {
                for _ in 0..halvings {
                    tensor = ctx.graph().max_pool(tensor, 2, 2)?;
                }
                Ok(tensor)
            })
            .collect()
    }
}

fn concat(ctx: &mut CellContext<'_>, tensors: &[NodeId]) -> Result<NodeId> {
    match tensors {
        &[single] => Ok(single),
        _ => ctx.graph().concat(tensors),
    }
}
