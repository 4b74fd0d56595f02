use std::{collections::BTreeMap, sync::Arc};

use log::info;
use ndarray::ArrayD;
use specs::{ArchSpec, ClassificationCellSpec, InitCellSpec, TrainingSpec};

use super::{Assembler, Assembly};
use crate::{
    cells::{
        CellContext, ClassificationCell, ConvEnvelope, ConvInit, EnvelopeCell, InitCell,
        LinearClassification,
    },
    error::Result,
    graph::{Graph, NodeId},
    variables::{ScopeMode, VariableScope, VariableStore},
};

/// The output of a forward pass through the whole network.
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub logits: NodeId,
    pub end_points: BTreeMap<String, NodeId>,
    pub assembly: Assembly,
}

/// The scalars of a tower's loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TowerLoss {
    /// Cross-entropy plus every weight decay penalty of the tower.
    pub total: NodeId,
    pub cross_entropy: NodeId,
    pub logits: NodeId,
}

/// An init cell, an assembled architecture and a classification cell.
///
/// A `Network` only describes the model, variables live in a `VariableStore` and each call to
/// `inference` records a fresh forward pass on the given context.
#[derive(Clone)]
pub struct Network {
    arch: ArchSpec,
    init_spec: InitCellSpec,
    class_spec: ClassificationCellSpec,
    init: Arc<dyn InitCell>,
    envelope: Arc<dyn EnvelopeCell>,
    classification: Arc<dyn ClassificationCell>,
}

impl Network {
    /// Creates a new `Network` built with the reference cells.
    pub fn new(
        arch: ArchSpec,
        init_spec: InitCellSpec,
        class_spec: ClassificationCellSpec,
    ) -> Self {
        Self {
            arch,
            init_spec,
            class_spec,
            init: Arc::new(ConvInit),
            envelope: Arc::new(ConvEnvelope::default()),
            classification: Arc::new(LinearClassification),
        }
    }

    /// Creates the `Network` described by a task configuration.
    pub fn from_spec(spec: &TrainingSpec) -> Self {
        Self::new(
            spec.arch.clone(),
            spec.init_cell,
            spec.classification_cell,
        )
    }

    /// Replaces the cells the network is built with.
    pub fn with_cells(
        mut self,
        init: Arc<dyn InitCell>,
        envelope: Arc<dyn EnvelopeCell>,
        classification: Arc<dyn ClassificationCell>,
    ) -> Self {
        self.init = init;
        self.envelope = envelope;
        self.classification = classification;
        self
    }

    pub fn arch(&self) -> &ArchSpec {
        &self.arch
    }

    /// Records a forward pass.
    ///
    /// # Arguments
    /// * `ctx` - The context of the tower being built.
    /// * `images` - An NHWC batch of images.
    ///
    /// # Returns
    /// The logits, the end points of every stage, and the assembled stages.
    pub fn inference(&self, ctx: &mut CellContext<'_>, images: NodeId) -> Result<Inference> {
        let init = self.init.build(ctx, images, &self.init_spec)?;
        let assembly = Assembler::assemble(ctx, self.envelope.as_ref(), init, &self.arch)?;

        let stage = assembly.end_points.len();
        let logits =
            self.classification
                .build(ctx, assembly.output, &self.class_spec, stage)?;

        Ok(Inference {
            logits,
            end_points: assembly.end_points.clone(),
            assembly,
        })
    }

    /// Records a forward pass and the tower's total loss.
    ///
    /// The total loss is the mean cross-entropy plus the weight decay penalties registered on
    /// this tower's graph while building it.
    pub fn tower_loss(
        &self,
        ctx: &mut CellContext<'_>,
        images: NodeId,
        labels: &[usize],
    ) -> Result<TowerLoss> {
        let inference = self.inference(ctx, images)?;

        let graph = ctx.graph();
        let cross_entropy = graph.softmax_cross_entropy(inference.logits, labels)?;

        let mut terms = vec![cross_entropy];
        terms.extend_from_slice(graph.losses());
        let total = graph.add_n(&terms)?;

        Ok(TowerLoss {
            total,
            cross_entropy,
            logits: inference.logits,
        })
    }

    /// Creates every variable of the network by building it once on a batch of zeros.
    ///
    /// # Arguments
    /// * `store` - The store the variables are created in.
    /// * `image_shape` - The `[height, width, channels]` of the input images.
    ///
    /// # Returns
    /// The amount of trainable scalars.
    pub fn materialize(&self, store: &VariableStore, image_shape: [usize; 3]) -> Result<usize> {
        let [height, width, channels] = image_shape;
        let mut graph = Graph::new();
        let scope = VariableScope::new(store.clone(), ScopeMode::Create);
        let mut ctx = CellContext::new(&mut graph, scope, true);

        let images = ctx.input(ArrayD::zeros(vec![1, height, width, channels]));
        let inference = self.inference(&mut ctx, images)?;

        let params = store.num_params();
        info!(
            variables = store.len(),
            params = params,
            stages = inference.assembly.stages.len();
            "materialized network"
        );

        Ok(params)
    }
}
