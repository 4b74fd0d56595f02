mod classification;
mod context;
mod envelope;
mod init;
pub mod layers;

pub use classification::LinearClassification;
pub use context::CellContext;
pub use envelope::{ConvEnvelope, FilterKind};
pub use init::ConvInit;

use specs::{ClassificationCellSpec, FilterSet, InitCellSpec};

use crate::{error::Result, graph::NodeId};

/// Turns a batch of raw images into the stage `0` tensor.
pub trait InitCell: Send + Sync {
    /// # Arguments
    /// * `ctx` - The cell context of the tower being built.
    /// * `images` - An NHWC batch of images.
    /// * `spec` - The init cell's configuration.
    fn build(&self, ctx: &mut CellContext<'_>, images: NodeId, spec: &InitCellSpec)
    -> Result<NodeId>;
}

/// The tensor produced by an envelope along with its diagnostic end points.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeOutput {
    pub tensor: NodeId,
    pub end_points: Vec<(String, NodeId)>,
}

/// Builds the body of a filter stage.
pub trait EnvelopeCell: Send + Sync {
    /// # Arguments
    /// * `ctx` - The cell context, its scope is already nested under the stage's name.
    /// * `input` - The stage input, with the current spatial extent.
    /// * `channel_width` - The network's current channel width.
    /// * `filters` - The filters of the stage, in declaration order.
    /// * `outputs` - The output channels of each filter branch.
    /// * `stage` - The stage number.
    fn build(
        &self,
        ctx: &mut CellContext<'_>,
        input: NodeId,
        channel_width: usize,
        filters: &FilterSet,
        outputs: usize,
        stage: usize,
    ) -> Result<EnvelopeOutput>;
}

/// Maps the last stage into class logits.
pub trait ClassificationCell: Send + Sync {
    /// # Arguments
    /// * `ctx` - The cell context of the tower being built.
    /// * `input` - The network's last stage.
    /// * `spec` - The classification cell's configuration.
    /// * `stage` - The index given to this cell, the amount of end points of the network.
    ///
    /// # Returns
    /// An `[n, classes]` tensor of logits.
    fn build(
        &self,
        ctx: &mut CellContext<'_>,
        input: NodeId,
        spec: &ClassificationCellSpec,
        stage: usize,
    ) -> Result<NodeId>;
}
