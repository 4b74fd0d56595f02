use log::debug;
use specs::FilterSet;

use super::{
    CellContext, EnvelopeCell, EnvelopeOutput,
    layers::{Conv, DEFAULT_STDDEV},
};
use crate::{
    error::{MlErr, Result},
    graph::NodeId,
};

/// The operations an envelope knows how to build, parsed from filter names such as `conv3x3`,
/// `maxpool3x3` or `avgpool5x5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Conv(usize),
    MaxPool(usize),
    AvgPool(usize),
}

impl FilterKind {
    /// Parses a filter name, returns `None` for unknown names or non square windows.
    pub fn parse(name: &str) -> Option<Self> {
        let (ctor, size): (fn(usize) -> Self, _) = if let Some(size) = name.strip_prefix("conv") {
            (FilterKind::Conv, size)
        } else if let Some(size) = name.strip_prefix("maxpool") {
            (FilterKind::MaxPool, size)
        } else if let Some(size) = name.strip_prefix("avgpool") {
            (FilterKind::AvgPool, size)
        } else {
            return None;
        };

        let (h, w) = size.split_once('x')?;
        let (h, w): (usize, usize) = (h.parse().ok()?, w.parse().ok()?);

        (h == w && h > 0).then(|| ctor(h))
    }
}

/// Runs every filter as a parallel branch over the input and concatenates the branches.
///
/// Convolution branches are followed by a ReLU, pooling branches keep the spatial extent and
/// are projected to the branch width with a 1x1 convolution.
#[derive(Debug, Clone, Copy)]
pub struct ConvEnvelope {
    pub stddev: f32,
    pub weight_decay: Option<f32>,
}

impl Default for ConvEnvelope {
    fn default() -> Self {
        Self {
            stddev: DEFAULT_STDDEV,
            weight_decay: None,
        }
    }
}

impl ConvEnvelope {
    fn branch(
        &self,
        ctx: &mut CellContext<'_>,
        input: NodeId,
        name: &str,
        kind: FilterKind,
        outputs: usize,
    ) -> Result<NodeId> {
        let conv = |kernel| {
            Conv::new(kernel, outputs)
                .stddev(self.stddev)
                .weight_decay(self.weight_decay)
        };

        match kind {
            FilterKind::Conv(k) => conv(k).build(ctx, input, name),
            FilterKind::MaxPool(k) => {
                let pooled = ctx.graph().max_pool(input, k, 1)?;
                conv(1).build(ctx, pooled, name)
            }
            FilterKind::AvgPool(k) => {
                let pooled = ctx.graph().avg_pool(input, k, 1)?;
                conv(1).build(ctx, pooled, name)
            }
        }
    }
}

impl EnvelopeCell for ConvEnvelope {
    fn build(
        &self,
        ctx: &mut CellContext<'_>,
        input: NodeId,
        channel_width: usize,
        filters: &FilterSet,
        outputs: usize,
        stage: usize,
    ) -> Result<EnvelopeOutput> {
        debug!(
            stage = stage,
            channel_width = channel_width,
            filters = filters.len(),
            outputs = outputs;
            "building envelope"
        );

        let mut branches = Vec::with_capacity(filters.len());
        let mut end_points = Vec::with_capacity(filters.len());

        for filter in filters.iter() {
            let kind = FilterKind::parse(&filter.name).ok_or_else(|| MlErr::UnknownFilter {
                stage,
                name: filter.name.clone(),
            })?;

            let branch = self.branch(ctx, input, &filter.name, kind, outputs)?;
            end_points.push((ctx.scope().full_name(&filter.name), branch));
            branches.push(branch);
        }

        let tensor = match branches.as_slice() {
            &[single] => single,
            _ => ctx.graph().concat(&branches)?,
        };

        Ok(EnvelopeOutput { tensor, end_points })
    }
}
