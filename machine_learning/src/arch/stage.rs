use std::fmt::{self, Display};

use crate::{
    cells::CellContext,
    error::{MlErr, Result},
    graph::NodeId,
};

/// The height and width of an NHWC tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpatialExtent {
    pub height: usize,
    pub width: usize,
}

impl SpatialExtent {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// The extent after a stride 2 pooling with `SAME` padding.
    pub fn halve(&self) -> Self {
        Self::new(self.height.div_ceil(2), self.width.div_ceil(2))
    }

    /// Returns how many halvings turn this extent into `target`.
    ///
    /// # Returns
    /// `None` if `target` can't be reached, either because it's larger along some axis or because
    /// halving would skip past it.
    pub fn halvings_to(&self, target: SpatialExtent) -> Option<usize> {
        let mut current = *self;
        let mut halvings = 0;

        while current != target {
            if current.height <= target.height && current.width <= target.width {
                return None;
            }

            current = current.halve();
            halvings += 1;

            if current.height < target.height || current.width < target.width {
                return None;
            }
        }

        Some(halvings)
    }
}

impl Display for SpatialExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// The tensor a stage produced along with its geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutput {
    pub tensor: NodeId,
    pub extent: SpatialExtent,
    pub channels: usize,
}

impl StageOutput {
    /// Describes an NHWC tensor of the context's graph.
    pub fn of(ctx: &CellContext<'_>, tensor: NodeId) -> Result<Self> {
        let shape = ctx.shape(tensor)?;
        let &[_, height, width, channels] = shape.as_slice() else {
            return Err(MlErr::RankMismatch {
                op: "stage output",
                got: shape.len(),
                expected: 4,
            });
        };

        Ok(Self {
            tensor,
            extent: SpatialExtent::new(height, width),
            channels,
        })
    }
}

/// The append-only record of every stage output, indexed by stage number.
///
/// Stage `0` is the init cell's output, so after `n` descriptors the arena holds `n + 1` stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageArena {
    stages: Vec<StageOutput>,
}

impl StageArena {
    /// Creates a new `StageArena` holding the init cell's output.
    pub fn new(init: StageOutput) -> Self {
        Self { stages: vec![init] }
    }

    pub fn push(&mut self, stage: StageOutput) {
        self.stages.push(stage);
    }

    pub fn get(&self, stage: usize) -> Option<&StageOutput> {
        self.stages.get(stage)
    }

    /// The most recent stage, never missing since the arena starts with the init output.
    pub fn last(&self) -> &StageOutput {
        &self.stages[self.stages.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageOutput> {
        self.stages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halving_rounds_up() {
        assert_eq!(SpatialExtent::new(5, 4).halve(), SpatialExtent::new(3, 2));
        assert_eq!(SpatialExtent::new(1, 1).halve(), SpatialExtent::new(1, 1));
    }

    #[test]
    fn halvings_to_reachable_extents() {
        let big = SpatialExtent::new(32, 32);

        assert_eq!(big.halvings_to(big), Some(0));
        assert_eq!(big.halvings_to(SpatialExtent::new(16, 16)), Some(1));
        assert_eq!(big.halvings_to(SpatialExtent::new(4, 4)), Some(3));
        assert_eq!(
            SpatialExtent::new(25, 25).halvings_to(SpatialExtent::new(7, 7)),
            Some(2)
        );
    }

    #[test]
    fn unreachable_extents() {
        let small = SpatialExtent::new(8, 8);

        assert_eq!(small.halvings_to(SpatialExtent::new(16, 16)), None);
        assert_eq!(small.halvings_to(SpatialExtent::new(3, 3)), None);
        assert_eq!(
            SpatialExtent::new(1, 1).halvings_to(SpatialExtent::new(1, 2)),
            None
        );
    }
}
