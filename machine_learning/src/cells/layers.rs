use super::CellContext;
use crate::{
    error::{MlErr, Result},
    graph::NodeId,
    variables::Initializer,
};

/// The standard deviation of the weights created when a cell spec doesn't provide one.
pub const DEFAULT_STDDEV: f32 = 5e-2;

/// The hyperparameters of a convolution layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conv {
    pub kernel: usize,
    pub outputs: usize,
    pub stride: usize,
    pub stddev: f32,
    pub weight_decay: Option<f32>,
    pub relu: bool,
}

impl Conv {
    /// A `kernel x kernel` stride 1 convolution followed by a ReLU.
    pub fn new(kernel: usize, outputs: usize) -> Self {
        Self {
            kernel,
            outputs,
            stride: 1,
            stddev: DEFAULT_STDDEV,
            weight_decay: None,
            relu: true,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn stddev(mut self, stddev: f32) -> Self {
        self.stddev = stddev;
        self
    }

    pub fn weight_decay(mut self, weight_decay: Option<f32>) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Adds the layer under the current scope's `name`.
    ///
    /// # Arguments
    /// * `ctx` - The cell context.
    /// * `x` - An NHWC tensor.
    /// * `name` - The layer's scope, its variables are `<name>/weights` and `<name>/biases`.
    ///
    /// # Returns
    /// The layer's output.
    pub fn build(&self, ctx: &mut CellContext<'_>, x: NodeId, name: &str) -> Result<NodeId> {
        let channels = channels(ctx, x)?;

        ctx.nested(name, |ctx| {
            let w = ctx.variable(
                "weights",
                &[self.kernel, self.kernel, channels, self.outputs],
                Initializer::TruncatedNormal {
                    stddev: self.stddev,
                },
                self.weight_decay,
            )?;
            let b = ctx.variable("biases", &[self.outputs], Initializer::Zeros, None)?;

            let graph = ctx.graph();
            let y = graph.conv2d(x, w, self.stride)?;
            let y = graph.bias_add(y, b)?;

            if self.relu { graph.relu(y) } else { Ok(y) }
        })
    }
}

/// A fully connected layer without activation.
///
/// # Arguments
/// * `ctx` - The cell context.
/// * `x` - An `[n, k]` tensor.
/// * `name` - The layer's scope.
/// * `outputs` - The amount of output units.
/// * `stddev` - The standard deviation of the initial weights.
/// * `weight_decay` - The L2 penalty factor of the weights, if any.
pub fn dense(
    ctx: &mut CellContext<'_>,
    x: NodeId,
    name: &str,
    outputs: usize,
    stddev: f32,
    weight_decay: Option<f32>,
) -> Result<NodeId> {
    let shape = ctx.shape(x)?;
    let &[_, inputs] = shape.as_slice() else {
        return Err(MlErr::RankMismatch {
            op: "dense",
            got: shape.len(),
            expected: 2,
        });
    };

    ctx.nested(name, |ctx| {
        let w = ctx.variable(
            "weights",
            &[inputs, outputs],
            Initializer::TruncatedNormal { stddev },
            weight_decay,
        )?;
        let b = ctx.variable("biases", &[outputs], Initializer::Constant(0.0), None)?;

        let graph = ctx.graph();
        let y = graph.matmul(x, w)?;
        graph.bias_add(y, b)
    })
}

/// Returns the channel count of an NHWC tensor.
pub fn channels(ctx: &CellContext<'_>, x: NodeId) -> Result<usize> {
    let shape = ctx.shape(x)?;
    match shape.as_slice() {
        &[_, _, _, c] => Ok(c),
        other => Err(MlErr::RankMismatch {
            op: "channels",
            got: other.len(),
            expected: 4,
        }),
    }
}
