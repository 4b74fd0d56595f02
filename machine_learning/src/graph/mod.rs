mod backward;
mod window;

use std::collections::HashMap;

use ndarray::{Array, Array2, Array4, ArrayD, ArrayView2, ArrayView4, Axis, Ix2, Ix4, IxDyn};

pub use backward::Gradients;
pub use window::Window;

use crate::{
    error::{MlErr, Result},
    variables::VarId,
};

/// A handle to a tensor recorded on a `Graph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The operation that produced a node, along with whatever the backward pass needs from the
/// forward pass.
#[derive(Debug)]
enum Op {
    Input,
    Variable(VarId),
    Conv2d {
        x: NodeId,
        w: NodeId,
        win: Window,
        cols: Array2<f32>,
    },
    BiasAdd {
        x: NodeId,
        b: NodeId,
    },
    Relu {
        x: NodeId,
    },
    MaxPool {
        x: NodeId,
        win: Window,
        argmax: Array4<usize>,
    },
    AvgPool {
        x: NodeId,
        win: Window,
    },
    Concat {
        xs: Vec<NodeId>,
        widths: Vec<usize>,
    },
    GlobalAvgPool {
        x: NodeId,
    },
    MatMul {
        x: NodeId,
        w: NodeId,
    },
    SoftmaxCrossEntropy {
        logits: NodeId,
        labels: Vec<usize>,
        probs: Array2<f32>,
    },
    L2Loss {
        x: NodeId,
        scale: f32,
    },
    AddN {
        xs: Vec<NodeId>,
    },
}

#[derive(Debug)]
struct Node {
    op: Op,
    value: ArrayD<f32>,
}

/// A define-by-run tape of tensor operations.
///
/// Every operation computes its value eagerly and appends a node, so a node only ever depends on
/// nodes recorded before it. Values are `f32` tensors, images use the NHWC layout.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    variables: HashMap<VarId, NodeId>,
    losses: Vec<NodeId>,
}

impl Graph {
    /// Creates a new empty `Graph`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the amount of recorded nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, op: Op, value: ArrayD<f32>) -> NodeId {
        let value = if value.is_standard_layout() {
            value
        } else {
            value.as_standard_layout().into_owned()
        };

        self.nodes.push(Node { op, value });
        NodeId(self.nodes.len() - 1)
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or(MlErr::UnknownNode(id.0))
    }

    /// Returns the value of a recorded tensor.
    pub fn value(&self, id: NodeId) -> Result<&ArrayD<f32>> {
        Ok(&self.node(id)?.value)
    }

    /// Returns the shape of a recorded tensor.
    pub fn shape(&self, id: NodeId) -> Result<&[usize]> {
        Ok(self.node(id)?.value.shape())
    }

    /// Returns the single element of a scalar tensor.
    pub fn scalar(&self, id: NodeId) -> Result<f32> {
        let value = self.value(id)?;
        match value.len() {
            1 => Ok(value.iter().copied().sum()),
            got => Err(MlErr::SizeMismatch {
                what: "scalar",
                got,
                expected: 1,
            }),
        }
    }

    fn view4(&self, id: NodeId, op: &'static str) -> Result<ArrayView4<'_, f32>> {
        let value = self.value(id)?;
        value
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|_| MlErr::RankMismatch {
                op,
                got: value.ndim(),
                expected: 4,
            })
    }

    fn view2(&self, id: NodeId, op: &'static str) -> Result<ArrayView2<'_, f32>> {
        let value = self.value(id)?;
        value
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| MlErr::RankMismatch {
                op,
                got: value.ndim(),
                expected: 2,
            })
    }

    /// Records an external tensor, such as a batch of images.
    pub fn input(&mut self, value: ArrayD<f32>) -> NodeId {
        self.push(Op::Input, value)
    }

    /// Records the read of a variable.
    ///
    /// A variable is recorded at most once per graph, later reads return the same node so its
    /// gradient accumulates every use.
    ///
    /// # Arguments
    /// * `var` - The variable's id in its store.
    /// * `value` - The variable's current value, only used on the first read.
    pub fn variable(&mut self, var: VarId, value: impl FnOnce() -> Result<ArrayD<f32>>) -> Result<NodeId> {
        if let Some(&id) = self.variables.get(&var) {
            return Ok(id);
        }

        let id = self.push(Op::Variable(var), value()?);
        self.variables.insert(var, id);
        Ok(id)
    }

    /// Adds a scalar to the graph's loss collection.
    pub fn add_to_losses(&mut self, id: NodeId) {
        self.losses.push(id);
    }

    /// Returns the scalars registered with `add_to_losses`, in registration order.
    pub fn losses(&self) -> &[NodeId] {
        &self.losses
    }

    /// 2D convolution with `SAME` padding.
    ///
    /// # Arguments
    /// * `x` - An NHWC input tensor.
    /// * `w` - A kernel of shape `[kh, kw, in_channels, out_channels]`.
    /// * `stride` - The stride along both spatial axes.
    pub fn conv2d(&mut self, x: NodeId, w: NodeId, stride: usize) -> Result<NodeId> {
        let xv = self.view4(x, "conv2d")?;
        let wv = self.view4(w, "conv2d")?;
        let (n, h, width, c) = xv.dim();
        let (kh, kw, kc, o) = wv.dim();

        if kc != c {
            return Err(MlErr::SizeMismatch {
                what: "conv2d input channels",
                got: c,
                expected: kc,
            });
        }

        let win = Window::same(h, width, kh, kw, stride.max(1));
        let cols = window::im2col(xv, &win);
        let w2 = wv.into_shape_with_order((kh * kw * c, o))?;
        let out = cols
            .dot(&w2)
            .into_shape_with_order((n, win.out_h, win.out_w, o))?
            .into_dyn();

        Ok(self.push(Op::Conv2d { x, w, win, cols }, out))
    }

    /// Adds a bias vector along the last axis.
    pub fn bias_add(&mut self, x: NodeId, b: NodeId) -> Result<NodeId> {
        let xv = self.value(x)?;
        let bv = self.value(b)?;
        let channels = xv.shape().last().copied().unwrap_or_default();

        if bv.ndim() != 1 || bv.len() != channels {
            return Err(MlErr::SizeMismatch {
                what: "bias_add",
                got: bv.len(),
                expected: channels,
            });
        }

        let out = xv + bv;
        Ok(self.push(Op::BiasAdd { x, b }, out))
    }

    pub fn relu(&mut self, x: NodeId) -> Result<NodeId> {
        let out = self.value(x)?.mapv(|v| if v < 0.0 { 0.0 } else { v });
        Ok(self.push(Op::Relu { x }, out))
    }

    /// Max pooling with a square window and `SAME` padding.
    pub fn max_pool(&mut self, x: NodeId, k: usize, stride: usize) -> Result<NodeId> {
        let xv = self.view4(x, "max_pool")?;
        let (_, h, w, _) = xv.dim();

        let win = Window::same(h, w, k, k, stride.max(1));
        let (out, argmax) = window::max_pool(xv, &win);

        Ok(self.push(Op::MaxPool { x, win, argmax }, out.into_dyn()))
    }

    /// Average pooling with a square window and `SAME` padding.
    pub fn avg_pool(&mut self, x: NodeId, k: usize, stride: usize) -> Result<NodeId> {
        let xv = self.view4(x, "avg_pool")?;
        let (_, h, w, _) = xv.dim();

        let win = Window::same(h, w, k, k, stride.max(1));
        let out = window::avg_pool(xv, &win);

        Ok(self.push(Op::AvgPool { x, win }, out.into_dyn()))
    }

    /// Concatenates tensors along the last (channel) axis.
    ///
    /// Every other axis must match.
    pub fn concat(&mut self, xs: &[NodeId]) -> Result<NodeId> {
        let views = xs
            .iter()
            .map(|&x| self.value(x).map(|v| v.view()))
            .collect::<Result<Vec<_>>>()?;

        let Some(first) = views.first() else {
            return Err(MlErr::SizeMismatch {
                what: "concat inputs",
                got: 0,
                expected: 1,
            });
        };

        let axis = Axis(first.ndim().saturating_sub(1));
        let widths = views.iter().map(|v| v.len_of(axis)).collect();
        let out = ndarray::concatenate(axis, &views)?;

        Ok(self.push(
            Op::Concat {
                xs: xs.to_vec(),
                widths,
            },
            out,
        ))
    }

    /// Averages an NHWC tensor over its spatial axes, producing an `[n, c]` matrix.
    pub fn global_avg_pool(&mut self, x: NodeId) -> Result<NodeId> {
        let xv = self.view4(x, "global_avg_pool")?;
        let (n, h, w, c) = xv.dim();
        let area = (h * w).max(1) as f32;

        let out = xv
            .into_shape_with_order((n, h * w, c))?
            .sum_axis(Axis(1))
            .mapv(|v| v / area)
            .into_dyn();

        Ok(self.push(Op::GlobalAvgPool { x }, out))
    }

    /// Matrix product of an `[n, k]` input and a `[k, m]` weight.
    pub fn matmul(&mut self, x: NodeId, w: NodeId) -> Result<NodeId> {
        let xv = self.view2(x, "matmul")?;
        let wv = self.view2(w, "matmul")?;

        if xv.ncols() != wv.nrows() {
            return Err(MlErr::SizeMismatch {
                what: "matmul inner dimension",
                got: xv.ncols(),
                expected: wv.nrows(),
            });
        }

        let out = xv.dot(&wv).into_dyn();
        Ok(self.push(Op::MatMul { x, w }, out))
    }

    /// Mean sparse softmax cross-entropy between `[n, classes]` logits and one label per row.
    pub fn softmax_cross_entropy(&mut self, logits: NodeId, labels: &[usize]) -> Result<NodeId> {
        let lv = self.view2(logits, "softmax_cross_entropy")?;
        let (n, classes) = lv.dim();

        if labels.len() != n {
            return Err(MlErr::SizeMismatch {
                what: "labels",
                got: labels.len(),
                expected: n,
            });
        }

        if let Some(&label) = labels.iter().find(|&&l| l >= classes) {
            return Err(MlErr::InvalidLabel { label, classes });
        }

        // -log softmax(l)[y] = max + ln(sum(exp(l - max))) - l[y]
        let mut probs = lv.to_owned();
        let mut loss = 0.0;
        for (i, mut row) in probs.rows_mut().into_iter().enumerate() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let total = row.sum();
            loss += max + total.ln() - lv[(i, labels[i])];
            row.mapv_inplace(|v| v / total);
        }
        let loss = loss / n.max(1) as f32;

        let op = Op::SoftmaxCrossEntropy {
            logits,
            labels: labels.to_vec(),
            probs,
        };

        Ok(self.push(op, Array::from_elem(IxDyn(&[]), loss)))
    }

    /// `scale * sum(x^2) / 2`, the weight decay penalty of a variable.
    pub fn l2_loss(&mut self, x: NodeId, scale: f32) -> Result<NodeId> {
        let half_sq = self.value(x)?.iter().map(|v| v * v).sum::<f32>() / 2.0;
        let out = Array::from_elem(IxDyn(&[]), scale * half_sq);
        Ok(self.push(Op::L2Loss { x, scale }, out))
    }

    /// Sums tensors of the same shape.
    pub fn add_n(&mut self, xs: &[NodeId]) -> Result<NodeId> {
        let Some((&first, rest)) = xs.split_first() else {
            return Err(MlErr::SizeMismatch {
                what: "add_n inputs",
                got: 0,
                expected: 1,
            });
        };

        let mut out = self.value(first)?.clone();
        for &x in rest {
            let v = self.value(x)?;
            if v.shape() != out.shape() {
                return Err(MlErr::SizeMismatch {
                    what: "add_n operand",
                    got: v.len(),
                    expected: out.len(),
                });
            }
            out += v;
        }

        Ok(self.push(Op::AddN { xs: xs.to_vec() }, out))
    }
}
