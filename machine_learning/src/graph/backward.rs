use std::collections::BTreeMap;

use ndarray::{Array2, ArrayD, Axis, Ix2, Ix4, NewAxis, s};

use super::{Graph, Node, NodeId, Op, window};
use crate::{
    error::{MlErr, Result},
    variables::VarId,
};

/// The gradient of a loss with respect to every variable read while computing it.
pub type Gradients = BTreeMap<VarId, ArrayD<f32>>;

fn accumulate(grads: &mut [Option<ArrayD<f32>>], id: NodeId, g: ArrayD<f32>) {
    match &mut grads[id.0] {
        Some(acc) => *acc += &g,
        slot => *slot = Some(g),
    }
}

impl Graph {
    /// Computes the reverse-mode gradient of a scalar.
    ///
    /// # Arguments
    /// * `loss` - A scalar node of this graph.
    ///
    /// # Returns
    /// The gradient of every variable that `loss` depends on. Variables that were recorded but
    /// don't contribute to `loss` have no entry.
    pub fn backward(&self, loss: NodeId) -> Result<Gradients> {
        let root = self.node(loss)?;
        if root.value.len() != 1 {
            return Err(MlErr::SizeMismatch {
                what: "backward root",
                got: root.value.len(),
                expected: 1,
            });
        }

        let mut grads: Vec<Option<ArrayD<f32>>> = vec![None; loss.0 + 1];
        grads[loss.0] = Some(ArrayD::ones(root.value.raw_dim()));

        let mut out = Gradients::new();

        for i in (0..=loss.0).rev() {
            let Some(d) = grads[i].take() else {
                continue;
            };

            let node = &self.nodes[i];
            match node.op {
                Op::Input => {}
                Op::Variable(var) => {
                    out.insert(var, d);
                }
                _ => {
                    for (input, g) in self.input_grads(node, d)? {
                        accumulate(&mut grads, input, g);
                    }
                }
            }
        }

        Ok(out)
    }

    /// Returns the gradient of every input of `node` given the gradient of its output.
    fn input_grads(&self, node: &Node, d: ArrayD<f32>) -> Result<Vec<(NodeId, ArrayD<f32>)>> {
        let grads = match &node.op {
            Op::Input | Op::Variable(_) => Vec::new(),
            Op::Conv2d { x, w, win, cols } => {
                let (n, _, _, c) = self.view4(*x, "conv2d")?.dim();
                let wv = self.view4(*w, "conv2d")?;
                let (kh, kw, kc, o) = wv.dim();

                let d2 = d.into_shape_with_order((cols.nrows(), o))?;
                let w2 = wv.into_shape_with_order((kh * kw * kc, o))?;

                let dw = cols
                    .t()
                    .dot(&d2)
                    .into_shape_with_order((kh, kw, kc, o))?
                    .into_dyn();
                let dcols = d2.dot(&w2.t());
                let dx = window::col2im(dcols.view(), win, n, c).into_dyn();

                vec![(*x, dx), (*w, dw)]
            }
            Op::BiasAdd { x, b } => {
                let channels = self.value(*b)?.len();
                let db = d
                    .view()
                    .into_shape_with_order((d.len() / channels.max(1), channels))?
                    .sum_axis(Axis(0))
                    .into_dyn();

                vec![(*x, d), (*b, db)]
            }
            Op::Relu { x } => {
                let mut dx = d;
                dx.zip_mut_with(&node.value, |g, &y| {
                    if y <= 0.0 {
                        *g = 0.0;
                    }
                });

                vec![(*x, dx)]
            }
            Op::MaxPool { x, win, argmax } => {
                let d4 = d.into_dimensionality::<Ix4>()?;
                let dx = window::max_pool_backward(d4.view(), argmax, win);
                vec![(*x, dx.into_dyn())]
            }
            Op::AvgPool { x, win } => {
                let d4 = d.into_dimensionality::<Ix4>()?;
                let dx = window::avg_pool_backward(d4.view(), win);
                vec![(*x, dx.into_dyn())]
            }
            Op::Concat { xs, widths } => {
                let axis = Axis(d.ndim().saturating_sub(1));
                let mut start = 0;

                xs.iter()
                    .zip(widths)
                    .map(|(&x, &width)| {
                        let g = d
                            .slice_axis(axis, (start..start + width).into())
                            .to_owned();
                        start += width;
                        (x, g)
                    })
                    .collect()
            }
            Op::GlobalAvgPool { x } => {
                let (n, h, w, c) = self.view4(*x, "global_avg_pool")?.dim();
                let area = (h * w).max(1) as f32;
                let d2 = d.into_dimensionality::<Ix2>()?;

                let dx = d2
                    .slice(s![.., NewAxis, NewAxis, ..])
                    .broadcast((n, h, w, c))
                    .ok_or(MlErr::SizeMismatch {
                        what: "global_avg_pool gradient",
                        got: d2.len(),
                        expected: n * c,
                    })?
                    .mapv(|g| g / area)
                    .into_dyn();

                vec![(*x, dx)]
            }
            Op::MatMul { x, w } => {
                let xv = self.view2(*x, "matmul")?;
                let wv = self.view2(*w, "matmul")?;
                let d2 = d.into_dimensionality::<Ix2>()?;

                let dx = d2.dot(&wv.t()).into_dyn();
                let dw = xv.t().dot(&d2).into_dyn();

                vec![(*x, dx), (*w, dw)]
            }
            Op::SoftmaxCrossEntropy {
                logits,
                labels,
                probs,
            } => {
                let scale = d.iter().copied().sum::<f32>() / labels.len().max(1) as f32;
                let mut dl: Array2<f32> = probs.clone();

                for (i, &label) in labels.iter().enumerate() {
                    dl[(i, label)] -= 1.0;
                }
                dl.mapv_inplace(|g| g * scale);

                vec![(*logits, dl.into_dyn())]
            }
            Op::L2Loss { x, scale } => {
                let g = d.iter().copied().sum::<f32>() * scale;
                vec![(*x, self.value(*x)?.mapv(|v| v * g))]
            }
            Op::AddN { xs } => xs.iter().map(|&x| (x, d.clone())).collect(),
        };

        Ok(grads)
    }
}
