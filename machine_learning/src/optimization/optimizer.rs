use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};

use crate::variables::VarId;

/// A variable paired with its gradient, `None` when the variable didn't take part in the loss.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientTuple {
    pub grad: Option<ArrayD<f32>>,
    pub var: VarId,
}

/// An update rule applied to every variable with a gradient.
///
/// A single optimizer is shared by all the variables of a step and used from several threads.
pub trait Optimizer: Sync {
    fn update_params(&self, params: ArrayViewMutD<f32>, grad: ArrayViewD<f32>);
}
