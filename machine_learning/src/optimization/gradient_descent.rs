use ndarray::{ArrayViewD, ArrayViewMutD, Zip};

use super::Optimizer;

/// Gradient descent optimization algorithm.
#[derive(Debug, Clone, Copy)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken on `update_params`.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl Optimizer for GradientDescent {
    /// Makes a step in the opposite direction of the gradient, with a length of `learning_rate`.
    ///
    /// # Arguments
    /// * `params` - The parameters that are going to be modified.
    /// * `grad` - The gradient used for taking the step.
    fn update_params(&self, params: ArrayViewMutD<f32>, grad: ArrayViewD<f32>) {
        let lr = self.learning_rate;

        Zip::from(params)
            .and(&grad)
            .for_each(|w, &g| *w -= lr * g);
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;

    #[test]
    fn steps_against_the_gradient() {
        let mut params = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();
        let grad = arr2(&[[1.0, -1.0], [0.0, 2.0]]).into_dyn();

        GradientDescent::new(0.1).update_params(params.view_mut(), grad.view());

        let expected = arr2(&[[0.9, 2.1], [3.0, 3.8]]).into_dyn();
        assert!(params.iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-6));
    }
}
