mod gradient_descent;
mod moving_average;
mod optimizer;
mod schedule;

pub use gradient_descent::GradientDescent;
pub use moving_average::{ExponentialMovingAverage, LossAverage};
pub use optimizer::{GradientTuple, Optimizer};
pub use schedule::ExponentialDecay;
