use ndarray::{ArrayD, IxDyn};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::Result;

/// A zero-mean normal distribution whose samples farther than two standard deviations from the
/// mean are drawn again.
#[derive(Debug, Clone, Copy)]
pub struct TruncatedNormal {
    normal: Normal<f32>,
    bound: f32,
}

impl TruncatedNormal {
    /// Creates a new `TruncatedNormal` distribution.
    ///
    /// # Returns
    /// An error if `stddev` is not finite.
    pub fn new(stddev: f32) -> Result<Self> {
        Ok(Self {
            normal: Normal::new(0.0, stddev)?,
            bound: 2.0 * stddev.abs(),
        })
    }
}

impl Distribution<f32> for TruncatedNormal {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        loop {
            let x = self.normal.sample(rng);
            if x.abs() <= self.bound {
                return x;
            }
        }
    }
}

/// How a variable gets its first value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Zeros,
    Constant(f32),
    TruncatedNormal { stddev: f32 },
}

impl Initializer {
    /// Generates an initial value.
    ///
    /// # Arguments
    /// * `shape` - The variable's shape.
    /// * `rng` - The random number generator to sample from.
    pub fn generate<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<ArrayD<f32>> {
        let value = match *self {
            Initializer::Zeros => ArrayD::zeros(IxDyn(shape)),
            Initializer::Constant(c) => ArrayD::from_elem(IxDyn(shape), c),
            Initializer::TruncatedNormal { stddev } => {
                ArrayD::random_using(IxDyn(shape), TruncatedNormal::new(stddev)?, rng)
            }
        };

        Ok(value)
    }
}
