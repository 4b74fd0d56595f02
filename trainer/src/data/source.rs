use ndarray::Array4;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use crate::{config::TrainerConfig, error::Result};

/// A batch of NHWC images and their class labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Anything that yields training batches, one at a time.
///
/// Sources are driven from a blocking thread, so `next_batch` may block on I/O or decoding.
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Seeded random images whose brightness depends on their label.
///
/// Used by the binary and the tests in place of a decoded dataset.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    rng: StdRng,
    batch_size: usize,
    shape: [usize; 3],
    classes: usize,
    noise: f32,
}

impl SyntheticSource {
    /// Creates a new `SyntheticSource`.
    ///
    /// # Args
    /// * `batch_size` - The amount of images of each batch.
    /// * `shape` - The `[height, width, channels]` of each image.
    /// * `classes` - The amount of distinct labels.
    /// * `seed` - The seed of the generator, a random one is used if `None`.
    pub fn new(batch_size: usize, shape: [usize; 3], classes: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            rng,
            batch_size,
            shape,
            classes: classes.max(1),
            noise: 0.1,
        }
    }

    /// Creates the source matching a run's batch size, image shape and labels.
    pub fn from_config(config: &TrainerConfig) -> Self {
        Self::new(
            config.batch_size(),
            config.image_shape(),
            config.classes(),
            config.seed(),
        )
    }

    /// Replaces the standard deviation of the per-pixel noise.
    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }
}

impl BatchSource for SyntheticSource {
    fn next_batch(&mut self) -> Result<Batch> {
        let [height, width, channels] = self.shape;
        let classes = self.classes;

        let labels: Vec<usize> = (0..self.batch_size)
            .map(|_| self.rng.random_range(0..classes))
            .collect();

        let rng = &mut self.rng;
        let noise = self.noise;
        let images = Array4::from_shape_fn((labels.len(), height, width, channels), |(n, ..)| {
            let level = labels[n] as f32 / classes as f32;
            let z: f32 = rng.sample(StandardNormal);
            level + noise * z
        });

        Ok(Batch { images, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_have_the_configured_shape() {
        let mut source = SyntheticSource::new(4, [6, 5, 3], 10, Some(1));
        let batch = source.next_batch().unwrap();

        assert_eq!(batch.images.shape(), [4, 6, 5, 3]);
        assert_eq!(batch.len(), 4);
        assert!(batch.labels.iter().all(|&l| l < 10));
    }

    #[test]
    fn seeded_sources_repeat_themselves() {
        let mut a = SyntheticSource::new(2, [2, 2, 1], 3, Some(9));
        let mut b = SyntheticSource::new(2, [2, 2, 1], 3, Some(9));

        assert_eq!(a.next_batch().unwrap(), b.next_batch().unwrap());
    }

    #[test]
    fn noiseless_images_encode_their_label() {
        let mut source = SyntheticSource::new(8, [2, 2, 1], 4, Some(3)).with_noise(0.0);
        let batch = source.next_batch().unwrap();

        for (image, &label) in batch.images.outer_iter().zip(&batch.labels) {
            assert!(image.iter().all(|&v| v == label as f32 / 4.0));
        }
    }
}
