use specs::ScheduleSpec;

/// A learning rate that decays by a constant factor every `decay_steps` steps, in a staircase.
///
/// `lr(step) = initial * factor ^ floor(step / decay_steps)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    initial: f32,
    factor: f32,
    decay_steps: u64,
}

impl ExponentialDecay {
    /// Creates a new `ExponentialDecay`.
    ///
    /// # Arguments
    /// * `initial` - The learning rate at step `0`.
    /// * `factor` - The factor applied on every decay.
    /// * `decay_steps` - The amount of steps between two decays, zero is treated as one.
    pub fn new(initial: f32, factor: f32, decay_steps: u64) -> Self {
        Self {
            initial,
            factor,
            decay_steps: decay_steps.max(1),
        }
    }

    /// Creates the schedule that decays every `epochs_per_decay` epochs of `batch_size` batches.
    pub fn from_spec(spec: &ScheduleSpec, batch_size: usize) -> Self {
        let batches_per_epoch = spec.examples_per_epoch as f64 / batch_size.max(1) as f64;
        let decay_steps = (batches_per_epoch * spec.epochs_per_decay as f64) as u64;

        Self::new(spec.initial_learning_rate, spec.decay_factor, decay_steps)
    }

    pub fn decay_steps(&self) -> u64 {
        self.decay_steps
    }

    /// Returns the learning rate to use at `step`.
    pub fn learning_rate(&self, step: u64) -> f32 {
        let decays = (step / self.decay_steps).min(i32::MAX as u64) as i32;
        self.initial * self.factor.powi(decays)
    }
}
