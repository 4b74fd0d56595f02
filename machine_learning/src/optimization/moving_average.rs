use crate::variables::VariableStore;

/// Keeps the shadow of every variable as an exponential moving average of its values.
///
/// Early on the effective decay is `min(decay, (1 + step) / (10 + step))`, so the shadows catch
/// up quickly while the variables still move a lot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialMovingAverage {
    decay: f32,
}

impl ExponentialMovingAverage {
    pub fn new(decay: f32) -> Self {
        Self { decay }
    }

    /// Returns the decay used after `step` updates.
    pub fn decay_at(&self, step: u64) -> f32 {
        let step = step as f64;
        let warmup = ((1.0 + step) / (10.0 + step)) as f32;
        self.decay.min(warmup)
    }

    /// Moves every shadow of `store` towards its variable.
    ///
    /// # Arguments
    /// * `store` - The variables.
    /// * `step` - The global step reached by the update that was just applied.
    pub fn apply(&self, store: &VariableStore, step: u64) {
        store.update_shadows(self.decay_at(step));
    }
}

/// An exponential moving average of the training loss.
///
/// The average starts at zero and is divided by `1 - decay^updates`, so it isn't biased towards
/// zero during the first updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossAverage {
    decay: f32,
    biased: f32,
    updates: u64,
}

impl LossAverage {
    pub fn new(decay: f32) -> Self {
        Self::restore(decay, 0.0, 0)
    }

    /// Recreates an average from its persisted state.
    pub fn restore(decay: f32, biased: f32, updates: u64) -> Self {
        Self {
            decay,
            biased,
            updates,
        }
    }

    /// Folds a new loss into the average and returns the updated average.
    pub fn update(&mut self, loss: f32) -> f32 {
        self.biased -= (1.0 - self.decay) * (self.biased - loss);
        self.updates += 1;
        self.value()
    }

    /// Returns the current average, zero if nothing was folded yet.
    pub fn value(&self) -> f32 {
        if self.updates == 0 {
            return 0.0;
        }

        let updates = self.updates.min(i32::MAX as u64) as i32;
        let correction = 1.0 - self.decay.powi(updates);
        if correction > 0.0 {
            self.biased / correction
        } else {
            self.biased
        }
    }

    /// The raw, not debiased, accumulator.
    pub fn biased(&self) -> f32 {
        self.biased
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}
