use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use specs::{DatasetKind, ScheduleSpec, TrainingSpec};

use crate::error::{Result, TrainErr};

/// The device a tower runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Single device mode.
    Default,
    Gpu(usize),
}

/// Immutable execution bounds for a training run.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    devices: Vec<Device>,
    batch_size: NonZeroUsize,
    image_shape: [usize; 3],
    classes: NonZeroUsize,
    max_steps: u64,
    log_frequency: NonZeroU64,
    save_interval: Duration,
    max_to_keep: NonZeroUsize,
    dataset: DatasetKind,
    data_dir: PathBuf,
    train_dir: PathBuf,
    schedule: ScheduleSpec,
    seed: Option<u64>,
}

fn non_zero(name: &str, value: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value).ok_or_else(|| TrainErr::Config(format!("{name} must be positive")))
}

impl TrainerConfig {
    /// Creates a new trainer configuration out of a task configuration.
    ///
    /// # Args
    /// * `spec` - The task configuration.
    ///
    /// # Returns
    /// A `TrainerConfig` instance or an error if `spec` holds invalid parameters.
    pub fn from_spec(spec: &TrainingSpec) -> Result<Self> {
        spec.validate()?;
        let p = &spec.parameters;

        let devices = if p.gpus.is_empty() {
            vec![Device::Default]
        } else {
            p.gpus.iter().copied().map(Device::Gpu).collect()
        };

        let log_frequency = NonZeroU64::new(p.log_frequency)
            .ok_or_else(|| TrainErr::Config("log_frequency must be positive".to_string()))?;

        Ok(Self {
            devices,
            batch_size: non_zero("batch_size", p.batch_size)?,
            image_shape: [p.image_size, p.image_size, p.image_channels],
            classes: non_zero("classes", spec.classification_cell.classes)?,
            max_steps: p.steps,
            log_frequency,
            save_interval: Duration::from_secs(p.save_checkpoint_secs),
            max_to_keep: non_zero("max_to_keep", p.max_to_keep)?,
            dataset: p.dataset,
            data_dir: p.data_dir.clone(),
            train_dir: p.train_dir.clone(),
            schedule: spec.schedule,
            seed: p.seed,
        })
    }

    /// Returns the device of every tower, in tower order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn towers(&self) -> usize {
        self.devices.len()
    }

    /// Returns the capacity of the batch queue shared by the towers.
    pub fn queue_capacity(&self) -> usize {
        2 * self.towers()
    }

    /// Returns the amount of examples of each tower's batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    /// Returns the `[height, width, channels]` of the input images.
    pub fn image_shape(&self) -> [usize; 3] {
        self.image_shape
    }

    pub fn classes(&self) -> usize {
        self.classes.get()
    }

    /// Returns the step at which training stops.
    pub fn max_steps(&self) -> u64 {
        self.max_steps
    }

    pub fn log_frequency(&self) -> u64 {
        self.log_frequency.get()
    }

    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    pub fn max_to_keep(&self) -> usize {
        self.max_to_keep.get()
    }

    pub fn dataset(&self) -> DatasetKind {
        self.dataset
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn train_dir(&self) -> &Path {
        &self.train_dir
    }

    pub fn schedule(&self) -> &ScheduleSpec {
        &self.schedule
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Overrides the interval between two time based checkpoints.
    pub fn with_save_interval(mut self, save_interval: Duration) -> Self {
        self.save_interval = save_interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn spec(gpus: &[usize]) -> TrainingSpec {
        serde_json::from_value(json!({
            "arch": [{"filters": {"conv3x3": {}}, "outputs": 8}],
            "init_cell": {"outputs": 4},
            "classification_cell": {"classes": 10},
            "parameters": {
                "arch_name": "tiny",
                "batch_size": 32,
                "image_size": 16,
                "steps": 100,
                "dataset": "cifar10",
                "data_dir": "data",
                "train_dir": "train",
                "gpus": gpus
            }
        }))
        .unwrap()
    }

    #[test]
    fn no_gpus_means_a_single_default_tower() {
        let config = TrainerConfig::from_spec(&spec(&[])).unwrap();

        assert_eq!(config.devices(), [Device::Default]);
        assert_eq!(config.queue_capacity(), 2);
        assert_eq!(config.image_shape(), [16, 16, 3]);
        assert_eq!(config.save_interval(), Duration::from_secs(300));
    }

    #[test]
    fn one_tower_per_gpu() {
        let config = TrainerConfig::from_spec(&spec(&[2, 0])).unwrap();

        assert_eq!(config.devices(), [Device::Gpu(2), Device::Gpu(0)]);
        assert_eq!(config.queue_capacity(), 4);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let mut spec = spec(&[]);
        spec.parameters.max_to_keep = 0;
        assert!(matches!(TrainerConfig::from_spec(&spec), Err(TrainErr::Config(_))));

        spec.parameters.batch_size = 0;
        assert!(matches!(TrainerConfig::from_spec(&spec), Err(TrainErr::Spec(_))));
    }
}
