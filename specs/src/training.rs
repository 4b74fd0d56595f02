use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ArchSpec, ClassificationCellSpec, InitCellSpec, Result, SpecErr};

/// The dataset a task trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Cifar10,
    Imagenet,
}

impl DatasetKind {
    /// Whether a missing data directory can be filled by downloading the dataset.
    pub fn is_downloadable(&self) -> bool {
        matches!(self, DatasetKind::Cifar10)
    }
}

fn default_channels() -> usize {
    3
}

fn default_log_frequency() -> u64 {
    10
}

fn default_save_checkpoint_secs() -> u64 {
    300
}

fn default_max_to_keep() -> usize {
    5
}

/// Run parameters of a training task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametersSpec {
    pub arch_name: String,
    pub batch_size: usize,
    pub image_size: usize,
    #[serde(default = "default_channels")]
    pub image_channels: usize,
    /// The step at which training stops.
    pub steps: u64,
    pub dataset: DatasetKind,
    pub data_dir: PathBuf,
    /// Where checkpoints are written to and restored from.
    pub train_dir: PathBuf,
    /// Device ids, an empty list trains on a single device.
    #[serde(default)]
    pub gpus: Vec<usize>,
    #[serde(default = "default_log_frequency")]
    pub log_frequency: u64,
    #[serde(default = "default_save_checkpoint_secs")]
    pub save_checkpoint_secs: u64,
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Learning-rate schedule and moving average constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSpec {
    pub initial_learning_rate: f32,
    pub decay_factor: f32,
    pub epochs_per_decay: f32,
    pub examples_per_epoch: usize,
    pub loss_average_decay: f32,
    pub moving_average_decay: f32,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            initial_learning_rate: 0.1,
            decay_factor: 0.1,
            epochs_per_decay: 350.0,
            examples_per_epoch: 50_000,
            loss_average_decay: 0.9,
            moving_average_decay: 0.9999,
        }
    }
}

/// The complete, pre-parsed task configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrainingSpec {
    pub arch: ArchSpec,
    pub init_cell: InitCellSpec,
    pub classification_cell: ClassificationCellSpec,
    pub parameters: ParametersSpec,
    #[serde(default)]
    pub schedule: ScheduleSpec,
}

impl TrainingSpec {
    /// Parses a task configuration from its JSON representation.
    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Validates the numeric parameters that the architecture validation doesn't cover.
    pub fn validate(&self) -> Result<()> {
        let p = &self.parameters;

        let checks: [(&'static str, bool, &str); 6] = [
            ("batch_size", p.batch_size > 0, "must be greater than 0"),
            ("image_size", p.image_size > 0, "must be greater than 0"),
            ("image_channels", p.image_channels > 0, "must be greater than 0"),
            ("init_cell.outputs", self.init_cell.outputs > 0, "must be greater than 0"),
            (
                "classification_cell.classes",
                self.classification_cell.classes > 0,
                "must be greater than 0",
            ),
            ("log_frequency", p.log_frequency > 0, "must be greater than 0"),
        ];

        if let Some((name, _, reason)) = checks.into_iter().find(|(_, ok, _)| !ok) {
            return Err(SpecErr::InvalidParameter {
                name,
                reason: reason.to_string(),
            });
        }

        let mut seen = p.gpus.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != p.gpus.len() {
            return Err(SpecErr::InvalidParameter {
                name: "gpus",
                reason: format!("device ids must be distinct, got {:?}", p.gpus),
            });
        }

        let s = &self.schedule;
        if !(s.initial_learning_rate > 0.0) || !(s.epochs_per_decay > 0.0) {
            return Err(SpecErr::InvalidParameter {
                name: "schedule",
                reason: "learning rate and epochs per decay must be positive".to_string(),
            });
        }

        Ok(())
    }
}
