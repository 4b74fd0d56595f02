use serde::{Deserialize, Serialize};

fn default_kernel() -> usize {
    3
}

fn default_stddev() -> f32 {
    5e-2
}

fn default_class_stddev() -> f32 {
    1.0 / 192.0
}

/// Configuration of the cell that turns raw images into the stage `0` tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitCellSpec {
    /// Channels produced by the init cell, the starting channel width.
    pub outputs: usize,
    #[serde(default = "default_kernel")]
    pub kernel: usize,
    #[serde(default = "default_stddev")]
    pub stddev: f32,
    #[serde(default)]
    pub weight_decay: Option<f32>,
}

impl InitCellSpec {
    pub fn new(outputs: usize) -> Self {
        Self {
            outputs,
            kernel: default_kernel(),
            stddev: default_stddev(),
            weight_decay: None,
        }
    }
}

/// Configuration of the cell that maps the last stage into class logits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationCellSpec {
    pub classes: usize,
    #[serde(default = "default_class_stddev")]
    pub stddev: f32,
    #[serde(default)]
    pub weight_decay: Option<f32>,
}

impl ClassificationCellSpec {
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            stddev: default_class_stddev(),
            weight_decay: None,
        }
    }
}
