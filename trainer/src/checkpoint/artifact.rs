use std::{collections::HashMap, fs, path::Path};

use ndarray::ArrayD;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};

use super::state::write_atomically;
use crate::error::{Result, TrainErr};

const GLOBAL_STEP: &str = "global_step";
const LOSS_AVERAGE: &str = "loss_average";
const LOSS_AVERAGE_UPDATES: &str = "loss_average_updates";

/// Everything a checkpoint holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub step: u64,
    /// Variables and their shadows, by checkpoint name.
    pub tensors: Vec<(String, ArrayD<f32>)>,
    /// The raw accumulator of the loss average and its amount of updates.
    pub loss_average: Option<(f32, u64)>,
}

impl Artifact {
    /// Serializes the artifact into a safetensors file at `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut buffers: Vec<(String, Vec<usize>, Vec<f32>)> = self
            .tensors
            .iter()
            .map(|(name, value)| (name.clone(), value.shape().to_vec(), value.iter().copied().collect()))
            .collect();

        let mut metadata = HashMap::from([(GLOBAL_STEP.to_string(), self.step.to_string())]);
        if let Some((biased, updates)) = self.loss_average {
            buffers.push((LOSS_AVERAGE.to_string(), vec![1], vec![biased]));
            metadata.insert(LOSS_AVERAGE_UPDATES.to_string(), updates.to_string());
        }

        let views = buffers
            .iter()
            .map(|(name, shape, data)| {
                TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(data))
                    .map(|view| (name.as_str(), view))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TrainErr::checkpoint(path, e))?;

        let bytes =
            safetensors::tensor::serialize(views, &Some(metadata)).map_err(|e| TrainErr::checkpoint(path, e))?;

        write_atomically(path, &bytes)
    }

    /// Reads the safetensors file at `path`.
    ///
    /// The step is the one recorded in the file, callers decide how to reconcile it with the
    /// step in the path.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| TrainErr::checkpoint(path, e))?;

        let (_, metadata) =
            SafeTensors::read_metadata(&bytes).map_err(|e| TrainErr::checkpoint(path, e))?;
        let metadata = metadata.metadata().clone().unwrap_or_default();

        let step = metadata
            .get(GLOBAL_STEP)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TrainErr::checkpoint(path, "missing global step"))?;

        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| TrainErr::checkpoint(path, e))?;

        let mut loss_biased = None;
        let mut entries = Vec::with_capacity(tensors.len());
        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(TrainErr::checkpoint(
                    path,
                    format!("tensor {name} is {:?}, expected F32", view.dtype()),
                ));
            }

            let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
            let value = ArrayD::from_shape_vec(view.shape().to_vec(), data)
                .map_err(|e| TrainErr::checkpoint(path, format!("tensor {name}: {e}")))?;

            if name == LOSS_AVERAGE {
                loss_biased = value.first().copied();
            } else {
                entries.push((name, value));
            }
        }

        let updates = metadata.get(LOSS_AVERAGE_UPDATES).and_then(|s| s.parse().ok());
        let loss_average = loss_biased.zip(updates);

        Ok(Self {
            step,
            tensors: entries,
            loss_average,
        })
    }
}
