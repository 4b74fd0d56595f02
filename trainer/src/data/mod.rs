mod queue;
mod source;

use std::{fs, path::Path};

use log::info;
use specs::DatasetKind;

use crate::error::{Result, TrainErr};

pub use queue::BatchQueue;
pub use source::{Batch, BatchSource, SyntheticSource};

/// Makes sure the data directory of a dataset exists.
///
/// Datasets that can be downloaded get their directory created, fetching the files is left to
/// whoever provides the `BatchSource`. The others must be present already.
pub fn ensure_data_dir(dataset: DatasetKind, dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    if !dataset.is_downloadable() {
        return Err(TrainErr::Config(format!(
            "data directory {} is missing and {dataset:?} can't be downloaded",
            dir.display()
        )));
    }

    fs::create_dir_all(dir)?;
    info!(dir:? = dir; "created data directory");
    Ok(())
}
