//! Step counted checkpoints of the variable store.
//!
//! A checkpoint directory holds one safetensors artifact per saved step, named
//! `model.ckpt-<step>`, and a JSON state file listing them. Resuming parses the step out of the
//! newest artifact's name.

mod artifact;
mod state;

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{info, warn};
use machine_learning::{optimization::LossAverage, variables::VariableStore};

use crate::error::{Result, TrainErr};

pub use artifact::Artifact;
pub use state::{CheckpointState, STATE_FILE, parse_step};

/// Prefix of every artifact name.
pub const CHECKPOINT_PREFIX: &str = "model.ckpt";

/// What was recovered from the latest checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub step: u64,
    pub path: PathBuf,
    pub loss_average: Option<LossAverage>,
}

/// Saves and restores the checkpoints of one directory.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    max_to_keep: usize,
}

impl Checkpointer {
    /// Creates a new `Checkpointer`.
    ///
    /// # Args
    /// * `dir` - The checkpoint directory, created on the first save.
    /// * `max_to_keep` - The amount of artifacts kept around, older ones are deleted.
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Self {
        Self {
            dir: dir.into(),
            max_to_keep: max_to_keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the artifact saved at `step`.
    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{CHECKPOINT_PREFIX}-{step}"))
    }

    /// Returns the state of the directory, if any checkpoint was saved in it.
    pub fn state(&self) -> Result<Option<CheckpointState>> {
        CheckpointState::read(&self.dir)
    }

    /// Returns the path of the newest artifact and its step.
    pub fn latest(&self) -> Result<Option<(PathBuf, u64)>> {
        let Some(state) = self.state()? else {
            return Ok(None);
        };

        let step = state.step()?;
        Ok(Some((self.dir.join(&state.model_checkpoint_path), step)))
    }

    /// Restores the newest checkpoint into `store`.
    ///
    /// Every variable of `store` must be present in the artifact with the same shape.
    ///
    /// # Args
    /// * `store` - The materialized variables.
    /// * `loss_decay` - The decay of the restored loss average.
    ///
    /// # Returns
    /// `None` if the directory holds no checkpoint.
    pub fn restore(&self, store: &VariableStore, loss_decay: f32) -> Result<Option<Restored>> {
        let Some((path, step)) = self.latest()? else {
            return Ok(None);
        };

        let artifact = Artifact::read(&path)?;
        if artifact.step != step {
            warn!(
                path:? = path,
                recorded = artifact.step,
                parsed = step;
                "checkpoint step disagrees with its name, resuming from the name"
            );
        }

        store
            .restore(artifact.tensors)
            .map_err(|e| TrainErr::checkpoint(&path, e))?;

        let loss_average = artifact
            .loss_average
            .map(|(biased, updates)| LossAverage::restore(loss_decay, biased, updates));

        info!(path:? = path, step = step; "restored checkpoint");

        Ok(Some(Restored {
            step,
            path,
            loss_average,
        }))
    }

    /// Saves `store` and the loss average as the checkpoint of `step`.
    ///
    /// # Returns
    /// The path of the new artifact.
    pub fn save(
        &self,
        store: &VariableStore,
        loss_average: &LossAverage,
        step: u64,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| TrainErr::checkpoint(&self.dir, e))?;

        let path = self.path_for(step);
        let artifact = Artifact {
            step,
            tensors: store.snapshot(),
            loss_average: Some((loss_average.biased(), loss_average.updates())),
        };
        artifact.write(&path)?;

        let name = format!("{CHECKPOINT_PREFIX}-{step}");
        let mut all = self
            .state()?
            .map(|s| s.all_model_checkpoint_paths)
            .unwrap_or_default();
        all.retain(|p| *p != name);
        all.push(name.clone());

        let stale = all.len().saturating_sub(self.max_to_keep);
        for old in all.drain(..stale) {
            if let Err(e) = fs::remove_file(self.dir.join(&old)) {
                warn!(path:? = old; "couldn't delete old checkpoint: {e}");
            }
        }

        CheckpointState {
            model_checkpoint_path: name,
            all_model_checkpoint_paths: all,
        }
        .write(&self.dir)?;

        info!(path:? = path, step = step; "saved checkpoint");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::variables::Initializer;

    use super::*;

    fn store() -> VariableStore {
        let store = VariableStore::new(Some(0));
        store
            .get_or_create("w", &[2, 2], Initializer::TruncatedNormal { stddev: 1.0 }, true)
            .unwrap();
        store
    }

    #[test]
    fn empty_directories_have_nothing_to_restore() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path().join("train"), 5);

        assert_eq!(ckpt.restore(&store(), 0.9).unwrap(), None);
    }

    #[test]
    fn saved_checkpoints_restore_values_and_loss_average() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), 5);

        let saved = store();
        let mut avg = LossAverage::new(0.9);
        avg.update(2.5);
        let path = ckpt.save(&saved, &avg, 1000).unwrap();
        assert!(path.ends_with("model.ckpt-1000"));

        let fresh = VariableStore::new(Some(1));
        fresh
            .get_or_create("w", &[2, 2], Initializer::Zeros, true)
            .unwrap();
        let restored = ckpt.restore(&fresh, 0.9).unwrap().unwrap();

        assert_eq!(restored.step, 1000);
        assert_eq!(restored.loss_average, Some(avg));
        assert_eq!(fresh.snapshot(), saved.snapshot());
    }

    #[test]
    fn only_the_newest_artifacts_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), 2);
        let store = store();
        let avg = LossAverage::new(0.9);

        for step in [10, 20, 30] {
            ckpt.save(&store, &avg, step).unwrap();
        }

        let state = ckpt.state().unwrap().unwrap();
        assert_eq!(state.model_checkpoint_path, "model.ckpt-30");
        assert_eq!(state.all_model_checkpoint_paths, ["model.ckpt-20", "model.ckpt-30"]);
        assert!(!ckpt.path_for(10).exists());
        assert!(ckpt.path_for(20).exists());
    }

    #[test]
    fn checkpoints_missing_variables_fail_to_restore() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), 5);
        ckpt.save(&store(), &LossAverage::new(0.9), 3).unwrap();

        let bigger = store();
        bigger
            .get_or_create("b", &[2], Initializer::Zeros, true)
            .unwrap();

        assert!(matches!(
            ckpt.restore(&bigger, 0.9),
            Err(TrainErr::Checkpoint { .. })
        ));
    }
}
