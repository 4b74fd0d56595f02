use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainErr};

/// Name of the file that points at the latest checkpoint of a directory.
pub const STATE_FILE: &str = "checkpoint";

/// The contents of a directory's state file.
///
/// Paths are relative to the directory, newest last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub model_checkpoint_path: String,
    #[serde(default)]
    pub all_model_checkpoint_paths: Vec<String>,
}

impl CheckpointState {
    /// Reads the state file of `dir`.
    ///
    /// # Returns
    /// `None` if there is no state file, or an error if it can't be read or parsed.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(STATE_FILE);

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TrainErr::checkpoint(path, e)),
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| TrainErr::checkpoint(path, e))
    }

    /// Replaces the state file of `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(STATE_FILE);
        let raw = serde_json::to_vec_pretty(self).map_err(|e| TrainErr::checkpoint(&path, e))?;

        write_atomically(&path, &raw)
    }

    /// Returns the step of the latest checkpoint.
    pub fn step(&self) -> Result<u64> {
        parse_step(&self.model_checkpoint_path)
    }
}

/// Recovers the global step out of a checkpoint path: the integer after its last `-`.
pub fn parse_step(path: &str) -> Result<u64> {
    path.rsplit('-')
        .next()
        .filter(|_| path.contains('-'))
        .and_then(|suffix| suffix.parse().ok())
        .ok_or_else(|| TrainErr::checkpoint(path, "path doesn't end in `-<step>`"))
}

/// Writes `bytes` next to `path` and renames the result into place.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    fs::write(&tmp, bytes).map_err(|e| TrainErr::checkpoint(path, e))?;
    fs::rename(&tmp, path).map_err(|e| TrainErr::checkpoint(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_come_from_the_last_dash() {
        assert_eq!(parse_step("model.ckpt-1000").unwrap(), 1000);
        assert_eq!(parse_step("runs/a-b/model.ckpt-7").unwrap(), 7);

        assert!(parse_step("model.ckpt").is_err());
        assert!(parse_step("model.ckpt-").is_err());
        assert!(parse_step("model.ckpt-12a").is_err());
    }

    #[test]
    fn missing_state_files_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(CheckpointState::read(dir.path()).unwrap(), None);
    }

    #[test]
    fn corrupt_state_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), "model_checkpoint_path: 3").unwrap();

        assert!(matches!(
            CheckpointState::read(dir.path()),
            Err(TrainErr::Checkpoint { .. })
        ));
    }

    #[test]
    fn state_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = CheckpointState {
            model_checkpoint_path: "model.ckpt-20".to_string(),
            all_model_checkpoint_paths: vec!["model.ckpt-10".into(), "model.ckpt-20".into()],
        };

        state.write(dir.path()).unwrap();
        let read = CheckpointState::read(dir.path()).unwrap().unwrap();

        assert_eq!(read, state);
        assert_eq!(read.step().unwrap(), 20);
    }
}
