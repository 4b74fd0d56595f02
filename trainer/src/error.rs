use std::{error::Error, fmt, io, path::PathBuf};

use machine_learning::MlErr;
use specs::SpecErr;

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training runtime failures.
#[derive(Debug)]
pub enum TrainErr {
    Io(io::Error),
    Spec(SpecErr),
    Ml(MlErr),
    /// A task configuration that can't be run as is.
    Config(String),
    /// A checkpoint that can't be read or written.
    Checkpoint {
        path: PathBuf,
        reason: String,
    },
    NonFiniteLoss {
        step: u64,
        loss: f32,
    },
    /// A tower task that panicked or was cancelled.
    Tower {
        tower: usize,
        reason: String,
    },
    /// Towers that disagree on the variables they computed gradients for.
    Aggregation(String),
    /// The batch producer stopped while the towers were still waiting for batches.
    QueueClosed,
}

impl TrainErr {
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Checkpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Spec(e) => write!(f, "configuration error: {e}"),
            TrainErr::Ml(e) => write!(f, "model error: {e}"),
            TrainErr::Config(reason) => write!(f, "configuration error: {reason}"),
            TrainErr::Checkpoint { path, reason } => {
                write!(f, "checkpoint error at {}: {reason}", path.display())
            }
            TrainErr::NonFiniteLoss { step, loss } => {
                write!(f, "model diverged with loss = {loss} at step {step}")
            }
            TrainErr::Tower { tower, reason } => write!(f, "tower {tower} failed: {reason}"),
            TrainErr::Aggregation(reason) => write!(f, "gradient aggregation failed: {reason}"),
            TrainErr::QueueClosed => write!(f, "batch queue closed before the run finished"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Io(e) => Some(e),
            TrainErr::Spec(e) => Some(e),
            TrainErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SpecErr> for TrainErr {
    fn from(value: SpecErr) -> Self {
        Self::Spec(value)
    }
}

impl From<MlErr> for TrainErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
