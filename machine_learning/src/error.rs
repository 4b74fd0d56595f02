use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;
use rand_distr::NormalError;

use crate::arch::SpatialExtent;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    RankMismatch {
        op: &'static str,
        got: usize,
        expected: usize,
    },
    Shape(ShapeError),
    UnknownNode(usize),
    Topology {
        stage: usize,
        reference: usize,
        reference_extent: SpatialExtent,
        target_extent: SpatialExtent,
    },
    UnknownStage {
        stage: usize,
        reference: usize,
    },
    UnknownFilter {
        stage: usize,
        name: String,
    },
    VariableShape {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    MissingVariable(String),
    InvalidLabel {
        label: usize,
        classes: usize,
    },
    Init(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::RankMismatch { op, got, expected } => write!(
                f,
                "The {op} operation expects tensors of rank {expected}, got rank {got}"
            ),
            MlErr::Shape(e) => write!(f, "Invalid tensor shape: {e}"),
            MlErr::UnknownNode(id) => write!(f, "Node {id} doesn't belong to this graph"),
            MlErr::Topology {
                stage,
                reference,
                reference_extent,
                target_extent,
            } => write!(
                f,
                "Stage {stage} can't use stage {reference} as input: its spatial extent \
                 {reference_extent} can't be halved down to {target_extent}"
            ),
            MlErr::UnknownStage { stage, reference } => write!(
                f,
                "Stage {stage} references stage {reference} which hasn't been built"
            ),
            MlErr::UnknownFilter { stage, name } => {
                write!(f, "Stage {stage} uses the unknown filter `{name}`")
            }
            MlErr::VariableShape {
                name,
                got,
                expected,
            } => write!(
                f,
                "Variable `{name}` was requested with shape {got:?} but it exists with shape {expected:?}"
            ),
            MlErr::MissingVariable(name) => {
                write!(f, "Variable `{name}` doesn't exist and the scope is reusing")
            }
            MlErr::InvalidLabel { label, classes } => {
                write!(f, "Label {label} is out of range for {classes} classes")
            }
            MlErr::Init(msg) => write!(f, "Failed to initialize a variable: {msg}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<NormalError> for MlErr {
    fn from(value: NormalError) -> Self {
        Self::Init(value.to_string())
    }
}
