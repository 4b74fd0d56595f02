use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used across the specs module.
pub type Result<T> = std::result::Result<T, SpecErr>;

/// Configuration errors detected while building or deserializing a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecErr {
    /// A descriptor mapping didn't match any of the known cell shapes.
    UnrecognizedCell { keys: Vec<String> },
    /// The `inputs` key of a descriptor held something other than `"all"` or a list of stages.
    InvalidInputSelector(String),
    /// A stage referenced itself or a stage that comes after it.
    ForwardReference { stage: usize, reference: usize },
    /// A filter cell without any filter.
    EmptyFilters { stage: usize },
    /// A filter cell whose outputs can't be split across its filters.
    OutputsTooSmall {
        stage: usize,
        outputs: usize,
        filters: usize,
    },
    /// A second kind widener without stages to concatenate.
    EmptyWidenerInputs { stage: usize },
    /// A numeric parameter outside of its valid domain.
    InvalidParameter { name: &'static str, reason: String },
}

impl Display for SpecErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecErr::UnrecognizedCell { keys } => {
                write!(f, "unrecognized cell descriptor with keys {keys:?}")
            }
            SpecErr::InvalidInputSelector(got) => write!(
                f,
                "invalid inputs selector {got:?}, expected \"all\" or a list of stage indices"
            ),
            SpecErr::ForwardReference { stage, reference } => write!(
                f,
                "stage {stage} references stage {reference}, only earlier stages can be referenced"
            ),
            SpecErr::EmptyFilters { stage } => {
                write!(f, "filter cell at stage {stage} has no filters")
            }
            SpecErr::OutputsTooSmall {
                stage,
                outputs,
                filters,
            } => write!(
                f,
                "filter cell at stage {stage} has {outputs} outputs, not enough for {filters} filters"
            ),
            SpecErr::EmptyWidenerInputs { stage } => {
                write!(f, "widener2 cell at stage {stage} has an empty inputs list")
            }
            SpecErr::InvalidParameter { name, reason } => {
                write!(f, "invalid parameter `{name}`: {reason}")
            }
        }
    }
}

impl Error for SpecErr {}
