//! Declarative configuration consumed by the graph assembler and the training driver.
//!
//! Everything in here is plain data: it can be deserialized from the JSON task
//! configuration and is validated on construction, so downstream crates never
//! have to probe keys or re-check stage references.

mod arch;
mod cells;
mod error;
mod training;

pub use arch::{ArchSpec, CellDescriptor, Filter, FilterSet, InputSelection};
pub use cells::{ClassificationCellSpec, InitCellSpec};
pub use error::{Result, SpecErr};
pub use training::{DatasetKind, ParametersSpec, ScheduleSpec, TrainingSpec};
