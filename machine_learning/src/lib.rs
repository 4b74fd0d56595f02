pub mod arch;
pub mod cells;
pub mod error;
pub mod graph;
pub mod optimization;
pub mod variables;

pub use error::{MlErr, Result};
