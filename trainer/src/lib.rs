//! Synchronous, multi-tower training of an assembled network with checkpoint resumption.

pub mod aggregation;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod towers;

pub use config::{Device, TrainerConfig};
pub use driver::{Driver, TrainingSummary};
pub use error::{Result, TrainErr};
