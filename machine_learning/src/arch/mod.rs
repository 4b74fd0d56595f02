mod assembler;
mod network;
mod stage;

pub use assembler::{Assembler, Assembly};
pub use network::{Inference, Network, TowerLoss};
pub use stage::{SpatialExtent, StageArena, StageOutput};
