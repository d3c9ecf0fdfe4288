pub mod distribution;
pub mod engine;
pub mod probability;
pub mod rolling;
pub mod standardize;

pub use engine::{IndexConfig, IndexError, compute_indices};
