pub mod dataset;
pub mod folds;
pub mod io;
pub mod summary;
pub mod water_year;

pub use dataset::{GridDataset, GridError, Variable, VariableAttrs};
