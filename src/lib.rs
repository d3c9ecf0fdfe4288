//! Standardized climate indices and spatially cross-validated tree-mortality
//! forecasting.
//!
//! The crate is organised the same way the pipeline runs:
//! - [`grid`]: gridded datasets, their tab-separated stores, water-year aggregation
//!   and spatial fold assignment.
//! - [`indices`]: rolling precipitation aggregates and standardized indices
//!   (SPI/SPEI) fitted independently for every grid cell.
//! - [`forecast`]: sample tables, the random forest, leave-one-fold-out evaluation and
//!   the dense result tensor.
//! - [`shared`]: configuration loading, the task pool and progress reporting.

#[path = "../shared/mod.rs"]
pub mod shared;

#[path = "../grid/mod.rs"]
pub mod grid;

#[path = "../indices/mod.rs"]
pub mod indices;

#[path = "../forecast/mod.rs"]
pub mod forecast;
