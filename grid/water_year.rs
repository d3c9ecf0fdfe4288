//! Resampling of monthly grids onto water years.
//!
//! Monthly time labels are `YYYYMM` integers. A month belongs to the water year of the
//! calendar date shifted forward by `shift_months`, so with the default shift of three
//! months October 2011 through September 2012 form water year 2012.

use crate::grid::dataset::{GridDataset, GridError, Variable};
use crate::shared::config::ConfigError;
use ndarray::{Array3, Axis, Zip};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const YEAR_DIM: &str = "year";

fn default_shift() -> i64 {
    3
}

/// How a variable's months are collapsed into one value per water year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    Sum,
    Mean,
    Min,
    Max,
}

impl Reducer {
    /// Reduces the finite-or-infinite entries of `values`, skipping `NaN`.
    /// A group with no usable entry reduces to `NaN`.
    pub fn reduce(self, values: impl Iterator<Item = f64>) -> f64 {
        let mut count = 0usize;
        let mut acc = match self {
            Self::Sum | Self::Mean => 0.0,
            Self::Min => f64::INFINITY,
            Self::Max => f64::NEG_INFINITY,
        };
        for v in values.filter(|v| !v.is_nan()) {
            count += 1;
            acc = match self {
                Self::Sum | Self::Mean => acc + v,
                Self::Min => acc.min(v),
                Self::Max => acc.max(v),
            };
        }
        match (self, count) {
            (_, 0) => f64::NAN,
            (Self::Mean, n) => acc / n as f64,
            _ => acc,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateConfig {
    /// Variables to keep and the reducer applied to each.
    pub variables: BTreeMap<String, Reducer>,
    #[serde(default = "default_shift")]
    pub shift_months: i64,
}

impl AggregateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.variables.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one variable must be aggregated".to_string(),
            ));
        }
        if !(0..12).contains(&self.shift_months) {
            return Err(ConfigError::Invalid(format!(
                "shift_months must be within 0..12, got {}",
                self.shift_months
            )));
        }
        Ok(())
    }
}

/// Water year of a `YYYYMM` label, or `None` when the month is out of range.
pub fn water_year(label: i64, shift_months: i64) -> Option<i64> {
    let year = label.div_euclid(100);
    let month = label.rem_euclid(100);
    if !(1..=12).contains(&month) {
        return None;
    }
    let shifted = month - 1 + shift_months;
    Some(year + shifted.div_euclid(12))
}

/// Collapses a monthly dataset into one step per water year.
pub fn aggregate_water_year(
    monthly: &GridDataset,
    config: &AggregateConfig,
) -> Result<GridDataset, GridError> {
    config.validate()?;
    monthly.ensure_non_empty()?;

    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (t, &label) in monthly.time.iter().enumerate() {
        let year = water_year(label, config.shift_months).ok_or_else(|| GridError::Malformed {
            path: monthly.time_dim.clone(),
            reason: format!("time label {label} is not a YYYYMM month"),
        })?;
        groups.entry(year).or_default().push(t);
    }
    let years: Vec<i64> = groups.keys().copied().collect();
    log::info!(
        "Aggregating {} months into {} water years (shift {} months)",
        monthly.time.len(),
        years.len(),
        config.shift_months
    );

    let (rows, cols, _) = monthly.shape();
    let mut out = GridDataset::new(
        monthly.northing.clone(),
        monthly.easting.clone(),
        YEAR_DIM,
        years,
    )?;
    for (name, reducer) in &config.variables {
        let source = monthly.variable(name)?;
        let mut data = Array3::from_elem((rows, cols, groups.len()), f64::NAN);
        for (slot, steps) in groups.values().enumerate() {
            let mut plane = data.index_axis_mut(Axis(2), slot);
            Zip::from(&mut plane)
                .and(source.data.lanes(Axis(2)))
                .for_each(|value, lane| {
                    *value = reducer.reduce(steps.iter().map(|&t| lane[t]));
                });
        }
        out.insert(name.clone(), Variable::new(data, source.attrs.clone()))?;
    }
    Ok(out)
}
