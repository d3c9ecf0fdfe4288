//! Per-variable statistics of projection grids.
//!
//! [`summarize_years`] collapses the time axis of one dataset into a single step, and
//! [`summarize_ensemble`] reduces several same-shaped datasets (ensemble members)
//! element by element, keeping their time axis. Both skip `NaN` entries; a reduction
//! with no usable entry is `NaN`.

use crate::grid::dataset::{GridDataset, GridError, Variable, VariableAttrs};
use crate::grid::water_year::Reducer;
use crate::shared::config::ConfigError;
use ndarray::{Array3, ArrayView3, Axis, Zip};
use serde::Deserialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Sum,
    Mean,
    Median,
    Min,
    Max,
    /// Population standard deviation.
    Std,
}

impl Statistic {
    pub fn reduce(self, values: &[f64]) -> f64 {
        let reducer = match self {
            Self::Sum => Reducer::Sum,
            Self::Mean => Reducer::Mean,
            Self::Min => Reducer::Min,
            Self::Max => Reducer::Max,
            Self::Median => return median(values),
            Self::Std => return std_dev(values),
        };
        reducer.reduce(values.iter().copied())
    }
}

fn median(values: &[f64]) -> f64 {
    let mut usable: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if usable.is_empty() {
        return f64::NAN;
    }
    usable.sort_by(f64::total_cmp);
    let mid = usable.len() / 2;
    if usable.len() % 2 == 1 {
        usable[mid]
    } else {
        0.5 * (usable[mid - 1] + usable[mid])
    }
}

fn std_dev(values: &[f64]) -> f64 {
    let mean = Reducer::Mean.reduce(values.iter().copied());
    if mean.is_nan() {
        return f64::NAN;
    }
    Reducer::Mean
        .reduce(values.iter().map(|v| (v - mean) * (v - mean)))
        .sqrt()
}

/// One output variable: `statistic` of the input `variable`, stored as `name`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatisticSpec {
    pub name: String,
    pub variable: String,
    pub statistic: Statistic,
    #[serde(default)]
    pub attrs: VariableAttrs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryConfig {
    pub statistics: Vec<StatisticSpec>,
}

impl SummaryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.statistics.is_empty() {
            return Err(ConfigError::Invalid("no statistics configured".to_string()));
        }
        let mut names = BTreeSet::new();
        for spec in &self.statistics {
            if spec.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "statistic of '{}' has an empty output name",
                    spec.variable
                )));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "output name '{}' is used more than once",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

/// Reduces every configured variable over time.
///
/// The result keeps the time dimension name with a single step labelled by the last
/// input step, so it can be stored and joined like any other grid.
pub fn summarize_years(ds: &GridDataset, config: &SummaryConfig) -> Result<GridDataset, GridError> {
    config.validate()?;
    ds.ensure_non_empty()?;
    let last = ds.time[ds.time.len() - 1];
    log::info!(
        "Summarizing {} {} steps ({}..={last}) into {} statistics",
        ds.time.len(),
        ds.time_dim,
        ds.time[0],
        config.statistics.len()
    );

    let (rows, cols, _) = ds.shape();
    let mut out = GridDataset::new(ds.northing.clone(), ds.easting.clone(), ds.time_dim.clone(), vec![last])?;
    for spec in &config.statistics {
        let source = ds.values(&spec.variable)?;
        let mut data = Array3::from_elem((rows, cols, 1), f64::NAN);
        Zip::from(data.lanes_mut(Axis(2)))
            .and(source.lanes(Axis(2)))
            .par_for_each(|mut value, lane| {
                value[0] = spec.statistic.reduce(&lane.to_vec());
            });
        out.insert(spec.name.clone(), Variable::new(data, spec.attrs.clone()))?;
    }
    Ok(out)
}

/// Reduces every configured variable across ensemble members.
///
/// Members must share the grid, the time dimension and the time axis.
pub fn summarize_ensemble(
    members: &[GridDataset],
    config: &SummaryConfig,
) -> Result<GridDataset, GridError> {
    config.validate()?;
    let first = members.first().ok_or(GridError::EmptyAxis("ensemble member"))?;
    first.ensure_non_empty()?;
    for member in &members[1..] {
        first.ensure_same_grid(member)?;
        if member.time_dim != first.time_dim {
            return Err(GridError::TimeDimMismatch {
                expected: first.time_dim.clone(),
                found: member.time_dim.clone(),
            });
        }
        if member.time != first.time {
            return Err(GridError::CoordinateMismatch {
                axis: "time",
                detail: format!(
                    "{} steps from {:?} vs {} steps from {:?}",
                    first.time.len(),
                    first.time.first(),
                    member.time.len(),
                    member.time.first()
                ),
            });
        }
    }
    log::info!(
        "Summarizing {} ensemble members into {} statistics",
        members.len(),
        config.statistics.len()
    );

    let mut out = GridDataset::new(
        first.northing.clone(),
        first.easting.clone(),
        first.time_dim.clone(),
        first.time.clone(),
    )?;
    for spec in &config.statistics {
        let sources = members
            .iter()
            .map(|member| member.values(&spec.variable))
            .collect::<Result<Vec<ArrayView3<f64>>, GridError>>()?;
        let mut data = Array3::from_elem(first.shape(), f64::NAN);
        Zip::indexed(&mut data).par_for_each(|index, value| {
            let across: Vec<f64> = sources.iter().map(|source| source[index]).collect();
            *value = spec.statistic.reduce(&across);
        });
        out.insert(spec.name.clone(), Variable::new(data, spec.attrs.clone()))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(offset: f64) -> GridDataset {
        let mut ds = GridDataset::new(vec![20.0, 10.0], vec![1.0], "year", vec![2030, 2031, 2032]).unwrap();
        let tpa = Array3::from_shape_fn((2, 1, 3), |(r, _, t)| offset + (r * 10 + t) as f64);
        ds.insert("tpa", Variable::new(tpa, VariableAttrs::with_units("trees per acre")))
            .unwrap();
        ds
    }

    fn config(statistics: &[(&str, Statistic)]) -> SummaryConfig {
        SummaryConfig {
            statistics: statistics
                .iter()
                .map(|&(name, statistic)| StatisticSpec {
                    name: name.to_string(),
                    variable: "tpa".to_string(),
                    statistic,
                    attrs: VariableAttrs::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn statistics_skip_nan() {
        let values = [4.0, f64::NAN, 1.0, 3.0, 2.0];
        assert_eq!(Statistic::Median.reduce(&values), 2.5);
        assert_eq!(Statistic::Median.reduce(&values[..4]), 3.0);
        assert_eq!(Statistic::Sum.reduce(&values), 10.0);
        assert!((Statistic::Std.reduce(&values) - 1.25f64.sqrt()).abs() < 1e-12);
        assert!(Statistic::Median.reduce(&[f64::NAN]).is_nan());
        assert!(Statistic::Std.reduce(&[]).is_nan());
    }

    #[test]
    fn years_collapse_to_last_step() {
        let mut ds = projection(0.0);
        ds.variables.get_mut("tpa").unwrap().data[[1, 0, 0]] = f64::NAN;
        let cfg = config(&[("tpa_mean", Statistic::Mean), ("tpa_max", Statistic::Max)]);
        let out = summarize_years(&ds, &cfg).unwrap();
        assert_eq!(out.time, vec![2032]);
        assert_eq!(out.values("tpa_mean").unwrap()[[0, 0, 0]], 1.0);
        assert_eq!(out.values("tpa_mean").unwrap()[[1, 0, 0]], 11.5);
        assert_eq!(out.values("tpa_max").unwrap()[[1, 0, 0]], 12.0);
        assert!(out.variable("tpa").is_err());
    }

    #[test]
    fn members_reduce_element_wise() {
        let members = vec![projection(0.0), projection(2.0), projection(7.0)];
        let mut cfg = config(&[("tpa_median", Statistic::Median)]);
        cfg.statistics[0].attrs = VariableAttrs::with_units("trees per acre");
        let out = summarize_ensemble(&members, &cfg).unwrap();
        assert_eq!(out.time, vec![2030, 2031, 2032]);
        let median = out.variable("tpa_median").unwrap();
        assert_eq!(median.data[[1, 0, 2]], 14.0);
        assert_eq!(median.attrs.units.as_deref(), Some("trees per acre"));
    }

    #[test]
    fn mismatched_members_are_rejected() {
        let shifted = projection(0.0).select_time(2031, 2032).unwrap();
        let cfg = config(&[("tpa_mean", Statistic::Mean)]);
        assert!(matches!(
            summarize_ensemble(&[projection(0.0), shifted], &cfg),
            Err(GridError::CoordinateMismatch { axis: "time", .. })
        ));
        assert!(matches!(summarize_ensemble(&[], &cfg), Err(GridError::EmptyAxis(_))));
    }

    #[test]
    fn duplicate_output_names_are_invalid() {
        let cfg = config(&[("tpa_mean", Statistic::Mean), ("tpa_mean", Statistic::Max)]);
        assert!(matches!(summarize_years(&projection(0.0), &cfg), Err(GridError::Config(_))));
    }
}
