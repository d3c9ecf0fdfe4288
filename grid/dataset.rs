//! In-memory gridded datasets.
//!
//! A [`GridDataset`] is a set of named variables that share one spatial grid (northing
//! rows by easting columns) and one time axis. Every variable is a dense
//! `northing × easting × time` cube; missing combinations are `NaN`.

use crate::shared::config::ConfigError;
use ndarray::{Array3, ArrayView3, Axis, s};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;

/// Coordinates are compared after rounding to this many decimal places.
pub const COORDINATE_DECIMALS: i32 = 4;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Failed to read or write grid store: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed grid store '{path}': {reason}")]
    Malformed { path: String, reason: String },
    #[error("Failed to parse attribute sidecar: {0}")]
    AttrsParse(#[from] toml::de::Error),
    #[error("Failed to serialize attribute sidecar: {0}")]
    AttrsSerialize(#[from] toml::ser::Error),
    #[error("Coordinate mismatch on the {axis} axis: {detail}")]
    CoordinateMismatch { axis: &'static str, detail: String },
    #[error("Variable '{0}' not found in dataset")]
    MissingVariable(String),
    #[error("Variable '{0}' already exists in dataset")]
    DuplicateVariable(String),
    #[error("Variable '{name}' has shape {found:?}, but the dataset grid is {expected:?}")]
    ShapeMismatch {
        name: String,
        found: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("Time axis '{0}' must be strictly increasing")]
    UnorderedTime(String),
    #[error(
        "Cannot join along '{dim}': the earlier dataset ends at {earlier_last} but the later one starts at {later_first}"
    )]
    OverlappingTime {
        dim: String,
        earlier_last: i64,
        later_first: i64,
    },
    #[error("Time dimension mismatch: expected '{expected}', found '{found}'")]
    TimeDimMismatch { expected: String, found: String },
    #[error("No time steps of '{dim}' fall within [{start}, {end}]")]
    EmptySelection { dim: String, start: i64, end: i64 },
    #[error("Dataset has an empty {0} axis")]
    EmptyAxis(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Descriptive metadata carried alongside a variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
}

impl VariableAttrs {
    pub fn with_units(units: impl Into<String>) -> Self {
        Self {
            units: Some(units.into()),
            long_name: None,
        }
    }
}

/// One gridded quantity, shaped `northing × easting × time`.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub data: Array3<f64>,
    pub attrs: VariableAttrs,
}

impl Variable {
    pub fn new(data: Array3<f64>, attrs: VariableAttrs) -> Self {
        Self { data, attrs }
    }

    /// A copy restricted to the given time-index range.
    pub fn slice_time(&self, range: Range<usize>) -> Variable {
        Variable {
            data: self.data.slice(s![.., .., range]).to_owned(),
            attrs: self.attrs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridDataset {
    pub northing: Vec<f64>,
    pub easting: Vec<f64>,
    pub time_dim: String,
    pub time: Vec<i64>,
    pub variables: BTreeMap<String, Variable>,
}

/// Rounds a coordinate to the comparison precision and returns it as an integer key.
pub fn coordinate_key(value: f64) -> i64 {
    let scale = 10f64.powi(COORDINATE_DECIMALS);
    (value * scale).round() as i64
}

impl GridDataset {
    /// An empty dataset over the given axes. Time must be strictly increasing.
    pub fn new(
        northing: Vec<f64>,
        easting: Vec<f64>,
        time_dim: impl Into<String>,
        time: Vec<i64>,
    ) -> Result<Self, GridError> {
        let time_dim = time_dim.into();
        if time.windows(2).any(|w| w[0] >= w[1]) {
            return Err(GridError::UnorderedTime(time_dim));
        }
        Ok(Self {
            northing,
            easting,
            time_dim,
            time,
            variables: BTreeMap::new(),
        })
    }

    /// `(rows, cols, time steps)` of every variable in this dataset.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.northing.len(), self.easting.len(), self.time.len())
    }

    pub fn variable(&self, name: &str) -> Result<&Variable, GridError> {
        self.variables
            .get(name)
            .ok_or_else(|| GridError::MissingVariable(name.to_string()))
    }

    pub fn values(&self, name: &str) -> Result<ArrayView3<'_, f64>, GridError> {
        Ok(self.variable(name)?.data.view())
    }

    /// Adds a variable, rejecting name collisions and shape mismatches.
    pub fn insert(&mut self, name: impl Into<String>, variable: Variable) -> Result<(), GridError> {
        let name = name.into();
        let (rows, cols, steps) = self.shape();
        if variable.data.dim() != (rows, cols, steps) {
            return Err(GridError::ShapeMismatch {
                name,
                found: variable.data.shape().to_vec(),
                expected: vec![rows, cols, steps],
            });
        }
        if self.variables.contains_key(&name) {
            return Err(GridError::DuplicateVariable(name));
        }
        self.variables.insert(name, variable);
        Ok(())
    }

    /// Adds or replaces a variable.
    pub fn replace(&mut self, name: impl Into<String>, variable: Variable) -> Result<(), GridError> {
        let name = name.into();
        self.variables.remove(&name);
        self.insert(name, variable)
    }

    /// Index range of time steps whose labels fall within `[start, end]`.
    pub fn time_range(&self, start: i64, end: i64) -> Result<Range<usize>, GridError> {
        let lo = self.time.partition_point(|&t| t < start);
        let hi = self.time.partition_point(|&t| t <= end);
        if lo >= hi {
            return Err(GridError::EmptySelection {
                dim: self.time_dim.clone(),
                start,
                end,
            });
        }
        Ok(lo..hi)
    }

    /// Position of one time label.
    pub fn time_index(&self, label: i64) -> Option<usize> {
        self.time.binary_search(&label).ok()
    }

    /// A copy holding only the time steps labelled within `[start, end]`.
    pub fn select_time(&self, start: i64, end: i64) -> Result<GridDataset, GridError> {
        let range = self.time_range(start, end)?;
        Ok(GridDataset {
            northing: self.northing.clone(),
            easting: self.easting.clone(),
            time_dim: self.time_dim.clone(),
            time: self.time[range.clone()].to_vec(),
            variables: self
                .variables
                .iter()
                .map(|(name, var)| (name.clone(), var.slice_time(range.clone())))
                .collect(),
        })
    }

    /// Fails unless both datasets share the same grid after coordinate rounding.
    pub fn ensure_same_grid(&self, other: &GridDataset) -> Result<(), GridError> {
        compare_axis("northing", &self.northing, &other.northing)?;
        compare_axis("easting", &self.easting, &other.easting)
    }

    /// Rounds both coordinate axes to the comparison precision in place.
    pub fn round_coordinates(&mut self) {
        let scale = 10f64.powi(COORDINATE_DECIMALS);
        for value in self.northing.iter_mut().chain(self.easting.iter_mut()) {
            *value = (*value * scale).round() / scale;
        }
    }

    /// Joins `earlier` and `later` along time.
    ///
    /// Only variables present in both are kept. The grids must match and every step of
    /// `later` must come after the last step of `earlier`.
    pub fn concat_time(earlier: &GridDataset, later: &GridDataset) -> Result<GridDataset, GridError> {
        earlier.ensure_same_grid(later)?;
        if earlier.time_dim != later.time_dim {
            return Err(GridError::TimeDimMismatch {
                expected: earlier.time_dim.clone(),
                found: later.time_dim.clone(),
            });
        }
        if let (Some(&earlier_last), Some(&later_first)) = (earlier.time.last(), later.time.first()) {
            if earlier_last >= later_first {
                return Err(GridError::OverlappingTime {
                    dim: earlier.time_dim.clone(),
                    earlier_last,
                    later_first,
                });
            }
        }
        let mut time = earlier.time.clone();
        time.extend_from_slice(&later.time);
        let mut combined = GridDataset::new(
            earlier.northing.clone(),
            earlier.easting.clone(),
            earlier.time_dim.clone(),
            time,
        )?;
        for (name, first) in &earlier.variables {
            let Some(second) = later.variables.get(name) else {
                log::debug!("Dropping '{name}' from concatenation: absent from later dataset");
                continue;
            };
            let data = ndarray::concatenate(Axis(2), &[first.data.view(), second.data.view()])
                .map_err(|e| GridError::ShapeMismatch {
                    name: format!("{name} ({e})"),
                    found: second.data.shape().to_vec(),
                    expected: first.data.shape().to_vec(),
                })?;
            combined.insert(name.clone(), Variable::new(data, first.attrs.clone()))?;
        }
        Ok(combined)
    }

    /// Fails if any axis is empty.
    pub fn ensure_non_empty(&self) -> Result<(), GridError> {
        if self.northing.is_empty() {
            return Err(GridError::EmptyAxis("northing"));
        }
        if self.easting.is_empty() {
            return Err(GridError::EmptyAxis("easting"));
        }
        if self.time.is_empty() {
            return Err(GridError::EmptyAxis("time"));
        }
        Ok(())
    }
}

fn compare_axis(axis: &'static str, left: &[f64], right: &[f64]) -> Result<(), GridError> {
    if left.len() != right.len() {
        return Err(GridError::CoordinateMismatch {
            axis,
            detail: format!("{} vs {} coordinates", left.len(), right.len()),
        });
    }
    if let Some(position) = left
        .iter()
        .zip(right)
        .position(|(a, b)| coordinate_key(*a) != coordinate_key(*b))
    {
        return Err(GridError::CoordinateMismatch {
            axis,
            detail: format!(
                "position {position}: {} vs {}",
                left[position], right[position]
            ),
        });
    }
    Ok(())
}
