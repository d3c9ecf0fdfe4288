//! Final models: training on one year, persistence and application to climate grids.

use crate::forecast::assemble::EvaluationTensor;
use crate::forecast::error::ForecastError;
use crate::forecast::forest::{ForestParams, RandomForest};
use crate::forecast::samples::{SampleTable, check_targets, parse_feature_name, sanitize_features};
use crate::grid::dataset::{GridDataset, Variable, VariableAttrs};
use crate::grid::water_year::YEAR_DIM;
use crate::shared::config::ConfigError;
use crate::shared::progress::{Stage, TaskProgress};
use crate::shared::tasks::{TaskPool, await_all};
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// A fitted forest together with the feature order it expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedForest {
    pub training_year: i64,
    pub target_name: String,
    pub feature_names: Vec<String>,
    pub params: ForestParams,
    pub forest: RandomForest,
}

impl TrainedForest {
    /// Saves the trained model to a human-readable TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ForecastError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ForecastError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

/// Fits the final model on every row of `year`.
pub fn train_final(table: &SampleTable, year: i64, params: &ForestParams) -> Result<TrainedForest, ForecastError> {
    let rows = table.rows_where(|i| table.year[i] == year);
    if rows.is_empty() {
        return Err(ForecastError::MissingYear {
            year,
            source_name: "sample table",
        });
    }
    let x = sanitize_features(
        &table.features.select(Axis(0), &rows),
        &table.feature_names,
        params.infinity_clamp,
    )?;
    let y = table.target.select(Axis(0), &rows);
    check_targets(y.view())?;
    log::info!("Training final model on {} rows of {year}", rows.len());
    let forest = RandomForest::fit(x.view(), y.view(), params)?;
    Ok(TrainedForest {
        training_year: year,
        target_name: table.target_name.clone(),
        feature_names: table.feature_names.clone(),
        params: params.clone(),
        forest,
    })
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YearRange {
    pub start: i64,
    /// Exclusive.
    pub end: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyConfig {
    pub year_range: YearRange,
    pub prediction_variable: String,
    #[serde(default)]
    pub prediction_variable_info: VariableAttrs,
}

impl ApplyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.year_range.start >= self.year_range.end {
            return Err(ConfigError::Invalid(format!(
                "year_range is empty: start {} is not before end {}",
                self.year_range.start, self.year_range.end
            )));
        }
        if self.prediction_variable.trim().is_empty() {
            return Err(ConfigError::Invalid("prediction_variable must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn years(&self) -> Vec<i64> {
        (self.year_range.start..self.year_range.end).collect()
    }
}

/// Climate variable and years back for each model feature, in model order.
fn feature_sources(model: &TrainedForest) -> Result<Vec<(String, i64)>, ForecastError> {
    model
        .feature_names
        .iter()
        .map(|name| parse_feature_name(name))
        .collect()
}

/// Predicts one year over the whole grid. Cells with any `NaN` feature are `NaN`.
fn predict_year(
    model: &TrainedForest,
    climate: &GridDataset,
    sources: &[(String, i64)],
    year: i64,
) -> Result<Array2<f64>, ForecastError> {
    let (rows, cols, _) = climate.shape();
    let mut x = Array2::<f64>::zeros((rows * cols, sources.len()));
    for (j, (variable, back)) in sources.iter().enumerate() {
        let source_year = year - back;
        let t = climate
            .time_index(source_year)
            .ok_or_else(|| ForecastError::MissingClimate {
                variable: variable.clone(),
                year: source_year,
            })?;
        let plane = climate.values(variable)?.index_axis_move(Axis(2), t);
        for (slot, value) in x.column_mut(j).iter_mut().zip(plane.iter()) {
            *slot = *value;
        }
    }

    let good: Vec<usize> = x
        .rows()
        .into_iter()
        .enumerate()
        .filter(|(_, row)| !row.iter().any(|v| v.is_nan()))
        .map(|(i, _)| i)
        .collect();
    let mut out = Array2::from_elem((rows, cols), f64::NAN);
    if !good.is_empty() {
        let x_good = sanitize_features(
            &x.select(Axis(0), &good),
            &model.feature_names,
            model.params.infinity_clamp,
        )?;
        let predicted = model.forest.predict(x_good.view())?;
        for (&i, value) in good.iter().zip(predicted) {
            out[[i / cols, i % cols]] = value;
        }
    }
    log::debug!("Year {year}: predicted {} of {} cells", good.len(), rows * cols);
    Ok(out)
}

/// Applies `model` to every configured year of `climate`, one unit of work per year.
pub fn apply_forest<P: TaskPool>(
    model: Arc<TrainedForest>,
    climate: Arc<GridDataset>,
    config: &ApplyConfig,
    pool: &P,
    progress: &mut dyn TaskProgress,
) -> Result<GridDataset, ForecastError> {
    config.validate()?;
    let years = config.years();
    let sources = Arc::new(feature_sources(&model)?);
    for (variable, back) in sources.iter() {
        climate.variable(variable)?;
        for &year in &years {
            if climate.time_index(year - back).is_none() {
                return Err(ForecastError::MissingClimate {
                    variable: variable.clone(),
                    year: year - back,
                });
            }
        }
    }
    log::info!(
        "Applying model trained on {} to {} years",
        model.training_year,
        years.len()
    );

    let handles = years
        .iter()
        .map(|&year| {
            let model = Arc::clone(&model);
            let climate = Arc::clone(&climate);
            let sources = Arc::clone(&sources);
            pool.submit(move || predict_year(&model, &climate, &sources, year))
        })
        .collect();
    let planes = await_all(handles, Stage::ApplyYears, progress)?;

    let (rows, cols, _) = climate.shape();
    let mut data = Array3::from_elem((rows, cols, years.len()), f64::NAN);
    for (t, plane) in planes.iter().enumerate() {
        data.index_axis_mut(Axis(2), t).assign(plane);
    }
    let mut out = GridDataset::new(climate.northing.clone(), climate.easting.clone(), YEAR_DIM, years)?;
    out.insert(
        config.prediction_variable.clone(),
        Variable::new(data, config.prediction_variable_info.clone()),
    )?;
    Ok(out)
}

/// Rebuilds the target grid from same-year cross-validated predictions.
///
/// Cell `id` is the row-major position on the mortality grid. Cells that were never
/// evaluated, or whose target is `NaN`, are `NaN`.
pub fn reformat_predictions(
    tensor: &EvaluationTensor,
    mortality: &GridDataset,
    target: &str,
) -> Result<GridDataset, ForecastError> {
    let (rows, cols, _) = mortality.shape();
    let original = mortality.variable(target)?;
    let mut data = Array3::from_elem(original.data.raw_dim(), f64::NAN);
    for (t, &year) in mortality.time.iter().enumerate() {
        let y = tensor.year_index(year).ok_or(ForecastError::MissingYear {
            year,
            source_name: "result archive",
        })?;
        for (k, &id) in tensor.ids.iter().enumerate() {
            if !tensor.covered[[y, y, k]] {
                continue;
            }
            let flat = usize::try_from(id)
                .ok()
                .filter(|&f| f < rows * cols)
                .ok_or(ForecastError::OffAxis { axis: "id", value: id })?;
            let (r, c) = (flat / cols, flat % cols);
            if original.data[[r, c, t]].is_nan() {
                continue;
            }
            data[[r, c, t]] = tensor.predictions[[y, y, k]];
        }
    }
    let mut out = mortality.clone();
    out.replace(target, Variable::new(data, original.attrs.clone()))?;
    Ok(out)
}
