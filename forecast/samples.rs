//! Sample tables: one row per (cell, year) with a target and lagged climate features.
//!
//! Tables are stored as tab-separated text with the fixed leading columns
//! `year  id  fold  easting  northing  <target>` followed by the feature columns in
//! name order. Loading goes through Polars; every column is read as text and parsed
//! here so that `NaN`, `inf` and `-inf` cells survive intact.

use crate::forecast::error::ForecastError;
use crate::grid::dataset::GridDataset;
use crate::grid::folds::{FOLD_VARIABLE, ID_VARIABLE};
use crate::shared::config::ConfigError;
use crate::shared::files::{create_writer, format_float, open_reader, parse_float};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;

pub const YEAR_COLUMN: &str = "year";
pub const ID_COLUMN: &str = "id";
pub const FOLD_COLUMN: &str = "fold";
pub const EASTING_COLUMN: &str = "easting";
pub const NORTHING_COLUMN: &str = "northing";
pub const DEFAULT_TARGET: &str = "tpa";

const FIXED_COLUMNS: [&str; 5] = [YEAR_COLUMN, ID_COLUMN, FOLD_COLUMN, EASTING_COLUMN, NORTHING_COLUMN];

pub fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleTable {
    pub year: Vec<i64>,
    pub id: Vec<i64>,
    pub fold: Vec<i64>,
    pub easting: Vec<f64>,
    pub northing: Vec<f64>,
    pub target_name: String,
    pub target: Array1<f64>,
    /// Sorted by name; column `j` of `features` belongs to `feature_names[j]`.
    pub feature_names: Vec<String>,
    /// Shape: [n_rows, n_features].
    pub features: Array2<f64>,
}

fn sorted_unique(values: &[i64]) -> Vec<i64> {
    let mut unique = values.to_vec();
    unique.sort_unstable();
    unique.dedup();
    unique
}

impl SampleTable {
    pub fn len(&self) -> usize {
        self.year.len()
    }

    pub fn is_empty(&self) -> bool {
        self.year.is_empty()
    }

    pub fn years(&self) -> Vec<i64> {
        sorted_unique(&self.year)
    }

    pub fn folds(&self) -> Vec<i64> {
        sorted_unique(&self.fold)
    }

    pub fn ids(&self) -> Vec<i64> {
        sorted_unique(&self.id)
    }

    /// Row indices satisfying `keep`, in table order.
    pub fn rows_where(&self, keep: impl Fn(usize) -> bool) -> Vec<usize> {
        (0..self.len()).filter(|&i| keep(i)).collect()
    }

    /// A new table holding the given rows, in the given order.
    pub fn select(&self, rows: &[usize]) -> SampleTable {
        let pick_i64 = |v: &[i64]| rows.iter().map(|&i| v[i]).collect::<Vec<_>>();
        let pick_f64 = |v: &[f64]| rows.iter().map(|&i| v[i]).collect::<Vec<_>>();
        SampleTable {
            year: pick_i64(&self.year),
            id: pick_i64(&self.id),
            fold: pick_i64(&self.fold),
            easting: pick_f64(&self.easting),
            northing: pick_f64(&self.northing),
            target_name: self.target_name.clone(),
            target: self.target.select(Axis(0), rows),
            feature_names: self.feature_names.clone(),
            features: self.features.select(Axis(0), rows),
        }
    }
}

/// Fails on the first `NaN` target.
pub fn check_targets(target: ArrayView1<f64>) -> Result<(), ForecastError> {
    match target.iter().position(|v| v.is_nan()) {
        Some(row) => Err(ForecastError::NanTarget { row }),
        None => Ok(()),
    }
}

/// Rejects `NaN` features and clamps infinities to `±clamp`.
///
/// Applying this to an already-sanitized matrix returns it unchanged.
pub fn sanitize_features(
    features: &Array2<f64>,
    feature_names: &[String],
    clamp: f64,
) -> Result<Array2<f64>, ForecastError> {
    if let Some(((row, col), _)) = features.indexed_iter().find(|(_, v)| v.is_nan()) {
        return Err(ForecastError::NanFeature {
            row,
            feature: feature_names
                .get(col)
                .cloned()
                .unwrap_or_else(|| format!("#{col}")),
        });
    }
    Ok(features.mapv(|v| {
        if v == f64::INFINITY {
            clamp
        } else if v == f64::NEG_INFINITY {
            -clamp
        } else {
            v
        }
    }))
}

/// Keeps only rows whose target is strictly positive.
pub fn filter_positive(table: &SampleTable) -> SampleTable {
    let rows = table.rows_where(|i| table.target[i] > 0.0);
    log::info!("Keeping {} of {} rows with a positive target", rows.len(), table.len());
    table.select(&rows)
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FeatureSpec {
    /// Number of years looked back, counting the sample year itself.
    pub back: usize,
    /// Number of cumulative variables `<base>1..=<base>lags` per year.
    pub lags: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleConfig {
    /// Half-open range `[start, end)` of sample years.
    pub years: [i64; 2],
    #[serde(default = "default_target")]
    pub target: String,
    pub features: BTreeMap<String, FeatureSpec>,
}

impl SampleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.years[0] >= self.years[1] {
            return Err(ConfigError::Invalid(format!(
                "year range [{}, {}) is empty",
                self.years[0], self.years[1]
            )));
        }
        if self.features.is_empty() {
            return Err(ConfigError::Invalid("no features configured".to_string()));
        }
        if let Some((base, _)) = self.features.iter().find(|(_, s)| s.back == 0 || s.lags == 0) {
            return Err(ConfigError::Invalid(format!(
                "feature '{base}' needs back >= 1 and lags >= 1"
            )));
        }
        Ok(())
    }

    /// `(feature name, climate variable, years back)` for every feature, sorted by name.
    pub fn feature_sources(&self) -> Vec<(String, String, i64)> {
        let mut sources = Vec::new();
        for (base, spec) in &self.features {
            for k in 1..=spec.back {
                for l in 1..=spec.lags {
                    let variable = format!("{base}{l}");
                    sources.push((format!("{variable}-{k}"), variable, (k - 1) as i64));
                }
            }
        }
        sources.sort_by(|a, b| a.0.cmp(&b.0));
        sources
    }
}

/// Splits a feature name `<variable>-<k>` into the climate variable and the number of
/// years back (`k - 1`).
pub fn parse_feature_name(name: &str) -> Result<(String, i64), ForecastError> {
    let malformed = || ForecastError::MalformedFeatureName(name.to_string());
    let (variable, back) = name.rsplit_once('-').ok_or_else(malformed)?;
    let k: i64 = back.parse().map_err(|_| malformed())?;
    if variable.is_empty() || k < 1 {
        return Err(malformed());
    }
    Ok((variable.to_string(), k - 1))
}

/// Joins a mortality grid (with `fold`, `id` and the target) and a climate grid into a
/// sample table. Rows whose target is `NaN` are dropped.
pub fn build_samples(
    mortality: &GridDataset,
    climate: &GridDataset,
    config: &SampleConfig,
) -> Result<SampleTable, ForecastError> {
    config.validate()?;
    let mut mortality = mortality.clone();
    let mut climate = climate.clone();
    mortality.round_coordinates();
    climate.round_coordinates();
    mortality.ensure_same_grid(&climate)?;

    let target = mortality.values(&config.target)?;
    let fold = mortality.values(FOLD_VARIABLE)?;
    let id = mortality.values(ID_VARIABLE)?;
    let sources = config.feature_sources();
    let feature_names: Vec<String> = sources.iter().map(|s| s.0.clone()).collect();
    let (rows, cols, _) = mortality.shape();

    let mut table = TableBuilder::new(feature_names.len());
    for year in config.years[0]..config.years[1] {
        let t = mortality.time_index(year).ok_or(ForecastError::MissingYear {
            year,
            source_name: "mortality",
        })?;
        let mut planes = Vec::with_capacity(sources.len());
        for (_, variable, back) in &sources {
            let climate_year = year - back;
            let ct = climate
                .time_index(climate_year)
                .ok_or_else(|| ForecastError::MissingClimate {
                    variable: variable.clone(),
                    year: climate_year,
                })?;
            planes.push(climate.values(variable)?.index_axis_move(Axis(2), ct));
        }
        let before = table.len();
        for r in 0..rows {
            for c in 0..cols {
                let value = target[[r, c, t]];
                if value.is_nan() {
                    continue;
                }
                table.year.push(year);
                table.id.push(id[[r, c, t]] as i64);
                table.fold.push(fold[[r, c, t]] as i64);
                table.easting.push(mortality.easting[c]);
                table.northing.push(mortality.northing[r]);
                table.target.push(value);
                table.features.extend(planes.iter().map(|plane| plane[[r, c]]));
            }
        }
        log::debug!("Year {year}: {} samples", table.len() - before);
    }
    log::info!(
        "Built {} samples with {} features for years [{}, {})",
        table.len(),
        feature_names.len(),
        config.years[0],
        config.years[1]
    );
    table.finish(config.target.clone(), feature_names)
}

/// Row-wise accumulator for a table under construction.
struct TableBuilder {
    n_features: usize,
    year: Vec<i64>,
    id: Vec<i64>,
    fold: Vec<i64>,
    easting: Vec<f64>,
    northing: Vec<f64>,
    target: Vec<f64>,
    features: Vec<f64>,
}

impl TableBuilder {
    fn new(n_features: usize) -> Self {
        Self {
            n_features,
            year: Vec::new(),
            id: Vec::new(),
            fold: Vec::new(),
            easting: Vec::new(),
            northing: Vec::new(),
            target: Vec::new(),
            features: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.year.len()
    }

    fn finish(self, target_name: String, feature_names: Vec<String>) -> Result<SampleTable, ForecastError> {
        let n = self.year.len();
        let features = Array2::from_shape_vec((n, self.n_features), self.features)
            .map_err(|e| ForecastError::InvalidValue {
                column: "features".to_string(),
                row: n,
                value: e.to_string(),
            })?;
        Ok(SampleTable {
            year: self.year,
            id: self.id,
            fold: self.fold,
            easting: self.easting,
            northing: self.northing,
            target_name,
            target: Array1::from_vec(self.target),
            feature_names,
            features,
        })
    }
}

fn text_column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a StringChunked, ForecastError> {
    let column = df
        .column(name)
        .map_err(|_| ForecastError::MissingColumn(name.to_string()))?;
    Ok(column.str()?)
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, ForecastError> {
    text_column(df, name)?
        .into_iter()
        .enumerate()
        .map(|(row, cell)| match cell {
            None => Ok(f64::NAN),
            Some(text) => parse_float(text).ok_or_else(|| ForecastError::InvalidValue {
                column: name.to_string(),
                row,
                value: text.to_string(),
            }),
        })
        .collect()
}

fn integer_column(df: &DataFrame, name: &str) -> Result<Vec<i64>, ForecastError> {
    text_column(df, name)?
        .into_iter()
        .enumerate()
        .map(|(row, cell)| {
            let invalid = || ForecastError::InvalidValue {
                column: name.to_string(),
                row,
                value: cell.unwrap_or("").to_string(),
            };
            let text = cell.ok_or_else(invalid)?.trim();
            text.parse::<i64>().or_else(|_| {
                parse_float(text)
                    .filter(|v| v.is_finite() && v.fract() == 0.0)
                    .map(|v| v as i64)
                    .ok_or_else(invalid)
            })
        })
        .collect()
}

/// Loads a sample table. Every column other than the fixed ones and the target is a
/// feature. A `.gz` path is decompressed before Polars sees it.
pub fn load_samples(path: &Path, target: &str) -> Result<SampleTable, ForecastError> {
    log::info!("Loading samples from '{}'", path.display());
    let mut bytes = Vec::new();
    open_reader(path)?.read_to_end(&mut bytes)?;
    let df = CsvReader::new(Cursor::new(bytes))
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0))
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let mut feature_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .filter(|name| name != target && !FIXED_COLUMNS.contains(&name.as_str()))
        .collect();
    feature_names.sort();

    let n = df.height();
    let mut features = Array2::<f64>::zeros((n, feature_names.len()));
    for (j, name) in feature_names.iter().enumerate() {
        let values = float_column(&df, name)?;
        features.column_mut(j).assign(&ArrayView1::from(values.as_slice()));
    }
    let table = SampleTable {
        year: integer_column(&df, YEAR_COLUMN)?,
        id: integer_column(&df, ID_COLUMN)?,
        fold: integer_column(&df, FOLD_COLUMN)?,
        easting: float_column(&df, EASTING_COLUMN)?,
        northing: float_column(&df, NORTHING_COLUMN)?,
        target_name: target.to_string(),
        target: Array1::from_vec(float_column(&df, target)?),
        feature_names,
        features,
    };
    log::info!(
        "Loaded {} samples with {} features",
        table.len(),
        table.feature_names.len()
    );
    Ok(table)
}

/// Writes a sample table, replacing any existing file.
pub fn write_samples(path: &Path, table: &SampleTable) -> Result<(), ForecastError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(create_writer(path)?);
    let mut header: Vec<&str> = FIXED_COLUMNS.to_vec();
    header.push(&table.target_name);
    header.extend(table.feature_names.iter().map(String::as_str));
    writer.write_record(&header)?;

    let mut buffer = ryu::Buffer::new();
    let mut record = csv::StringRecord::with_capacity(256, header.len());
    for i in 0..table.len() {
        record.clear();
        record.push_field(&table.year[i].to_string());
        record.push_field(&table.id[i].to_string());
        record.push_field(&table.fold[i].to_string());
        record.push_field(format_float(&mut buffer, table.easting[i]));
        record.push_field(format_float(&mut buffer, table.northing[i]));
        record.push_field(format_float(&mut buffer, table.target[i]));
        for &value in table.features.row(i) {
            record.push_field(format_float(&mut buffer, value));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    log::info!("Wrote {} samples to '{}'", table.len(), path.display());
    Ok(())
}
