use crate::grid::dataset::GridError;
use crate::shared::config::ConfigError;
use crate::shared::tasks::TaskError;
use polars::prelude::PolarsError;
use thiserror::Error;

/// Failures of sample construction, model fitting and evaluation.
#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Failed to write table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to (de)serialize result archive: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to parse model from TOML format: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("The required column '{0}' was not found in the sample table.")]
    MissingColumn(String),
    #[error("Column '{column}' holds an invalid value '{value}' at row {row}.")]
    InvalidValue {
        column: String,
        row: usize,
        value: String,
    },
    #[error("NaN entry in feature '{feature}' at row {row}; samples and climate grid are misaligned")]
    NanFeature { row: usize, feature: String },
    #[error("NaN entry in target vector at row {row}")]
    NanTarget { row: usize },
    #[error("Climate variable '{variable}' has no value for year {year}")]
    MissingClimate { variable: String, year: i64 },
    #[error("Year {year} is not present in the '{source_name}' grid")]
    MissingYear { year: i64, source_name: &'static str },
    #[error("No training rows for year {year} outside held-out fold {fold}")]
    EmptyTrainingSet { year: i64, fold: i64 },
    #[error("No rows to fit a model on")]
    EmptyTable,
    #[error("Feature set mismatch: expected {expected:?}, found {found:?}")]
    FeatureMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("{axis} {value} is not on the result axis")]
    OffAxis { axis: &'static str, value: i64 },
    #[error("Feature '{0}' does not follow the '<variable>-<years back>' naming")]
    MalformedFeatureName(String),
    #[error("Feature matrix has {found} columns, but the model was trained on {expected}")]
    MismatchedFeatureCount { found: usize, expected: usize },
}
