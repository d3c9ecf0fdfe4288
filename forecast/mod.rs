pub mod assemble;
pub mod error;
pub mod evaluate;
pub mod forest;
pub mod metrics;
pub mod model;
pub mod samples;

pub use assemble::{EvaluationTensor, assemble};
pub use error::ForecastError;
pub use evaluate::{FoldResult, evaluate_all, evaluate_fold};
pub use forest::{ForestParams, RandomForest};
pub use model::{ApplyConfig, TrainedForest, apply_forest, reformat_predictions, train_final};
pub use samples::{SampleConfig, SampleTable, build_samples, filter_positive, load_samples, write_samples};
