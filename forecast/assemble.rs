//! Merge of per-fold results into dense tensors indexed by global sorted axes.

use crate::forecast::error::ForecastError;
use crate::forecast::evaluate::FoldResult;
use crate::shared::files::{create_writer, open_reader};
use crate::shared::progress::{Stage, TaskProgress};
use ndarray::{Array3, s};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Cross-validation results for every (training year, evaluation year, id).
///
/// Entries never produced by an evaluation stay zero in `predictions` and `targets`
/// and `false` in `covered`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTensor {
    pub years: Vec<i64>,
    pub folds: Vec<i64>,
    pub ids: Vec<i64>,
    pub feature_names: Vec<String>,
    /// Shape: [train year, eval year, id].
    pub predictions: Array3<f64>,
    pub targets: Array3<f64>,
    pub covered: Array3<bool>,
    /// Shape: [train year, fold, feature].
    pub importances: Array3<f64>,
}

fn locate(axis: &'static str, sorted: &[i64], value: i64) -> Result<usize, ForecastError> {
    sorted
        .binary_search(&value)
        .map_err(|_| ForecastError::OffAxis { axis, value })
}

/// Scatters `results` into zero-initialized tensors over the sorted `years`, `folds`
/// and `ids` axes.
pub fn assemble(
    results: &[FoldResult],
    years: &[i64],
    folds: &[i64],
    ids: &[i64],
    progress: &mut dyn TaskProgress,
) -> Result<EvaluationTensor, ForecastError> {
    let first = results.first().ok_or(ForecastError::EmptyTable)?;
    let feature_names: Vec<String> = first.importances.keys().cloned().collect();
    let n_features = feature_names.len();

    let mut tensor = EvaluationTensor {
        years: years.to_vec(),
        folds: folds.to_vec(),
        ids: ids.to_vec(),
        feature_names,
        predictions: Array3::zeros((years.len(), years.len(), ids.len())),
        targets: Array3::zeros((years.len(), years.len(), ids.len())),
        covered: Array3::from_elem((years.len(), years.len(), ids.len()), false),
        importances: Array3::zeros((years.len(), folds.len(), n_features)),
    };

    progress.on_stage_start(Stage::MergeResults, results.len());
    for result in results {
        if !result.importances.keys().eq(tensor.feature_names.iter()) {
            return Err(ForecastError::FeatureMismatch {
                expected: tensor.feature_names.clone(),
                found: result.importances.keys().cloned().collect(),
            });
        }
        let t = locate("training year", years, result.train_year)?;
        let id_index = result
            .ids
            .iter()
            .map(|&id| locate("id", ids, id))
            .collect::<Result<Vec<_>, _>>()?;
        for (row, &year) in result.years.iter().enumerate() {
            let e = locate("evaluation year", years, year)?;
            for (col, &i) in id_index.iter().enumerate() {
                if !result.covered[[row, col]] {
                    continue;
                }
                tensor.predictions[[t, e, i]] = result.predictions[[row, col]];
                tensor.targets[[t, e, i]] = result.targets[[row, col]];
                tensor.covered[[t, e, i]] = true;
            }
        }
        let f = locate("fold", folds, result.fold)?;
        for (slot, value) in tensor
            .importances
            .slice_mut(s![t, f, ..])
            .iter_mut()
            .zip(result.importances.values())
        {
            *slot = *value;
        }
        progress.on_unit_complete(Stage::MergeResults);
    }
    progress.on_stage_finish(Stage::MergeResults);
    Ok(tensor)
}

impl EvaluationTensor {
    /// Writes the tensor as JSON, gzip-compressed when the path ends in `.gz`.
    pub fn save(&self, path: &Path) -> Result<(), ForecastError> {
        let mut writer = create_writer(path)?;
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ForecastError> {
        Ok(serde_json::from_reader(open_reader(path)?)?)
    }

    pub fn year_index(&self, year: i64) -> Option<usize> {
        self.years.binary_search(&year).ok()
    }
}
