//! Per (training year, held-out fold) model evaluation.

use crate::forecast::error::ForecastError;
use crate::forecast::forest::{ForestParams, RandomForest};
use crate::forecast::samples::{SampleTable, check_targets, sanitize_features};
use crate::shared::progress::{Stage, TaskProgress};
use crate::shared::tasks::{TaskPool, await_all};
use itertools::iproduct;
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of one unit of evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldResult {
    pub fold: i64,
    pub train_year: i64,
    /// Sorted distinct years of the held-out rows.
    pub years: Vec<i64>,
    /// Sorted distinct ids of the held-out rows.
    pub ids: Vec<i64>,
    /// Shape: [years, ids].
    pub predictions: Array2<f64>,
    pub targets: Array2<f64>,
    /// True where a held-out row supplied the (year, id) entry.
    pub covered: Array2<bool>,
    pub importances: BTreeMap<String, f64>,
}

fn sorted_unique(values: impl Iterator<Item = i64>) -> Vec<i64> {
    let mut unique: Vec<i64> = values.collect();
    unique.sort_unstable();
    unique.dedup();
    unique
}

/// Sanitized `(features, targets)` for the given rows.
fn design(
    table: &SampleTable,
    rows: &[usize],
    clamp: f64,
) -> Result<(Array2<f64>, Array1<f64>), ForecastError> {
    let x = sanitize_features(
        &table.features.select(Axis(0), rows),
        &table.feature_names,
        clamp,
    )?;
    let y = table.target.select(Axis(0), rows);
    check_targets(y.view())?;
    Ok((x, y))
}

/// Trains on `training_year` rows outside `held_out`, then predicts every row of
/// `held_out` across all years.
pub fn evaluate_fold(
    table: &SampleTable,
    held_out: i64,
    training_year: i64,
    params: &ForestParams,
) -> Result<FoldResult, ForecastError> {
    let train_rows = table.rows_where(|i| table.year[i] == training_year && table.fold[i] != held_out);
    if train_rows.is_empty() {
        return Err(ForecastError::EmptyTrainingSet {
            year: training_year,
            fold: held_out,
        });
    }
    let (x_train, y_train) = design(table, &train_rows, params.infinity_clamp)?;
    let forest = RandomForest::fit(x_train.view(), y_train.view(), params)?;

    let test_rows = table.rows_where(|i| table.fold[i] == held_out);
    let (x_test, y_test) = design(table, &test_rows, params.infinity_clamp)?;
    let predicted = forest.predict(x_test.view())?;

    let years = sorted_unique(test_rows.iter().map(|&i| table.year[i]));
    let ids = sorted_unique(test_rows.iter().map(|&i| table.id[i]));
    let mut predictions = Array2::zeros((years.len(), ids.len()));
    let mut targets = Array2::zeros((years.len(), ids.len()));
    let mut covered = Array2::from_elem((years.len(), ids.len()), false);
    for (k, &row) in test_rows.iter().enumerate() {
        let (Ok(y), Ok(c)) = (years.binary_search(&table.year[row]), ids.binary_search(&table.id[row])) else {
            continue;
        };
        predictions[[y, c]] = predicted[k];
        targets[[y, c]] = y_test[k];
        covered[[y, c]] = true;
    }

    let importances = table
        .feature_names
        .iter()
        .cloned()
        .zip(forest.importances.iter().copied())
        .collect();
    log::debug!(
        "Year {training_year}, fold {held_out}: trained on {} rows, evaluated {} rows",
        train_rows.len(),
        test_rows.len()
    );
    Ok(FoldResult {
        fold: held_out,
        train_year: training_year,
        years,
        ids,
        predictions,
        targets,
        covered,
        importances,
    })
}

/// Evaluates every (year, fold) pair of the table on `pool`.
///
/// Results are in sorted (year, fold) order. The first failing unit fails the run.
pub fn evaluate_all<P: TaskPool>(
    table: Arc<SampleTable>,
    params: Arc<ForestParams>,
    pool: &P,
    progress: &mut dyn TaskProgress,
) -> Result<Vec<FoldResult>, ForecastError> {
    params.validate()?;
    if table.is_empty() {
        return Err(ForecastError::EmptyTable);
    }
    let years = table.years();
    let folds = table.folds();
    log::info!(
        "Evaluating {} years x {} folds ({} units)",
        years.len(),
        folds.len(),
        years.len() * folds.len()
    );
    let handles = iproduct!(years, folds)
        .map(|(year, fold)| {
            let table = Arc::clone(&table);
            let params = Arc::clone(&params);
            pool.submit(move || evaluate_fold(&table, fold, year, &params))
        })
        .collect();
    await_all(handles, Stage::FoldEvaluation, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn table() -> SampleTable {
        // two years, two folds, two ids per fold
        let year = vec![2000, 2000, 2000, 2000, 2001, 2001, 2001, 2001];
        let id = vec![0, 1, 2, 3, 0, 1, 2, 3];
        let fold = vec![0, 0, 1, 1, 0, 0, 1, 1];
        let x: Vec<f64> = (0..8).map(|i| i as f64).collect();
        SampleTable {
            year,
            id,
            fold,
            easting: vec![0.0; 8],
            northing: vec![0.0; 8],
            target_name: "tpa".to_string(),
            target: Array1::from_iter(x.iter().map(|v| v * 2.0)),
            feature_names: vec!["A1-1".to_string()],
            features: Array2::from_shape_vec((8, 1), x).unwrap(),
        }
    }

    #[test]
    fn held_out_fold_spans_all_years() {
        let params = ForestParams {
            n_estimators: 3,
            ..ForestParams::default()
        };
        let result = evaluate_fold(&table(), 1, 2000, &params).unwrap();
        assert_eq!(result.years, vec![2000, 2001]);
        assert_eq!(result.ids, vec![2, 3]);
        assert!(result.covered.iter().all(|&c| c));
        assert_eq!(result.targets, array![[4.0, 6.0], [12.0, 14.0]]);
        assert_eq!(result.importances.len(), 1);
    }

    #[test]
    fn empty_training_subset_is_an_error() {
        let mut t = table();
        t.fold = vec![0; 8];
        assert!(matches!(
            evaluate_fold(&t, 0, 2000, &ForestParams::default()),
            Err(ForecastError::EmptyTrainingSet { year: 2000, fold: 0 })
        ));
    }

    #[test]
    fn nan_feature_fails_the_unit() {
        let mut t = table();
        t.features[[0, 0]] = f64::NAN;
        assert!(matches!(
            evaluate_fold(&t, 1, 2000, &ForestParams::default()),
            Err(ForecastError::NanFeature { .. })
        ));
    }
}
