//! Skill scores between every training year and every evaluation year.

use crate::forecast::assemble::EvaluationTensor;
use crate::forecast::error::ForecastError;
use crate::shared::files::{create_writer, format_float};
use ndarray::Array2;
use std::path::Path;

/// Root mean squared error; `NaN` for empty input.
pub fn rmse(truth: &[f64], predicted: &[f64]) -> f64 {
    if truth.is_empty() {
        return f64::NAN;
    }
    let sse: f64 = truth.iter().zip(predicted).map(|(t, p)| (t - p).powi(2)).sum();
    (sse / truth.len() as f64).sqrt()
}

/// Coefficient of determination.
///
/// A constant truth scores 1.0 when predicted exactly and 0.0 otherwise.
pub fn r2(truth: &[f64], predicted: &[f64]) -> f64 {
    if truth.is_empty() {
        return f64::NAN;
    }
    let mean = truth.iter().sum::<f64>() / truth.len() as f64;
    let ss_res: f64 = truth.iter().zip(predicted).map(|(t, p)| (t - p).powi(2)).sum();
    let ss_tot: f64 = truth.iter().map(|t| (t - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMatrix {
    pub years: Vec<i64>,
    /// Shape: [train year, eval year].
    pub r2: Array2<f64>,
    pub rmse: Array2<f64>,
}

/// Scores every (training year, evaluation year) pair over the ids that were evaluated.
pub fn performance_matrix(tensor: &EvaluationTensor) -> PerformanceMatrix {
    let n = tensor.years.len();
    let mut r2_scores = Array2::from_elem((n, n), f64::NAN);
    let mut rmse_scores = Array2::from_elem((n, n), f64::NAN);
    for train in 0..n {
        for eval in 0..n {
            let (truth, predicted): (Vec<f64>, Vec<f64>) = (0..tensor.ids.len())
                .filter(|&k| tensor.covered[[train, eval, k]])
                .map(|k| (tensor.targets[[train, eval, k]], tensor.predictions[[train, eval, k]]))
                .unzip();
            r2_scores[[train, eval]] = r2(&truth, &predicted);
            rmse_scores[[train, eval]] = rmse(&truth, &predicted);
        }
    }
    PerformanceMatrix {
        years: tensor.years.clone(),
        r2: r2_scores,
        rmse: rmse_scores,
    }
}

/// Writes one tab-separated row per year pair.
pub fn write_performance(path: &Path, matrix: &PerformanceMatrix) -> Result<(), ForecastError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(create_writer(path)?);
    writer.write_record(["train_year", "eval_year", "r2", "rmse"])?;
    let mut buffer = ryu::Buffer::new();
    for (i, train) in matrix.years.iter().enumerate() {
        for (j, eval) in matrix.years.iter().enumerate() {
            let r2_text = format_float(&mut buffer, matrix.r2[[i, j]]).to_string();
            let rmse_text = format_float(&mut buffer, matrix.rmse[[i, j]]).to_string();
            writer.write_record([train.to_string(), eval.to_string(), r2_text, rmse_text])?;
        }
    }
    writer.flush()?;
    log::info!("Wrote {} year pairs to {}", matrix.years.len().pow(2), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    #[test]
    fn scores_match_hand_computation() {
        let truth = [1.0, 2.0, 3.0, 4.0];
        let predicted = [1.5, 2.0, 2.5, 4.0];
        assert_abs_diff_eq!(rmse(&truth, &predicted), (0.5f64 / 4.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(r2(&truth, &predicted), 1.0 - 0.5 / 5.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_truth_is_finite() {
        assert_eq!(r2(&[2.0, 2.0], &[2.0, 2.0]), 1.0);
        assert_eq!(r2(&[2.0, 2.0], &[1.0, 2.0]), 0.0);
        assert!(r2(&[], &[]).is_nan());
    }

    #[test]
    fn uncovered_entries_are_ignored() {
        let mut tensor = EvaluationTensor {
            years: vec![2010, 2011],
            folds: vec![0],
            ids: vec![0, 1, 2],
            feature_names: vec![],
            predictions: Array3::zeros((2, 2, 3)),
            targets: Array3::zeros((2, 2, 3)),
            covered: Array3::from_elem((2, 2, 3), false),
            importances: Array3::zeros((2, 1, 0)),
        };
        for k in 0..2 {
            tensor.covered[[0, 1, k]] = true;
            tensor.targets[[0, 1, k]] = k as f64;
            tensor.predictions[[0, 1, k]] = k as f64;
        }
        tensor.predictions[[0, 1, 2]] = 50.0;
        let matrix = performance_matrix(&tensor);
        assert_eq!(matrix.r2[[0, 1]], 1.0);
        assert_eq!(matrix.rmse[[0, 1]], 0.0);
        assert!(matrix.r2[[1, 0]].is_nan());
    }

    #[test]
    fn table_has_one_row_per_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.tsv");
        let matrix = PerformanceMatrix {
            years: vec![2010, 2011],
            r2: Array2::from_elem((2, 2), 0.5),
            rmse: Array2::from_elem((2, 2), 1.25),
        };
        write_performance(&path, &matrix).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "train_year\teval_year\tr2\trmse");
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[2], "2010\t2011\t0.5\t1.25");
    }
}
