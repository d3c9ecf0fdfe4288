//! Bagged regression trees.
//!
//! Trees are grown depth first with variance-reduction splits. Each tree draws its
//! bootstrap sample and feature subsets from its own generator, seeded from the forest
//! seed and the tree index, so a fit is reproducible regardless of how rayon schedules
//! the trees.

use crate::forecast::error::ForecastError;
use crate::shared::config::ConfigError;
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

fn default_n_estimators() -> usize {
    100
}
fn default_max_depth() -> Option<usize> {
    Some(5)
}
fn default_min_samples_split() -> usize {
    2
}
fn default_min_samples_leaf() -> usize {
    1
}
fn default_bootstrap() -> bool {
    true
}
fn default_infinity_clamp() -> f64 {
    100.0
}

/// Hyperparameters shared by every model the evaluator fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForestParams {
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: Option<usize>,
    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,
    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,
    /// Fraction of features considered at each split; all features when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_features: Option<f64>,
    #[serde(default = "default_bootstrap")]
    pub bootstrap: bool,
    #[serde(default)]
    pub seed: u64,
    /// Magnitude that infinite features are clamped to before fitting or predicting.
    #[serde(default = "default_infinity_clamp")]
    pub infinity_clamp: f64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: default_n_estimators(),
            max_depth: default_max_depth(),
            min_samples_split: default_min_samples_split(),
            min_samples_leaf: default_min_samples_leaf(),
            max_features: None,
            bootstrap: default_bootstrap(),
            seed: 0,
            infinity_clamp: default_infinity_clamp(),
        }
    }
}

impl ForestParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_estimators == 0 {
            return Err(ConfigError::Invalid("n_estimators must be at least 1".to_string()));
        }
        if self.min_samples_split < 2 {
            return Err(ConfigError::Invalid("min_samples_split must be at least 2".to_string()));
        }
        if self.min_samples_leaf == 0 {
            return Err(ConfigError::Invalid("min_samples_leaf must be at least 1".to_string()));
        }
        if let Some(fraction) = self.max_features {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "max_features must be within (0, 1], got {fraction}"
                )));
            }
        }
        if !(self.infinity_clamp.is_finite() && self.infinity_clamp > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "infinity_clamp must be a positive finite number, got {}",
                self.infinity_clamp
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub feature: usize,
    /// Rows with `x[feature] <= threshold` go left.
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub value: f64,
    pub n_samples: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<Split>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = &self.nodes[0];
        while let Some(split) = &node.split {
            let next = if row[split.feature] <= split.threshold {
                split.left
            } else {
                split.right
            };
            node = &self.nodes[next];
        }
        node.value
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match &nodes[at].split {
                Some(split) => 1 + walk(nodes, split.left).max(walk(nodes, split.right)),
                None => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub n_features: usize,
    /// Impurity-based importances, normalized to sum to one (all zero when no tree
    /// could split).
    pub importances: Vec<f64>,
    pub trees: Vec<Tree>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    position: usize,
    gain: f64,
}

/// Grows one tree over the rows listed in `sample`; returns the tree and the raw
/// impurity decrease accumulated per feature.
fn grow_tree(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    sample: Vec<usize>,
    params: &ForestParams,
    rng: &mut StdRng,
) -> (Tree, Vec<f64>) {
    let n_features = x.ncols();
    let n_candidates = params
        .max_features
        .map(|f| ((f * n_features as f64).round() as usize).clamp(1, n_features))
        .unwrap_or(n_features);
    let mut decrease = vec![0.0; n_features];
    let mut nodes: Vec<Node> = Vec::new();
    // (node slot, rows, depth)
    let mut stack = vec![(0usize, sample, 0usize)];
    nodes.push(Node {
        value: 0.0,
        n_samples: 0,
        split: None,
    });

    while let Some((slot, mut rows, depth)) = stack.pop() {
        let n = rows.len();
        let sum: f64 = rows.iter().map(|&i| y[i]).sum();
        nodes[slot].value = sum / n as f64;
        nodes[slot].n_samples = n;

        let depth_ok = params.max_depth.is_none_or(|max| depth < max);
        if !depth_ok || n < params.min_samples_split || n < 2 * params.min_samples_leaf {
            continue;
        }
        let features: Vec<usize> = if n_candidates < n_features {
            rand::seq::index::sample(rng, n_features, n_candidates).into_vec()
        } else {
            (0..n_features).collect()
        };

        let parent_score = sum * sum / n as f64;
        let mut best: Option<BestSplit> = None;
        for &feature in &features {
            rows.sort_by(|&a, &b| x[[a, feature]].total_cmp(&x[[b, feature]]));
            let mut left_sum = 0.0;
            for position in 1..n {
                left_sum += y[rows[position - 1]];
                if position < params.min_samples_leaf || n - position < params.min_samples_leaf {
                    continue;
                }
                let lo = x[[rows[position - 1], feature]];
                let hi = x[[rows[position], feature]];
                if lo >= hi {
                    continue;
                }
                let right_sum = sum - left_sum;
                let gain = left_sum * left_sum / position as f64
                    + right_sum * right_sum / (n - position) as f64
                    - parent_score;
                if gain > best.as_ref().map_or(1e-12, |b| b.gain) {
                    let mid = lo + (hi - lo) / 2.0;
                    best = Some(BestSplit {
                        feature,
                        threshold: if mid < hi { mid } else { lo },
                        position,
                        gain,
                    });
                }
            }
        }

        let Some(best) = best else {
            continue;
        };
        decrease[best.feature] += best.gain;
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&i| x[[i, best.feature]] <= best.threshold);
        debug_assert_eq!(left_rows.len(), best.position);
        let left = nodes.len();
        let right = left + 1;
        for _ in 0..2 {
            nodes.push(Node {
                value: 0.0,
                n_samples: 0,
                split: None,
            });
        }
        nodes[slot].split = Some(Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        });
        stack.push((right, right_rows, depth + 1));
        stack.push((left, left_rows, depth + 1));
    }
    (Tree { nodes }, decrease)
}

fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed ^ (tree as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn normalize(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        values.iter_mut().for_each(|v| *v /= total);
    }
}

impl RandomForest {
    /// Fits a forest to a sanitized feature matrix (no `NaN`, no infinities).
    pub fn fit(x: ArrayView2<f64>, y: ArrayView1<f64>, params: &ForestParams) -> Result<Self, ForecastError> {
        params.validate()?;
        if x.nrows() == 0 {
            return Err(ForecastError::EmptyTable);
        }
        if x.nrows() != y.len() {
            return Err(ForecastError::InvalidValue {
                column: "target".to_string(),
                row: y.len(),
                value: format!("{} targets for {} feature rows", y.len(), x.nrows()),
            });
        }
        let n = x.nrows();
        let grown: Vec<(Tree, Vec<f64>)> = (0..params.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(tree_seed(params.seed, t));
                let sample: Vec<usize> = if params.bootstrap {
                    (0..n).map(|_| rng.gen_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                let (tree, mut decrease) = grow_tree(x, y, sample, params, &mut rng);
                normalize(&mut decrease);
                (tree, decrease)
            })
            .collect();

        let mut importances = vec![0.0; x.ncols()];
        let mut trees = Vec::with_capacity(grown.len());
        for (tree, decrease) in grown {
            for (total, value) in importances.iter_mut().zip(decrease) {
                *total += value;
            }
            trees.push(tree);
        }
        normalize(&mut importances);
        log::debug!(
            "Fitted {} trees on {} rows x {} features",
            trees.len(),
            n,
            x.ncols()
        );
        Ok(Self {
            n_features: x.ncols(),
            importances,
            trees,
        })
    }

    /// Mean prediction of all trees for every row of `x`.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ForecastError> {
        if x.ncols() != self.n_features {
            return Err(ForecastError::MismatchedFeatureCount {
                found: x.ncols(),
                expected: self.n_features,
            });
        }
        let mut out = Array1::zeros(x.nrows());
        let scale = 1.0 / self.trees.len() as f64;
        Zip::from(&mut out).and(x.rows()).par_for_each(|value, row| {
            *value = self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() * scale;
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn step_data() -> (Array2<f64>, Array1<f64>) {
        let n = 200;
        let x = Array2::from_shape_fn((n, 3), |(i, j)| match j {
            0 => i as f64 / n as f64,
            1 => ((i * 37) % 101) as f64,
            _ => ((i * 53) % 17) as f64,
        });
        let y = Array1::from_shape_fn(n, |i| if (i as f64 / n as f64) < 0.5 { 1.0 } else { 5.0 });
        (x, y)
    }

    #[test]
    fn fits_step_function_and_ranks_informative_feature() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 20,
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(x.view(), y.view(), &params).unwrap();
        let predicted = forest.predict(x.view()).unwrap();
        for (p, t) in predicted.iter().zip(y.iter()) {
            assert!((p - t).abs() < 0.5, "{p} vs {t}");
        }
        assert!(forest.importances[0] > 0.9, "{:?}", forest.importances);
        let total: f64 = forest.importances.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(forest.trees.iter().all(|t| t.depth() <= 5));
    }

    #[test]
    fn same_seed_gives_identical_forest() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 8,
            max_features: Some(0.5),
            seed: 42,
            ..ForestParams::default()
        };
        let a = RandomForest::fit(x.view(), y.view(), &params).unwrap();
        let b = RandomForest::fit(x.view(), y.view(), &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn constant_target_gives_single_leaf_trees() {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| (i + j) as f64);
        let y = Array1::from_elem(10, 3.0);
        let forest = RandomForest::fit(x.view(), y.view(), &ForestParams::default()).unwrap();
        assert!(forest.trees.iter().all(|t| t.nodes.len() == 1));
        assert!(forest.importances.iter().all(|&v| v == 0.0));
        assert_eq!(forest.predict(x.view()).unwrap()[3], 3.0);
    }

    #[test]
    fn wrong_width_is_rejected() {
        let (x, y) = step_data();
        let forest = RandomForest::fit(
            x.view(),
            y.view(),
            &ForestParams {
                n_estimators: 2,
                ..ForestParams::default()
            },
        )
        .unwrap();
        let narrow = Array2::zeros((3, 2));
        assert!(matches!(
            forest.predict(narrow.view()),
            Err(ForecastError::MismatchedFeatureCount { found: 2, expected: 3 })
        ));
    }

    #[test]
    fn params_parse_with_defaults() {
        let params: ForestParams = toml::from_str("n_estimators = 10\nseed = 3").unwrap();
        assert_eq!(params.max_depth, Some(5));
        assert_eq!(params.infinity_clamp, 100.0);
        assert!(toml::from_str::<ForestParams>("depth = 3").is_err());
    }
}
