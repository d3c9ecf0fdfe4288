//! Spatial fold and cell-identifier assignment.
//!
//! Cells are grouped into square blocks of `grid_size × grid_size`; every block is one
//! fold. Identifiers number the cells in row-major order and never depend on the fold
//! layout.

use crate::grid::dataset::{GridDataset, GridError, Variable, VariableAttrs};
use crate::shared::config::ConfigError;
use ndarray::{Array2, Array3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;

pub const FOLD_VARIABLE: &str = "fold";
pub const ID_VARIABLE: &str = "id";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FoldConfig {
    /// Side length of a fold block, in cells.
    pub grid_size: usize,
    /// Shuffle fold ids across the grid so neighbouring blocks do not share structure.
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub seed: u64,
}

impl FoldConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_size == 0 {
            return Err(ConfigError::Invalid("grid_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Fold and id arrays, both shaped `rows × cols`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    pub fold: Array2<i64>,
    pub id: Array2<i64>,
}

impl FoldAssignment {
    /// Number of distinct fold ids.
    pub fn num_folds(&self) -> usize {
        let mut folds: Vec<i64> = self.fold.iter().copied().collect();
        folds.sort_unstable();
        folds.dedup();
        folds.len()
    }
}

/// Builds the block fold layout for a `rows × cols` grid.
///
/// `fold = col / grid_size + (max_col_block + 1) * (row / grid_size)`. When `shuffle`
/// holds a seed the fold array is permuted with [`shuffle_folds`].
pub fn make_folds(
    rows: usize,
    cols: usize,
    grid_size: usize,
    shuffle: Option<u64>,
) -> Result<FoldAssignment, ConfigError> {
    if grid_size == 0 {
        return Err(ConfigError::Invalid("grid_size must be at least 1".to_string()));
    }
    if rows == 0 || cols == 0 {
        return Err(ConfigError::Invalid(format!(
            "cannot assign folds to an empty {rows}x{cols} grid"
        )));
    }
    let blocks_per_row = ((cols - 1) / grid_size + 1) as i64;
    let fold = Array2::from_shape_fn((rows, cols), |(r, c)| {
        (c / grid_size) as i64 + blocks_per_row * (r / grid_size) as i64
    });
    let id = Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as i64);
    let fold = match shuffle {
        Some(seed) => shuffle_folds(seed, &fold),
        None => fold,
    };
    Ok(FoldAssignment { fold, id })
}

/// Permutes every entry of `folds` with a generator seeded from `seed` alone.
pub fn shuffle_folds(seed: u64, folds: &Array2<i64>) -> Array2<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut flat: Vec<i64> = folds.iter().copied().collect();
    flat.shuffle(&mut rng);
    Array2::from_shape_vec(folds.raw_dim(), flat)
        .unwrap_or_else(|_| unreachable!("permutation keeps the element count"))
}

fn broadcast(values: &Array2<i64>, steps: usize) -> Array3<f64> {
    Array3::from_shape_fn((values.nrows(), values.ncols(), steps), |(r, c, _)| {
        values[[r, c]] as f64
    })
}

/// Appends `fold` and `id` variables (constant along time) to `dataset`.
pub fn append_folds(dataset: &mut GridDataset, config: &FoldConfig) -> Result<FoldAssignment, GridError> {
    dataset.ensure_non_empty()?;
    let (rows, cols, steps) = dataset.shape();
    let seed = config.shuffle.then_some(config.seed);
    let assignment = make_folds(rows, cols, config.grid_size, seed)?;
    log::info!(
        "Assigned {} folds of {}x{} cells{}",
        assignment.num_folds(),
        config.grid_size,
        config.grid_size,
        if config.shuffle { " (shuffled)" } else { "" }
    );
    dataset.insert(
        FOLD_VARIABLE,
        Variable::new(
            broadcast(&assignment.fold, steps),
            VariableAttrs {
                units: None,
                long_name: Some("fold".to_string()),
            },
        ),
    )?;
    dataset.insert(
        ID_VARIABLE,
        Variable::new(
            broadcast(&assignment.id, steps),
            VariableAttrs {
                units: None,
                long_name: Some("cell identifier".to_string()),
            },
        ),
    )?;
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn blocks_on_uneven_grid() {
        let folds = make_folds(3, 5, 2, None).unwrap();
        assert_eq!(
            folds.fold,
            array![[0, 0, 1, 1, 2], [0, 0, 1, 1, 2], [3, 3, 4, 4, 5]]
        );
        assert_eq!(folds.num_folds(), 6);
    }

    #[test]
    fn shuffle_keeps_fold_multiset() {
        let plain = make_folds(6, 6, 3, None).unwrap();
        let shuffled = make_folds(6, 6, 3, Some(0)).unwrap();
        let mut a: Vec<i64> = plain.fold.iter().copied().collect();
        let mut b: Vec<i64> = shuffled.fold.iter().copied().collect();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
        assert_eq!(plain.id, shuffled.id);
    }

    #[test]
    fn zero_grid_size_is_rejected() {
        assert!(make_folds(4, 4, 0, None).is_err());
        let config = FoldConfig {
            grid_size: 0,
            shuffle: false,
            seed: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn appended_variables_are_constant_in_time() {
        let mut ds = GridDataset::new(vec![1.0, 2.0], vec![1.0, 2.0], "year", vec![2000, 2001, 2002]).unwrap();
        let config = FoldConfig {
            grid_size: 1,
            shuffle: false,
            seed: 0,
        };
        append_folds(&mut ds, &config).unwrap();
        let id = ds.values(ID_VARIABLE).unwrap();
        for t in 0..3 {
            assert_eq!(id[[1, 0, t]], 2.0);
        }
        assert_eq!(ds.values(FOLD_VARIABLE).unwrap()[[1, 1, 2]], 3.0);
    }
}
