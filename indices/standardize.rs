//! Standardized indices: per-cell distribution fits mapped onto the normal scale.
//!
//! Every cell is fitted independently from its own reference series; no parameter is
//! ever shared across the grid. Cells are processed in parallel.

use crate::grid::dataset::{Variable, VariableAttrs};
use crate::indices::distribution::{Distribution, FitError};
use crate::indices::probability::normal_ppf;
use ndarray::{Array3, ArrayView1, ArrayView3, ArrayViewMut1, Axis, Zip};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const STANDARDIZED_UNITS: &str = "standard deviations";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StandardizeOptions {
    pub distribution: Distribution,
    /// Fit only the strictly positive reference values (location fixed at zero) and
    /// blend in the observed probability of an exact zero.
    pub zero_inflation: bool,
}

impl StandardizeOptions {
    pub fn spi() -> Self {
        Self {
            distribution: Distribution::Gamma,
            zero_inflation: true,
        }
    }

    pub fn spei(distribution: Distribution) -> Self {
        Self {
            distribution,
            zero_inflation: false,
        }
    }
}

/// Cumulative probabilities of `focal` under a fit to `reference`.
///
/// `NaN` entries of `reference` are ignored. When every reference value is `NaN` the
/// result is all `NaN`.
pub fn cumulative_probabilities(
    focal: &[f64],
    reference: &[f64],
    options: StandardizeOptions,
) -> Result<Vec<f64>, FitError> {
    let sample: Vec<f64> = reference.iter().copied().filter(|v| !v.is_nan()).collect();
    if sample.is_empty() {
        return Ok(vec![f64::NAN; focal.len()]);
    }
    let dist = options.distribution;
    if options.zero_inflation {
        let p0 = sample.iter().filter(|&&v| v == 0.0).count() as f64 / sample.len() as f64;
        let positive: Vec<f64> = sample.into_iter().filter(|&v| v > 0.0).collect();
        let params = dist.fit(&positive, Some(0.0))?;
        Ok(focal
            .iter()
            .map(|&x| {
                if x == 0.0 {
                    p0
                } else {
                    p0 + (1.0 - p0) * dist.cdf(&params, x)
                }
            })
            .collect())
    } else {
        let params = dist.fit(&sample, None)?;
        Ok(focal.iter().map(|&x| dist.cdf(&params, x)).collect())
    }
}

fn standardize_cell(
    mut out: ArrayViewMut1<f64>,
    focal: ArrayView1<f64>,
    reference: ArrayView1<f64>,
    options: StandardizeOptions,
) -> Result<(), FitError> {
    let focal = focal.to_vec();
    let reference = reference.to_vec();
    let probabilities = cumulative_probabilities(&focal, &reference, options)?;
    for (slot, p) in out.iter_mut().zip(probabilities) {
        *slot = normal_ppf(p);
    }
    Ok(())
}

/// Standardizes every cell of `focal` against the matching cell of `reference`.
///
/// Cells whose reference sample cannot be fitted (too few or identical values) are
/// left as `NaN`.
pub fn standardize(
    focal: ArrayView3<f64>,
    reference: ArrayView3<f64>,
    options: StandardizeOptions,
) -> Array3<f64> {
    let mut out = Array3::from_elem(focal.raw_dim(), f64::NAN);
    let failed = AtomicUsize::new(0);
    Zip::from(out.lanes_mut(Axis(2)))
        .and(focal.lanes(Axis(2)))
        .and(reference.lanes(Axis(2)))
        .par_for_each(|cell_out, cell_focal, cell_reference| {
            if let Err(e) = standardize_cell(cell_out, cell_focal, cell_reference, options) {
                log::debug!("Leaving cell unfitted: {e}");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });
    let failed = failed.into_inner();
    if failed > 0 {
        log::warn!(
            "{failed} of {} cells could not be fitted with the {} distribution and are NaN",
            focal.len_of(Axis(0)) * focal.len_of(Axis(1)),
            options.distribution.name()
        );
    }
    out
}

fn standardized(data: Array3<f64>) -> Variable {
    Variable::new(data, VariableAttrs::with_units(STANDARDIZED_UNITS))
}

/// Standardized precipitation index: zero-inflated gamma with location fixed at zero.
pub fn spi(focal: ArrayView3<f64>, reference: ArrayView3<f64>) -> Variable {
    standardized(standardize(focal, reference, StandardizeOptions::spi()))
}

/// Standardized precipitation-evapotranspiration index: free-location fit, no zero
/// inflation.
pub fn spei(focal: ArrayView3<f64>, reference: ArrayView3<f64>, distribution: Distribution) -> Variable {
    standardized(standardize(focal, reference, StandardizeOptions::spei(distribution)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_focal_maps_to_zero_probability_mass() {
        let mut reference = vec![0.0; 3];
        reference.extend([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let probs =
            cumulative_probabilities(&[0.0, 3.0, f64::NAN], &reference, StandardizeOptions::spi()).unwrap();
        assert_eq!(probs[0], 0.3);
        assert!(probs[1] > 0.3 && probs[1] < 1.0);
        assert!(probs[2].is_nan());
    }

    #[test]
    fn negative_reference_values_are_left_out_of_the_fit() {
        let positive = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let mut reference = vec![0.0, 0.0, 0.0];
        reference.extend(positive);
        let clean = cumulative_probabilities(&[3.0], &reference, StandardizeOptions::spi()).unwrap();
        reference.push(-2.0);
        let dirty = cumulative_probabilities(&[0.0, 3.0], &reference, StandardizeOptions::spi()).unwrap();
        let p0 = 3.0 / 11.0;
        assert_eq!(dirty[0], p0);
        assert!(dirty[1].is_finite());
        // the fitted gamma is identical, only the zero fraction moves
        let cdf = (clean[0] - 0.3) / 0.7;
        assert!((dirty[1] - (p0 + (1.0 - p0) * cdf)).abs() < 1e-12);
    }

    #[test]
    fn unfittable_cells_are_nan() {
        let focal = Array3::from_elem((1, 2, 3), 1.0);
        let mut reference = Array3::from_elem((1, 2, 4), 2.0);
        reference[[0, 1, 0]] = 1.0;
        reference[[0, 1, 1]] = 3.0;
        let out = standardize(focal.view(), reference.view(), StandardizeOptions::spi());
        assert!(out.slice(ndarray::s![0, 0, ..]).iter().all(|v| v.is_nan()));
        assert!(out.slice(ndarray::s![0, 1, ..]).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn output_has_standard_units() {
        let focal = Array3::from_shape_fn((1, 1, 3), |(_, _, t)| t as f64 + 1.0);
        let reference = Array3::from_shape_fn((1, 1, 6), |(_, _, t)| t as f64 * 2.0 - 3.0);
        let var = spei(focal.view(), reference.view(), Distribution::Gamma);
        assert_eq!(var.attrs.units.as_deref(), Some(STANDARDIZED_UNITS));
        assert_eq!(var.data.dim(), (1, 1, 3));
    }
}
