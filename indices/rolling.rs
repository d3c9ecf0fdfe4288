//! Trailing window sums along the time axis.

use crate::grid::dataset::{GridDataset, Variable, VariableAttrs};
use crate::indices::engine::IndexError;
use ndarray::{Array3, ArrayView3, Axis, Zip};

/// Trailing sum over `window` steps for every cell.
///
/// The first `window - 1` steps and every window that contains a `NaN` are `NaN`. The
/// window must be non-zero and shorter than the time axis.
pub fn rolling_sum(values: ArrayView3<f64>, window: usize) -> Result<Array3<f64>, IndexError> {
    let steps = values.len_of(Axis(2));
    if window == 0 {
        return Err(IndexError::EmptyWindow);
    }
    if window >= steps {
        return Err(IndexError::WindowTooLarge { window, steps });
    }
    let mut out = Array3::from_elem(values.raw_dim(), f64::NAN);
    Zip::from(out.lanes_mut(Axis(2)))
        .and(values.lanes(Axis(2)))
        .par_for_each(|mut sums, series| {
            for end in window..=steps {
                let total: f64 = series.slice(ndarray::s![end - window..end]).sum();
                sums[end - 1] = total;
            }
        });
    Ok(out)
}

fn precip_attrs(ds: &GridDataset, precip: &str) -> Result<VariableAttrs, IndexError> {
    Ok(VariableAttrs {
        units: ds.variable(precip)?.attrs.units.clone(),
        long_name: None,
    })
}

/// Rolling precipitation total.
pub fn pr(ds: &GridDataset, window: usize, precip: &str) -> Result<Variable, IndexError> {
    let data = rolling_sum(ds.values(precip)?, window)?;
    Ok(Variable::new(data, precip_attrs(ds, precip)?))
}

/// Rolling climatic water balance: precipitation minus evapotranspiration, summed.
pub fn pret(ds: &GridDataset, window: usize, precip: &str, et: &str) -> Result<Variable, IndexError> {
    let balance = &ds.values(precip)? - &ds.values(et)?;
    let data = rolling_sum(balance.view(), window)?;
    Ok(Variable::new(data, precip_attrs(ds, precip)?))
}
