//! Probability models fitted to per-cell reference samples.

use crate::indices::probability::{digamma, ln_gamma, regularized_gamma, trigamma};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

const NEWTON_TOL: f64 = 1e-10;
const NEWTON_MAX_ITER: usize = 100;
const GOLDEN_MAX_ITER: usize = 200;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Need at least {needed} usable values to fit, found {found}")]
    TooFewValues { needed: usize, found: usize },
    #[error("Sample contains non-finite value {0}")]
    NonFinite(f64),
    #[error("Sample has no spread; all values equal {0}")]
    Degenerate(f64),
    #[error("Value {value} lies outside the support above location {location}")]
    OutOfSupport { value: f64, location: f64 },
    #[error("Shape estimate did not converge (last estimate {0})")]
    NoConvergence(f64),
    #[error("The {0} fit does not support a fixed location")]
    FixedLocationUnsupported(&'static str),
}

/// Closed set of distribution families available to the standardized indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    #[default]
    Gamma,
    /// Three-parameter log-logistic.
    Fisk,
}

/// Fitted parameters. For the gamma family `shape` is `a` and `scale` is `theta`; for
/// the log-logistic family `shape` is `beta` and `scale` is `alpha`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Params {
    pub shape: f64,
    pub scale: f64,
    pub location: f64,
}

impl Distribution {
    pub fn name(self) -> &'static str {
        match self {
            Self::Gamma => "gamma",
            Self::Fisk => "fisk",
        }
    }

    /// Fits the family to `sample`. With `location = Some(loc)` the location is held
    /// fixed; otherwise it is estimated.
    pub fn fit(self, sample: &[f64], location: Option<f64>) -> Result<Params, FitError> {
        check_sample(sample)?;
        match (self, location) {
            (Self::Gamma, Some(loc)) => fit_gamma_fixed(sample, loc),
            (Self::Gamma, None) => fit_gamma_free(sample),
            (Self::Fisk, Some(_)) => Err(FitError::FixedLocationUnsupported(self.name())),
            (Self::Fisk, None) => fit_fisk(sample),
        }
    }

    pub fn cdf(self, params: &Params, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        let y = x - params.location;
        if y <= 0.0 {
            return 0.0;
        }
        match self {
            Self::Gamma => regularized_gamma(params.shape, y / params.scale).0,
            Self::Fisk => 1.0 / (1.0 + (params.scale / y).powf(params.shape)),
        }
    }
}

fn check_sample(sample: &[f64]) -> Result<(), FitError> {
    if sample.len() < 2 {
        return Err(FitError::TooFewValues {
            needed: 2,
            found: sample.len(),
        });
    }
    if let Some(&bad) = sample.iter().find(|v| !v.is_finite()) {
        return Err(FitError::NonFinite(bad));
    }
    let first = sample[0];
    if sample.iter().all(|&v| v == first) {
        return Err(FitError::Degenerate(first));
    }
    Ok(())
}

/// Gamma log-likelihood and shape/scale estimates for a fixed location.
struct GammaFit {
    shape: f64,
    scale: f64,
    log_likelihood: f64,
}

fn gamma_mle(sample: &[f64], location: f64) -> Result<GammaFit, FitError> {
    let n = sample.len() as f64;
    let mut sum = 0.0;
    let mut sum_ln = 0.0;
    for &v in sample {
        let y = v - location;
        if y <= 0.0 {
            return Err(FitError::OutOfSupport { value: v, location });
        }
        sum += y;
        sum_ln += y.ln();
    }
    let mean = sum / n;
    let s = mean.ln() - sum_ln / n;
    if s <= 0.0 || !s.is_finite() {
        return Err(FitError::Degenerate(mean + location));
    }

    // Newton iteration on ln(a) - digamma(a) = s, started from the Thom estimate.
    let mut shape = (3.0 - s + ((s - 3.0).powi(2) + 24.0 * s).sqrt()) / (12.0 * s);
    let mut converged = false;
    for _ in 0..NEWTON_MAX_ITER {
        let f = shape.ln() - digamma(shape) - s;
        let df = 1.0 / shape - trigamma(shape);
        let mut next = shape - f / df;
        if next <= 0.0 || !next.is_finite() {
            next = shape / 2.0;
        }
        let step = (next - shape).abs();
        shape = next;
        if step <= NEWTON_TOL * shape {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(FitError::NoConvergence(shape));
    }
    let scale = mean / shape;
    let log_likelihood =
        (shape - 1.0) * sum_ln - sum / scale - n * (ln_gamma(shape) + shape * scale.ln());
    Ok(GammaFit {
        shape,
        scale,
        log_likelihood,
    })
}

fn fit_gamma_fixed(sample: &[f64], location: f64) -> Result<Params, FitError> {
    let fit = gamma_mle(sample, location)?;
    Ok(Params {
        shape: fit.shape,
        scale: fit.scale,
        location,
    })
}

/// Profile likelihood over the location: for each candidate offset `d` below the
/// sample minimum the shape and scale are fitted by maximum likelihood, and `ln d` is
/// chosen by golden-section search.
fn fit_gamma_free(sample: &[f64]) -> Result<Params, FitError> {
    let min = sample.iter().copied().fold(f64::INFINITY, f64::min);
    let n = sample.len() as f64;
    let mean = sample.iter().sum::<f64>() / n;
    let sd = (sample.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

    let profile = |log_offset: f64| -> f64 {
        let location = min - log_offset.exp();
        gamma_mle(sample, location)
            .map(|fit| fit.log_likelihood)
            .unwrap_or(f64::NEG_INFINITY)
    };

    let inv_phi = (5f64.sqrt() - 1.0) / 2.0;
    let mut lo = (sd * 1e-3).ln();
    let mut hi = (sd * 1e3).ln();
    let mut x1 = hi - inv_phi * (hi - lo);
    let mut x2 = lo + inv_phi * (hi - lo);
    let mut f1 = profile(x1);
    let mut f2 = profile(x2);
    for _ in 0..GOLDEN_MAX_ITER {
        if (hi - lo).abs() < 1e-8 {
            break;
        }
        if f1 >= f2 {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - inv_phi * (hi - lo);
            f1 = profile(x1);
        } else {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + inv_phi * (hi - lo);
            f2 = profile(x2);
        }
    }
    let location = min - (0.5 * (lo + hi)).exp();
    fit_gamma_fixed(sample, location)
}

/// Probability-weighted-moment fit of the three-parameter log-logistic distribution.
fn fit_fisk(sample: &[f64]) -> Result<Params, FitError> {
    let mut sorted = sample.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let mut w = [0.0f64; 3];
    for (i, &x) in sorted.iter().enumerate() {
        let f = (i as f64 + 1.0 - 0.35) / n;
        let tail = 1.0 - f;
        w[0] += x;
        w[1] += tail * x;
        w[2] += tail * tail * x;
    }
    for value in &mut w {
        *value /= n;
    }
    let shape = (2.0 * w[1] - w[0]) / (6.0 * w[1] - w[0] - 6.0 * w[2]);
    if !shape.is_finite() || shape <= 1.0 {
        return Err(FitError::NoConvergence(shape));
    }
    // Gamma(1 + 1/b) * Gamma(1 - 1/b) = (pi / b) / sin(pi / b)
    let g = (PI / shape) / (PI / shape).sin();
    let scale = (w[0] - 2.0 * w[1]) * shape / g;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(FitError::Degenerate(w[0]));
    }
    Ok(Params {
        shape,
        scale,
        location: w[0] - scale * g,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution as Sampler, Gamma};

    fn gamma_sample(shape: f64, scale: f64, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Gamma::new(shape, scale).unwrap();
        (0..n).map(|_| dist.sample(&mut rng)).collect()
    }

    #[test]
    fn fixed_location_gamma_recovers_parameters() {
        let sample = gamma_sample(2.5, 4.0, 5000, 7);
        let params = Distribution::Gamma.fit(&sample, Some(0.0)).unwrap();
        assert!((params.shape - 2.5).abs() < 0.15, "shape {}", params.shape);
        assert!((params.scale - 4.0).abs() < 0.3, "scale {}", params.scale);
        assert_eq!(params.location, 0.0);
    }

    #[test]
    fn free_location_gamma_tracks_shift() {
        let sample: Vec<f64> = gamma_sample(4.0, 2.0, 4000, 11).into_iter().map(|v| v - 20.0).collect();
        let params = Distribution::Gamma.fit(&sample, None).unwrap();
        let min = sample.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(params.location < min);
        let median = Distribution::Gamma.cdf(&params, -20.0 + 4.0 * 2.0 - 0.667);
        assert!((median - 0.5).abs() < 0.05, "cdf near median {median}");
    }

    #[test]
    fn fisk_cdf_is_monotone_within_unit_interval() {
        let sample = gamma_sample(3.0, 10.0, 500, 3);
        let params = Distribution::Fisk.fit(&sample, None).unwrap();
        let mut previous = 0.0;
        for x in [5.0, 10.0, 20.0, 30.0, 60.0, 120.0] {
            let p = Distribution::Fisk.cdf(&params, x);
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= previous);
            previous = p;
        }
        assert!(matches!(
            Distribution::Fisk.fit(&sample, Some(0.0)),
            Err(FitError::FixedLocationUnsupported(_))
        ));
    }

    #[test]
    fn degenerate_samples_are_rejected() {
        assert!(matches!(
            Distribution::Gamma.fit(&[3.0], Some(0.0)),
            Err(FitError::TooFewValues { .. })
        ));
        assert!(matches!(
            Distribution::Gamma.fit(&[2.0, 2.0, 2.0], Some(0.0)),
            Err(FitError::Degenerate(_))
        ));
        assert!(matches!(
            Distribution::Gamma.fit(&[-1.0, 2.0, 3.0], Some(0.0)),
            Err(FitError::OutOfSupport { .. })
        ));
    }

    #[test]
    fn cdf_below_location_is_zero() {
        let params = Params {
            shape: 2.0,
            scale: 1.0,
            location: 0.0,
        };
        assert_eq!(Distribution::Gamma.cdf(&params, -1.0), 0.0);
        assert!(Distribution::Gamma.cdf(&params, f64::NAN).is_nan());
        assert_eq!(Distribution::Gamma.cdf(&params, f64::INFINITY), 1.0);
    }
}
