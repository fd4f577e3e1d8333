//! # Weighted kernel density estimation
//!
//! Gaussian-kernel density estimates over weighted one-dimensional samples.
//! Densities are evaluated in log space so that values far outside the
//! observed range produce finite, strongly negative log-densities instead of
//! underflowing to zero.

use serde::{Deserialize, Serialize};

use crate::utils::{log_sum_exp, weighted_mean_std, weighted_quantile};

const IQR_TO_SIGMA: f64 = 1.34;
const RELATIVE_BANDWIDTH_FLOOR: f64 = 1.0e-6;
const LN_SQRT_TAU: f64 = 0.918_938_533_204_672_8;

/// Bandwidth selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthRule {
    /// `0.9 * min(sigma, IQR / 1.34) * n^(-1/5)`.
    #[default]
    Silverman,
    /// `1.06 * sigma * n^(-1/5)`.
    Scott,
    /// Fixed bandwidth, still subject to the positivity floor.
    Fixed(f64),
}

impl BandwidthRule {
    #[must_use]
    pub fn is_valid(self) -> bool {
        match self {
            Self::Silverman | Self::Scott => true,
            Self::Fixed(value) => value > 0.0 && value.is_finite(),
        }
    }

    /// Bandwidth for the given weighted sample.
    ///
    /// Always strictly positive and finite for finite input with positive total weight.
    #[must_use]
    pub fn bandwidth(self, values: &[f64], weights: &[f64]) -> f64 {
        let (mean, sigma) = weighted_mean_std(values, weights);
        let floor = RELATIVE_BANDWIDTH_FLOOR * (1.0 + mean.abs());
        let n_eff = effective_count(weights);
        let raw = match self {
            Self::Silverman => {
                let iqr = weighted_quantile(values, weights, 0.75)
                    - weighted_quantile(values, weights, 0.25);
                let spread = if iqr > 0.0 {
                    sigma.min(iqr / IQR_TO_SIGMA)
                } else {
                    sigma
                };
                0.9 * spread * n_eff.powf(-0.2)
            }
            Self::Scott => 1.06 * sigma * n_eff.powf(-0.2),
            Self::Fixed(value) => value,
        };
        if raw.is_finite() && raw > floor {
            raw
        } else if floor.is_finite() {
            floor
        } else {
            RELATIVE_BANDWIDTH_FLOOR
        }
    }
}

/// Kish effective sample size `(sum w)^2 / sum w^2`.
#[must_use]
pub fn effective_count(weights: &[f64]) -> f64 {
    let total = weights.iter().sum::<f64>();
    let squares = weights.iter().map(|weight| weight * weight).sum::<f64>();
    if squares <= 0.0 {
        0.0
    } else {
        (total * total / squares).max(1.0)
    }
}

/// Weighted Gaussian KDE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedKde {
    pub bandwidth: f64,
    /// Log of the normalizing weight sum.
    pub log_total_weight: f64,
    pub points: Vec<f64>,
    /// Log weights aligned with `points`; zero-weight samples are dropped.
    pub log_weights: Vec<f64>,
}

impl WeightedKde {
    /// Build a KDE from samples and non-negative weights.
    ///
    /// Samples with zero weight are discarded. Returns `None` when no sample
    /// carries positive weight.
    #[must_use]
    pub fn fit(values: &[f64], weights: &[f64], rule: BandwidthRule) -> Option<Self> {
        let (points, kept_weights): (Vec<f64>, Vec<f64>) = values
            .iter()
            .copied()
            .zip(weights.iter().copied())
            .filter(|(value, weight)| *weight > 0.0 && value.is_finite())
            .unzip();
        if points.is_empty() {
            return None;
        }
        let bandwidth = rule.bandwidth(&points, &kept_weights);
        let total = kept_weights.iter().sum::<f64>();
        Some(Self {
            bandwidth,
            log_total_weight: total.ln(),
            points,
            log_weights: kept_weights.iter().map(|weight| weight.ln()).collect(),
        })
    }

    /// Unweighted KDE.
    #[must_use]
    pub fn fit_unweighted(values: &[f64], rule: BandwidthRule) -> Option<Self> {
        Self::fit(values, &vec![1.0; values.len()], rule)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Log-density at `x`.
    #[must_use]
    pub fn log_density(&self, x: f64) -> f64 {
        let ln_h = self.bandwidth.ln();
        let terms = self
            .points
            .iter()
            .zip(&self.log_weights)
            .map(|(point, log_weight)| {
                let z = (x - point) / self.bandwidth;
                log_weight - 0.5 * z * z - LN_SQRT_TAU - ln_h
            })
            .collect::<Vec<_>>();
        log_sum_exp(&terms) - self.log_total_weight
    }

    #[must_use]
    pub fn density(&self, x: f64) -> f64 {
        self.log_density(x).exp()
    }

    /// Log-density at the `index`-th kernel centre with that kernel left out
    /// and the remaining weights renormalized.
    ///
    /// Negative infinity when no other kernel carries weight.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn leave_one_out_log_density(&self, index: usize) -> f64 {
        let x = self.points[index];
        let remaining = self.log_total_weight.exp() - self.log_weights[index].exp();
        if self.points.len() < 2 || remaining <= 0.0 {
            return f64::NEG_INFINITY;
        }
        let ln_h = self.bandwidth.ln();
        let terms = self
            .points
            .iter()
            .zip(&self.log_weights)
            .enumerate()
            .filter(|(other, _)| *other != index)
            .map(|(_, (point, log_weight))| {
                let z = (x - point) / self.bandwidth;
                log_weight - 0.5 * z * z - LN_SQRT_TAU - ln_h
            })
            .collect::<Vec<_>>();
        log_sum_exp(&terms) - remaining.ln()
    }

    /// Weighted median of the kernel centres.
    #[must_use]
    pub fn median(&self) -> f64 {
        let weights = self
            .log_weights
            .iter()
            .map(|log_weight| log_weight.exp())
            .collect::<Vec<_>>();
        weighted_quantile(&self.points, &weights, 0.5)
    }

    /// Weighted mean and standard deviation of the kernel centres.
    #[must_use]
    pub fn moments(&self) -> (f64, f64) {
        let weights = self
            .log_weights
            .iter()
            .map(|log_weight| log_weight.exp())
            .collect::<Vec<_>>();
        weighted_mean_std(&self.points, &weights)
    }

    /// Effective number of kernels.
    #[must_use]
    pub fn effective_count(&self) -> f64 {
        let weights = self
            .log_weights
            .iter()
            .map(|log_weight| log_weight.exp())
            .collect::<Vec<_>>();
        effective_count(&weights)
    }

    #[must_use]
    pub fn support(&self) -> (f64, f64) {
        let min = self.points.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self
            .points
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        (min, max)
    }
}
