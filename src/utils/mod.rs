/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Shared numeric and statistics utilities for event-based model components.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Utilities
//!
//! Shared helpers for log-space arithmetic, weighted summary statistics,
//! and working with faer matrices.

use faer::Mat;
use num_traits::ToPrimitive;

const EPS_PROBABILITY: f64 = 1.0e-10;

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

/// Bound probability away from exact 0 and 1.
#[must_use]
pub fn clamp_probability(probability: f64) -> f64 {
    probability.clamp(EPS_PROBABILITY, 1.0 - EPS_PROBABILITY)
}

/// Numerically stable `log(sum(exp(values)))`.
///
/// Returns `-inf` for an empty slice or when every term is `-inf`.
#[must_use]
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum = values.iter().map(|value| (value - max).exp()).sum::<f64>();
    max + sum.ln()
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

#[must_use]
pub fn column_values(matrix: &Mat<f64>, column: usize) -> Vec<f64> {
    (0..matrix.nrows()).map(|row| matrix[(row, column)]).collect()
}

#[must_use]
pub fn row_values(matrix: &Mat<f64>, row: usize) -> Vec<f64> {
    (0..matrix.ncols()).map(|col| matrix[(row, col)]).collect()
}

/// Weighted mean and (population) standard deviation.
///
/// Returns `(NaN, NaN)` when total weight is not positive.
#[must_use]
pub fn weighted_mean_std(values: &[f64], weights: &[f64]) -> (f64, f64) {
    let total = weights.iter().sum::<f64>();
    if total <= 0.0 || !total.is_finite() {
        return (f64::NAN, f64::NAN);
    }
    let mean = values
        .iter()
        .zip(weights)
        .map(|(value, weight)| value * weight)
        .sum::<f64>()
        / total;
    let variance = values
        .iter()
        .zip(weights)
        .map(|(value, weight)| {
            let centered = value - mean;
            weight * centered * centered
        })
        .sum::<f64>()
        / total;
    (mean, variance.max(0.0).sqrt())
}

/// Weighted quantile with linear interpolation on cumulative weight midpoints.
///
/// Zero-weight observations are ignored. Returns `NaN` if no positive weight remains.
#[must_use]
pub fn weighted_quantile(values: &[f64], weights: &[f64], probability: f64) -> f64 {
    let mut pairs = values
        .iter()
        .copied()
        .zip(weights.iter().copied())
        .filter(|(_, weight)| *weight > 0.0)
        .collect::<Vec<_>>();
    if pairs.is_empty() {
        return f64::NAN;
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total = pairs.iter().map(|(_, weight)| weight).sum::<f64>();
    let target = probability.clamp(0.0, 1.0) * total;
    let mut cumulative = 0.0;
    let mut previous: Option<(f64, f64)> = None;
    for (value, weight) in &pairs {
        let midpoint = cumulative + 0.5 * weight;
        if target <= midpoint {
            return match previous {
                None => *value,
                Some((prev_value, prev_mid)) => {
                    let span = midpoint - prev_mid;
                    if span <= 0.0 {
                        *value
                    } else {
                        let t = (target - prev_mid) / span;
                        t.mul_add(value - prev_value, prev_value)
                    }
                }
            };
        }
        previous = Some((*value, midpoint));
        cumulative += weight;
    }
    pairs.last().map_or(f64::NAN, |(value, _)| *value)
}

/// Unweighted percentile of an already sorted slice.
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

/// Median of an unsorted slice.
#[must_use]
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile(&sorted, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn log_sum_exp_matches_direct_sum() {
        let values = [0.1_f64.ln(), 0.2_f64.ln(), 0.7_f64.ln()];
        assert_relative_eq!(log_sum_exp(&values), 0.0, epsilon = 1.0e-12);
    }

    #[test]
    fn log_sum_exp_survives_large_magnitudes() {
        let values = [-1_000.0, -1_000.0];
        assert_relative_eq!(
            log_sum_exp(&values),
            -1_000.0 + std::f64::consts::LN_2,
            epsilon = 1.0e-9
        );
        assert!(log_sum_exp(&[]).is_infinite());
    }

    #[test]
    fn weighted_mean_std_ignores_zero_weights() {
        let (mean, std) = weighted_mean_std(&[1.0, 3.0, 100.0], &[1.0, 1.0, 0.0]);
        assert_relative_eq!(mean, 2.0);
        assert_relative_eq!(std, 1.0);
    }

    #[test]
    fn weighted_mean_std_is_nan_without_weight() {
        let (mean, std) = weighted_mean_std(&[1.0], &[0.0]);
        assert!(mean.is_nan());
        assert!(std.is_nan());
    }

    #[test]
    fn weighted_quantile_matches_median_for_equal_weights() {
        let values = [5.0, 1.0, 3.0];
        let weights = [1.0, 1.0, 1.0];
        assert_relative_eq!(weighted_quantile(&values, &weights, 0.5), 3.0);
        assert_relative_eq!(weighted_quantile(&values, &weights, 0.0), 1.0);
        assert_relative_eq!(weighted_quantile(&values, &weights, 1.0), 5.0);
    }

    #[test]
    fn weighted_quantile_is_nan_without_weight() {
        assert!(weighted_quantile(&[1.0, 2.0], &[0.0, 0.0], 0.5).is_nan());
    }

    #[test]
    fn median_of_even_length_interpolates() {
        assert_relative_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn clamp_probability_keeps_logs_finite() {
        assert!(clamp_probability(0.0).ln().is_finite());
        assert!((1.0 - clamp_probability(1.0)).ln().is_finite());
    }

    #[test]
    fn matrix_is_finite_detects_nan() {
        let matrix = Mat::from_fn(2, 1, |i, _| if i == 0 { 1.0 } else { f64::NAN });
        assert!(!matrix_is_finite(&matrix));
    }

    #[test]
    fn row_and_column_values_extract_slices() {
        let matrix = Mat::from_fn(2, 3, |i, j| usize_to_f64(i * 10 + j));
        assert_eq!(column_values(&matrix, 1), vec![1.0, 11.0]);
        assert_eq!(row_values(&matrix, 1), vec![10.0, 11.0, 12.0]);
    }
}
