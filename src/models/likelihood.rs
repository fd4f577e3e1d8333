//! Event-probability and ordering-likelihood evaluation.
//!
//! A subject at stage `k` under an ordering has the events in the first `k`
//! positions abnormal and the rest normal. Stage log-likelihoods are
//! computed from cumulative sums of `ln p` and `ln(1 - p)`, so evaluating an
//! ordering costs `O(M * N)`.

use faer::Mat;
use thiserror::Error;

use super::mixture::MixtureModel;
use crate::input::{Direction, InputError, validate_measurements};
use crate::utils::{clamp_probability, log_sum_exp, usize_to_f64};

/// Errors returned by likelihood evaluation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LikelihoodError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("probability matrix must have at least one row and one column")]
    EmptyProbabilities,
    #[error("probability matrix contains values outside [0, 1]")]
    InvalidProbability,
    #[error("stage prior must have {expected} entries; found {found}")]
    StagePriorLength { expected: usize, found: usize },
    #[error("stage prior must be non-negative, finite, and sum to a positive value")]
    InvalidStagePrior,
    #[error("ordering is not a permutation of 0..{n_events}")]
    InvalidOrdering { n_events: usize },
}

/// Map raw measurements to post-event probabilities.
///
/// # Errors
///
/// Returns `LikelihoodError::Input` if the measurement matrix is empty,
/// contains non-finite values, or its column count differs from the number
/// of mixtures.
pub fn probability_matrix(
    measurements: &Mat<f64>,
    mixtures: &[MixtureModel],
) -> Result<Mat<f64>, LikelihoodError> {
    let directions = mixtures
        .iter()
        .map(|mixture| mixture.direction)
        .collect::<Vec<Direction>>();
    validate_measurements(measurements, &directions)?;
    Ok(Mat::from_fn(
        measurements.nrows(),
        measurements.ncols(),
        |row, col| mixtures[col].probability(measurements[(row, col)]),
    ))
}

/// Check that `ordering` is a permutation of `0..n_events`.
#[must_use]
pub fn is_valid_ordering(ordering: &[usize], n_events: usize) -> bool {
    if ordering.len() != n_events {
        return false;
    }
    let mut seen = vec![false; n_events];
    for event in ordering {
        if *event >= n_events || seen[*event] {
            return false;
        }
        seen[*event] = true;
    }
    true
}

/// Normalized log stage prior over `0..=n_events`.
///
/// # Errors
///
/// Returns `LikelihoodError` if the prior has the wrong length or is not a
/// valid unnormalized distribution.
pub fn log_stage_prior(
    stage_prior: Option<&[f64]>,
    n_events: usize,
) -> Result<Vec<f64>, LikelihoodError> {
    let n_stages = n_events + 1;
    let Some(prior) = stage_prior else {
        return Ok(vec![-usize_to_f64(n_stages).ln(); n_stages]);
    };
    if prior.len() != n_stages {
        return Err(LikelihoodError::StagePriorLength {
            expected: n_stages,
            found: prior.len(),
        });
    }
    if prior.iter().any(|value| !value.is_finite() || *value < 0.0) {
        return Err(LikelihoodError::InvalidStagePrior);
    }
    let total = prior.iter().sum::<f64>();
    if total <= 0.0 {
        return Err(LikelihoodError::InvalidStagePrior);
    }
    Ok(prior.iter().map(|value| (value / total).ln()).collect())
}

/// Precomputed log-probabilities for ordering likelihood evaluation.
#[derive(Debug, Clone)]
pub struct SequenceLikelihood {
    n_subjects: usize,
    n_events: usize,
    /// Row-major `ln p`.
    log_abnormal: Vec<f64>,
    /// Row-major `ln(1 - p)`.
    log_normal: Vec<f64>,
    mean_abnormality: Vec<f64>,
    log_prior: Vec<f64>,
}

impl SequenceLikelihood {
    /// # Errors
    ///
    /// Returns `LikelihoodError` for empty matrices, probabilities outside
    /// `[0, 1]`, or an invalid stage prior.
    pub fn new(
        probabilities: &Mat<f64>,
        stage_prior: Option<&[f64]>,
    ) -> Result<Self, LikelihoodError> {
        let n_subjects = probabilities.nrows();
        let n_events = probabilities.ncols();
        if n_subjects == 0 || n_events == 0 {
            return Err(LikelihoodError::EmptyProbabilities);
        }
        let mut log_abnormal = Vec::with_capacity(n_subjects * n_events);
        let mut log_normal = Vec::with_capacity(n_subjects * n_events);
        let mut mean_abnormality = vec![0.0; n_events];
        for row in 0..n_subjects {
            for (col, mean) in mean_abnormality.iter_mut().enumerate() {
                let p = probabilities[(row, col)];
                if !(0.0..=1.0).contains(&p) {
                    return Err(LikelihoodError::InvalidProbability);
                }
                let clamped = clamp_probability(p);
                log_abnormal.push(clamped.ln());
                log_normal.push((-clamped).ln_1p());
                *mean += p;
            }
        }
        for mean in &mut mean_abnormality {
            *mean /= usize_to_f64(n_subjects);
        }
        Ok(Self {
            n_subjects,
            n_events,
            log_abnormal,
            log_normal,
            mean_abnormality,
            log_prior: log_stage_prior(stage_prior, n_events)?,
        })
    }

    #[must_use]
    pub const fn n_subjects(&self) -> usize {
        self.n_subjects
    }

    #[must_use]
    pub const fn n_events(&self) -> usize {
        self.n_events
    }

    /// Mean abnormality probability per event.
    #[must_use]
    pub fn mean_abnormality(&self) -> &[f64] {
        &self.mean_abnormality
    }

    /// Normalized log stage prior.
    #[must_use]
    pub fn log_prior(&self) -> &[f64] {
        &self.log_prior
    }

    /// `ln P(x_subject | stage k)` for `k = 0..=N`, without the stage prior.
    ///
    /// `ordering` must be a valid permutation.
    #[must_use]
    pub fn subject_stage_log_likelihoods(&self, subject: usize, ordering: &[usize]) -> Vec<f64> {
        let offset = subject * self.n_events;
        stage_log_likelihoods(
            &self.log_abnormal[offset..offset + self.n_events],
            &self.log_normal[offset..offset + self.n_events],
            ordering,
        )
    }

    /// Total log-likelihood of `ordering` over all subjects.
    ///
    /// `ordering` must be a valid permutation.
    #[must_use]
    pub fn log_likelihood(&self, ordering: &[usize]) -> f64 {
        self.log_likelihood_with(ordering, &mut Vec::new())
    }

    /// [`Self::log_likelihood`] with a caller-owned buffer for the per-stage
    /// terms, so repeated evaluation does not allocate.
    #[must_use]
    pub fn log_likelihood_with(&self, ordering: &[usize], scratch: &mut Vec<f64>) -> f64 {
        scratch.clear();
        scratch.resize(self.n_events + 1, 0.0);
        let mut total = 0.0;
        for (log_abnormal, log_normal) in self
            .log_abnormal
            .chunks_exact(self.n_events)
            .zip(self.log_normal.chunks_exact(self.n_events))
        {
            let mut current = ordering.iter().map(|event| log_normal[*event]).sum::<f64>();
            scratch[0] = current + self.log_prior[0];
            for ((slot, event), prior) in scratch[1..]
                .iter_mut()
                .zip(ordering)
                .zip(&self.log_prior[1..])
            {
                current += log_abnormal[*event] - log_normal[*event];
                *slot = current + prior;
            }
            total += log_sum_exp(scratch.as_slice());
        }
        total
    }

    /// Checked variant of [`Self::log_likelihood`].
    ///
    /// # Errors
    ///
    /// Returns `LikelihoodError::InvalidOrdering` if `ordering` is not a
    /// permutation of the events.
    pub fn checked_log_likelihood(&self, ordering: &[usize]) -> Result<f64, LikelihoodError> {
        if !is_valid_ordering(ordering, self.n_events) {
            return Err(LikelihoodError::InvalidOrdering {
                n_events: self.n_events,
            });
        }
        Ok(self.log_likelihood(ordering))
    }
}

/// Stage log-likelihoods from per-event `ln p` and `ln(1 - p)` (indexed by
/// event, not position).
#[must_use]
pub fn stage_log_likelihoods(
    log_abnormal: &[f64],
    log_normal: &[f64],
    ordering: &[usize],
) -> Vec<f64> {
    let n = ordering.len();
    let mut stages = Vec::with_capacity(n + 1);
    let mut current = ordering.iter().map(|event| log_normal[*event]).sum::<f64>();
    stages.push(current);
    for event in ordering {
        current += log_abnormal[*event] - log_normal[*event];
        stages.push(current);
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn probabilities(rows: &[&[f64]]) -> Mat<f64> {
        Mat::from_fn(rows.len(), rows[0].len(), |i, j| rows[i][j])
    }

    #[test]
    fn stage_log_likelihoods_match_direct_products() {
        let p = [0.9, 0.2, 0.6];
        let log_abnormal = p.iter().map(|value: &f64| value.ln()).collect::<Vec<_>>();
        let log_normal = p.iter().map(|value: &f64| (1.0 - value).ln()).collect::<Vec<_>>();
        let ordering = [2, 0, 1];
        let stages = stage_log_likelihoods(&log_abnormal, &log_normal, &ordering);
        assert_eq!(stages.len(), 4);
        assert_relative_eq!(stages[0].exp(), 0.4 * 0.1 * 0.8, epsilon = 1e-12);
        assert_relative_eq!(stages[1].exp(), 0.6 * 0.1 * 0.8, epsilon = 1e-12);
        assert_relative_eq!(stages[2].exp(), 0.6 * 0.9 * 0.8, epsilon = 1e-12);
        assert_relative_eq!(stages[3].exp(), 0.6 * 0.9 * 0.2, epsilon = 1e-12);
    }

    #[test]
    fn log_likelihood_sums_uniform_stage_mixture() {
        let matrix = probabilities(&[&[0.9, 0.2], &[0.5, 0.5]]);
        let likelihood = SequenceLikelihood::new(&matrix, None).expect("likelihood");
        let first: f64 = (0.1 * 0.8 + 0.9 * 0.8 + 0.9 * 0.2) / 3.0;
        let second = (0.25 + 0.25 + 0.25) / 3.0_f64;
        let expected = first.ln() + second.ln();
        assert_relative_eq!(likelihood.log_likelihood(&[0, 1]), expected, epsilon = 1e-9);
    }

    #[test]
    fn reused_scratch_matches_per_subject_stages() {
        let matrix = probabilities(&[
            &[0.9, 0.2, 0.6],
            &[0.1, 0.7, 0.4],
            &[0.5, 0.5, 0.99],
        ]);
        let prior = [1.0, 2.0, 3.0, 4.0];
        let likelihood =
            SequenceLikelihood::new(&matrix, Some(prior.as_slice())).expect("likelihood");
        let mut scratch = vec![f64::NAN; 1];
        for ordering in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let expected = (0..likelihood.n_subjects())
                .map(|subject| {
                    let joint = likelihood
                        .subject_stage_log_likelihoods(subject, &ordering)
                        .iter()
                        .zip(likelihood.log_prior())
                        .map(|(stage, prior)| stage + prior)
                        .collect::<Vec<_>>();
                    log_sum_exp(&joint)
                })
                .sum::<f64>();
            let reused = likelihood.log_likelihood_with(&ordering, &mut scratch);
            assert_relative_eq!(reused, expected, epsilon = 1e-12);
            assert_relative_eq!(likelihood.log_likelihood(&ordering), expected, epsilon = 1e-12);
        }
        assert_eq!(scratch.len(), 4);
    }

    #[test]
    fn better_ordering_scores_higher() {
        let matrix = probabilities(&[
            &[0.05, 0.05],
            &[0.95, 0.05],
            &[0.95, 0.05],
            &[0.95, 0.95],
        ]);
        let likelihood = SequenceLikelihood::new(&matrix, None).expect("likelihood");
        assert!(likelihood.log_likelihood(&[0, 1]) > likelihood.log_likelihood(&[1, 0]));
        assert_relative_eq!(likelihood.mean_abnormality()[0], 0.725, epsilon = 1e-12);
    }

    #[test]
    fn custom_stage_prior_is_normalized() {
        let prior = log_stage_prior(Some([2.0, 1.0, 1.0].as_slice()), 2).expect("prior");
        assert_relative_eq!(prior[0].exp(), 0.5, epsilon = 1e-12);
        assert!(matches!(
            log_stage_prior(Some([1.0, 1.0].as_slice()), 2),
            Err(LikelihoodError::StagePriorLength { expected: 3, found: 2 })
        ));
        assert!(matches!(
            log_stage_prior(Some([0.0, 0.0, 0.0].as_slice()), 2),
            Err(LikelihoodError::InvalidStagePrior)
        ));
    }

    #[test]
    fn rejects_out_of_range_probabilities() {
        let matrix = probabilities(&[&[1.5]]);
        assert!(matches!(
            SequenceLikelihood::new(&matrix, None),
            Err(LikelihoodError::InvalidProbability)
        ));
    }

    #[test]
    fn checked_log_likelihood_rejects_invalid_ordering() {
        let matrix = probabilities(&[&[0.5, 0.5]]);
        let likelihood = SequenceLikelihood::new(&matrix, None).expect("likelihood");
        assert!(likelihood.checked_log_likelihood(&[0, 0]).is_err());
        assert!(likelihood.checked_log_likelihood(&[1, 0]).is_ok());
    }

    #[test]
    fn ordering_validation() {
        assert!(is_valid_ordering(&[2, 0, 1], 3));
        assert!(!is_valid_ordering(&[0, 1], 3));
        assert!(!is_valid_ordering(&[0, 3, 1], 3));
        assert!(!is_valid_ordering(&[0, 0, 1], 3));
    }
}
