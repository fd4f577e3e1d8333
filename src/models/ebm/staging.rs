//! Subject staging along an inferred event ordering.
//!
//! A subject's stage is the number of events that have occurred. The stage
//! posterior combines the cumulative stage likelihoods of a single ordering,
//! or averages the per-ordering posteriors over retained samples. Repeated
//! orderings are evaluated once and weighted by how often they were drawn.

use std::collections::BTreeMap;

use faer::Mat;
use serde::{Deserialize, Serialize};

use crate::input::LongitudinalStagingInput;
use crate::models::likelihood::{is_valid_ordering, log_stage_prior, stage_log_likelihoods};
use crate::utils::{clamp_probability, log_sum_exp, row_values, usize_to_f64};

use super::types::{EbmError, SequenceSample};

/// Which orderings a fitted model stages with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingMode {
    /// The maximum-likelihood ordering only.
    #[default]
    MaximumLikelihood,
    /// Stage posteriors averaged over every retained ordering.
    PosteriorAverage,
}

/// Staging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingOptions {
    /// Unnormalized prior over stages `0..=N`; uniform when absent.
    pub stage_prior: Option<Vec<f64>>,
    pub mode: StagingMode,
}

impl StagingOptions {
    /// # Errors
    ///
    /// Returns `EbmError::Likelihood` if the stage prior is invalid for
    /// `n_events` events.
    pub fn validate(&self, n_events: usize) -> Result<(), EbmError> {
        log_stage_prior(self.stage_prior.as_deref(), n_events)?;
        Ok(())
    }
}

/// Orderings to stage against.
#[derive(Debug, Clone, Copy)]
pub enum OrderingSource<'a> {
    Fixed(&'a [usize]),
    Posterior(&'a [SequenceSample]),
}

impl<'a> OrderingSource<'a> {
    /// Distinct orderings with their multiplicity.
    fn distinct_orderings(&self) -> Vec<(&'a [usize], usize)> {
        match *self {
            Self::Fixed(ordering) => vec![(ordering, 1)],
            Self::Posterior(samples) => {
                let mut counts = BTreeMap::<&'a [usize], usize>::new();
                for sample in samples {
                    *counts.entry(sample.ordering.as_slice()).or_default() += 1;
                }
                counts.into_iter().collect()
            }
        }
    }
}

/// Stage posterior of one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Normalized posterior over stages `0..=N`.
    pub posterior: Vec<f64>,
    /// First stage with maximal posterior.
    pub most_likely: usize,
    pub expected: f64,
}

impl StageResult {
    fn from_posterior(posterior: Vec<f64>) -> Self {
        let most_likely = posterior
            .iter()
            .enumerate()
            .fold(0, |best, (stage, value)| {
                if *value > posterior[best] { stage } else { best }
            });
        let expected = posterior
            .iter()
            .enumerate()
            .map(|(stage, value)| usize_to_f64(stage) * value)
            .sum();
        Self {
            posterior,
            most_likely,
            expected,
        }
    }
}

/// Stage one subject from its row of post-event probabilities.
///
/// # Errors
///
/// Returns `EbmError` for an empty source, a row whose length differs from
/// the orderings, orderings that are not permutations, out-of-range
/// probabilities, or an invalid stage prior.
pub fn stage_subject(
    probabilities: &[f64],
    source: &OrderingSource<'_>,
    options: &StagingOptions,
) -> Result<StageResult, EbmError> {
    let n_events = probabilities.len();
    let orderings = checked_orderings(source, n_events)?;
    let log_prior = log_stage_prior(options.stage_prior.as_deref(), n_events)?;
    stage_row(probabilities, &orderings, &log_prior)
}

/// Stage every row of an `M x N` probability matrix.
///
/// # Errors
///
/// Same conditions as [`stage_subject`].
pub fn stage_subjects(
    probabilities: &Mat<f64>,
    source: &OrderingSource<'_>,
    options: &StagingOptions,
) -> Result<Vec<StageResult>, EbmError> {
    let n_events = probabilities.ncols();
    let orderings = checked_orderings(source, n_events)?;
    let log_prior = log_stage_prior(options.stage_prior.as_deref(), n_events)?;
    (0..probabilities.nrows())
        .map(|row| stage_row(&row_values(probabilities, row), &orderings, &log_prior))
        .collect()
}

/// Visit-level stages of one subject, in time order.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectStages {
    pub subject_id: u64,
    /// Rows of the longitudinal input, sorted by visit time.
    pub rows: Vec<usize>,
    pub times: Vec<f64>,
    pub stages: Vec<StageResult>,
    /// Expected stage at the last visit minus the first.
    pub stage_change: f64,
}

/// Stage every visit independently and regroup per subject.
///
/// `probabilities` holds one row per visit of `input`.
///
/// # Errors
///
/// Returns `EbmError` if `input` is malformed, its row count differs from
/// `probabilities`, or staging fails.
pub fn stage_visits(
    probabilities: &Mat<f64>,
    input: &LongitudinalStagingInput,
    source: &OrderingSource<'_>,
    options: &StagingOptions,
) -> Result<Vec<SubjectStages>, EbmError> {
    input.validate()?;
    if probabilities.nrows() != input.measurements.nrows() {
        return Err(EbmError::VisitCountMismatch {
            visits: input.measurements.nrows(),
            rows: probabilities.nrows(),
        });
    }
    let visit_stages = stage_subjects(probabilities, source, options)?;
    Ok(input
        .visits_by_subject()
        .into_iter()
        .map(|(subject_id, rows)| {
            let stages = rows
                .iter()
                .map(|row| visit_stages[*row].clone())
                .collect::<Vec<_>>();
            let stage_change = match (stages.first(), stages.last()) {
                (Some(first), Some(last)) => last.expected - first.expected,
                _ => 0.0,
            };
            SubjectStages {
                subject_id,
                times: rows.iter().map(|row| input.time[*row]).collect(),
                rows,
                stages,
                stage_change,
            }
        })
        .collect())
}

fn checked_orderings<'a>(
    source: &OrderingSource<'a>,
    n_events: usize,
) -> Result<Vec<(&'a [usize], usize)>, EbmError> {
    let orderings = source.distinct_orderings();
    let Some((first, _)) = orderings.first() else {
        return Err(EbmError::EmptyPosterior);
    };
    if first.len() != n_events {
        return Err(EbmError::ProbabilityLength {
            expected: first.len(),
            found: n_events,
        });
    }
    if orderings
        .iter()
        .any(|(ordering, _)| !is_valid_ordering(ordering, n_events))
    {
        return Err(EbmError::InvalidOrdering { n_events });
    }
    Ok(orderings)
}

fn stage_row(
    probabilities: &[f64],
    orderings: &[(&[usize], usize)],
    log_prior: &[f64],
) -> Result<StageResult, EbmError> {
    if probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) {
        return Err(EbmError::InvalidProbability);
    }
    let log_abnormal = probabilities
        .iter()
        .map(|p| clamp_probability(*p).ln())
        .collect::<Vec<_>>();
    let log_normal = probabilities
        .iter()
        .map(|p| (-clamp_probability(*p)).ln_1p())
        .collect::<Vec<_>>();

    let total = usize_to_f64(orderings.iter().map(|(_, count)| count).sum());
    let mut posterior = vec![0.0; log_prior.len()];
    for (ordering, count) in orderings {
        let joint = stage_log_likelihoods(&log_abnormal, &log_normal, ordering)
            .iter()
            .zip(log_prior)
            .map(|(stage, prior)| stage + prior)
            .collect::<Vec<_>>();
        let normalizer = log_sum_exp(&joint);
        let share = usize_to_f64(*count) / total;
        for (slot, value) in posterior.iter_mut().zip(&joint) {
            *slot += share * (value - normalizer).exp();
        }
    }
    Ok(StageResult::from_posterior(posterior))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn all_normal_stages_at_zero_and_all_abnormal_at_n() {
        let ordering = [0, 1, 2];
        let options = StagingOptions::default();
        let healthy = stage_subject(&[0.0; 3], &OrderingSource::Fixed(&ordering), &options)
            .expect("stage");
        assert_eq!(healthy.most_likely, 0);
        assert!(healthy.expected < 1e-6);
        let advanced = stage_subject(&[1.0; 3], &OrderingSource::Fixed(&ordering), &options)
            .expect("stage");
        assert_eq!(advanced.most_likely, 3);
        assert!(advanced.expected > 3.0 - 1e-6);
    }

    #[test]
    fn posterior_is_normalized() {
        let result = stage_subject(
            &[0.7, 0.4, 0.1],
            &OrderingSource::Fixed(&[2, 0, 1]),
            &StagingOptions::default(),
        )
        .expect("stage");
        assert_eq!(result.posterior.len(), 4);
        assert_relative_eq!(result.posterior.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn dominated_rows_have_lower_expected_stage() {
        let ordering = [1, 0, 2];
        let options = StagingOptions::default();
        let lower = stage_subject(&[0.3, 0.6, 0.1], &OrderingSource::Fixed(&ordering), &options)
            .expect("stage");
        let upper = stage_subject(&[0.5, 0.8, 0.4], &OrderingSource::Fixed(&ordering), &options)
            .expect("stage");
        assert!(upper.expected >= lower.expected);
    }

    #[test]
    fn posterior_source_averages_orderings() {
        let samples = [
            SequenceSample {
                log_likelihood: -1.0,
                ordering: vec![0, 1],
            },
            SequenceSample {
                log_likelihood: -2.0,
                ordering: vec![1, 0],
            },
        ];
        let options = StagingOptions::default();
        let row = [0.9, 0.1];
        let averaged = stage_subject(&row, &OrderingSource::Posterior(&samples), &options)
            .expect("stage");
        let first = stage_subject(&row, &OrderingSource::Fixed(&[0, 1]), &options).expect("stage");
        let second = stage_subject(&row, &OrderingSource::Fixed(&[1, 0]), &options).expect("stage");
        for stage in 0..3 {
            assert_relative_eq!(
                averaged.posterior[stage],
                0.5 * (first.posterior[stage] + second.posterior[stage]),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn repeated_orderings_are_weighted_by_count() {
        let sample = |ordering: Vec<usize>| SequenceSample {
            log_likelihood: -1.0,
            ordering,
        };
        let samples = [
            sample(vec![0, 1, 2]),
            sample(vec![2, 1, 0]),
            sample(vec![0, 1, 2]),
            sample(vec![0, 1, 2]),
        ];
        let source = OrderingSource::Posterior(&samples);
        assert_eq!(
            source.distinct_orderings(),
            vec![([0, 1, 2].as_slice(), 3), ([2, 1, 0].as_slice(), 1)]
        );

        let options = StagingOptions::default();
        let row = [0.8, 0.3, 0.6];
        let pooled = stage_subject(&row, &source, &options).expect("stage");
        let forward =
            stage_subject(&row, &OrderingSource::Fixed(&[0, 1, 2]), &options).expect("stage");
        let reverse =
            stage_subject(&row, &OrderingSource::Fixed(&[2, 1, 0]), &options).expect("stage");
        for stage in 0..4 {
            assert_relative_eq!(
                pooled.posterior[stage],
                0.75f64.mul_add(forward.posterior[stage], 0.25 * reverse.posterior[stage]),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn stage_prior_shifts_posterior() {
        let options = StagingOptions {
            stage_prior: Some(vec![10.0, 1.0, 1.0]),
            ..StagingOptions::default()
        };
        let row = [0.5, 0.5];
        let weighted = stage_subject(&row, &OrderingSource::Fixed(&[0, 1]), &options)
            .expect("stage");
        assert_eq!(weighted.most_likely, 0);
        assert_relative_eq!(weighted.posterior[0], 10.0 / 12.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_invalid_sources_and_rows() {
        let options = StagingOptions::default();
        assert!(matches!(
            stage_subject(&[0.5, 0.5], &OrderingSource::Posterior(&[]), &options),
            Err(EbmError::EmptyPosterior)
        ));
        assert!(matches!(
            stage_subject(&[0.5, 0.5], &OrderingSource::Fixed(&[0, 1, 2]), &options),
            Err(EbmError::ProbabilityLength {
                expected: 3,
                found: 2
            })
        ));
        assert!(matches!(
            stage_subject(&[0.5, 0.5], &OrderingSource::Fixed(&[1, 1]), &options),
            Err(EbmError::InvalidOrdering { n_events: 2 })
        ));
        assert!(matches!(
            stage_subject(&[0.5, 1.5], &OrderingSource::Fixed(&[0, 1]), &options),
            Err(EbmError::InvalidProbability)
        ));
    }

    #[test]
    fn stage_subjects_covers_every_row() {
        let probabilities = Mat::from_fn(3, 2, |row, _| if row == 0 { 0.0 } else { 1.0 });
        let stages = stage_subjects(
            &probabilities,
            &OrderingSource::Fixed(&[0, 1]),
            &StagingOptions::default(),
        )
        .expect("stages");
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].most_likely, 0);
        assert_eq!(stages[2].most_likely, 2);
    }

    #[test]
    fn visits_are_grouped_with_stage_change() {
        let probabilities = Mat::from_fn(3, 2, |row, _| match row {
            0 => 0.9,
            1 => 0.05,
            _ => 0.5,
        });
        let input = LongitudinalStagingInput::new(
            Mat::from_fn(3, 2, |_, _| 0.0),
            vec![4, 4, 9],
            vec![3.0, 1.0, 0.0],
        );
        let grouped = stage_visits(
            &probabilities,
            &input,
            &OrderingSource::Fixed(&[0, 1]),
            &StagingOptions::default(),
        )
        .expect("grouped");
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].subject_id, 4);
        assert_eq!(grouped[0].rows, vec![1, 0]);
        assert!(grouped[0].stage_change > 0.0);
        assert_relative_eq!(grouped[1].stage_change, 0.0);
    }
}
