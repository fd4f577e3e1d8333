//! Positional variance diagram over retained orderings.

use faer::Mat;

use crate::models::likelihood::is_valid_ordering;
use crate::utils::usize_to_f64;

use super::types::{EbmError, SequenceSample, first_maximum};

/// Frequency with which each event occupies each position.
#[derive(Debug, Clone)]
pub struct PositionalVarianceDiagram {
    /// `frequencies[(event, position)]`; every row sums to one.
    pub frequencies: Mat<f64>,
    /// Ordering used to arrange rows for display.
    pub reference: Vec<usize>,
    pub n_samples: usize,
}

impl PositionalVarianceDiagram {
    #[must_use]
    pub fn n_events(&self) -> usize {
        self.frequencies.nrows()
    }

    #[must_use]
    pub fn frequency(&self, event: usize, position: usize) -> f64 {
        self.frequencies[(event, position)]
    }

    /// Rows rearranged so that row `i` is the event at position `i` of the
    /// reference ordering.
    #[must_use]
    pub fn ordered_frequencies(&self) -> Mat<f64> {
        Mat::from_fn(self.n_events(), self.n_events(), |row, position| {
            self.frequencies[(self.reference[row], position)]
        })
    }

    /// Most frequent position of `event`; ties pick the earliest.
    #[must_use]
    pub fn modal_position(&self, event: usize) -> usize {
        (0..self.n_events()).fold(0, |best, position| {
            if self.frequencies[(event, position)] > self.frequencies[(event, best)] {
                position
            } else {
                best
            }
        })
    }
}

/// Aggregate event positions over `samples`.
///
/// `reference` defaults to the maximum-likelihood sample.
///
/// # Errors
///
/// Returns `EbmError::EmptyPosterior` without samples and
/// `EbmError::InvalidOrdering` if any ordering or the reference is not a
/// permutation of the same event set.
pub fn positional_variance(
    samples: &[SequenceSample],
    reference: Option<&[usize]>,
) -> Result<PositionalVarianceDiagram, EbmError> {
    let best = first_maximum(samples.iter()).ok_or(EbmError::EmptyPosterior)?;
    let n_events = best.ordering.len();

    let mut counts = Mat::<f64>::zeros(n_events, n_events);
    for sample in samples {
        if !is_valid_ordering(&sample.ordering, n_events) {
            return Err(EbmError::InvalidOrdering { n_events });
        }
        for (position, event) in sample.ordering.iter().enumerate() {
            counts[(*event, position)] += 1.0;
        }
    }

    let reference = reference.unwrap_or(best.ordering.as_slice());
    if !is_valid_ordering(reference, n_events) {
        return Err(EbmError::InvalidOrdering { n_events });
    }

    let total = usize_to_f64(samples.len());
    Ok(PositionalVarianceDiagram {
        frequencies: Mat::from_fn(n_events, n_events, |event, position| {
            counts[(event, position)] / total
        }),
        reference: reference.to_vec(),
        n_samples: samples.len(),
    })
}
