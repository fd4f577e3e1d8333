//! Longitudinal staging input containers.
//!
//! Repeated-measures data is never modelled as a trajectory. Each visit is
//! staged independently against a single fitted model and visits are then
//! regrouped per subject.

use std::collections::BTreeMap;

use faer::Mat;

use super::InputError;
use crate::utils::matrix_is_finite;

/// Person-visit measurements for longitudinal staging.
#[derive(Debug, Clone)]
pub struct LongitudinalStagingInput {
    pub measurements: Mat<f64>,
    pub subject_ids: Vec<u64>,
    pub time: Vec<f64>,
}

impl LongitudinalStagingInput {
    #[must_use]
    pub const fn new(measurements: Mat<f64>, subject_ids: Vec<u64>, time: Vec<f64>) -> Self {
        Self {
            measurements,
            subject_ids,
            time,
        }
    }

    /// # Errors
    ///
    /// Returns `InputError` if shapes or values are malformed.
    pub fn validate(&self) -> Result<(), InputError> {
        let rows = self.measurements.nrows();
        if rows == 0 {
            return Err(InputError::NoSubjects);
        }
        if self.measurements.ncols() == 0 {
            return Err(InputError::NoBiomarkers);
        }
        if self.subject_ids.len() != rows {
            return Err(InputError::InvalidSubjectLength {
                len: self.subject_ids.len(),
                rows,
            });
        }
        if self.time.len() != rows {
            return Err(InputError::InvalidTimeLength {
                len: self.time.len(),
                rows,
            });
        }
        if !matrix_is_finite(&self.measurements) {
            return Err(InputError::NonFiniteMeasurements);
        }
        if self.time.iter().any(|value| !value.is_finite()) {
            return Err(InputError::NonFiniteTime);
        }
        Ok(())
    }

    /// Row indices grouped by subject id, each group sorted by visit time.
    ///
    /// Subjects are returned in ascending id order; ties in time keep row order.
    #[must_use]
    pub fn visits_by_subject(&self) -> Vec<(u64, Vec<usize>)> {
        let mut groups: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (row, subject_id) in self.subject_ids.iter().copied().enumerate() {
            groups.entry(subject_id).or_default().push(row);
        }
        groups
            .into_iter()
            .map(|(subject_id, mut rows)| {
                rows.sort_by(|a, b| self.time[*a].total_cmp(&self.time[*b]));
                (subject_id, rows)
            })
            .collect()
    }
}
