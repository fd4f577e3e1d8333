//! # Model inputs
//!
//! Defines the cross-sectional biomarker container used by every event-based
//! model component: a subject-by-biomarker measurement matrix, the declared
//! abnormality direction of each biomarker, and optional group labels.
//!
//! # Examples
//!
//! ```
//! use faer::Mat;
//! use event_based_models::{BiomarkerData, Direction};
//!
//! let measurements = Mat::from_fn(3, 2, |i, j| f64::from(u32::try_from(i + j).unwrap_or(0)));
//! let data = BiomarkerData::new(measurements, vec![Direction::Increase, Direction::Decrease]);
//!
//! assert!(data.validate().is_ok());
//! ```
//!
//! ```
//! use faer::Mat;
//! use event_based_models::{BiomarkerData, Direction};
//!
//! let measurements = Mat::from_fn(3, 2, |_, _| 1.0);
//! let data = BiomarkerData::new(measurements, vec![Direction::Increase]);
//!
//! assert!(data.validate().is_err());
//! ```

use faer::Mat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::matrix_is_finite;

pub mod longitudinal;

pub use longitudinal::LongitudinalStagingInput;

/// Errors returned when validating model inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("measurement matrix must have at least one row")]
    NoSubjects,
    #[error("measurement matrix must have at least one biomarker column")]
    NoBiomarkers,
    #[error("measurement columns ({columns}) must match direction count ({directions})")]
    DirectionMismatch { columns: usize, directions: usize },
    #[error("label length ({labels}) must match measurement rows ({rows})")]
    LabelMismatch { labels: usize, rows: usize },
    #[error("biomarker name count ({names}) must match measurement columns ({columns})")]
    NameMismatch { names: usize, columns: usize },
    #[error("measurement matrix contains non-finite values")]
    NonFiniteMeasurements,
    #[error("abnormality direction must be +1 or -1; found {0}")]
    InvalidDirection(i8),
    #[error("group label code must be 0 (control) or 1 (patient); found {0}")]
    InvalidLabel(u8),
    #[error("subject id length ({len}) must equal number of rows ({rows})")]
    InvalidSubjectLength { len: usize, rows: usize },
    #[error("visit time length ({len}) must equal number of rows ({rows})")]
    InvalidTimeLength { len: usize, rows: usize },
    #[error("visit times contain non-finite values")]
    NonFiniteTime,
}

/// Side of the value axis on which a biomarker becomes abnormal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Higher values signal disease.
    Increase,
    /// Lower values signal disease.
    Decrease,
}

impl Direction {
    /// # Errors
    ///
    /// Returns `InputError::InvalidDirection` for any sign other than `+1` or `-1`.
    pub const fn from_sign(sign: i8) -> Result<Self, InputError> {
        match sign {
            1 => Ok(Self::Increase),
            -1 => Ok(Self::Decrease),
            other => Err(InputError::InvalidDirection(other)),
        }
    }

    #[must_use]
    pub const fn sign(self) -> f64 {
        match self {
            Self::Increase => 1.0,
            Self::Decrease => -1.0,
        }
    }

    /// Whether `value` lies strictly on the disease side of `threshold`.
    #[must_use]
    pub fn is_beyond(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Increase => value > threshold,
            Self::Decrease => value < threshold,
        }
    }
}

/// Known diagnostic group of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLabel {
    Control,
    Patient,
}

impl GroupLabel {
    /// # Errors
    ///
    /// Returns `InputError::InvalidLabel` for codes other than `0` and `1`.
    pub const fn from_code(code: u8) -> Result<Self, InputError> {
        match code {
            0 => Ok(Self::Control),
            1 => Ok(Self::Patient),
            other => Err(InputError::InvalidLabel(other)),
        }
    }

    /// Convert a slice of integer codes into labels.
    ///
    /// # Errors
    ///
    /// Returns `InputError::InvalidLabel` on the first unknown code.
    pub fn from_codes(codes: &[u8]) -> Result<Vec<Self>, InputError> {
        codes.iter().map(|code| Self::from_code(*code)).collect()
    }
}

/// Cross-sectional biomarker measurements for `M` subjects and `N` biomarkers.
#[derive(Debug, Clone)]
pub struct BiomarkerData {
    pub measurements: Mat<f64>,
    pub directions: Vec<Direction>,
    pub labels: Option<Vec<GroupLabel>>,
    pub names: Option<Vec<String>>,
}

impl BiomarkerData {
    #[must_use]
    pub const fn new(measurements: Mat<f64>, directions: Vec<Direction>) -> Self {
        Self {
            measurements,
            directions,
            labels: None,
            names: None,
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Vec<GroupLabel>) -> Self {
        self.labels = Some(labels);
        self
    }

    #[must_use]
    pub fn with_names(self, names: Vec<String>) -> Self {
        Self {
            names: Some(names),
            ..self
        }
    }

    #[must_use]
    pub fn n_subjects(&self) -> usize {
        self.measurements.nrows()
    }

    #[must_use]
    pub fn n_biomarkers(&self) -> usize {
        self.measurements.ncols()
    }

    #[must_use]
    pub fn labels(&self) -> Option<&[GroupLabel]> {
        self.labels.as_deref()
    }

    /// Biomarker names, falling back to `biomarker_<index>`.
    #[must_use]
    pub fn biomarker_names(&self) -> Vec<String> {
        self.names.clone().unwrap_or_else(|| {
            (0..self.n_biomarkers())
                .map(|index| format!("biomarker_{index}"))
                .collect()
        })
    }

    /// Validate shapes and values.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if inputs are malformed.
    pub fn validate(&self) -> Result<(), InputError> {
        validate_measurements(&self.measurements, &self.directions)?;
        let rows = self.measurements.nrows();
        if let Some(labels) = &self.labels
            && labels.len() != rows
        {
            return Err(InputError::LabelMismatch {
                labels: labels.len(),
                rows,
            });
        }
        if let Some(names) = &self.names
            && names.len() != self.measurements.ncols()
        {
            return Err(InputError::NameMismatch {
                names: names.len(),
                columns: self.measurements.ncols(),
            });
        }
        Ok(())
    }
}

/// Validate a measurement matrix against a direction vector.
///
/// # Errors
///
/// Returns `InputError` on empty matrices, column/direction mismatch, or
/// non-finite values.
pub fn validate_measurements(
    measurements: &Mat<f64>,
    directions: &[Direction],
) -> Result<(), InputError> {
    if measurements.nrows() == 0 {
        return Err(InputError::NoSubjects);
    }
    if measurements.ncols() == 0 {
        return Err(InputError::NoBiomarkers);
    }
    if measurements.ncols() != directions.len() {
        return Err(InputError::DirectionMismatch {
            columns: measurements.ncols(),
            directions: directions.len(),
        });
    }
    if !matrix_is_finite(measurements) {
        return Err(InputError::NonFiniteMeasurements);
    }
    Ok(())
}
