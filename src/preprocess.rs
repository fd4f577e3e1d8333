use faer::Mat;

use crate::input::{BiomarkerData, GroupLabel};
use crate::utils::{column_values, median};

/// Per-biomarker group summary used to seed mixture fitting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomarkerSummary {
    pub biomarker: usize,
    pub n_controls: usize,
    pub n_patients: usize,
    pub n_unlabelled: usize,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub control_median: Option<f64>,
    pub patient_median: Option<f64>,
}

impl BiomarkerSummary {
    /// Value separating the initial pre-event and post-event groups.
    ///
    /// Midpoint of the control and patient medians when both groups are
    /// present, otherwise the overall median.
    #[must_use]
    pub fn initial_threshold(&self) -> f64 {
        match (self.control_median, self.patient_median) {
            (Some(control), Some(patient)) => 0.5 * (control + patient),
            _ => self.median,
        }
    }
}

#[must_use]
pub fn summarize_biomarker(
    values: &[f64],
    labels: Option<&[GroupLabel]>,
    biomarker: usize,
) -> BiomarkerSummary {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let (controls, patients) = labels.map_or_else(
        || (Vec::new(), Vec::new()),
        |labels| {
            let mut controls = Vec::new();
            let mut patients = Vec::new();
            for (value, label) in values.iter().zip(labels) {
                match label {
                    GroupLabel::Control => controls.push(*value),
                    GroupLabel::Patient => patients.push(*value),
                }
            }
            (controls, patients)
        },
    );

    BiomarkerSummary {
        biomarker,
        n_controls: controls.len(),
        n_patients: patients.len(),
        n_unlabelled: values.len() - controls.len() - patients.len(),
        min,
        max,
        median: median(values),
        control_median: (!controls.is_empty()).then(|| median(&controls)),
        patient_median: (!patients.is_empty()).then(|| median(&patients)),
    }
}

#[must_use]
pub fn summarize_biomarkers(data: &BiomarkerData) -> Vec<BiomarkerSummary> {
    (0..data.n_biomarkers())
        .map(|column| {
            summarize_biomarker(
                &column_values(&data.measurements, column),
                data.labels(),
                column,
            )
        })
        .collect()
}

#[must_use]
pub fn column_has_variation(x: &Mat<f64>, column: usize, tolerance: f64) -> bool {
    if column >= x.ncols() || x.nrows() < 2 {
        return false;
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for row in 0..x.nrows() {
        let value = x[(row, column)];
        min = min.min(value);
        max = max.max(value);
    }
    (max - min).abs() > tolerance.abs()
}
