//! End-to-end event-based model fitting and forward staging.

use faer::Mat;
use serde::{Deserialize, Serialize};

use crate::input::{BiomarkerData, LongitudinalStagingInput};
use crate::models::likelihood::{SequenceLikelihood, probability_matrix};
use crate::models::mixture::{MixtureDiagnostics, MixtureModel, fit_mixtures, split_fits};

use super::diagnostics::{ConvergenceSummary, summarize_chain_agreement};
use super::posterior::{PositionalVarianceDiagram, positional_variance};
use super::sampler::sample_sequences;
use super::staging::{
    OrderingSource, StageResult, StagingMode, StagingOptions, SubjectStages, stage_subjects,
    stage_visits,
};
use super::types::{EbmConfig, EbmError, SequencePosterior, SequenceSample};

/// Reusable fitted model: mixtures, the maximum-likelihood ordering, and the
/// retained ordering samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EbmModel {
    /// Log-likelihood of `ordering` on the training data.
    pub log_likelihood: f64,
    pub biomarker_names: Vec<String>,
    /// Maximum-likelihood ordering, `ordering[position] = event`.
    pub ordering: Vec<usize>,
    pub staging: StagingOptions,
    pub mixtures: Vec<MixtureModel>,
    pub samples: Vec<SequenceSample>,
}

impl EbmModel {
    #[must_use]
    pub fn n_events(&self) -> usize {
        self.mixtures.len()
    }

    /// Biomarker names listed in event order.
    #[must_use]
    pub fn ordered_names(&self) -> Vec<&str> {
        self.ordering
            .iter()
            .map(|event| self.biomarker_names[*event].as_str())
            .collect()
    }

    /// Orderings used for staging under the configured mode.
    ///
    /// Posterior averaging falls back to the maximum-likelihood ordering when
    /// no samples were kept.
    #[must_use]
    pub fn ordering_source(&self) -> OrderingSource<'_> {
        match self.staging.mode {
            StagingMode::PosteriorAverage if !self.samples.is_empty() => {
                OrderingSource::Posterior(&self.samples)
            }
            _ => OrderingSource::Fixed(&self.ordering),
        }
    }

    /// Post-event probabilities for new measurements.
    ///
    /// # Errors
    ///
    /// Returns `EbmError` if the matrix is empty, non-finite, or has the wrong
    /// number of columns.
    pub fn probabilities(&self, measurements: &Mat<f64>) -> Result<Mat<f64>, EbmError> {
        Ok(probability_matrix(measurements, &self.mixtures)?)
    }

    /// Stage rows of an existing probability matrix.
    ///
    /// # Errors
    ///
    /// Returns `EbmError` if the matrix does not match the model.
    pub fn stage_probabilities(
        &self,
        probabilities: &Mat<f64>,
    ) -> Result<Vec<StageResult>, EbmError> {
        stage_subjects(probabilities, &self.ordering_source(), &self.staging)
    }

    /// Stage new subjects without refitting.
    ///
    /// # Errors
    ///
    /// Returns `EbmError` if the measurements do not match the model.
    pub fn stage_measurements(
        &self,
        measurements: &Mat<f64>,
    ) -> Result<Vec<StageResult>, EbmError> {
        let probabilities = self.probabilities(measurements)?;
        self.stage_probabilities(&probabilities)
    }

    /// Stage each visit independently and group visits per subject.
    ///
    /// # Errors
    ///
    /// Returns `EbmError` if the longitudinal input is malformed or does not
    /// match the model.
    pub fn stage_longitudinal(
        &self,
        input: &LongitudinalStagingInput,
    ) -> Result<Vec<SubjectStages>, EbmError> {
        input.validate()?;
        let probabilities = self.probabilities(&input.measurements)?;
        stage_visits(&probabilities, input, &self.ordering_source(), &self.staging)
    }
}

/// Every artifact of one fit.
#[derive(Debug, Clone)]
pub struct EbmFit {
    pub model: EbmModel,
    pub mixture_diagnostics: Vec<MixtureDiagnostics>,
    /// `M x N` training probabilities.
    pub probabilities: Mat<f64>,
    pub posterior: SequencePosterior,
    pub positional_variance: PositionalVarianceDiagram,
    /// Training-subject stages.
    pub stages: Vec<StageResult>,
    pub convergence: ConvergenceSummary,
}

/// Fit mixtures, sample orderings, and stage the training subjects.
///
/// # Errors
///
/// Returns `EbmError` if input or configuration is invalid, a chain thread
/// fails, or no ordering was retained before the deadline.
pub fn fit_ebm(data: &BiomarkerData, config: &EbmConfig) -> Result<EbmFit, EbmError> {
    data.validate()?;
    config.validate(data.n_biomarkers())?;
    log::info!(
        "fitting event-based model: {} subjects, {} biomarkers, fixed controls: {}",
        data.n_subjects(),
        data.n_biomarkers(),
        config.fixed_controls
    );

    let fits = fit_mixtures(data, config.fixed_controls, &config.mixture)?;
    let (mixtures, mixture_diagnostics) = split_fits(fits);
    let probabilities = probability_matrix(&data.measurements, &mixtures)?;

    let likelihood =
        SequenceLikelihood::new(&probabilities, config.staging.stage_prior.as_deref())?;
    let posterior = sample_sequences(&likelihood, &config.mcmc)?;
    let best = posterior
        .maximum_likelihood()
        .cloned()
        .ok_or(EbmError::EmptyPosterior)?;
    let samples = posterior.pooled_samples();
    let positional_variance = positional_variance(&samples, Some(best.ordering.as_slice()))?;
    let convergence = summarize_chain_agreement(&posterior);

    let model = EbmModel {
        log_likelihood: best.log_likelihood,
        biomarker_names: data.biomarker_names(),
        ordering: best.ordering,
        staging: config.staging.clone(),
        mixtures,
        samples,
    };
    log::info!(
        "maximum-likelihood ordering (log-likelihood {:.3}): {}",
        model.log_likelihood,
        model.ordered_names().join(" -> ")
    );

    let stages = model.stage_probabilities(&probabilities)?;
    Ok(EbmFit {
        model,
        mixture_diagnostics,
        probabilities,
        posterior,
        positional_variance,
        stages,
        convergence,
    })
}
