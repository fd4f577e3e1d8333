//! Core public types for the event-based model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::{InferenceError, McmcConfig, ProposalStats};
use crate::input::InputError;
use crate::models::likelihood::LikelihoodError;
use crate::models::mixture::{MixtureError, MixtureOptions};

use super::staging::StagingOptions;

/// Errors returned by event-based model configuration, fitting, and staging.
#[derive(Debug, Error)]
pub enum EbmError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),
    #[error(transparent)]
    Mixture(#[from] MixtureError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Likelihood(#[from] LikelihoodError),
    #[error("at least one retained ordering is required")]
    EmptyPosterior,
    #[error("ordering is not a permutation of 0..{n_events}")]
    InvalidOrdering { n_events: usize },
    #[error("probability row has {found} entries; expected {expected}")]
    ProbabilityLength { expected: usize, found: usize },
    #[error("longitudinal input has {visits} visits but {rows} probability rows")]
    VisitCountMismatch { visits: usize, rows: usize },
    #[error("probabilities must lie in [0, 1]")]
    InvalidProbability,
    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error("sampler thread for chain {chain} panicked")]
    ChainFailed { chain: usize },
}

/// One retained ordering and its data log-likelihood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSample {
    pub log_likelihood: f64,
    /// `ordering[position] = event`.
    pub ordering: Vec<usize>,
}

/// Retained output of one MCMC chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTrace {
    pub chain: usize,
    pub seed: u64,
    pub samples: Vec<SequenceSample>,
    pub proposals: ProposalStats,
    pub iterations_completed: usize,
    /// The wall-clock deadline elapsed before the schedule finished.
    pub stopped_early: bool,
}

impl ChainTrace {
    /// Highest log-likelihood retained sample; ties keep the earliest.
    #[must_use]
    pub fn best(&self) -> Option<&SequenceSample> {
        first_maximum(self.samples.iter())
    }

    /// Log-likelihood of each retained sample in order.
    #[must_use]
    pub fn log_likelihood_trace(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|sample| sample.log_likelihood)
            .collect()
    }
}

/// All chain traces of one sampler run, in chain order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequencePosterior {
    pub chains: Vec<ChainTrace>,
}

impl SequencePosterior {
    /// Total number of retained samples across chains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.iter().map(|chain| chain.samples.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained samples of every chain, chain by chain.
    pub fn samples(&self) -> impl Iterator<Item = &SequenceSample> {
        self.chains.iter().flat_map(|chain| chain.samples.iter())
    }

    #[must_use]
    pub fn pooled_samples(&self) -> Vec<SequenceSample> {
        self.samples().cloned().collect()
    }

    /// Maximum-likelihood sample over all chains; ties resolve to the first
    /// occurrence in chain order.
    #[must_use]
    pub fn maximum_likelihood(&self) -> Option<&SequenceSample> {
        first_maximum(self.samples())
    }

    /// Whether any chain hit its deadline.
    #[must_use]
    pub fn stopped_early(&self) -> bool {
        self.chains.iter().any(|chain| chain.stopped_early)
    }
}

pub(crate) fn first_maximum<'a>(
    samples: impl Iterator<Item = &'a SequenceSample>,
) -> Option<&'a SequenceSample> {
    samples.fold(None, |best: Option<&SequenceSample>, sample| match best {
        Some(current) if current.log_likelihood >= sample.log_likelihood => Some(current),
        _ => Some(sample),
    })
}

/// Full event-based model configuration.
///
/// Loadable from TOML; missing fields take their defaults.
///
/// ```
/// use event_based_models::EbmConfig;
///
/// let config = EbmConfig::from_toml_str(
///     "fixed_controls = false\n[mcmc]\niterations = 500\nburn_in = 100\n",
/// )
/// .expect("valid config");
/// assert!(!config.fixed_controls);
/// assert_eq!(config.mcmc.iterations, 500);
/// assert_eq!(config.mcmc.chains, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EbmConfig {
    /// Anchor each pre-event density on the labelled controls.
    pub fixed_controls: bool,
    pub mixture: MixtureOptions,
    pub mcmc: McmcConfig,
    pub staging: StagingOptions,
}

impl Default for EbmConfig {
    fn default() -> Self {
        Self {
            fixed_controls: true,
            mixture: MixtureOptions::default(),
            mcmc: McmcConfig::default(),
            staging: StagingOptions::default(),
        }
    }
}

impl EbmConfig {
    /// # Errors
    ///
    /// Returns `EbmError::Config` if the TOML is malformed.
    pub fn from_toml_str(source: &str) -> Result<Self, EbmError> {
        Ok(toml::from_str(source)?)
    }

    /// # Errors
    ///
    /// Returns `EbmError` if mixture options, the MCMC schedule, or the stage
    /// prior are invalid for `n_events` biomarkers.
    pub fn validate(&self, n_events: usize) -> Result<(), EbmError> {
        if !self.mixture.is_valid() {
            return Err(MixtureError::InvalidOptions.into());
        }
        self.mcmc.validate()?;
        self.staging.validate(n_events)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(log_likelihood: f64, ordering: &[usize]) -> SequenceSample {
        SequenceSample {
            log_likelihood,
            ordering: ordering.to_vec(),
        }
    }

    fn trace(chain: usize, samples: Vec<SequenceSample>) -> ChainTrace {
        ChainTrace {
            chain,
            seed: 0,
            samples,
            proposals: ProposalStats::default(),
            iterations_completed: 0,
            stopped_early: false,
        }
    }

    #[test]
    fn maximum_likelihood_prefers_first_tie_in_chain_order() {
        let posterior = SequencePosterior {
            chains: vec![
                trace(0, vec![sample(-5.0, &[0, 1]), sample(-2.0, &[1, 0])]),
                trace(1, vec![sample(-2.0, &[0, 1])]),
            ],
        };
        let best = posterior.maximum_likelihood().expect("samples");
        assert_eq!(best.ordering, vec![1, 0]);
        assert_eq!(posterior.len(), 3);
        assert_eq!(posterior.pooled_samples().len(), 3);
    }

    #[test]
    fn empty_posterior_has_no_maximum() {
        let posterior = SequencePosterior {
            chains: vec![trace(0, Vec::new())],
        };
        assert!(posterior.is_empty());
        assert!(posterior.maximum_likelihood().is_none());
        assert!(!posterior.stopped_early());
    }

    #[test]
    fn config_parses_nested_tables() {
        let config = EbmConfig::from_toml_str(
            r#"
fixed_controls = true

[mixture]
grid_points = 64
bandwidth = "scott"

[mcmc]
iterations = 2000
burn_in = 500
chains = 2
initialization = "rank_based"

[staging]
mode = "posterior_average"
"#,
        )
        .expect("config should parse");
        assert_eq!(config.mixture.grid_points, 64);
        assert_eq!(config.mcmc.chains, 2);
        assert!(config.validate(3).is_ok());
    }

    #[test]
    fn config_rejects_malformed_toml() {
        assert!(matches!(
            EbmConfig::from_toml_str("fixed_controls = maybe"),
            Err(EbmError::Config(_))
        ));
    }

    #[test]
    fn config_validation_reports_invalid_schedule() {
        let mut config = EbmConfig::default();
        config.mcmc.burn_in = config.mcmc.iterations;
        assert!(matches!(config.validate(2), Err(EbmError::Inference(_))));
    }
}
