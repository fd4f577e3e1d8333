//! Reusable inference and MCMC utility types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::usize_to_f64;

/// Errors for MCMC configuration.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InferenceError {
    #[error("iterations must be positive")]
    InvalidIterations,
    #[error("burn-in ({burn_in}) must be smaller than iterations ({iterations})")]
    InvalidBurnIn { burn_in: usize, iterations: usize },
    #[error("thinning interval must be positive")]
    InvalidThinning,
    #[error("at least one chain is required")]
    InvalidChainCount,
    #[error("multi-chain seed stride must be positive")]
    InvalidSeedStride,
    #[error("greedy initialization requires a positive iteration count")]
    InvalidGreedyIterations,
    #[error("time budget must be a finite, non-negative number of seconds")]
    InvalidDuration,
}

/// Starting ordering for each chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainInitialization {
    /// Seeded uniform random permutation.
    Random,
    /// Events sorted by descending mean abnormality probability.
    RankBased,
    /// Greedy swap ascent from a random permutation before sampling starts.
    GreedyAscent { iterations: usize },
}

impl Default for ChainInitialization {
    fn default() -> Self {
        Self::GreedyAscent { iterations: 1_000 }
    }
}

/// MCMC schedule over event orderings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcConfig {
    /// Total iterations per chain, burn-in included.
    pub iterations: usize,
    /// Iterations discarded before retention.
    pub burn_in: usize,
    /// Keep every `thin`-th state after burn-in.
    pub thin: usize,
    /// Number of independent chains.
    pub chains: usize,
    /// Master seed.
    pub seed: u64,
    /// Chain `c` uses `seed + c * seed_stride` with wrapping arithmetic.
    pub seed_stride: u64,
    pub initialization: ChainInitialization,
    /// Wall-clock budget per run in seconds; chains stop early once it
    /// elapses.
    pub max_duration_secs: Option<f64>,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            iterations: 10_000,
            burn_in: 1_000,
            thin: 1,
            chains: 4,
            seed: 42,
            seed_stride: 10_000,
            initialization: ChainInitialization::default(),
            max_duration_secs: None,
        }
    }
}

impl McmcConfig {
    /// # Errors
    ///
    /// Returns `InferenceError` if schedule values are invalid.
    pub const fn validate(&self) -> Result<(), InferenceError> {
        if self.iterations == 0 {
            return Err(InferenceError::InvalidIterations);
        }
        if self.burn_in >= self.iterations {
            return Err(InferenceError::InvalidBurnIn {
                burn_in: self.burn_in,
                iterations: self.iterations,
            });
        }
        if self.thin == 0 {
            return Err(InferenceError::InvalidThinning);
        }
        if self.chains == 0 {
            return Err(InferenceError::InvalidChainCount);
        }
        if self.seed_stride == 0 {
            return Err(InferenceError::InvalidSeedStride);
        }
        if let ChainInitialization::GreedyAscent { iterations: 0 } = self.initialization {
            return Err(InferenceError::InvalidGreedyIterations);
        }
        match self.max_duration_secs {
            Some(secs) if !(secs.is_finite() && secs >= 0.0) => {
                Err(InferenceError::InvalidDuration)
            }
            _ => Ok(()),
        }
    }

    /// Time budget, if one is set and valid.
    #[must_use]
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Number of retained draws per chain implied by this configuration.
    #[must_use]
    pub const fn retained_draws(&self) -> usize {
        (self.iterations - self.burn_in).div_ceil(self.thin)
    }

    /// Seed of chain `chain_index`.
    #[must_use]
    pub fn chain_seed(&self, chain_index: usize) -> u64 {
        let index_u64 = u64::try_from(chain_index).unwrap_or(u64::MAX);
        self.seed
            .wrapping_add(index_u64.wrapping_mul(self.seed_stride))
    }
}

/// Proposal counters for a Metropolis-Hastings chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalStats {
    pub proposed: usize,
    pub accepted: usize,
}

impl ProposalStats {
    /// Record one proposal and whether it was accepted.
    pub const fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Acceptance rate in `[0, 1]`, or `0` if no proposals were made.
    #[must_use]
    pub fn acceptance_rate(self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            usize_to_f64(self.accepted) / usize_to_f64(self.proposed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_rejects_zero_iterations() {
        let config = McmcConfig {
            iterations: 0,
            ..McmcConfig::default()
        };
        assert_eq!(config.validate(), Err(InferenceError::InvalidIterations));
    }

    #[test]
    fn config_validation_rejects_burn_in_past_iterations() {
        let config = McmcConfig {
            iterations: 100,
            burn_in: 100,
            ..McmcConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InferenceError::InvalidBurnIn {
                burn_in: 100,
                iterations: 100
            })
        );
    }

    #[test]
    fn time_budget_reads_as_seconds_from_toml() {
        let source = "max_duration_secs = 2.5\ninitialization = \"rank_based\"\n";
        let config = toml::from_str::<McmcConfig>(source).expect("toml");
        assert_eq!(config.max_duration(), Some(Duration::from_millis(2_500)));
        assert_eq!(config.initialization, ChainInitialization::RankBased);
        assert_eq!(config.validate(), Ok(()));
        let written = toml::to_string(&config).expect("serialize");
        assert!(written.contains("max_duration_secs = 2.5"), "{written}");
        assert_eq!(McmcConfig::default().max_duration(), None);
    }

    #[test]
    fn config_validation_rejects_invalid_time_budget() {
        for secs in [-1.0, f64::NAN, f64::INFINITY] {
            let config = McmcConfig {
                max_duration_secs: Some(secs),
                ..McmcConfig::default()
            };
            assert_eq!(config.validate(), Err(InferenceError::InvalidDuration));
        }
    }

    #[test]
    fn config_validation_rejects_zero_greedy_iterations() {
        let config = McmcConfig {
            initialization: ChainInitialization::GreedyAscent { iterations: 0 },
            ..McmcConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InferenceError::InvalidGreedyIterations)
        );
    }

    #[test]
    fn retained_draws_counts_first_post_burn_in_state() {
        let config = McmcConfig {
            iterations: 100,
            burn_in: 20,
            thin: 3,
            ..McmcConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.retained_draws(), 27);
    }

    #[test]
    fn chain_seeds_are_distinct() {
        let config = McmcConfig::default();
        assert_eq!(config.chain_seed(0), config.seed);
        assert_ne!(config.chain_seed(1), config.chain_seed(2));
    }

    #[test]
    fn proposal_stats_tracks_acceptance() {
        let mut stats = ProposalStats::default();
        stats.record(true);
        stats.record(false);
        assert!((stats.acceptance_rate() - 0.5).abs() < 1.0e-12);
    }
}
