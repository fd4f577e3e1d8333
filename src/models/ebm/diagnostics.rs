//! Convergence diagnostics for ordering chains.

use crate::utils::usize_to_f64;

use super::types::SequencePosterior;

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let mean = series.iter().sum::<f64>() / usize_to_f64(series.len());
    let denominator = series
        .iter()
        .map(|value| (value - mean) * (value - mean))
        .sum::<f64>();
    if denominator <= 0.0 {
        return 0.0;
    }

    let numerator = series
        .iter()
        .zip(&series[lag..])
        .map(|(current, lagged)| (current - mean) * (lagged - mean))
        .sum::<f64>();
    numerator / denominator
}

/// Effective sample size with truncation at the first non-positive
/// autocorrelation.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return usize_to_f64(n);
    }

    let mut rho_sum = 0.0;
    for lag in 1..n {
        let rho = autocorrelation(series, lag);
        if rho <= 0.0 {
            break;
        }
        rho_sum += rho;
    }

    usize_to_f64(n) / (2.0f64.mul_add(rho_sum, 1.0)).max(1.0)
}

/// Number of event pairs ordered differently by `a` and `b`.
///
/// Both orderings must be permutations of the same events.
#[must_use]
pub fn kendall_tau_distance(a: &[usize], b: &[usize]) -> usize {
    let n = a.len().min(b.len());
    let mut position_in_b = vec![0usize; n];
    for (position, event) in b.iter().enumerate().take(n) {
        if *event < n {
            position_in_b[*event] = position;
        }
    }
    let mapped = a
        .iter()
        .take(n)
        .map(|event| position_in_b.get(*event).copied().unwrap_or(0))
        .collect::<Vec<_>>();
    let mut discordant = 0;
    for i in 0..n {
        for j in i + 1..n {
            if mapped[i] > mapped[j] {
                discordant += 1;
            }
        }
    }
    discordant
}

/// Per-chain convergence summary.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub chain: usize,
    pub best_log_likelihood: Option<f64>,
    pub acceptance_rate: f64,
    pub log_likelihood_ess: f64,
    /// Kendall distance between this chain's best ordering and the global
    /// maximum-likelihood ordering.
    pub distance_to_best: Option<usize>,
}

/// Agreement across chains.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceSummary {
    pub chains: Vec<ChainSummary>,
    pub max_distance: usize,
    /// Chains disagree on their best ordering; only set with two or more
    /// chains.
    pub divergent: bool,
}

/// Summarize how well chains agree.
///
/// Divergence is logged as a warning and never returned as an error.
#[must_use]
pub fn summarize_chain_agreement(posterior: &SequencePosterior) -> ConvergenceSummary {
    let global = posterior.maximum_likelihood();
    let chains = posterior
        .chains
        .iter()
        .map(|trace| {
            let best = trace.best();
            ChainSummary {
                chain: trace.chain,
                best_log_likelihood: best.map(|sample| sample.log_likelihood),
                acceptance_rate: trace.proposals.acceptance_rate(),
                log_likelihood_ess: effective_sample_size(&trace.log_likelihood_trace()),
                distance_to_best: best.zip(global).map(|(local, global)| {
                    kendall_tau_distance(&local.ordering, &global.ordering)
                }),
            }
        })
        .collect::<Vec<_>>();

    let max_distance = chains
        .iter()
        .filter_map(|summary| summary.distance_to_best)
        .max()
        .unwrap_or(0);
    let divergent = chains.len() >= 2 && max_distance > 0;
    if divergent {
        log::warn!(
            "chains disagree on the best ordering (max Kendall distance {max_distance}); consider more iterations"
        );
    }
    ConvergenceSummary {
        chains,
        max_distance,
        divergent,
    }
}
