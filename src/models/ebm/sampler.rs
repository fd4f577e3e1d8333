//! Metropolis-Hastings sampling over event orderings.
//!
//! The state is a permutation of the events. Each step swaps two distinct
//! positions and accepts with probability `min(1, exp(delta log-likelihood))`.
//! Chains run on scoped threads, each with its own seeded RNG and
//! accumulator, and are collected in chain order.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngExt, SeedableRng};

use crate::inference::{ChainInitialization, McmcConfig, ProposalStats};
use crate::models::likelihood::SequenceLikelihood;

use super::types::{ChainTrace, EbmError, SequencePosterior, SequenceSample};

/// Run all configured chains.
///
/// # Errors
///
/// Returns `EbmError` if the schedule is invalid or a chain thread panics.
pub fn sample_sequences(
    likelihood: &SequenceLikelihood,
    config: &McmcConfig,
) -> Result<SequencePosterior, EbmError> {
    config.validate()?;
    let deadline = config.max_duration().map(|budget| Instant::now() + budget);
    log::info!(
        "sampling {} events: {} chains x {} iterations (burn-in {}, thin {})",
        likelihood.n_events(),
        config.chains,
        config.iterations,
        config.burn_in,
        config.thin
    );

    let chains = std::thread::scope(|scope| -> Result<Vec<ChainTrace>, EbmError> {
        let handles = (0..config.chains)
            .map(|chain| scope.spawn(move || run_chain(likelihood, config, chain, deadline)))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .enumerate()
            .map(|(chain, handle)| handle.join().map_err(|_| EbmError::ChainFailed { chain }))
            .collect()
    })?;

    for trace in &chains {
        log::debug!(
            "chain {} (seed {}): {} iterations, {} retained, acceptance {:.3}",
            trace.chain,
            trace.seed,
            trace.iterations_completed,
            trace.samples.len(),
            trace.proposals.acceptance_rate()
        );
        if trace.stopped_early {
            log::warn!(
                "chain {} stopped at its deadline after {} of {} iterations",
                trace.chain,
                trace.iterations_completed,
                config.iterations
            );
        }
    }
    Ok(SequencePosterior { chains })
}

/// Per-chain retention state.
#[derive(Debug)]
struct ChainAccumulator {
    burn_in: usize,
    thin: usize,
    samples: Vec<SequenceSample>,
    proposals: ProposalStats,
    iterations_completed: usize,
}

impl ChainAccumulator {
    fn new(config: &McmcConfig) -> Self {
        Self {
            burn_in: config.burn_in,
            thin: config.thin,
            samples: Vec::with_capacity(config.retained_draws()),
            proposals: ProposalStats::default(),
            iterations_completed: 0,
        }
    }

    fn record(&mut self, ordering: &[usize], log_likelihood: f64) {
        let iteration = self.iterations_completed;
        self.iterations_completed += 1;
        if iteration >= self.burn_in && (iteration - self.burn_in).is_multiple_of(self.thin) {
            self.samples.push(SequenceSample {
                log_likelihood,
                ordering: ordering.to_vec(),
            });
        }
    }

    fn finish(self, chain: usize, seed: u64, stopped_early: bool) -> ChainTrace {
        ChainTrace {
            chain,
            seed,
            samples: self.samples,
            proposals: self.proposals,
            iterations_completed: self.iterations_completed,
            stopped_early,
        }
    }
}

fn run_chain(
    likelihood: &SequenceLikelihood,
    config: &McmcConfig,
    chain: usize,
    deadline: Option<Instant>,
) -> ChainTrace {
    let seed = config.chain_seed(chain);
    let mut rng = StdRng::seed_from_u64(seed);
    let n_events = likelihood.n_events();
    let mut ordering = initial_ordering(likelihood, config.initialization, &mut rng);
    let mut scratch = Vec::with_capacity(n_events + 1);
    let mut current = likelihood.log_likelihood_with(&ordering, &mut scratch);
    let mut accumulator = ChainAccumulator::new(config);
    let mut stopped_early = false;

    for _ in 0..config.iterations {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            stopped_early = true;
            break;
        }
        if n_events >= 2 {
            let (a, b) = distinct_positions(n_events, &mut rng);
            ordering.swap(a, b);
            let candidate = likelihood.log_likelihood_with(&ordering, &mut scratch);
            let accepted = should_accept(candidate - current, &mut rng);
            if accepted {
                current = candidate;
            } else {
                ordering.swap(a, b);
            }
            accumulator.proposals.record(accepted);
        }
        accumulator.record(&ordering, current);
    }

    accumulator.finish(chain, seed, stopped_early)
}

/// Starting ordering for a chain.
#[must_use]
pub fn initial_ordering(
    likelihood: &SequenceLikelihood,
    initialization: ChainInitialization,
    rng: &mut StdRng,
) -> Vec<usize> {
    let n_events = likelihood.n_events();
    match initialization {
        ChainInitialization::Random => random_ordering(n_events, rng),
        ChainInitialization::RankBased => rank_ordering(likelihood.mean_abnormality()),
        ChainInitialization::GreedyAscent { iterations } => {
            let start = random_ordering(n_events, rng);
            greedy_ascent(likelihood, start, iterations, rng)
        }
    }
}

fn random_ordering(n_events: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut ordering = (0..n_events).collect::<Vec<_>>();
    ordering.shuffle(rng);
    ordering
}

/// Events sorted by descending mean abnormality; ties keep event order.
#[must_use]
pub fn rank_ordering(mean_abnormality: &[f64]) -> Vec<usize> {
    let mut ordering = (0..mean_abnormality.len()).collect::<Vec<_>>();
    ordering.sort_by(|a, b| mean_abnormality[*b].total_cmp(&mean_abnormality[*a]));
    ordering
}

/// Random swap hill climbing; only strict improvements are kept.
#[must_use]
pub fn greedy_ascent(
    likelihood: &SequenceLikelihood,
    mut ordering: Vec<usize>,
    iterations: usize,
    rng: &mut StdRng,
) -> Vec<usize> {
    let n_events = ordering.len();
    if n_events < 2 {
        return ordering;
    }
    let mut scratch = Vec::with_capacity(n_events + 1);
    let mut current = likelihood.log_likelihood_with(&ordering, &mut scratch);
    for _ in 0..iterations {
        let (a, b) = distinct_positions(n_events, rng);
        ordering.swap(a, b);
        let candidate = likelihood.log_likelihood_with(&ordering, &mut scratch);
        if candidate > current {
            current = candidate;
        } else {
            ordering.swap(a, b);
        }
    }
    ordering
}

fn distinct_positions(n_events: usize, rng: &mut StdRng) -> (usize, usize) {
    let a = rng.random_range(0..n_events);
    let mut b = rng.random_range(0..n_events - 1);
    if b >= a {
        b += 1;
    }
    (a, b)
}

fn should_accept(log_acceptance: f64, rng: &mut StdRng) -> bool {
    log_acceptance >= 0.0 || rng.random::<f64>().ln() < log_acceptance
}

#[cfg(test)]
mod tests {
    use faer::Mat;

    use super::*;
    use crate::models::likelihood::is_valid_ordering;

    fn staircase_likelihood() -> SequenceLikelihood {
        // Subject k has the first k events abnormal under ordering [0, 1, 2].
        let probabilities = Mat::from_fn(8, 3, |row, col| {
            if col < row % 4 { 0.95 } else { 0.05 }
        });
        SequenceLikelihood::new(&probabilities, None).expect("likelihood")
    }

    fn short_config() -> McmcConfig {
        McmcConfig {
            iterations: 400,
            burn_in: 100,
            thin: 3,
            chains: 2,
            seed: 11,
            initialization: ChainInitialization::Random,
            ..McmcConfig::default()
        }
    }

    #[test]
    fn retains_thinned_post_burn_in_states() {
        let likelihood = staircase_likelihood();
        let config = short_config();
        let posterior = sample_sequences(&likelihood, &config).expect("sampling");
        assert_eq!(posterior.chains.len(), 2);
        for trace in &posterior.chains {
            assert_eq!(trace.samples.len(), config.retained_draws());
            assert_eq!(trace.iterations_completed, config.iterations);
            assert_eq!(trace.proposals.proposed, config.iterations);
            assert!(!trace.stopped_early);
            for sample in &trace.samples {
                assert!(is_valid_ordering(&sample.ordering, 3));
            }
        }
    }

    #[test]
    fn same_seed_reproduces_chains() {
        let likelihood = staircase_likelihood();
        let first = sample_sequences(&likelihood, &short_config()).expect("first run");
        let second = sample_sequences(&likelihood, &short_config()).expect("second run");
        assert_eq!(first, second);
        assert_ne!(first.chains[0].seed, first.chains[1].seed);
    }

    #[test]
    fn recovers_staircase_ordering() {
        let likelihood = staircase_likelihood();
        let posterior = sample_sequences(&likelihood, &short_config()).expect("sampling");
        let best = posterior.maximum_likelihood().expect("samples");
        assert_eq!(best.ordering, vec![0, 1, 2]);
    }

    #[test]
    fn single_event_records_every_iteration_without_proposals() {
        let probabilities = Mat::from_fn(3, 1, |row, _| if row == 0 { 0.1 } else { 0.9 });
        let likelihood = SequenceLikelihood::new(&probabilities, None).expect("likelihood");
        let config = McmcConfig {
            iterations: 10,
            burn_in: 0,
            chains: 1,
            ..McmcConfig::default()
        };
        let posterior = sample_sequences(&likelihood, &config).expect("sampling");
        assert_eq!(posterior.len(), 10);
        assert_eq!(posterior.chains[0].proposals.proposed, 0);
        assert!(posterior.samples().all(|sample| sample.ordering == vec![0]));
    }

    #[test]
    fn elapsed_deadline_stops_chains_early() {
        let likelihood = staircase_likelihood();
        let config = McmcConfig {
            max_duration_secs: Some(0.0),
            ..short_config()
        };
        let posterior = sample_sequences(&likelihood, &config).expect("sampling");
        assert!(posterior.stopped_early());
        assert!(posterior.chains.iter().all(|trace| trace.iterations_completed == 0));
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        let likelihood = staircase_likelihood();
        let config = McmcConfig {
            thin: 0,
            ..short_config()
        };
        assert!(matches!(
            sample_sequences(&likelihood, &config),
            Err(EbmError::Inference(_))
        ));
    }

    #[test]
    fn rank_ordering_sorts_by_descending_abnormality() {
        assert_eq!(rank_ordering(&[0.2, 0.9, 0.5, 0.9]), vec![1, 3, 2, 0]);
    }

    #[test]
    fn greedy_ascent_never_decreases_likelihood() {
        let likelihood = staircase_likelihood();
        let mut rng = StdRng::seed_from_u64(3);
        let start = vec![2, 1, 0];
        let start_ll = likelihood.log_likelihood(&start);
        let climbed = greedy_ascent(&likelihood, start, 200, &mut rng);
        assert!(is_valid_ordering(&climbed, 3));
        assert!(likelihood.log_likelihood(&climbed) >= start_ll);
    }

    #[test]
    fn distinct_positions_never_collide() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..500 {
            let (a, b) = distinct_positions(3, &mut rng);
            assert_ne!(a, b);
            assert!(a < 3 && b < 3);
        }
    }
}
