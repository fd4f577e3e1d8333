/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Two-component KDE mixture models for biomarker event probabilities.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # KDE mixture models
//!
//! Each biomarker is modelled as a two-component mixture:
//! - a pre-event density (the "event has not occurred" population),
//! - a post-event density (the "event has occurred" population),
//! - a mixing weight, the prior probability of the post-event state.
//!
//! Components are Gaussian KDEs refined by EM. The fitting strategy is
//! chosen once per fit. Known controls can anchor the pre-event density
//! while the remaining subjects carry soft responsibilities. Without that
//! anchor, subjects are ranked along the abnormality direction and split
//! into a pre-event head and a post-event tail; the split point moves to
//! agree with leave-one-out posteriors until it stops moving.
//!
//! Post-event probabilities are exposed through a monotone lookup grid so
//! that evaluation is consistent with the declared abnormality direction
//! and is defined for any real value.

use std::cmp::Reverse;
use std::ops::Range;

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use statrs::function::logistic::logistic;
use thiserror::Error;

use super::kde::{BandwidthRule, WeightedKde};
use crate::input::{BiomarkerData, Direction, GroupLabel, InputError};
use crate::preprocess::{column_has_variation, summarize_biomarker};
use crate::utils::{column_values, usize_to_f64};

const MIN_MIXING_WEIGHT: f64 = 1.0e-6;
const MIN_COMPONENT_SUBJECTS: usize = 2;
const MIN_COMPONENT_SHARE: f64 = 0.01;
const FALLBACK_TAIL_SHARE: f64 = 0.1;
const MIN_SEPARATION: f64 = 0.5;
const GRID_PADDING_BANDWIDTHS: f64 = 3.0;

/// Errors returned by mixture fitting.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MixtureError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("fixed controls require group labels")]
    MissingLabels,
    #[error("invalid mixture options")]
    InvalidOptions,
    #[error("biomarker {biomarker} has no finite values to fit")]
    NoFiniteValues { biomarker: usize },
}

/// Tuning parameters for mixture fitting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixtureOptions {
    pub bandwidth: BandwidthRule,
    /// Maximum number of EM iterations.
    pub max_iterations: usize,
    /// Convergence tolerance on the maximum responsibility change of
    /// anchored EM. Unanchored EM converges when its split stops moving.
    pub tolerance: f64,
    /// Number of points in the monotone probability grid.
    pub grid_points: usize,
    /// Controls required before the pre-event density is anchored on them.
    pub min_controls: usize,
}

impl Default for MixtureOptions {
    fn default() -> Self {
        Self {
            bandwidth: BandwidthRule::Silverman,
            max_iterations: 200,
            tolerance: 1.0e-5,
            grid_points: 256,
            min_controls: 2,
        }
    }
}

impl MixtureOptions {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.bandwidth.is_valid()
            && self.max_iterations > 0
            && self.tolerance > 0.0
            && self.tolerance.is_finite()
            && self.grid_points >= 2
            && self.min_controls >= 1
    }
}

/// How component membership is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixtureStrategy {
    /// Controls define the pre-event density; everyone else is mixed-membership.
    AnchoredControls,
    /// No subject is fixed; labels only seed initialization.
    FullEm,
}

impl MixtureStrategy {
    #[must_use]
    pub const fn from_fixed_controls(fixed_controls: bool) -> Self {
        if fixed_controls {
            Self::AnchoredControls
        } else {
            Self::FullEm
        }
    }
}

/// Mixture component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    PreEvent,
    PostEvent,
}

/// Non-fatal reasons a biomarker fit is low-information.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DegenerateReason {
    /// Every subject has the same value.
    ConstantBiomarker,
    /// Too few controls to anchor the pre-event density; unanchored EM was used.
    InsufficientControls { found: usize, required: usize },
    /// A component shrank to a handful of subjects and holds only the
    /// extreme tail on its side.
    EmptyComponent(Component),
    /// Standardized distance between component medians is below threshold.
    PoorSeparation { separation: f64 },
    /// EM stopped at the iteration limit.
    NotConverged { iterations: usize },
}

/// Per-biomarker fitting diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureDiagnostics {
    pub biomarker: usize,
    /// Strategy actually used after fallbacks.
    pub strategy: MixtureStrategy,
    pub iterations: usize,
    pub converged: bool,
    /// Signed standardized distance between post- and pre-event medians.
    pub separation: f64,
    /// Total post-event responsibility; leave-one-out posteriors for
    /// unanchored fits.
    pub post_event_mass: f64,
    pub degenerate: Vec<DegenerateReason>,
}

impl MixtureDiagnostics {
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        !self.degenerate.is_empty()
    }
}

/// Fitted two-component mixture for one biomarker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureModel {
    pub biomarker: usize,
    pub direction: Direction,
    /// Prior probability of the post-event state.
    pub mixing_weight: f64,
    pub grid: Vec<f64>,
    /// Monotone post-event probabilities aligned with `grid`.
    pub grid_probabilities: Vec<f64>,
    pub pre_event: WeightedKde,
    pub post_event: WeightedKde,
}

impl MixtureModel {
    /// Bayes posterior probability of the post-event state at `x`, without
    /// monotone correction.
    #[must_use]
    pub fn raw_probability(&self, x: f64) -> f64 {
        let log_post = self.mixing_weight.ln() + self.post_event.log_density(x);
        let log_pre = (-self.mixing_weight).ln_1p() + self.pre_event.log_density(x);
        let log_odds = log_post - log_pre;
        if log_odds.is_nan() {
            self.mixing_weight
        } else {
            logistic(log_odds)
        }
    }

    /// Monotone post-event probability at `x`.
    ///
    /// Linear interpolation inside the grid, clamped to the end values
    /// outside it. `NaN` maps to the mixing weight.
    #[must_use]
    pub fn probability(&self, x: f64) -> f64 {
        if x.is_nan() {
            return self.mixing_weight;
        }
        let n = self.grid.len();
        if n == 0 {
            return self.mixing_weight;
        }
        if x <= self.grid[0] {
            return self.grid_probabilities[0];
        }
        if x >= self.grid[n - 1] {
            return self.grid_probabilities[n - 1];
        }
        let upper = self.grid.partition_point(|point| *point <= x);
        let lower = upper - 1;
        let span = self.grid[upper] - self.grid[lower];
        if span <= 0.0 {
            return self.grid_probabilities[upper];
        }
        let t = (x - self.grid[lower]) / span;
        t.mul_add(
            self.grid_probabilities[upper] - self.grid_probabilities[lower],
            self.grid_probabilities[lower],
        )
    }
}

/// Fitted mixture together with its diagnostics.
#[derive(Debug, Clone)]
pub struct MixtureFit {
    pub model: MixtureModel,
    pub diagnostics: MixtureDiagnostics,
}

/// Fit one mixture per biomarker column.
///
/// `fixed_controls` selects the strategy once for every biomarker. Poorly
/// separated biomarkers still produce a best-effort fit; the condition is
/// logged and recorded in the diagnostics.
///
/// # Errors
///
/// Returns `MixtureError` if input is malformed, options are invalid, or
/// fixed controls are requested without labels.
pub fn fit_mixtures(
    data: &BiomarkerData,
    fixed_controls: bool,
    options: &MixtureOptions,
) -> Result<Vec<MixtureFit>, MixtureError> {
    if !options.is_valid() {
        return Err(MixtureError::InvalidOptions);
    }
    data.validate()?;
    let strategy = MixtureStrategy::from_fixed_controls(fixed_controls);
    if strategy == MixtureStrategy::AnchoredControls && data.labels.is_none() {
        return Err(MixtureError::MissingLabels);
    }

    let names = data.biomarker_names();
    (0..data.n_biomarkers())
        .map(|column| -> Result<MixtureFit, MixtureError> {
            let values = column_values(&data.measurements, column);
            let constant = !column_has_variation(&data.measurements, column, 0.0);
            let fit = fit_biomarker(
                &BiomarkerRequest {
                    biomarker: column,
                    values: &values,
                    labels: data.labels(),
                    direction: data.directions[column],
                    constant,
                },
                strategy,
                options,
            )?;
            log::debug!(
                "{}: mixing weight {:.3}, separation {:.2}, {} EM iterations",
                names[column],
                fit.model.mixing_weight,
                fit.diagnostics.separation,
                fit.diagnostics.iterations
            );
            for reason in &fit.diagnostics.degenerate {
                log::warn!("{}: degenerate mixture fit ({reason:?})", names[column]);
            }
            Ok(fit)
        })
        .collect()
}

/// Split fitted mixtures into models and diagnostics.
#[must_use]
pub fn split_fits(fits: Vec<MixtureFit>) -> (Vec<MixtureModel>, Vec<MixtureDiagnostics>) {
    fits.into_iter()
        .map(|fit| (fit.model, fit.diagnostics))
        .unzip()
}

struct BiomarkerRequest<'a> {
    biomarker: usize,
    values: &'a [f64],
    labels: Option<&'a [GroupLabel]>,
    direction: Direction,
    constant: bool,
}

struct Components {
    pre: WeightedKde,
    post: WeightedKde,
    mixing: f64,
    empty: Option<Component>,
}

struct EmOutcome {
    components: Components,
    responsibilities: Vec<f64>,
    iterations: usize,
    converged: bool,
}

fn fit_biomarker(
    request: &BiomarkerRequest<'_>,
    requested: MixtureStrategy,
    options: &MixtureOptions,
) -> Result<MixtureFit, MixtureError> {
    let BiomarkerRequest {
        biomarker,
        values,
        labels,
        direction,
        constant,
    } = *request;
    let summary = summarize_biomarker(values, labels, biomarker);
    let mut degenerate = Vec::new();
    if constant {
        degenerate.push(DegenerateReason::ConstantBiomarker);
    }

    let strategy = if requested == MixtureStrategy::AnchoredControls
        && summary.n_controls < options.min_controls
    {
        degenerate.push(DegenerateReason::InsufficientControls {
            found: summary.n_controls,
            required: options.min_controls,
        });
        MixtureStrategy::FullEm
    } else {
        requested
    };

    let threshold = summary.initial_threshold();
    let outcome = match strategy {
        MixtureStrategy::AnchoredControls => {
            let anchored = anchored_mask(values.len(), labels);
            anchored_em(values, &anchored, direction, threshold, options)
        }
        MixtureStrategy::FullEm => partition_em(values, direction, threshold, options),
    }
    .ok_or(MixtureError::NoFiniteValues { biomarker })?;
    let EmOutcome {
        components,
        responsibilities,
        iterations,
        converged,
    } = outcome;

    if !converged {
        degenerate.push(DegenerateReason::NotConverged { iterations });
    }
    if let Some(component) = components.empty {
        degenerate.push(DegenerateReason::EmptyComponent(component));
    }

    let separation = standardized_separation(&components.pre, &components.post, direction);
    if !constant && separation < MIN_SEPARATION {
        degenerate.push(DegenerateReason::PoorSeparation { separation });
    }

    let (grid, grid_probabilities) = monotone_grid(&components, direction, options.grid_points);

    Ok(MixtureFit {
        model: MixtureModel {
            biomarker,
            direction,
            mixing_weight: components.mixing,
            grid,
            grid_probabilities,
            pre_event: components.pre,
            post_event: components.post,
        },
        diagnostics: MixtureDiagnostics {
            biomarker,
            strategy,
            iterations,
            converged,
            separation,
            post_event_mass: responsibilities.iter().sum(),
            degenerate,
        },
    })
}

fn anchored_mask(n: usize, labels: Option<&[GroupLabel]>) -> Vec<bool> {
    labels.map_or_else(
        || vec![false; n],
        |labels| {
            labels
                .iter()
                .map(|label| *label == GroupLabel::Control)
                .collect()
        },
    )
}

/// Smallest subject count a component may hold before it counts as empty.
fn min_component_size(n: usize) -> usize {
    (usize_to_f64(n) * MIN_COMPONENT_SHARE)
        .ceil()
        .to_usize()
        .unwrap_or(0)
        .max(MIN_COMPONENT_SUBJECTS)
}

fn clamp_mixing(mixing: f64) -> f64 {
    mixing.clamp(MIN_MIXING_WEIGHT, 1.0 - MIN_MIXING_WEIGHT)
}

/// Soft EM with the pre-event density fixed on the controls.
fn anchored_em(
    values: &[f64],
    anchored: &[bool],
    direction: Direction,
    threshold: f64,
    options: &MixtureOptions,
) -> Option<EmOutcome> {
    let control_weights = anchored
        .iter()
        .map(|fixed| if *fixed { 1.0 } else { 0.0 })
        .collect::<Vec<_>>();
    let anchor = WeightedKde::fit(values, &control_weights, options.bandwidth)?;

    let mut responsibilities = values
        .iter()
        .zip(anchored)
        .map(|(value, fixed)| {
            if !*fixed && direction.is_beyond(*value, threshold) {
                1.0
            } else {
                0.0
            }
        })
        .collect::<Vec<_>>();

    let mut iterations = 0;
    let mut converged = false;
    while iterations < options.max_iterations {
        iterations += 1;
        let components =
            anchored_components(values, &responsibilities, &anchor, direction, options.bandwidth)?;
        let max_change = update_responsibilities(
            values,
            anchored,
            &components,
            &mut responsibilities,
        );
        if max_change < options.tolerance {
            converged = true;
            break;
        }
    }

    Some(EmOutcome {
        components: anchored_components(
            values,
            &responsibilities,
            &anchor,
            direction,
            options.bandwidth,
        )?,
        responsibilities,
        iterations,
        converged,
    })
}

fn anchored_components(
    values: &[f64],
    responsibilities: &[f64],
    anchor: &WeightedKde,
    direction: Direction,
    rule: BandwidthRule,
) -> Option<Components> {
    let post_mass = responsibilities.iter().sum::<f64>();
    let fitted = if post_mass >= usize_to_f64(min_component_size(values.len())) {
        WeightedKde::fit(values, responsibilities, rule)
    } else {
        None
    };
    let (post, empty) = match fitted {
        Some(post) => (post, None),
        None => (
            tail_kde(values, direction, Component::PostEvent, rule)?,
            Some(Component::PostEvent),
        ),
    };
    Some(Components {
        pre: anchor.clone(),
        post,
        mixing: clamp_mixing(post_mass / usize_to_f64(values.len()).max(1.0)),
        empty,
    })
}

/// KDE over the most extreme values on one side of the axis.
///
/// `None` only when `values` has no finite entry.
fn tail_kde(
    values: &[f64],
    direction: Direction,
    component: Component,
    rule: BandwidthRule,
) -> Option<WeightedKde> {
    let mut order = (0..values.len()).collect::<Vec<_>>();
    let orientation = match component {
        Component::PostEvent => direction.sign(),
        Component::PreEvent => -direction.sign(),
    };
    order.sort_by(|a, b| (orientation * values[*b]).total_cmp(&(orientation * values[*a])));

    let count = (usize_to_f64(values.len()) * FALLBACK_TAIL_SHARE).ceil();
    let count = count
        .to_usize()
        .unwrap_or(1)
        .clamp(1, values.len().max(1));
    let mut weights = vec![0.0; values.len()];
    for index in order.into_iter().take(count) {
        weights[index] = 1.0;
    }
    WeightedKde::fit(values, &weights, rule)
}

fn update_responsibilities(
    values: &[f64],
    anchored: &[bool],
    components: &Components,
    responsibilities: &mut [f64],
) -> f64 {
    let log_mixing = components.mixing.ln();
    let log_complement = (-components.mixing).ln_1p();
    let mut max_change = 0.0_f64;
    for ((value, fixed), responsibility) in values
        .iter()
        .zip(anchored)
        .zip(responsibilities.iter_mut())
    {
        if *fixed {
            continue;
        }
        let log_odds = (log_mixing + components.post.log_density(*value))
            - (log_complement + components.pre.log_density(*value));
        let next = posterior_from_log_odds(log_odds, components.mixing);
        max_change = max_change.max((next - *responsibility).abs());
        *responsibility = next;
    }
    max_change
}

fn posterior_from_log_odds(log_odds: f64, mixing: f64) -> f64 {
    if log_odds.is_nan() {
        mixing
    } else {
        logistic(log_odds)
    }
}

/// Subjects ranked from most to least abnormal; the leading `cut` form the
/// post-event component.
struct Partition<'a> {
    values: &'a [f64],
    ranked: Vec<usize>,
    rule: BandwidthRule,
}

impl<'a> Partition<'a> {
    fn new(values: &'a [f64], direction: Direction, rule: BandwidthRule) -> Self {
        let sign = direction.sign();
        let mut ranked = (0..values.len()).collect::<Vec<_>>();
        ranked.sort_by(|a, b| (sign * values[*b]).total_cmp(&(sign * values[*a])));
        Self {
            values,
            ranked,
            rule,
        }
    }

    fn len(&self) -> usize {
        self.ranked.len()
    }

    fn side(&self, ranks: Range<usize>) -> Vec<f64> {
        self.ranked[ranks]
            .iter()
            .map(|index| self.values[*index])
            .collect()
    }

    /// Unweighted KDEs on each side of `cut`. An empty side falls back to
    /// the extreme tail on its side of the axis.
    fn components(&self, cut: usize, direction: Direction) -> Option<Components> {
        let n = self.len();
        let min_size = min_component_size(n);
        let post = match WeightedKde::fit_unweighted(&self.side(0..cut), self.rule) {
            Some(post) => post,
            None => tail_kde(self.values, direction, Component::PostEvent, self.rule)?,
        };
        let pre = match WeightedKde::fit_unweighted(&self.side(cut..n), self.rule) {
            Some(pre) => pre,
            None => tail_kde(self.values, direction, Component::PreEvent, self.rule)?,
        };
        let empty = if cut <= min_size {
            Some(Component::PostEvent)
        } else if n - cut <= min_size {
            Some(Component::PreEvent)
        } else {
            None
        };
        Some(Components {
            pre,
            post,
            mixing: clamp_mixing(usize_to_f64(cut) / usize_to_f64(n).max(1.0)),
            empty,
        })
    }

    /// Post-event posterior of every subject in rank order, scoring each
    /// against its own component with its kernel left out.
    fn leave_one_out_posteriors(&self, cut: usize, components: &Components) -> Vec<f64> {
        let log_mixing = components.mixing.ln();
        let log_complement = (-components.mixing).ln_1p();
        self.ranked
            .iter()
            .enumerate()
            .map(|(rank, index)| {
                let x = self.values[*index];
                let (log_post, log_pre) = if rank < cut {
                    (
                        components.post.leave_one_out_log_density(rank),
                        components.pre.log_density(x),
                    )
                } else {
                    (
                        components.post.log_density(x),
                        components.pre.leave_one_out_log_density(rank - cut),
                    )
                };
                posterior_from_log_odds(
                    (log_mixing + log_post) - (log_complement + log_pre),
                    components.mixing,
                )
            })
            .collect()
    }

    /// Responsibilities in subject order.
    fn to_subject_order(&self, ranked_posteriors: &[f64]) -> Vec<f64> {
        let mut responsibilities = vec![0.0; self.len()];
        for (index, posterior) in self.ranked.iter().zip(ranked_posteriors) {
            responsibilities[*index] = *posterior;
        }
        responsibilities
    }
}

/// Cut in `lo..=hi` that agrees with the most posteriors: ranks before it at
/// or above one half, ranks after it below. Ties go to the cut nearest
/// `current`, then to the smaller cut.
fn best_agreeing_cut(ranked_posteriors: &[f64], current: usize, lo: usize, hi: usize) -> usize {
    let n = ranked_posteriors.len();
    let is_post = |p: f64| p >= 0.5;
    let total_post = ranked_posteriors.iter().filter(|p| is_post(**p)).count();
    let mut post_before = ranked_posteriors[..lo].iter().filter(|p| is_post(**p)).count();
    let mut best = current;
    let mut best_key = None;
    for cut in lo..=hi {
        if cut > lo && is_post(ranked_posteriors[cut - 1]) {
            post_before += 1;
        }
        let agreement = post_before + (n - cut) - (total_post - post_before);
        let key = (agreement, Reverse(cut.abs_diff(current)));
        if best_key.is_none_or(|incumbent| key > incumbent) {
            best_key = Some(key);
            best = cut;
        }
    }
    best
}

/// Hard-assignment EM over monotone splits of the ranked subjects.
fn partition_em(
    values: &[f64],
    direction: Direction,
    threshold: f64,
    options: &MixtureOptions,
) -> Option<EmOutcome> {
    let partition = Partition::new(values, direction, options.bandwidth);
    let n = partition.len();
    let lo = min_component_size(n).min(n / 2);
    let hi = n - lo;
    let mut cut = values
        .iter()
        .filter(|value| direction.is_beyond(**value, threshold))
        .count()
        .clamp(lo, hi);

    let mut iterations = 0;
    let mut converged = false;
    let mut components = partition.components(cut, direction)?;
    let mut posteriors = partition.leave_one_out_posteriors(cut, &components);
    while iterations < options.max_iterations {
        iterations += 1;
        let next = best_agreeing_cut(&posteriors, cut, lo, hi);
        if next == cut {
            converged = true;
            break;
        }
        cut = next;
        components = partition.components(cut, direction)?;
        posteriors = partition.leave_one_out_posteriors(cut, &components);
    }

    Some(EmOutcome {
        responsibilities: partition.to_subject_order(&posteriors),
        components,
        iterations,
        converged,
    })
}

fn standardized_separation(pre: &WeightedKde, post: &WeightedKde, direction: Direction) -> f64 {
    let (_, pre_sd) = pre.moments();
    let (_, post_sd) = post.moments();
    let mut pooled = (0.5 * pre_sd.mul_add(pre_sd, post_sd * post_sd)).sqrt();
    if !(pooled.is_finite() && pooled > 0.0) {
        pooled = pre.bandwidth.max(post.bandwidth);
    }
    direction.sign() * (post.median() - pre.median()) / pooled
}

/// Raw Bayes posterior on a regular grid, made monotone around the
/// pre-event median.
fn monotone_grid(
    components: &Components,
    direction: Direction,
    grid_points: usize,
) -> (Vec<f64>, Vec<f64>) {
    let (pre_lo, pre_hi) = components.pre.support();
    let (post_lo, post_hi) = components.post.support();
    let padding =
        GRID_PADDING_BANDWIDTHS * components.pre.bandwidth.max(components.post.bandwidth);
    let lo = pre_lo.min(post_lo) - padding;
    let hi = pre_hi.max(post_hi) + padding;
    let step = (hi - lo) / usize_to_f64(grid_points - 1);
    let grid = (0..grid_points)
        .map(|index| usize_to_f64(index).mul_add(step, lo))
        .collect::<Vec<_>>();

    let log_mixing = components.mixing.ln();
    let log_complement = (-components.mixing).ln_1p();
    let mut probabilities = grid
        .iter()
        .map(|x| {
            let log_odds = (log_mixing + components.post.log_density(*x))
                - (log_complement + components.pre.log_density(*x));
            posterior_from_log_odds(log_odds, components.mixing)
        })
        .collect::<Vec<_>>();

    let anchor = components.pre.median();
    let anchor_index = grid
        .partition_point(|point| *point < anchor)
        .min(grid_points - 1);
    match direction {
        Direction::Increase => {
            for i in anchor_index + 1..grid_points {
                probabilities[i] = probabilities[i].max(probabilities[i - 1]);
            }
            for i in (0..anchor_index).rev() {
                probabilities[i] = probabilities[i].min(probabilities[i + 1]);
            }
        }
        Direction::Decrease => {
            for i in (0..anchor_index).rev() {
                probabilities[i] = probabilities[i].max(probabilities[i + 1]);
            }
            for i in anchor_index + 1..grid_points {
                probabilities[i] = probabilities[i].min(probabilities[i - 1]);
            }
        }
    }

    (grid, probabilities)
}
