#![forbid(unsafe_code)]

//! # `event_based_models`
//!
//! Event-based models of disease progression from cross-sectional biomarker
//! data: per-biomarker KDE mixtures, MCMC over event orderings, positional
//! variance diagrams, and subject staging.
//!
//! The library only emits `log` records; installing a logger is left to the
//! caller.

pub mod inference;
pub mod input;
pub mod models;
pub mod preprocess;
pub mod utils;

pub use inference::{ChainInitialization, InferenceError, McmcConfig, ProposalStats};
pub use input::{
    BiomarkerData, Direction, GroupLabel, InputError, LongitudinalStagingInput,
    validate_measurements,
};
pub use preprocess::{BiomarkerSummary, column_has_variation, summarize_biomarkers};

pub use models::kde::{BandwidthRule, WeightedKde};
pub use models::likelihood::{
    LikelihoodError, SequenceLikelihood, is_valid_ordering, probability_matrix,
};
pub use models::mixture::{
    Component, DegenerateReason, MixtureDiagnostics, MixtureError, MixtureFit, MixtureModel,
    MixtureOptions, MixtureStrategy, fit_mixtures, split_fits,
};
pub use models::report::{
    EbmTables, render_convergence_table, render_fit_tables, render_mixture_table,
    render_positional_variance_table, render_stage_table,
};

pub use models::ebm::{
    ArtifactError, ChainSummary, ChainTrace, ConvergenceSummary, EbmConfig, EbmError, EbmFit,
    EbmModel, OrderingSource, PositionalVarianceDiagram, SequencePosterior, SequenceSample,
    StageResult, StagingMode, StagingOptions, SubjectStages, autocorrelation,
    effective_sample_size, fit_ebm, kendall_tau_distance, positional_variance, sample_sequences,
    stage_subject, stage_subjects, stage_visits, summarize_chain_agreement,
};
