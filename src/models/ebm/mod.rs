//! Event-based model of disease progression.
//!
//! Orderings of biomarker events are sampled with Metropolis-Hastings over
//! permutations, summarized as a positional variance diagram, and used to
//! stage subjects. [`fit_ebm`] runs the whole pipeline; the returned
//! [`EbmModel`] stages new data without refitting and can be saved as TOML.

pub mod artifact;
pub mod diagnostics;
pub mod fit;
pub mod posterior;
pub mod sampler;
pub mod staging;
pub mod types;

pub use artifact::ArtifactError;
pub use diagnostics::{
    ChainSummary, ConvergenceSummary, autocorrelation, effective_sample_size,
    kendall_tau_distance, summarize_chain_agreement,
};
pub use fit::{EbmFit, EbmModel, fit_ebm};
pub use posterior::{PositionalVarianceDiagram, positional_variance};
pub use sampler::{greedy_ascent, initial_ordering, rank_ordering, sample_sequences};
pub use staging::{
    OrderingSource, StageResult, StagingMode, StagingOptions, SubjectStages, stage_subject,
    stage_subjects, stage_visits,
};
pub use types::{ChainTrace, EbmConfig, EbmError, SequencePosterior, SequenceSample};
