//! # Models
//!
//! Mixture models for per-biomarker event probabilities, ordering
//! likelihoods, and the event-based model built on top of them.

pub mod ebm;
pub mod kde;
pub mod likelihood;
pub mod mixture;
pub mod report;
