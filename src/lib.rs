#![forbid(unsafe_code)]

//! # bigram-comfort
//!
//! Estimates a latent comfort ordering over keyboard bigrams from pairwise
//! human preference judgments.
//!
//! Each judgment says which of two bigrams a participant found easier to
//! type. A hierarchical Bradley-Terry model turns those judgments into
//! posterior weights over bigram features, with a random effect per
//! participant. A round-robin tournament chooses which candidate features
//! enter the model, scoring each by effect size, cross-fold consistency and
//! predictive gain over a control-only baseline.

pub mod cache;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod features;
pub mod importance;
pub mod metrics;
pub mod model;
pub mod report;
pub mod selection;
pub mod synthetic;

pub use config::{Config, ConfigError};
pub use dataset::{Preference, PreferenceDataset, TransitivityReport};
pub use engine::{InferenceEngine, LaplaceEngine, Posterior, SamplingStrategy};
pub use error::ModelError;
pub use features::{Bigram, FeatureError, FeatureProvider, FeatureTable, Interaction};
pub use importance::{FeatureImportanceCalculator, FeatureMetrics};
pub use model::{
    ComfortScore, CrossValidationReport, EvaluationMetrics, FeatureWeight, ModelPrediction,
    PreferenceModel,
};
pub use report::MetricsReport;
pub use selection::{SelectionResult, SelectionRound};
