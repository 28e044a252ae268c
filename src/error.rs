//! Error types for loading, fitting and querying preference models.

use thiserror::Error;

use crate::config::ConfigError;
use crate::features::FeatureError;

/// Errors surfaced by dataset loading, model fitting and model queries.
///
/// Per-row and per-prediction failures never reach this type: they are logged
/// and skipped. Only whole-operation failures are returned.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A query that needs a posterior was issued before `fit` succeeded.
    #[error("model is not fitted: call fit() before {0}")]
    NotFitted(&'static str),

    /// Input data is missing required columns or produced no usable rows.
    #[error("data format error: {0}")]
    DataFormat(String),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    /// Every sampling attempt failed.
    #[error("fit failed after {attempts} attempt(s): {last}")]
    Fit { attempts: usize, last: String },

    /// An argument was out of range (fraction, indices, fold count, ...).
    #[error("invalid value: {0}")]
    Value(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A persisted model bundle could not be trusted.
    #[error("persisted model rejected: {0}")]
    Persist(String),
}

impl ModelError {
    pub fn data_format(message: impl Into<String>) -> Self {
        Self::DataFormat(message.into())
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::Value(message.into())
    }

    /// Whether repeating the operation (e.g. with another seed) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fit { .. } => true,
            Self::Io(_) => true,
            Self::NotFitted(_)
            | Self::DataFormat(_)
            | Self::Feature(_)
            | Self::Value(_)
            | Self::Config(_)
            | Self::Csv(_)
            | Self::Serde(_)
            | Self::Persist(_) => false,
        }
    }

    /// Short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFitted(_) => "not_fitted",
            Self::DataFormat(_) => "data_format",
            Self::Feature(_) => "feature_error",
            Self::Fit { .. } => "fit_failed",
            Self::Value(_) => "invalid_value",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Csv(_) => "csv_error",
            Self::Serde(_) => "serde_error",
            Self::Persist(_) => "persist_error",
        }
    }
}
