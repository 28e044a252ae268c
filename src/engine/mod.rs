//! Inference-engine boundary for the hierarchical Bradley-Terry model.
//!
//! The model hands an engine a standardized numeric package (`InferenceData`)
//! and gets back posterior draws for the feature and control weights. The
//! engine is a trait so an out-of-process sampler can be slotted in; the
//! crate ships `LaplaceEngine`.

mod laplace;

pub use laplace::LaplaceEngine;

use std::fmt;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelSettings;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid inference data: {0}")]
    InvalidData(String),
    #[error("hessian is not positive definite even with ridge {ridge:e}")]
    Singular { ridge: f64 },
    #[error("optimizer did not converge in {iterations} iterations (last step {last_step:e})")]
    NotConverged { iterations: usize, last_step: f64 },
    #[error("non-finite log posterior at iteration {0}")]
    NonFinite(usize),
}

/// Numeric package for one fit. Row `n` of each matrix describes preference `n`.
#[derive(Debug, Clone)]
pub struct InferenceData {
    pub n_preferences: usize,
    pub n_participants: usize,
    pub n_features: usize,
    pub n_controls: usize,
    /// Standardized main features of bigram1 / bigram2 (N × F).
    pub x1: DMatrix<f64>,
    pub x2: DMatrix<f64>,
    /// Standardized control features (N × C).
    pub control1: DMatrix<f64>,
    pub control2: DMatrix<f64>,
    /// 1-based participant index per preference.
    pub participant: Vec<usize>,
    /// 1 when bigram1 was preferred.
    pub y: Vec<u8>,
    pub feature_scale: f64,
    pub participant_scale: f64,
}

impl InferenceData {
    pub fn validate(&self) -> Result<(), EngineError> {
        let n = self.n_preferences;
        let shape_ok = |m: &DMatrix<f64>, cols: usize| m.nrows() == n && m.ncols() == cols;
        if !shape_ok(&self.x1, self.n_features) || !shape_ok(&self.x2, self.n_features) {
            return Err(EngineError::InvalidData("feature matrix shape".into()));
        }
        if !shape_ok(&self.control1, self.n_controls) || !shape_ok(&self.control2, self.n_controls)
        {
            return Err(EngineError::InvalidData("control matrix shape".into()));
        }
        if self.participant.len() != n || self.y.len() != n {
            return Err(EngineError::InvalidData(
                "participant / outcome length".into(),
            ));
        }
        if n == 0 {
            return Err(EngineError::InvalidData("no preferences".into()));
        }
        if let Some(bad) = self
            .participant
            .iter()
            .find(|&&p| p == 0 || p > self.n_participants)
        {
            return Err(EngineError::InvalidData(format!(
                "participant index {bad} outside 1..={}",
                self.n_participants
            )));
        }
        if self.y.iter().any(|&y| y > 1) {
            return Err(EngineError::InvalidData("outcome must be 0 or 1".into()));
        }
        let finite = |m: &DMatrix<f64>| m.iter().all(|v| v.is_finite());
        if !(finite(&self.x1) && finite(&self.x2) && finite(&self.control1) && finite(&self.control2))
        {
            return Err(EngineError::InvalidData("non-finite predictor".into()));
        }
        if !(self.feature_scale > 0.0 && self.participant_scale > 0.0) {
            return Err(EngineError::InvalidData("prior scales must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Full Newton steps.
    Newton,
    /// Newton direction with step halving until the log posterior improves.
    LineSearch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerSettings {
    pub chains: usize,
    pub draws_per_chain: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub seed: u64,
}

/// One entry of the fallback ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingAttempt {
    pub settings: SamplerSettings,
    pub strategy: SamplingStrategy,
}

/// Attempts tried in order until one succeeds: the configured sampler, then
/// half the chains with line search, then a single long line-search chain.
pub fn fallback_attempts(model: &ModelSettings) -> Vec<SamplingAttempt> {
    let base = SamplerSettings {
        chains: model.chains,
        draws_per_chain: model.draws_per_chain,
        max_iterations: model.max_iterations,
        tolerance: model.tolerance,
        seed: model.seed,
    };
    vec![
        SamplingAttempt {
            settings: base.clone(),
            strategy: SamplingStrategy::Newton,
        },
        SamplingAttempt {
            settings: SamplerSettings {
                chains: (model.chains / 2).max(1),
                ..base.clone()
            },
            strategy: SamplingStrategy::LineSearch,
        },
        SamplingAttempt {
            settings: SamplerSettings {
                chains: 1,
                max_iterations: model.max_iterations.saturating_mul(2),
                ..base
            },
            strategy: SamplingStrategy::LineSearch,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub strategy: SamplingStrategy,
    pub chains: usize,
    pub draws_per_chain: usize,
    pub iterations: usize,
    /// Draws whose log posterior was not finite.
    pub divergences: usize,
    /// Split-chain R-hat per weight (features then controls); `None` where
    /// too few draws exist to compute it.
    pub rhat: Vec<Option<f64>>,
}

impl Diagnostics {
    pub fn total_draws(&self) -> usize {
        self.chains * self.draws_per_chain
    }

    pub fn divergence_rate(&self) -> f64 {
        let total = self.total_draws();
        if total == 0 {
            0.0
        } else {
            self.divergences as f64 / total as f64
        }
    }

    pub fn max_rhat(&self) -> Option<f64> {
        self.rhat.iter().flatten().copied().fold(None, |acc, r| {
            Some(acc.map_or(r, |a: f64| a.max(r)))
        })
    }
}

/// Posterior draws: one row per draw, one column per weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posterior {
    pub beta: DMatrix<f64>,
    pub gamma: DMatrix<f64>,
    pub diagnostics: Diagnostics,
}

impl Posterior {
    pub fn n_draws(&self) -> usize {
        self.beta.nrows()
    }
}

pub trait InferenceEngine: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn sample(
        &self,
        data: &InferenceData,
        settings: &SamplerSettings,
        strategy: SamplingStrategy,
    ) -> Result<Posterior, EngineError>;
}

/// Split-chain R-hat for one parameter. `chains` holds each chain's draws.
pub fn split_rhat(chains: &[Vec<f64>]) -> Option<f64> {
    let half = chains.first()?.len() / 2;
    if half < 2 || chains.iter().any(|c| c.len() / 2 != half) {
        return None;
    }
    let mut splits: Vec<&[f64]> = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        splits.push(&chain[..half]);
        splits.push(&chain[chain.len() - half..]);
    }
    let m = splits.len() as f64;
    let n = half as f64;
    let means: Vec<f64> = splits.iter().map(|s| s.iter().sum::<f64>() / n).collect();
    let grand = means.iter().sum::<f64>() / m;
    let between = n / (m - 1.0) * means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>();
    let within = splits
        .iter()
        .zip(&means)
        .map(|(s, mu)| s.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / (n - 1.0))
        .sum::<f64>()
        / m;
    if within <= 0.0 || !within.is_finite() {
        return Some(1.0);
    }
    let var_plus = (n - 1.0) / n * within + between / n;
    Some((var_plus / within).sqrt())
}
