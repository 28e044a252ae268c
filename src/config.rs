//! Validated configuration for feature layout, inference and selection.
//!
//! Loaded from JSON (`Config::from_path`) or built in code from `Default`.
//! `validate()` runs once when a model is constructed; everything downstream
//! assumes a valid config.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

// ---------------------------------------------------------------------
//  Sections
// ---------------------------------------------------------------------

/// Which features exist and how they are grouped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FeatureSettings {
    /// Main candidate features. When empty, every feature the provider
    /// exposes (minus controls) is a candidate.
    pub base_features: Vec<String>,
    /// Confound controls, included in every fit and never competed for.
    pub control_features: Vec<String>,
    /// Interaction terms, each a list of component feature names.
    pub interactions: Vec<Vec<String>>,
}

/// Priors, sampler budget and diagnostic limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    // -- Priors ----------------------------------------------------------------

    /// Prior scale for feature and control weights.
    pub feature_scale: f64,
    /// Prior scale for participant random effects.
    pub participant_scale: f64,

    // -- Sampler ---------------------------------------------------------------

    pub chains: usize,
    pub draws_per_chain: usize,
    /// Cap on optimizer iterations per attempt. The last fallback doubles it.
    pub max_iterations: usize,
    /// Convergence threshold on the largest parameter update.
    pub tolerance: f64,
    pub seed: u64,

    // -- Diagnostics (warn only) -----------------------------------------------

    pub max_divergence_rate: f64,
    pub max_rhat: f64,

    /// |weight| above which a main feature counts as non-sparse.
    pub sparsity_threshold: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            feature_scale: 2.0,
            participant_scale: 1.0,
            chains: 4,
            draws_per_chain: 250,
            max_iterations: 50,
            tolerance: 1e-8,
            seed: 42,
            max_divergence_rate: 0.05,
            max_rhat: 1.1,
            sparsity_threshold: 0.1,
        }
    }
}

/// Acceptance thresholds on raw importance metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionThresholds {
    /// Minimum |standardized weight|.
    pub model_effect: f64,
    /// Minimum cross-fold consistency in [0, 1].
    pub effect_consistency: f64,
    /// Minimum accuracy gain over the control-only baseline, in [0, 1].
    pub predictive_power: f64,
}

impl Default for SelectionThresholds {
    fn default() -> Self {
        Self {
            model_effect: 0.25,
            effect_consistency: 0.5,
            predictive_power: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionSettings {
    pub n_consistency_folds: usize,
    /// Seed for participant-grouped fold assignment.
    pub cv_seed: u64,
    pub thresholds: SelectionThresholds,
    /// How many of the three thresholds a round winner must meet.
    pub min_metrics_passed: usize,
    /// Weight of each interaction term's consistency relative to the base
    /// feature's. 1.0 averages them equally.
    pub interaction_consistency_weight: f64,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            n_consistency_folds: 5,
            cv_seed: 42,
            thresholds: SelectionThresholds::default(),
            min_metrics_passed: 3,
            interaction_consistency_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { max_size: 10_000 }
    }
}

// ---------------------------------------------------------------------
//  Config
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub features: FeatureSettings,
    pub model: ModelSettings,
    pub selection: SelectionSettings,
    pub cache: CacheSettings,
}

impl Config {
    /// Read and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn is_control(&self, feature: &str) -> bool {
        self.features.control_features.iter().any(|c| c == feature)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = &self.features;
        check_names("features.base_features", &f.base_features)?;
        check_names("features.control_features", &f.control_features)?;
        if let Some(overlap) = f
            .base_features
            .iter()
            .find(|name| f.control_features.contains(name))
        {
            return Err(ConfigError::invalid(format!(
                "feature '{overlap}' is listed as both base and control"
            )));
        }

        let mut seen = BTreeSet::new();
        for components in &f.interactions {
            let unique: BTreeSet<&String> = components.iter().collect();
            if components.len() < 2 || unique.len() != components.len() {
                return Err(ConfigError::invalid(format!(
                    "interaction {components:?} needs at least two distinct components"
                )));
            }
            if components.iter().any(|c| c.trim().is_empty()) {
                return Err(ConfigError::invalid("interaction component is empty"));
            }
            if let Some(control) = components.iter().find(|c| self.is_control(c)) {
                return Err(ConfigError::invalid(format!(
                    "interaction {components:?} uses control feature '{control}'"
                )));
            }
            if !f.base_features.is_empty() {
                if let Some(unknown) = components.iter().find(|c| !f.base_features.contains(c)) {
                    return Err(ConfigError::invalid(format!(
                        "interaction component '{unknown}' is not a base feature"
                    )));
                }
            }
            let key: Vec<&String> = unique.into_iter().collect();
            if !seen.insert(key) {
                return Err(ConfigError::invalid(format!(
                    "interaction {components:?} is listed twice"
                )));
            }
        }

        let m = &self.model;
        if !(m.feature_scale.is_finite() && m.feature_scale > 0.0) {
            return Err(ConfigError::invalid("model.feature_scale must be > 0"));
        }
        if !(m.participant_scale.is_finite() && m.participant_scale > 0.0) {
            return Err(ConfigError::invalid("model.participant_scale must be > 0"));
        }
        if m.chains == 0 || m.draws_per_chain == 0 {
            return Err(ConfigError::invalid(
                "model.chains and model.draws_per_chain must be >= 1",
            ));
        }
        if m.max_iterations == 0 {
            return Err(ConfigError::invalid("model.max_iterations must be >= 1"));
        }
        if !(m.tolerance.is_finite() && m.tolerance > 0.0) {
            return Err(ConfigError::invalid("model.tolerance must be > 0"));
        }
        if !(0.0..=1.0).contains(&m.max_divergence_rate) {
            return Err(ConfigError::invalid(
                "model.max_divergence_rate must be in [0, 1]",
            ));
        }
        if !(m.max_rhat.is_finite() && m.max_rhat >= 1.0) {
            return Err(ConfigError::invalid("model.max_rhat must be >= 1"));
        }
        if !(m.sparsity_threshold.is_finite() && m.sparsity_threshold >= 0.0) {
            return Err(ConfigError::invalid("model.sparsity_threshold must be >= 0"));
        }

        let s = &self.selection;
        if s.n_consistency_folds < 2 {
            return Err(ConfigError::invalid(
                "selection.n_consistency_folds must be >= 2",
            ));
        }
        if s.min_metrics_passed == 0 || s.min_metrics_passed > 3 {
            return Err(ConfigError::invalid(
                "selection.min_metrics_passed must be in 1..=3",
            ));
        }
        let t = &s.thresholds;
        if [t.model_effect, t.effect_consistency, t.predictive_power]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(ConfigError::invalid(
                "selection.thresholds must be finite and >= 0",
            ));
        }
        if !(s.interaction_consistency_weight.is_finite() && s.interaction_consistency_weight >= 0.0)
        {
            return Err(ConfigError::invalid(
                "selection.interaction_consistency_weight must be >= 0",
            ));
        }

        if self.cache.max_size == 0 {
            return Err(ConfigError::invalid("cache.max_size must be >= 1"));
        }
        Ok(())
    }
}

fn check_names(section: &str, names: &[String]) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(ConfigError::invalid(format!("{section} contains an empty name")));
        }
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::invalid(format!(
                "{section} lists '{name}' more than once"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            features: FeatureSettings {
                base_features: vec!["same_row".into(), "outward_roll".into()],
                control_features: vec!["bigram_frequency".into()],
                interactions: vec![vec!["same_row".into(), "outward_roll".into()]],
            },
            ..Config::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
        base().validate().unwrap();
    }

    #[test]
    fn rejects_control_overlap() {
        let mut cfg = base();
        cfg.features.control_features.push("same_row".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_degenerate_interactions() {
        let mut cfg = base();
        cfg.features.interactions = vec![vec!["same_row".into()]];
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.features.interactions = vec![
            vec!["same_row".into(), "outward_roll".into()],
            vec!["outward_roll".into(), "same_row".into()],
        ];
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.features.interactions = vec![vec!["same_row".into(), "finger_span".into()]];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_model_settings() {
        let mut cfg = base();
        cfg.model.chains = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.model.participant_scale = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.selection.min_metrics_passed = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_roundtrip_fills_defaults() {
        let raw = r#"{"features": {"base_features": ["a"], "control_features": ["c"]}}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.model, ModelSettings::default());
        assert_eq!(cfg.selection.n_consistency_folds, 5);
        assert!(cfg.is_control("c"));
        cfg.validate().unwrap();
    }
}
