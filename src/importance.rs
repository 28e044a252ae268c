//! Per-feature importance metrics used by the selection tournament.
//!
//! - **model_effect**: |weight| of the candidate in a context fit.
//! - **effect_consistency**: stability of that weight across
//!   participant-grouped folds.
//! - **predictive_power**: accuracy gain of a controls + candidate model over
//!   a controls-only baseline.
//!
//! Raw values are normalized against the running maximum seen during one
//! selection run, kept separately for main and control features.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{SelectionSettings, SelectionThresholds};
use crate::dataset::PreferenceDataset;
use crate::error::ModelError;
use crate::metrics;
use crate::model::{FeatureWeight, PreferenceModel};

/// Accuracy gaps below this count as no gain.
const MIN_ACCURACY_GAIN: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    Main,
    Control,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureMetrics {
    pub feature: String,
    pub category: FeatureCategory,

    // -- Normalized against the run's running maxima --------------------------
    pub model_effect: f64,
    pub effect_consistency: f64,
    pub predictive_power: f64,

    // -- Raw -------------------------------------------------------------------
    pub raw_model_effect: f64,
    pub raw_effect_consistency: f64,
    pub raw_predictive_power: f64,

    /// Candidate weight in the context fit.
    pub weight: f64,
    pub weight_std: f64,
    /// In-sample accuracy of the controls + candidate model.
    pub accuracy: f64,
    pub baseline_accuracy: f64,
    /// False when a fit failed and the metrics are placeholders.
    pub evaluated: bool,
}

impl FeatureMetrics {
    fn failed(feature: &str, category: FeatureCategory, baseline_accuracy: f64) -> Self {
        Self {
            feature: feature.to_string(),
            category,
            model_effect: 0.0,
            effect_consistency: 0.0,
            predictive_power: 0.0,
            raw_model_effect: 0.0,
            raw_effect_consistency: 0.0,
            raw_predictive_power: 0.0,
            weight: 0.0,
            weight_std: 0.0,
            accuracy: baseline_accuracy,
            baseline_accuracy,
            evaluated: false,
        }
    }

    /// Majority vote: strictly greater on at least two of the three
    /// normalized metrics.
    pub fn is_better(&self, other: &FeatureMetrics) -> bool {
        let wins = [
            self.model_effect > other.model_effect,
            self.effect_consistency > other.effect_consistency,
            self.predictive_power > other.predictive_power,
        ];
        wins.iter().filter(|&&w| w).count() >= 2
    }

    /// Sum of normalized metrics, used to break tournament ties.
    pub fn score_sum(&self) -> f64 {
        self.model_effect + self.effect_consistency + self.predictive_power
    }

    /// How many raw metrics meet their threshold.
    pub fn thresholds_passed(&self, thresholds: &SelectionThresholds) -> usize {
        [
            self.raw_model_effect >= thresholds.model_effect,
            self.raw_effect_consistency >= thresholds.effect_consistency,
            self.raw_predictive_power >= thresholds.predictive_power,
        ]
        .iter()
        .filter(|&&p| p)
        .count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RunningMax {
    effect: f64,
    consistency: f64,
    power: f64,
}

#[derive(Debug, Clone)]
pub struct FeatureImportanceCalculator {
    settings: SelectionSettings,
    maxima: BTreeMap<FeatureCategory, RunningMax>,
    baseline: Option<f64>,
}

impl FeatureImportanceCalculator {
    pub fn new(settings: SelectionSettings) -> Self {
        Self {
            settings,
            maxima: BTreeMap::new(),
            baseline: None,
        }
    }

    /// Forget running maxima and the memoized baseline.
    pub fn reset(&mut self) {
        self.maxima.clear();
        self.baseline = None;
    }

    /// Accuracy of a controls-only model on `dataset`, computed once per run.
    pub fn baseline_accuracy(
        &mut self,
        dataset: &PreferenceDataset,
        model: &PreferenceModel,
    ) -> Result<f64, ModelError> {
        if let Some(baseline) = self.baseline {
            return Ok(baseline);
        }
        let mut baseline_model = model.sibling();
        baseline_model.fit(dataset, &[])?;
        let baseline = baseline_model.evaluate(dataset)?.accuracy;
        debug!(baseline, "control-only baseline accuracy");
        self.baseline = Some(baseline);
        Ok(baseline)
    }

    /// Score `feature` in the context of the already-selected main features.
    ///
    /// Returned metrics are normalized against the maxima seen so far; call
    /// [`normalize`](Self::normalize) on a whole round to make them
    /// order-independent. Fit failures produce zeroed metrics with
    /// `evaluated = false`.
    pub fn evaluate_feature(
        &mut self,
        feature: &str,
        dataset: &PreferenceDataset,
        model: &PreferenceModel,
        selected: &[String],
    ) -> FeatureMetrics {
        let category = if model.config().is_control(feature) {
            FeatureCategory::Control
        } else {
            FeatureCategory::Main
        };
        let baseline = match self.baseline_accuracy(dataset, model) {
            Ok(b) => b,
            Err(err) => {
                warn!(error = %err, "baseline fit failed; assuming 0.5");
                0.5
            }
        };

        let mut context: Vec<String> = selected.to_vec();
        if !context.iter().any(|f| f == feature) {
            context.push(feature.to_string());
        }

        let weight = match context_weight(feature, dataset, model, &context) {
            Ok(w) => w,
            Err(err) => {
                warn!(feature, error = %err, "context fit failed");
                return FeatureMetrics::failed(feature, category, baseline);
            }
        };
        let consistency = match self.consistency(feature, dataset, model, &context) {
            Ok(c) => c,
            Err(err) => {
                warn!(feature, error = %err, "consistency folds failed");
                0.0
            }
        };
        let accuracy = match isolated_accuracy(feature, dataset, model) {
            Ok(a) => a,
            Err(err) => {
                warn!(feature, error = %err, "isolated fit failed");
                return FeatureMetrics::failed(feature, category, baseline);
            }
        };
        let gain = accuracy - baseline;
        let power = if gain < MIN_ACCURACY_GAIN || baseline >= 1.0 {
            0.0
        } else {
            gain / (1.0 - baseline)
        };

        let mut metrics = FeatureMetrics {
            feature: feature.to_string(),
            category,
            model_effect: 0.0,
            effect_consistency: 0.0,
            predictive_power: 0.0,
            raw_model_effect: weight.mean.abs(),
            raw_effect_consistency: consistency,
            raw_predictive_power: power,
            weight: weight.mean,
            weight_std: weight.std,
            accuracy,
            baseline_accuracy: baseline,
            evaluated: true,
        };
        self.observe(&metrics);
        self.apply_normalization(&mut metrics);
        debug!(
            feature,
            effect = metrics.raw_model_effect,
            consistency = metrics.raw_effect_consistency,
            power = metrics.raw_predictive_power,
            "feature evaluated"
        );
        metrics
    }

    /// Fold every raw value into the running maxima, then renormalize all of
    /// `round` against them.
    pub fn normalize(&mut self, round: &mut [FeatureMetrics]) {
        for m in round.iter() {
            self.observe(m);
        }
        for m in round.iter_mut() {
            self.apply_normalization(m);
        }
    }

    fn observe(&mut self, m: &FeatureMetrics) {
        if !m.evaluated {
            return;
        }
        let max = self.maxima.entry(m.category).or_default();
        max.effect = max.effect.max(m.raw_model_effect);
        max.consistency = max.consistency.max(m.raw_effect_consistency);
        max.power = max.power.max(m.raw_predictive_power);
    }

    fn apply_normalization(&self, m: &mut FeatureMetrics) {
        let max = self.maxima.get(&m.category).copied().unwrap_or_default();
        let scale = |raw: f64, max: f64| if max > 0.0 { raw / max } else { 0.0 };
        m.model_effect = scale(m.raw_model_effect, max.effect);
        m.effect_consistency = scale(m.raw_effect_consistency, max.consistency);
        m.predictive_power = scale(m.raw_predictive_power, max.power);
    }

    /// Cross-fold consistency of the feature's weight, averaged with the
    /// consistency of every interaction term in the context that involves it.
    fn consistency(
        &self,
        feature: &str,
        dataset: &PreferenceDataset,
        model: &PreferenceModel,
        context: &[String],
    ) -> Result<f64, ModelError> {
        let splits = dataset.cv_splits(self.settings.n_consistency_folds, self.settings.cv_seed)?;
        let interactions: Vec<&String> = context
            .iter()
            .filter(|name| {
                dataset
                    .layout()
                    .interaction(name)
                    .is_some_and(|i| i.name != feature && i.involves(feature))
            })
            .collect();

        let mut base_effects = Vec::with_capacity(splits.len());
        let mut interaction_effects: Vec<Vec<f64>> = vec![Vec::new(); interactions.len()];
        for (fold, split) in splits.iter().enumerate() {
            if split.train.is_empty() {
                continue;
            }
            let train = dataset.subset(&split.train)?;
            let mut fold_model = model.sibling();
            if let Err(err) = fold_model.fit(&train, context) {
                debug!(feature, fold, error = %err, "consistency fold skipped");
                continue;
            }
            let weights = fold_model.get_feature_weights(false)?;
            if let Some(w) = weights.get(feature) {
                base_effects.push(w.mean);
            }
            for (slot, name) in interactions.iter().enumerate() {
                if let Some(w) = weights.get(*name) {
                    interaction_effects[slot].push(w.mean);
                }
            }
        }
        if base_effects.is_empty() {
            return Err(ModelError::Fit {
                attempts: splits.len(),
                last: format!("no consistency fold could be fit for '{feature}'"),
            });
        }

        let base = metrics::effect_consistency(&base_effects);
        let weight = self.settings.interaction_consistency_weight;
        let mut total = base;
        let mut norm = 1.0;
        for effects in interaction_effects.iter().filter(|e| !e.is_empty()) {
            total += weight * metrics::effect_consistency(effects);
            norm += weight;
        }
        Ok(total / norm)
    }
}

fn context_weight(
    feature: &str,
    dataset: &PreferenceDataset,
    model: &PreferenceModel,
    context: &[String],
) -> Result<FeatureWeight, ModelError> {
    let mut fitted = model.sibling();
    fitted.fit(dataset, context)?;
    fitted
        .get_feature_weights(true)?
        .get(feature)
        .copied()
        .ok_or_else(|| ModelError::value(format!("no weight for '{feature}' after fit")))
}

fn isolated_accuracy(
    feature: &str,
    dataset: &PreferenceDataset,
    model: &PreferenceModel,
) -> Result<f64, ModelError> {
    let mut isolated = model.sibling();
    isolated.fit(dataset, &[feature.to_string()])?;
    Ok(isolated.evaluate(dataset)?.accuracy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(name: &str, effect: f64, consistency: f64, power: f64) -> FeatureMetrics {
        FeatureMetrics {
            feature: name.to_string(),
            category: FeatureCategory::Main,
            model_effect: effect,
            effect_consistency: consistency,
            predictive_power: power,
            raw_model_effect: effect,
            raw_effect_consistency: consistency,
            raw_predictive_power: power,
            weight: effect,
            weight_std: 0.1,
            accuracy: 0.5,
            baseline_accuracy: 0.5,
            evaluated: true,
        }
    }

    #[test]
    fn majority_vote_needs_two_of_three() {
        let a = metrics("a", 0.9, 0.8, 0.1);
        let b = metrics("b", 0.5, 0.9, 0.05);
        assert!(a.is_better(&b));
        assert!(!b.is_better(&a));

        let c = metrics("c", 0.9, 0.1, 0.1);
        let d = metrics("d", 0.1, 0.9, 0.1);
        assert!(!c.is_better(&d));
        assert!(!d.is_better(&c));
    }

    #[test]
    fn thresholds_count_raw_metrics() {
        let t = SelectionThresholds::default();
        assert_eq!(metrics("a", 1.0, 0.9, 0.5).thresholds_passed(&t), 3);
        assert_eq!(metrics("b", 0.1, 0.9, 0.5).thresholds_passed(&t), 2);
        assert_eq!(metrics("c", 0.0, 0.0, 0.0).thresholds_passed(&t), 0);
    }

    #[test]
    fn normalization_is_order_independent_within_a_round() {
        let mut calc = FeatureImportanceCalculator::new(SelectionSettings::default());
        let mut round = vec![metrics("a", 0.5, 0.4, 0.1), metrics("b", 1.0, 0.8, 0.2)];
        calc.normalize(&mut round);
        assert_eq!(round[0].model_effect, 0.5);
        assert_eq!(round[0].effect_consistency, 0.5);
        assert_eq!(round[1].predictive_power, 1.0);

        let mut calc = FeatureImportanceCalculator::new(SelectionSettings::default());
        let mut reversed = vec![metrics("b", 1.0, 0.8, 0.2), metrics("a", 0.5, 0.4, 0.1)];
        calc.normalize(&mut reversed);
        assert_eq!(reversed[1], round[0]);
    }

    #[test]
    fn unevaluated_metrics_do_not_move_maxima() {
        let mut calc = FeatureImportanceCalculator::new(SelectionSettings::default());
        let mut failed = FeatureMetrics::failed("x", FeatureCategory::Main, 0.5);
        failed.raw_model_effect = 100.0;
        let mut round = vec![failed, metrics("a", 0.5, 0.5, 0.5)];
        calc.normalize(&mut round);
        assert_eq!(round[1].model_effect, 1.0);
    }
}
