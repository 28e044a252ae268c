//! Hierarchical Bradley-Terry preference model.
//!
//! Each bigram has a latent comfort that is linear in its standardized
//! features. The log-odds of preferring bigram1 over bigram2 is the comfort
//! difference plus a random effect for the participant who judged the pair:
//!
//! ```text
//! logit P(bigram1 chosen) = (x1 − x2)·β + (c1 − c2)·γ + z[participant]
//! ```
//!
//! Sampling is delegated to an [`InferenceEngine`]. A model is either unfit
//! or holds exactly one posterior; every `fit` starts from scratch.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, CacheStats};
use crate::config::Config;
use crate::dataset::PreferenceDataset;
use crate::engine::{fallback_attempts, InferenceData, InferenceEngine, LaplaceEngine, Posterior};
use crate::error::ModelError;
use crate::features::{add_interactions, Bigram, FeatureMap, FeatureProvider, Interaction, TYPING_TIME};
use crate::metrics::{self, logistic, mean_std};

/// Bump when the persisted bundle layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// Standard deviations below this are treated as 1.0 (constant feature).
const MIN_STD: f64 = 1e-12;

// ---------------------------------------------------------------------
//  Public result types
// ---------------------------------------------------------------------

/// Posterior mean and standard deviation of one standardized weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeight {
    pub mean: f64,
    pub std: f64,
}

/// Training-set statistics used to standardize a feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub mean: f64,
    pub std: f64,
}

impl Standardization {
    fn apply(&self, value: f64) -> f64 {
        (value - self.mean) / self.std
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPrediction {
    /// Probability that the first bigram is preferred.
    pub probability: f64,
    /// Standard deviation of the effect difference across posterior draws.
    pub uncertainty: f64,
    pub features_used: Vec<String>,
    pub computation_time: Duration,
}

impl ModelPrediction {
    /// Returned when a prediction cannot be computed.
    pub fn neutral(computation_time: Duration) -> Self {
        Self {
            probability: 0.5,
            uncertainty: 1.0,
            features_used: Vec::new(),
            computation_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub auc: f64,
    pub n_evaluated: usize,
    pub n_failed: usize,
    pub mean_uncertainty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoldMetrics {
    pub fold: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub accuracy: f64,
    pub auc: f64,
    pub mean_uncertainty: f64,
}

/// How stable a feature's weight is across cross-validation folds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightStability {
    pub mean_weight: f64,
    pub mean_std: f64,
    pub fold_weights: Vec<f64>,
    pub consistency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossValidationReport {
    pub folds: Vec<FoldMetrics>,
    pub n_skipped: usize,
    pub mean_accuracy: f64,
    pub std_accuracy: f64,
    pub mean_auc: f64,
    pub std_auc: f64,
    pub mean_uncertainty: f64,
    pub feature_stability: BTreeMap<String, WeightStability>,
}

/// Latent comfort of a single bigram on the model's standardized scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComfortScore {
    pub bigram: Bigram,
    pub score: f64,
    pub uncertainty: f64,
}

// ---------------------------------------------------------------------
//  State
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FittedModel {
    main_features: Vec<String>,
    control_features: Vec<String>,
    interactions: Vec<Interaction>,
    standardization: BTreeMap<String, Standardization>,
    weights: BTreeMap<String, FeatureWeight>,
    posterior: Posterior,
}

impl FittedModel {
    fn all_features(&self) -> Vec<String> {
        let mut names = self.main_features.clone();
        names.extend(self.control_features.iter().cloned());
        names
    }

    /// Standardized value of `feature` for a query-time feature map.
    /// Typing time is never known at query time and reads as 0.
    fn standardized(&self, feature: &str, features: &FeatureMap) -> f64 {
        if feature == TYPING_TIME {
            return 0.0;
        }
        let raw = features.get(feature).copied().unwrap_or(0.0);
        self.standardization
            .get(feature)
            .map_or(raw, |s| s.apply(raw))
    }

    fn differences(&self, names: &[String], f1: &FeatureMap, f2: &FeatureMap) -> DVector<f64> {
        DVector::from_iterator(
            names.len(),
            names
                .iter()
                .map(|n| self.standardized(n, f1) - self.standardized(n, f2)),
        )
    }
}

#[derive(Debug, Clone)]
enum ModelState {
    Unfit,
    Fitted(Box<FittedModel>),
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelBundle {
    format_version: u32,
    engine: String,
    config: Config,
    main_features: Vec<String>,
    control_features: Vec<String>,
    interactions: Vec<Interaction>,
    standardization: BTreeMap<String, Standardization>,
    weights: BTreeMap<String, FeatureWeight>,
    posterior: Posterior,
    fingerprint: String,
}

// ---------------------------------------------------------------------
//  Model
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct PreferenceModel {
    config: Arc<Config>,
    provider: Arc<dyn FeatureProvider>,
    engine: Arc<dyn InferenceEngine>,
    state: ModelState,
    feature_cache: Mutex<CacheManager<Bigram, FeatureMap>>,
    prediction_cache: Mutex<CacheManager<(Bigram, Bigram), ModelPrediction>>,
}

impl PreferenceModel {
    /// Validate `config` and build an unfit model backed by the Laplace engine.
    pub fn new(config: Config, provider: Arc<dyn FeatureProvider>) -> Result<Self, ModelError> {
        Self::with_engine(config, provider, Arc::new(LaplaceEngine::new()))
    }

    pub fn with_engine(
        config: Config,
        provider: Arc<dyn FeatureProvider>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        Ok(Self::from_parts(Arc::new(config), provider, engine))
    }

    fn from_parts(
        config: Arc<Config>,
        provider: Arc<dyn FeatureProvider>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Self {
        let max_size = config.cache.max_size;
        Self {
            config,
            provider,
            engine,
            state: ModelState::Unfit,
            feature_cache: Mutex::new(CacheManager::new(max_size)),
            prediction_cache: Mutex::new(CacheManager::new(max_size)),
        }
    }

    /// Unfit model sharing this model's config, provider and engine.
    pub(crate) fn sibling(&self) -> Self {
        Self::from_parts(
            Arc::clone(&self.config),
            Arc::clone(&self.provider),
            Arc::clone(&self.engine),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, ModelState::Fitted(_))
    }

    /// Main then control features of the current fit.
    pub fn selected_features(&self) -> Option<Vec<String>> {
        match &self.state {
            ModelState::Fitted(f) => Some(f.all_features()),
            ModelState::Unfit => None,
        }
    }

    /// Diagnostics of the current posterior.
    pub fn diagnostics(&self) -> Option<&crate::engine::Diagnostics> {
        match &self.state {
            ModelState::Fitted(f) => Some(&f.posterior.diagnostics),
            ModelState::Unfit => None,
        }
    }

    /// (feature cache, prediction cache) statistics.
    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (
            lock(&self.feature_cache).stats(),
            lock(&self.prediction_cache).stats(),
        )
    }

    fn fitted(&self, operation: &'static str) -> Result<&FittedModel, ModelError> {
        match &self.state {
            ModelState::Fitted(f) => Ok(f),
            ModelState::Unfit => Err(ModelError::NotFitted(operation)),
        }
    }

    fn reset(&mut self) {
        self.state = ModelState::Unfit;
        lock(&self.feature_cache).clear();
        lock(&self.prediction_cache).clear();
    }

    // -----------------------------------------------------------------
    //  Fitting
    // -----------------------------------------------------------------

    /// Fit the model on `dataset` using `features`.
    ///
    /// Every configured control feature is included whether or not it is
    /// listed. On failure the model is left unfit.
    pub fn fit(&mut self, dataset: &PreferenceDataset, features: &[String]) -> Result<(), ModelError> {
        self.reset();
        if dataset.is_empty() {
            return Err(ModelError::value("cannot fit an empty dataset"));
        }

        let controls = self.config.features.control_features.clone();
        let mut main: Vec<String> = Vec::new();
        for name in features {
            if !self.config.is_control(name) && !main.contains(name) {
                main.push(name.clone());
            }
        }
        let layout = dataset.layout();
        if let Some(unknown) = main.iter().chain(&controls).find(|n| !layout.contains(n)) {
            return Err(ModelError::value(format!(
                "feature '{unknown}' is not part of the dataset"
            )));
        }
        let interactions: Vec<Interaction> = main
            .iter()
            .filter_map(|n| layout.interaction(n).cloned())
            .collect();

        let standardization: BTreeMap<String, Standardization> = main
            .iter()
            .chain(&controls)
            .map(|name| (name.clone(), feature_statistics(dataset, name)))
            .collect();
        let data = self.inference_data(dataset, &main, &controls, &standardization);

        let attempts = fallback_attempts(&self.config.model);
        let mut last_error = String::new();
        for (idx, attempt) in attempts.iter().enumerate() {
            match self.engine.sample(&data, &attempt.settings, attempt.strategy) {
                Ok(posterior) => {
                    self.check_diagnostics(&posterior);
                    let weights = extract_weights(&posterior, &main, &controls);
                    info!(
                        engine = self.engine.name(),
                        attempt = idx + 1,
                        preferences = data.n_preferences,
                        participants = data.n_participants,
                        features = main.len(),
                        controls = controls.len(),
                        "model fitted"
                    );
                    self.state = ModelState::Fitted(Box::new(FittedModel {
                        main_features: main,
                        control_features: controls,
                        interactions,
                        standardization,
                        weights,
                        posterior,
                    }));
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        attempt = idx + 1,
                        strategy = ?attempt.strategy,
                        chains = attempt.settings.chains,
                        error = %err,
                        "sampling attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
        }
        Err(ModelError::Fit {
            attempts: attempts.len(),
            last: last_error,
        })
    }

    fn inference_data(
        &self,
        dataset: &PreferenceDataset,
        main: &[String],
        controls: &[String],
        standardization: &BTreeMap<String, Standardization>,
    ) -> InferenceData {
        let n = dataset.len();
        let participant_index: BTreeMap<&String, usize> = dataset
            .participants()
            .iter()
            .enumerate()
            .map(|(idx, id)| (id, idx + 1))
            .collect();

        let fill = |names: &[String]| -> (DMatrix<f64>, DMatrix<f64>) {
            let mut left = DMatrix::<f64>::zeros(n, names.len());
            let mut right = DMatrix::<f64>::zeros(n, names.len());
            for (row, pref) in dataset.preferences().iter().enumerate() {
                for (col, name) in names.iter().enumerate() {
                    // Nulled pairs stay at 0 on both sides.
                    if let (Some((a, b)), Some(stats)) =
                        (pref.feature_pair(name), standardization.get(name))
                    {
                        left[(row, col)] = stats.apply(a);
                        right[(row, col)] = stats.apply(b);
                    }
                }
            }
            (left, right)
        };
        let (x1, x2) = fill(main);
        let (control1, control2) = fill(controls);

        InferenceData {
            n_preferences: n,
            n_participants: participant_index.len(),
            n_features: main.len(),
            n_controls: controls.len(),
            x1,
            x2,
            control1,
            control2,
            participant: dataset
                .preferences()
                .iter()
                .map(|p| participant_index.get(&p.participant_id).copied().unwrap_or(1))
                .collect(),
            y: dataset
                .preferences()
                .iter()
                .map(|p| u8::from(p.preferred))
                .collect(),
            feature_scale: self.config.model.feature_scale,
            participant_scale: self.config.model.participant_scale,
        }
    }

    fn check_diagnostics(&self, posterior: &Posterior) {
        let diagnostics = &posterior.diagnostics;
        let rate = diagnostics.divergence_rate();
        if rate > self.config.model.max_divergence_rate {
            warn!(
                divergences = diagnostics.divergences,
                rate, "high divergence rate in posterior draws"
            );
        }
        if let Some(rhat) = diagnostics.max_rhat() {
            if rhat > self.config.model.max_rhat {
                warn!(rhat, "posterior chains may not have mixed (R-hat above limit)");
            }
        }
    }

    // -----------------------------------------------------------------
    //  Queries
    // -----------------------------------------------------------------

    /// Probability that `bigram1` is preferred over `bigram2`.
    ///
    /// Fails only when the model is unfit. Any other problem (malformed or
    /// unknown bigram, non-finite arithmetic) yields the neutral prediction.
    pub fn predict_preference(
        &self,
        bigram1: &str,
        bigram2: &str,
    ) -> Result<ModelPrediction, ModelError> {
        let fitted = self.fitted("predict_preference")?;
        let start = Instant::now();
        let result = bigram1
            .parse::<Bigram>()
            .and_then(|b1| bigram2.parse::<Bigram>().map(|b2| (b1, b2)))
            .map_err(ModelError::from)
            .and_then(|(b1, b2)| self.predict_pair(fitted, b1, b2, start));
        match result {
            Ok(prediction) => Ok(prediction),
            Err(err) => {
                warn!(bigram1, bigram2, error = %err, "prediction failed; returning neutral");
                Ok(ModelPrediction::neutral(start.elapsed()))
            }
        }
    }

    fn predict_pair(
        &self,
        fitted: &FittedModel,
        bigram1: Bigram,
        bigram2: Bigram,
        start: Instant,
    ) -> Result<ModelPrediction, ModelError> {
        let key = (bigram1, bigram2);
        if let Some(hit) = lock(&self.prediction_cache).get(&key) {
            return Ok(hit);
        }

        let f1 = self.features_for(fitted, bigram1)?;
        let f2 = self.features_for(fitted, bigram2)?;
        let diff_main = fitted.differences(&fitted.main_features, &f1, &f2);
        let diff_ctrl = fitted.differences(&fitted.control_features, &f1, &f2);
        let effects = &fitted.posterior.beta * diff_main + &fitted.posterior.gamma * diff_ctrl;
        let (mean, std) = mean_std(effects.as_slice());
        if !(mean.is_finite() && std.is_finite()) {
            return Err(ModelError::value(format!(
                "non-finite effect for {bigram1} vs {bigram2}"
            )));
        }

        let prediction = ModelPrediction {
            probability: logistic(mean),
            uncertainty: std,
            features_used: fitted.all_features(),
            computation_time: start.elapsed(),
        };
        lock(&self.prediction_cache).insert(key, prediction.clone());
        Ok(prediction)
    }

    fn features_for(&self, fitted: &FittedModel, bigram: Bigram) -> Result<FeatureMap, ModelError> {
        if let Some(hit) = lock(&self.feature_cache).get(&bigram) {
            return Ok(hit);
        }
        let mut features = self.provider.extract(bigram)?;
        add_interactions(&mut features, &fitted.interactions);
        lock(&self.feature_cache).insert(bigram, features.clone());
        Ok(features)
    }

    /// Accuracy and AUC of the model's predictions on `dataset`.
    ///
    /// Preferences whose prediction fails are skipped. With nothing left the
    /// result is accuracy 0.5, AUC 0.5.
    pub fn evaluate(&self, dataset: &PreferenceDataset) -> Result<EvaluationMetrics, ModelError> {
        let fitted = self.fitted("evaluate")?;
        let mut labels = Vec::with_capacity(dataset.len());
        let mut probabilities = Vec::with_capacity(dataset.len());
        let mut uncertainties = Vec::with_capacity(dataset.len());
        let mut n_failed = 0;

        for pref in dataset.preferences() {
            match self.predict_pair(fitted, pref.bigram1, pref.bigram2, Instant::now()) {
                Ok(prediction) => {
                    labels.push(pref.preferred);
                    probabilities.push(prediction.probability);
                    uncertainties.push(prediction.uncertainty);
                }
                Err(err) => {
                    debug!(
                        bigram1 = %pref.bigram1,
                        bigram2 = %pref.bigram2,
                        error = %err,
                        "skipping preference in evaluation"
                    );
                    n_failed += 1;
                }
            }
        }
        if n_failed > 0 {
            warn!(n_failed, "some preferences could not be evaluated");
        }
        if labels.is_empty() {
            return Ok(EvaluationMetrics {
                accuracy: 0.5,
                auc: 0.5,
                n_evaluated: 0,
                n_failed,
                mean_uncertainty: 0.0,
            });
        }

        Ok(EvaluationMetrics {
            accuracy: metrics::accuracy(&labels, &probabilities),
            auc: metrics::auc(&labels, &probabilities),
            n_evaluated: labels.len(),
            n_failed,
            mean_uncertainty: mean_std(&uncertainties).0,
        })
    }

    /// Participant-grouped k-fold cross-validation.
    ///
    /// Uses the fitted feature set if there is one, otherwise every feature
    /// in the dataset. Folds are fit on fresh sibling models; `self` is not
    /// modified.
    pub fn cross_validate(
        &self,
        dataset: &PreferenceDataset,
        n_splits: usize,
    ) -> Result<CrossValidationReport, ModelError> {
        let features = match &self.state {
            ModelState::Fitted(f) => f.all_features(),
            ModelState::Unfit => dataset.feature_names(true),
        };
        let splits = dataset.cv_splits(n_splits, self.config.selection.cv_seed)?;

        let mut folds = Vec::with_capacity(splits.len());
        let mut per_feature: BTreeMap<String, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
        let mut n_skipped = 0;
        for (fold, split) in splits.iter().enumerate() {
            if split.train.is_empty() || split.test.is_empty() {
                warn!(fold, "skipping empty cross-validation fold");
                n_skipped += 1;
                continue;
            }
            let train = dataset.subset(&split.train)?;
            let test = dataset.subset(&split.test)?;
            let mut model = self.sibling();
            if let Err(err) = model.fit(&train, &features) {
                warn!(fold, error = %err, "skipping cross-validation fold");
                n_skipped += 1;
                continue;
            }
            let scores = model.evaluate(&test)?;
            for (name, weight) in model.get_feature_weights(true)? {
                let entry = per_feature.entry(name).or_default();
                entry.0.push(weight.mean);
                entry.1.push(weight.std);
            }
            debug!(fold, accuracy = scores.accuracy, auc = scores.auc, "fold evaluated");
            folds.push(FoldMetrics {
                fold,
                n_train: train.len(),
                n_test: test.len(),
                accuracy: scores.accuracy,
                auc: scores.auc,
                mean_uncertainty: scores.mean_uncertainty,
            });
        }

        if folds.is_empty() {
            return Err(ModelError::Fit {
                attempts: splits.len(),
                last: "no cross-validation fold could be fit".to_string(),
            });
        }
        let accuracies: Vec<f64> = folds.iter().map(|f| f.accuracy).collect();
        let aucs: Vec<f64> = folds.iter().map(|f| f.auc).collect();
        let (mean_accuracy, std_accuracy) = mean_std(&accuracies);
        let (mean_auc, std_auc) = mean_std(&aucs);
        let uncertainties: Vec<f64> = folds.iter().map(|f| f.mean_uncertainty).collect();
        let mean_uncertainty = mean_std(&uncertainties).0;
        let feature_stability = per_feature
            .into_iter()
            .map(|(name, (means, stds))| {
                let stability = WeightStability {
                    mean_weight: mean_std(&means).0,
                    mean_std: mean_std(&stds).0,
                    consistency: metrics::effect_consistency(&means),
                    fold_weights: means,
                };
                (name, stability)
            })
            .collect();

        Ok(CrossValidationReport {
            folds,
            n_skipped,
            mean_accuracy,
            std_accuracy,
            mean_auc,
            std_auc,
            mean_uncertainty,
            feature_stability,
        })
    }

    /// Posterior weights of the main features, plus controls when asked.
    pub fn get_feature_weights(
        &self,
        include_control: bool,
    ) -> Result<BTreeMap<String, FeatureWeight>, ModelError> {
        let fitted = self.fitted("get_feature_weights")?;
        Ok(fitted
            .weights
            .iter()
            .filter(|(name, _)| include_control || !fitted.control_features.contains(name))
            .map(|(name, weight)| (name.clone(), *weight))
            .collect())
    }

    /// Latent comfort of one bigram: `Σ z_f · mean_f`, with uncertainty
    /// `sqrt(Σ (z_f · std_f)²)`.
    pub fn comfort_score(&self, bigram: &str) -> Result<ComfortScore, ModelError> {
        let fitted = self.fitted("comfort_score")?;
        let bigram: Bigram = bigram.parse()?;
        let features = self.features_for(fitted, bigram)?;
        let mut score = 0.0;
        let mut variance = 0.0;
        for name in fitted.main_features.iter().chain(&fitted.control_features) {
            let z = fitted.standardized(name, &features);
            if let Some(weight) = fitted.weights.get(name) {
                score += z * weight.mean;
                variance += (z * weight.std).powi(2);
            }
        }
        Ok(ComfortScore {
            bigram,
            score,
            uncertainty: variance.sqrt(),
        })
    }

    /// Fraction of main features whose |weight| exceeds the sparsity threshold.
    pub fn feature_sparsity(&self) -> Result<f64, ModelError> {
        let fitted = self.fitted("feature_sparsity")?;
        if fitted.main_features.is_empty() {
            return Ok(0.0);
        }
        let threshold = self.config.model.sparsity_threshold;
        let active = fitted
            .main_features
            .iter()
            .filter(|n| fitted.weights.get(*n).is_some_and(|w| w.mean.abs() > threshold))
            .count();
        Ok(active as f64 / fitted.main_features.len() as f64)
    }

    /// Fraction of compared bigram triangles whose predicted preferences are
    /// transitive. 1.0 when the dataset contains no triangle.
    pub fn prediction_transitivity(&self, dataset: &PreferenceDataset) -> Result<f64, ModelError> {
        let fitted = self.fitted("prediction_transitivity")?;
        let mut neighbours: BTreeMap<Bigram, BTreeSet<Bigram>> = BTreeMap::new();
        for pref in dataset.preferences() {
            neighbours.entry(pref.bigram1).or_default().insert(pref.bigram2);
            neighbours.entry(pref.bigram2).or_default().insert(pref.bigram1);
        }

        let mut total = 0usize;
        let mut transitive = 0usize;
        for (a, near_a) in &neighbours {
            for b in near_a.iter().filter(|b| *b > a) {
                let Some(near_b) = neighbours.get(b) else { continue };
                for c in near_b.iter().filter(|c| *c > b && near_a.contains(*c)) {
                    let prefers = |x: Bigram, y: Bigram| {
                        self.predict_pair(fitted, x, y, Instant::now())
                            .map(|p| p.probability > 0.5)
                    };
                    let (Ok(ab), Ok(bc), Ok(ac)) = (prefers(*a, *b), prefers(*b, *c), prefers(*a, *c))
                    else {
                        continue;
                    };
                    total += 1;
                    let cyclic = (ab && bc && !ac) || (!ab && !bc && ac);
                    if !cyclic {
                        transitive += 1;
                    }
                }
            }
        }
        Ok(if total == 0 {
            1.0
        } else {
            transitive as f64 / total as f64
        })
    }

    // -----------------------------------------------------------------
    //  Persistence
    // -----------------------------------------------------------------

    /// Write the fitted state as a JSON bundle.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let fitted = self.fitted("save")?;
        let mut bundle = ModelBundle {
            format_version: FORMAT_VERSION,
            engine: self.engine.name().to_string(),
            config: (*self.config).clone(),
            main_features: fitted.main_features.clone(),
            control_features: fitted.control_features.clone(),
            interactions: fitted.interactions.clone(),
            standardization: fitted.standardization.clone(),
            weights: fitted.weights.clone(),
            posterior: fitted.posterior.clone(),
            fingerprint: String::new(),
        };
        bundle.fingerprint = fingerprint(&bundle)?;
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&bundle)?)?;
        info!(path = %path.display(), "saved model");
        Ok(())
    }

    /// Load a bundle written by [`save`](Self::save), using the Laplace engine
    /// for any later refits.
    pub fn load(path: impl AsRef<Path>, provider: Arc<dyn FeatureProvider>) -> Result<Self, ModelError> {
        Self::load_with_engine(path, provider, Arc::new(LaplaceEngine::new()))
    }

    pub fn load_with_engine(
        path: impl AsRef<Path>,
        provider: Arc<dyn FeatureProvider>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, ModelError> {
        let raw = std::fs::read(path.as_ref())?;
        let bundle: ModelBundle = serde_json::from_slice(&raw)?;
        if bundle.format_version != FORMAT_VERSION {
            return Err(ModelError::Persist(format!(
                "format version {} is not supported (expected {FORMAT_VERSION})",
                bundle.format_version
            )));
        }
        if fingerprint(&bundle)? != bundle.fingerprint {
            return Err(ModelError::Persist(
                "bundle fingerprint does not match".to_string(),
            ));
        }
        let n_draws = bundle.posterior.n_draws();
        if bundle.posterior.beta.ncols() != bundle.main_features.len()
            || bundle.posterior.gamma.ncols() != bundle.control_features.len()
            || bundle.posterior.gamma.nrows() != n_draws
        {
            return Err(ModelError::Persist(
                "posterior shape does not match feature lists".to_string(),
            ));
        }

        let mut model = Self::with_engine(bundle.config, provider, engine)?;
        model.state = ModelState::Fitted(Box::new(FittedModel {
            main_features: bundle.main_features,
            control_features: bundle.control_features,
            interactions: bundle.interactions,
            standardization: bundle.standardization,
            weights: bundle.weights,
            posterior: bundle.posterior,
        }));
        Ok(model)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pooled mean and population std of `feature` over both sides of every
/// preference where it is present.
fn feature_statistics(dataset: &PreferenceDataset, feature: &str) -> Standardization {
    let mut values = Vec::with_capacity(dataset.len() * 2);
    for pref in dataset.preferences() {
        if let Some((a, b)) = pref.feature_pair(feature) {
            values.push(a);
            values.push(b);
        }
    }
    let (mean, std) = mean_std(&values);
    Standardization {
        mean: if mean.is_finite() { mean } else { 0.0 },
        std: if std.is_finite() && std >= MIN_STD { std } else { 1.0 },
    }
}

fn extract_weights(
    posterior: &Posterior,
    main: &[String],
    controls: &[String],
) -> BTreeMap<String, FeatureWeight> {
    let column = |matrix: &DMatrix<f64>, col: usize| {
        let values: Vec<f64> = matrix.column(col).iter().copied().collect();
        let (mean, std) = mean_std(&values);
        FeatureWeight { mean, std }
    };
    let mut weights = BTreeMap::new();
    for (j, name) in main.iter().enumerate() {
        weights.insert(name.clone(), column(&posterior.beta, j));
    }
    for (k, name) in controls.iter().enumerate() {
        weights.insert(name.clone(), column(&posterior.gamma, k));
    }
    weights
}

/// blake3 over the canonical JSON of every bundle field except the
/// fingerprint itself.
fn fingerprint(bundle: &ModelBundle) -> Result<String, ModelError> {
    let mut value = serde_json::to_value(bundle)?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("fingerprint");
    }
    Ok(blake3::hash(&serde_json::to_vec(&value)?).to_hex().to_string())
}
