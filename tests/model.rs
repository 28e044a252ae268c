use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bigram_comfort::engine::{EngineError, InferenceData, SamplerSettings};
use bigram_comfort::features::FeatureLayout;
use bigram_comfort::synthetic::{SyntheticData, SyntheticStudy};
use bigram_comfort::{
    Bigram, FeatureTable, InferenceEngine, LaplaceEngine, ModelError, Posterior, Preference,
    PreferenceDataset, PreferenceModel, SamplingStrategy,
};

fn study(participants: usize) -> SyntheticData {
    let mut data = SyntheticStudy {
        n_participants: participants,
        preferences_per_participant: 40,
        ..SyntheticStudy::default()
    }
    .generate()
    .unwrap();
    data.config.model.chains = 2;
    data.config.model.draws_per_chain = 200;
    data
}

fn fitted(data: &SyntheticData) -> (PreferenceModel, PreferenceDataset) {
    let dataset = data.dataset().unwrap();
    let mut model = PreferenceModel::new(data.config.clone(), Arc::new(data.table.clone())).unwrap();
    model
        .fit(&dataset, &["strong".to_string(), "noise".to_string()])
        .unwrap();
    (model, dataset)
}

#[test]
fn fit_recovers_the_informative_weight() {
    let data = study(8);
    let (model, _) = fitted(&data);

    let weights = model.get_feature_weights(false).unwrap();
    assert_eq!(weights.len(), 2);
    assert!(weights["strong"].mean > 0.5);
    assert!(weights["strong"].mean.abs() > weights["noise"].mean.abs());
    assert!(weights["strong"].std > 0.0);

    let all = model.get_feature_weights(true).unwrap();
    assert!(all.contains_key("frequency"));
    assert_eq!(
        model.selected_features().unwrap(),
        vec!["strong".to_string(), "noise".to_string(), "frequency".to_string()]
    );

    let diagnostics = model.diagnostics().unwrap();
    assert_eq!(diagnostics.strategy, SamplingStrategy::Newton);
    assert_eq!(diagnostics.divergences, 0);
    assert_eq!(diagnostics.rhat.len(), 3);
}

#[test]
fn refitting_with_the_same_seed_is_deterministic() {
    let data = study(4);
    let (mut model, dataset) = fitted(&data);
    let first = model.get_feature_weights(true).unwrap();
    model
        .fit(&dataset, &["strong".to_string(), "noise".to_string()])
        .unwrap();
    assert_eq!(model.get_feature_weights(true).unwrap(), first);
}

#[test]
fn unfit_model_refuses_queries() {
    let data = study(2);
    let model = PreferenceModel::new(data.config.clone(), Arc::new(data.table.clone())).unwrap();
    let dataset = data.dataset().unwrap();

    assert!(!model.is_fitted());
    assert!(matches!(
        model.predict_preference("ab", "cd"),
        Err(ModelError::NotFitted(_))
    ));
    assert!(matches!(model.evaluate(&dataset), Err(ModelError::NotFitted(_))));
    assert!(matches!(model.comfort_score("ab"), Err(ModelError::NotFitted(_))));
    assert!(matches!(model.feature_sparsity(), Err(ModelError::NotFitted(_))));
    assert!(matches!(
        model.get_feature_weights(true),
        Err(ModelError::NotFitted(_))
    ));
}

#[test]
fn unknown_feature_is_rejected() {
    let data = study(2);
    let dataset = data.dataset().unwrap();
    let mut model = PreferenceModel::new(data.config.clone(), Arc::new(data.table.clone())).unwrap();
    let err = model.fit(&dataset, &["missing".to_string()]).unwrap_err();
    assert!(matches!(err, ModelError::Value(_)));
    assert!(!model.is_fitted());
}

#[test]
fn predictions_are_complementary_and_neutral_on_bad_input() {
    let data = study(4);
    let (model, _) = fitted(&data);

    let forward = model.predict_preference("ab", "cd").unwrap();
    let backward = model.predict_preference("cd", "ab").unwrap();
    assert!((forward.probability + backward.probability - 1.0).abs() < 1e-9);
    assert!((forward.uncertainty - backward.uncertainty).abs() < 1e-9);
    assert!(forward.features_used.contains(&"strong".to_string()));

    for (b1, b2) in [("abc", "cd"), ("ab", "zq")] {
        let neutral = model.predict_preference(b1, b2).unwrap();
        assert_eq!(neutral.probability, 0.5);
        assert_eq!(neutral.uncertainty, 1.0);
        assert!(neutral.features_used.is_empty());
    }
}

#[test]
fn refit_clears_prediction_cache() {
    let data = study(4);
    let (mut model, dataset) = fitted(&data);

    model.predict_preference("ab", "cd").unwrap();
    model.predict_preference("ab", "cd").unwrap();
    let (_, predictions) = model.cache_stats();
    assert_eq!(predictions.size, 1);
    assert!(predictions.hits >= 1);

    model.fit(&dataset, &["strong".to_string()]).unwrap();
    let (features, predictions) = model.cache_stats();
    assert_eq!(predictions.size, 0);
    assert_eq!(features.size, 0);
    let weights = model.get_feature_weights(false).unwrap();
    assert_eq!(weights.keys().collect::<Vec<_>>(), vec!["strong"]);
}

#[test]
fn evaluation_and_derived_metrics() {
    let data = study(8);
    let (model, dataset) = fitted(&data);

    let metrics = model.evaluate(&dataset).unwrap();
    assert_eq!(metrics.n_evaluated, dataset.len());
    assert_eq!(metrics.n_failed, 0);
    assert!(metrics.accuracy > 0.65, "accuracy {}", metrics.accuracy);
    assert!(metrics.auc > 0.7, "auc {}", metrics.auc);

    let sparsity = model.feature_sparsity().unwrap();
    assert!((0.5..=1.0).contains(&sparsity));

    // A linear comfort score always orders predictions transitively.
    assert_eq!(model.prediction_transitivity(&dataset).unwrap(), 1.0);
}

#[test]
fn comfort_scores_match_pairwise_predictions() {
    let data = study(8);
    let (model, dataset) = fitted(&data);

    let widest = dataset
        .preferences()
        .iter()
        .max_by(|a, b| {
            let gap = |p: &bigram_comfort::Preference| {
                (p.features1["strong"] - p.features2["strong"]).abs()
            };
            gap(a).total_cmp(&gap(b))
        })
        .unwrap();
    let (hi, lo) = if widest.features1["strong"] > widest.features2["strong"] {
        (widest.bigram1, widest.bigram2)
    } else {
        (widest.bigram2, widest.bigram1)
    };

    let s_hi = model.comfort_score(&hi.to_string()).unwrap();
    let s_lo = model.comfort_score(&lo.to_string()).unwrap();
    assert!(s_hi.score > s_lo.score);
    assert!(s_hi.uncertainty >= 0.0);

    let p = model
        .predict_preference(&hi.to_string(), &lo.to_string())
        .unwrap();
    let from_scores = 1.0 / (1.0 + (-(s_hi.score - s_lo.score)).exp());
    assert!((p.probability - from_scores).abs() < 1e-6);
}

#[test]
fn cross_validation_reports_every_fold() {
    let data = study(8);
    let dataset = data.dataset().unwrap();
    let model = PreferenceModel::new(data.config.clone(), Arc::new(data.table.clone())).unwrap();

    let report = model.cross_validate(&dataset, 4).unwrap();
    assert_eq!(report.folds.len(), 4);
    assert_eq!(report.n_skipped, 0);
    assert!(report.mean_accuracy > 0.6, "cv accuracy {}", report.mean_accuracy);
    let strong = &report.feature_stability["strong"];
    assert_eq!(strong.fold_weights.len(), 4);
    assert!(strong.fold_weights.iter().all(|w| *w > 0.0));
    assert!(strong.consistency > 0.5);
    assert!(report.mean_uncertainty.is_finite() && report.mean_uncertainty > 0.0);
    let fold_mean =
        report.folds.iter().map(|f| f.mean_uncertainty).sum::<f64>() / report.folds.len() as f64;
    assert!((report.mean_uncertainty - fold_mean).abs() < 1e-12);
    assert!(!model.is_fitted());

    assert!(matches!(
        model.cross_validate(&dataset, 1),
        Err(ModelError::Value(_))
    ));
}

#[test]
fn evaluation_without_any_usable_prediction_is_neutral() {
    let data = study(2);
    let (model, dataset) = fitted(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    model.save(&path).unwrap();

    // Same feature names, but no bigram rows to look up.
    let empty = FeatureTable::new(vec![
        "strong".to_string(),
        "noise".to_string(),
        "frequency".to_string(),
    ]);
    let reloaded = PreferenceModel::load(&path, Arc::new(empty)).unwrap();
    let metrics = reloaded.evaluate(&dataset).unwrap();
    assert_eq!(metrics.accuracy, 0.5);
    assert_eq!(metrics.auc, 0.5);
    assert_eq!(metrics.n_evaluated, 0);
    assert_eq!(metrics.n_failed, dataset.len());
}

fn timed_preferences() -> (FeatureTable, PreferenceDataset) {
    let letters: Vec<char> = "abcdefgh".chars().collect();
    let mut table = FeatureTable::new(vec!["x".to_string()]);
    let mut bigrams = Vec::new();
    for (i, &a) in letters.iter().enumerate() {
        let b = letters[(i + 1) % letters.len()];
        let bigram = Bigram(a, b);
        table.insert(bigram, &[i as f64]).unwrap();
        bigrams.push(bigram);
    }

    let mut preferences = Vec::new();
    for row in 0..120usize {
        let bigram1 = bigrams[row % bigrams.len()];
        let bigram2 = bigrams[(row * 3 + 1) % bigrams.len()];
        let time1 = 100.0 + ((row * 37) % 80) as f64;
        let time2 = 100.0 + ((row * 53 + 11) % 80) as f64;
        // The faster bigram is chosen; one side of every fourth row is missing.
        let missing = row % 4 == 0;
        preferences.push(Preference {
            bigram1,
            bigram2,
            participant_id: format!("p{}", row % 4),
            preferred: time1 < time2,
            features1: [("x".to_string(), 0.0)].into_iter().collect(),
            features2: [("x".to_string(), 0.0)].into_iter().collect(),
            confidence: 50.0,
            typing_time1: Some(time1),
            typing_time2: if missing { None } else { Some(time2) },
        });
    }
    let layout = FeatureLayout {
        base: vec!["x".to_string()],
        interactions: Vec::new(),
        control: Vec::new(),
    };
    (table, PreferenceDataset::from_preferences(preferences, layout).unwrap())
}

#[test]
fn typing_time_is_fit_from_recorded_pairs_and_neutral_at_query_time() {
    let (table, dataset) = timed_preferences();
    let mut config = study(2).config;
    config.features.control_features.clear();
    let mut model = PreferenceModel::new(config, Arc::new(table)).unwrap();
    model.fit(&dataset, &["typing_time".to_string()]).unwrap();

    let weights = model.get_feature_weights(true).unwrap();
    assert_eq!(weights.len(), 1);
    assert!(weights["typing_time"].mean < 0.0, "{:?}", weights["typing_time"]);

    let prediction = model.predict_preference("ab", "cd").unwrap();
    assert_eq!(prediction.probability, 0.5);
    assert_eq!(prediction.uncertainty, 0.0);

    let recorded: Vec<f64> = dataset
        .preferences()
        .iter()
        .filter_map(|p| p.feature_pair("typing_time"))
        .flat_map(|(a, b)| [a, b])
        .collect();
    assert_eq!(recorded.len(), 2 * 90);
    let expected_mean = recorded.iter().sum::<f64>() / recorded.len() as f64;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    model.save(&path).unwrap();
    let bundle: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let saved_mean = bundle["standardization"]["typing_time"]["mean"].as_f64().unwrap();
    assert!((saved_mean - expected_mean).abs() < 1e-9);
}

#[derive(Debug)]
struct FlakyEngine {
    failures: usize,
    calls: AtomicUsize,
    seen: Mutex<Vec<(SamplingStrategy, usize)>>,
}

impl FlakyEngine {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl InferenceEngine for FlakyEngine {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn sample(
        &self,
        data: &InferenceData,
        settings: &SamplerSettings,
        strategy: SamplingStrategy,
    ) -> Result<Posterior, EngineError> {
        self.seen.lock().unwrap().push((strategy, settings.chains));
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(EngineError::NotConverged {
                iterations: settings.max_iterations,
                last_step: 1.0,
            });
        }
        LaplaceEngine::new().sample(data, settings, strategy)
    }
}

#[test]
fn sampler_falls_back_through_the_ladder() {
    let mut data = study(4);
    data.config.model.chains = 4;
    let dataset = data.dataset().unwrap();

    let engine = Arc::new(FlakyEngine::new(2));
    let mut model = PreferenceModel::with_engine(
        data.config.clone(),
        Arc::new(data.table.clone()),
        engine.clone(),
    )
    .unwrap();
    model.fit(&dataset, &["strong".to_string()]).unwrap();

    let seen = engine.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (SamplingStrategy::Newton, 4),
            (SamplingStrategy::LineSearch, 2),
            (SamplingStrategy::LineSearch, 1),
        ]
    );
    let diagnostics = model.diagnostics().unwrap();
    assert_eq!(diagnostics.strategy, SamplingStrategy::LineSearch);
    assert_eq!(diagnostics.chains, 1);
}

#[test]
fn exhausted_ladder_leaves_model_unfit() {
    let data = study(2);
    let dataset = data.dataset().unwrap();
    let mut model = PreferenceModel::with_engine(
        data.config.clone(),
        Arc::new(data.table.clone()),
        Arc::new(FlakyEngine::new(usize::MAX)),
    )
    .unwrap();

    let err = model.fit(&dataset, &["strong".to_string()]).unwrap_err();
    assert!(matches!(err, ModelError::Fit { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert!(!model.is_fitted());
}
