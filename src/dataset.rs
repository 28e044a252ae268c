//! Pairwise bigram preference judgments with participant tracking.
//!
//! A `PreferenceDataset` is an ordered list of `Preference`s plus the set of
//! participants that produced them. Subsets share preferences by `Arc` and
//! carry the parent's feature layout, so splitting is cheap and a subset can
//! be fit exactly like the full dataset.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use csv::StringRecord;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::FeatureSettings;
use crate::error::ModelError;
use crate::features::{
    add_interactions, Bigram, FeatureLayout, FeatureMap, FeatureProvider, Interaction, TYPING_TIME,
};

/// Columns a judgments CSV must carry.
pub const REQUIRED_COLUMNS: [&str; 9] = [
    "bigram1",
    "bigram2",
    "user_id",
    "chosen_bigram",
    "bigram1_time",
    "bigram2_time",
    "chosen_bigram_correct",
    "unchosen_bigram_correct",
    "abs_sliderValue",
];

// ---------------------------------------------------------------------
//  Preference
// ---------------------------------------------------------------------

/// One recorded choice between two bigrams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub bigram1: Bigram,
    pub bigram2: Bigram,
    pub participant_id: String,
    /// True when `bigram1` was chosen.
    pub preferred: bool,
    pub features1: FeatureMap,
    pub features2: FeatureMap,
    /// Slider magnitude of the judgment.
    pub confidence: f64,
    pub typing_time1: Option<f64>,
    pub typing_time2: Option<f64>,
}

impl Preference {
    /// Values of `feature` for (bigram1, bigram2).
    ///
    /// Missing keys read as 0.0. Typing time is `None` unless both sides were
    /// recorded, so a difference is never built from a single measurement.
    pub fn feature_pair(&self, feature: &str) -> Option<(f64, f64)> {
        if feature == TYPING_TIME {
            return match (self.typing_time1, self.typing_time2) {
                (Some(a), Some(b)) => Some((a, b)),
                _ => None,
            };
        }
        Some((
            self.features1.get(feature).copied().unwrap_or(0.0),
            self.features2.get(feature).copied().unwrap_or(0.0),
        ))
    }
}

/// Result of the transitivity diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransitivityReport {
    pub violations: usize,
    pub triples_checked: usize,
    pub violation_rate: f64,
}

/// Row indices of one participant-grouped fold.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

// ---------------------------------------------------------------------
//  Dataset
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PreferenceDataset {
    preferences: Vec<Arc<Preference>>,
    participants: BTreeSet<String>,
    layout: Arc<FeatureLayout>,
}

impl PreferenceDataset {
    /// Build a dataset from already-featurized preferences.
    pub fn from_preferences(
        preferences: Vec<Preference>,
        layout: FeatureLayout,
    ) -> Result<Self, ModelError> {
        if preferences.is_empty() {
            return Err(ModelError::data_format("dataset has no preferences"));
        }
        Ok(Self::from_shared(
            preferences.into_iter().map(Arc::new).collect(),
            Arc::new(layout),
        ))
    }

    fn from_shared(preferences: Vec<Arc<Preference>>, layout: Arc<FeatureLayout>) -> Self {
        let participants = preferences
            .iter()
            .map(|p| p.participant_id.clone())
            .collect();
        Self {
            preferences,
            participants,
            layout,
        }
    }

    /// Load judgments from CSV and attach features from `provider`.
    ///
    /// Rows comparing a repeated-key bigram are dropped. Rows with unknown or
    /// malformed bigrams are skipped with a warning. Fails only if the header
    /// is incomplete or no row survives.
    pub fn load(
        path: impl AsRef<Path>,
        provider: &dyn FeatureProvider,
        settings: &FeatureSettings,
    ) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let layout = layout_for(provider, settings);

        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let column: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim(), idx))
            .collect();
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !column.contains_key(c))
            .collect();
        if !missing.is_empty() {
            return Err(ModelError::data_format(format!(
                "{} is missing required columns: {}",
                path.display(),
                missing.join(", ")
            )));
        }

        let mut preferences = Vec::new();
        let mut repeated = 0usize;
        let mut skipped = 0usize;
        for (row, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(err) => {
                    warn!(row = row + 2, error = %err, "skipping unreadable row");
                    skipped += 1;
                    continue;
                }
            };
            match parse_row(&record, &column, provider, &layout.interactions) {
                Ok(Some(pref)) => preferences.push(Arc::new(pref)),
                Ok(None) => repeated += 1,
                Err(reason) => {
                    warn!(row = row + 2, %reason, "skipping preference row");
                    skipped += 1;
                }
            }
        }

        if preferences.is_empty() {
            return Err(ModelError::data_format(format!(
                "no valid preferences in {} ({skipped} skipped, {repeated} repeated-key)",
                path.display()
            )));
        }
        let dataset = Self::from_shared(preferences, Arc::new(layout));
        info!(
            preferences = dataset.len(),
            participants = dataset.participants.len(),
            skipped,
            repeated,
            "loaded preference dataset"
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.preferences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty()
    }

    pub fn preferences(&self) -> &[Arc<Preference>] {
        &self.preferences
    }

    pub fn participants(&self) -> &BTreeSet<String> {
        &self.participants
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    /// Main feature names (base then interactions), optionally followed by
    /// controls.
    pub fn feature_names(&self, include_control: bool) -> Vec<String> {
        self.layout.names(include_control)
    }

    /// New dataset holding exactly the given rows, in the given order.
    pub fn subset(&self, indices: &[usize]) -> Result<Self, ModelError> {
        if indices.is_empty() {
            return Err(ModelError::value("subset indices are empty"));
        }
        if let Some(bad) = indices.iter().find(|&&i| i >= self.preferences.len()) {
            return Err(ModelError::value(format!(
                "subset index {bad} out of range for {} preferences",
                self.preferences.len()
            )));
        }
        let preferences = indices
            .iter()
            .map(|&i| Arc::clone(&self.preferences[i]))
            .collect();
        Ok(Self::from_shared(preferences, Arc::clone(&self.layout)))
    }

    /// Split into (train, test) with no participant in both halves.
    ///
    /// `max(1, floor(n * test_fraction))` participants are held out.
    pub fn split_by_participants(
        &self,
        test_fraction: f64,
        seed: u64,
    ) -> Result<(Self, Self), ModelError> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(ModelError::value(format!(
                "test_fraction must be in (0, 1), got {test_fraction}"
            )));
        }
        let n = self.participants.len();
        if n < 2 {
            return Err(ModelError::value(
                "need at least two participants to split",
            ));
        }
        let mut order: Vec<&String> = self.participants.iter().collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let n_test = ((n as f64 * test_fraction).floor() as usize).clamp(1, n - 1);
        let held_out: BTreeSet<&String> = order.into_iter().take(n_test).collect();

        let (test, train): (Vec<usize>, Vec<usize>) =
            (0..self.preferences.len()).partition(|&i| {
                held_out.contains(&self.preferences[i].participant_id)
            });
        debug!(
            train = train.len(),
            test = test.len(),
            held_out = n_test,
            "split by participants"
        );
        Ok((self.subset(&train)?, self.subset(&test)?))
    }

    /// Participant-grouped k-fold splits.
    ///
    /// Participants are sorted, shuffled with `seed`, and dealt into
    /// `min(n_splits, participants)` folds whose sizes differ by at most one.
    pub fn cv_splits(&self, n_splits: usize, seed: u64) -> Result<Vec<FoldSplit>, ModelError> {
        let k = n_splits.min(self.participants.len());
        if k < 2 {
            return Err(ModelError::value(format!(
                "cross-validation needs at least 2 folds (requested {n_splits}, {} participants)",
                self.participants.len()
            )));
        }
        let mut order: Vec<&String> = self.participants.iter().collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let n = order.len();
        let mut fold_of: HashMap<&String, usize> = HashMap::with_capacity(n);
        let mut start = 0;
        for fold in 0..k {
            let size = n / k + usize::from(fold < n % k);
            for &participant in &order[start..start + size] {
                fold_of.insert(participant, fold);
            }
            start += size;
        }

        let mut splits = vec![
            FoldSplit {
                train: Vec::new(),
                test: Vec::new(),
            };
            k
        ];
        for (idx, pref) in self.preferences.iter().enumerate() {
            let own = fold_of.get(&pref.participant_id).copied().unwrap_or(0);
            for (fold, split) in splits.iter_mut().enumerate() {
                if fold == own {
                    split.test.push(idx);
                } else {
                    split.train.push(idx);
                }
            }
        }
        Ok(splits)
    }

    /// Count preference cycles a≻b≻c with c≻a recorded.
    pub fn check_transitivity(&self) -> TransitivityReport {
        let mut beats: BTreeMap<Bigram, BTreeSet<Bigram>> = BTreeMap::new();
        for pref in &self.preferences {
            let (winner, loser) = if pref.preferred {
                (pref.bigram1, pref.bigram2)
            } else {
                (pref.bigram2, pref.bigram1)
            };
            beats.entry(winner).or_default().insert(loser);
        }

        let empty = BTreeSet::new();
        let mut violations = 0;
        let mut triples_checked = 0;
        for (a, over_a) in &beats {
            for b in over_a {
                for c in beats.get(b).unwrap_or(&empty) {
                    if c == a {
                        continue;
                    }
                    triples_checked += 1;
                    if over_a.contains(c) {
                        continue;
                    }
                    if beats.get(c).is_some_and(|over_c| over_c.contains(a)) {
                        violations += 1;
                    }
                }
            }
        }
        let violation_rate = if triples_checked > 0 {
            violations as f64 / triples_checked as f64
        } else {
            0.0
        };
        TransitivityReport {
            violations,
            triples_checked,
            violation_rate,
        }
    }
}

fn layout_for(provider: &dyn FeatureProvider, settings: &FeatureSettings) -> FeatureLayout {
    let control = settings.control_features.clone();
    let base = if settings.base_features.is_empty() {
        provider
            .feature_names()
            .into_iter()
            .filter(|name| !control.contains(name))
            .collect()
    } else {
        settings.base_features.clone()
    };
    let interactions = settings
        .interactions
        .iter()
        .map(|components| Interaction::new(components.as_slice()))
        .collect();
    FeatureLayout {
        base,
        interactions,
        control,
    }
}

fn cell<'r>(record: &'r StringRecord, column: &HashMap<&str, usize>, name: &str) -> &'r str {
    column
        .get(name)
        .and_then(|idx| record.get(*idx))
        .unwrap_or("")
        .trim()
}

/// `Ok(None)` for rows that compare a repeated-key bigram.
fn parse_row(
    record: &StringRecord,
    column: &HashMap<&str, usize>,
    provider: &dyn FeatureProvider,
    interactions: &[Interaction],
) -> Result<Option<Preference>, String> {
    let field = |name: &str| cell(record, column, name);
    let raw1 = field("bigram1");
    let raw2 = field("bigram2");
    let bigram1: Bigram = raw1.parse().map_err(|e| format!("{e}"))?;
    let bigram2: Bigram = raw2.parse().map_err(|e| format!("{e}"))?;
    if bigram1.is_repeated() || bigram2.is_repeated() {
        return Ok(None);
    }

    let participant_id = field("user_id");
    if participant_id.is_empty() {
        return Err("empty user_id".to_string());
    }
    let chosen = field("chosen_bigram");
    let preferred = if chosen == raw1 {
        true
    } else if chosen == raw2 {
        false
    } else {
        return Err(format!("chosen_bigram '{chosen}' matches neither side"));
    };
    let confidence = field("abs_sliderValue")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(f64::abs)
        .ok_or_else(|| format!("unparsable abs_sliderValue '{}'", field("abs_sliderValue")))?;

    let mut features1 = provider.extract(bigram1).map_err(|e| e.to_string())?;
    let mut features2 = provider.extract(bigram2).map_err(|e| e.to_string())?;
    add_interactions(&mut features1, interactions);
    add_interactions(&mut features2, interactions);

    Ok(Some(Preference {
        bigram1,
        bigram2,
        participant_id: participant_id.to_string(),
        preferred,
        features1,
        features2,
        confidence,
        typing_time1: parse_time(field("bigram1_time")),
        typing_time2: parse_time(field("bigram2_time")),
    }))
}

fn parse_time(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|t| t.is_finite())
}
