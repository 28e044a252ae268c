//! Synthetic preference studies with known ground-truth weights.
//!
//! Generates a bigram feature table and pairwise judgments from a
//! hierarchical logistic model, so selection and fitting can be checked
//! against weights we chose ourselves.

use std::path::{Path, PathBuf};

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;

use crate::config::{Config, FeatureSettings};
use crate::dataset::{Preference, PreferenceDataset, REQUIRED_COLUMNS};
use crate::error::ModelError;
use crate::features::{Bigram, FeatureLayout, FeatureMap, FeatureProvider, FeatureTable};
use crate::metrics::logistic;

// =============================================================================
// Study definition
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticFeature {
    pub name: String,
    /// True weight per unit of raw feature difference.
    pub weight: f64,
}

impl SyntheticFeature {
    pub fn new(name: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticStudy {
    /// Keys to build bigrams from; every ordered pair of distinct keys is a bigram.
    pub alphabet: String,
    pub features: Vec<SyntheticFeature>,
    pub controls: Vec<SyntheticFeature>,
    pub n_participants: usize,
    pub preferences_per_participant: usize,
    /// Standard deviation of participant random effects.
    pub participant_sd: f64,
    /// Probability that a typing time is not recorded.
    pub missing_time_rate: f64,
    pub seed: u64,
}

impl Default for SyntheticStudy {
    fn default() -> Self {
        Self {
            alphabet: "abcdefghij".to_string(),
            features: vec![
                SyntheticFeature::new("strong", 4.0),
                SyntheticFeature::new("noise", 0.0),
            ],
            controls: vec![SyntheticFeature::new("frequency", 0.5)],
            n_participants: 8,
            preferences_per_participant: 40,
            participant_sd: 0.3,
            missing_time_rate: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub table: FeatureTable,
    pub preferences: Vec<Preference>,
    pub config: Config,
}

/// Files written by [`SyntheticData::write_to_dir`].
#[derive(Debug, Clone)]
pub struct SyntheticPaths {
    pub judgments: PathBuf,
    pub features: PathBuf,
    pub config: PathBuf,
}

// =============================================================================
// Generation
// =============================================================================

impl SyntheticStudy {
    pub fn generate(&self) -> Result<SyntheticData, ModelError> {
        let keys: Vec<char> = self.alphabet.chars().collect();
        let mut bigrams = Vec::new();
        for &a in &keys {
            for &b in &keys {
                if a != b {
                    bigrams.push(Bigram(a, b));
                }
            }
        }
        if bigrams.len() < 2 {
            return Err(ModelError::value("alphabet needs at least two distinct keys"));
        }
        if self.n_participants == 0 || self.preferences_per_participant == 0 {
            return Err(ModelError::value("study needs participants and preferences"));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let all: Vec<&SyntheticFeature> = self.features.iter().chain(&self.controls).collect();
        let names: Vec<String> = all.iter().map(|f| f.name.clone()).collect();
        let mut table = FeatureTable::new(names);
        for &bigram in &bigrams {
            let values: Vec<f64> = all.iter().map(|_| rng.gen::<f64>()).collect();
            table.insert(bigram, &values)?;
        }

        let participant_effect = if self.participant_sd > 0.0 {
            Some(
                Normal::new(0.0, self.participant_sd)
                    .map_err(|e| ModelError::value(format!("participant_sd: {e}")))?,
            )
        } else {
            None
        };

        let mut preferences =
            Vec::with_capacity(self.n_participants * self.preferences_per_participant);
        for participant in 0..self.n_participants {
            let participant_id = format!("p{participant:03}");
            let z = participant_effect
                .as_ref()
                .map_or(0.0, |normal| normal.sample(&mut rng));
            for _ in 0..self.preferences_per_participant {
                let i = rng.gen_range(0..bigrams.len());
                let mut j = rng.gen_range(0..bigrams.len() - 1);
                if j >= i {
                    j += 1;
                }
                let (bigram1, bigram2) = (bigrams[i], bigrams[j]);
                let features1 = table.extract(bigram1)?;
                let features2 = table.extract(bigram2)?;
                let eta = z + all
                    .iter()
                    .map(|f| f.weight * (value(&features1, &f.name) - value(&features2, &f.name)))
                    .sum::<f64>();
                let p = logistic(eta);
                preferences.push(Preference {
                    bigram1,
                    bigram2,
                    participant_id: participant_id.clone(),
                    preferred: rng.gen::<f64>() < p,
                    features1,
                    features2,
                    confidence: (100.0 * (2.0 * p - 1.0).abs()).round(),
                    typing_time1: self.typing_time(&mut rng),
                    typing_time2: self.typing_time(&mut rng),
                });
            }
        }

        let config = Config {
            features: FeatureSettings {
                base_features: self.features.iter().map(|f| f.name.clone()).collect(),
                control_features: self.controls.iter().map(|f| f.name.clone()).collect(),
                interactions: Vec::new(),
            },
            ..Config::default()
        };
        Ok(SyntheticData {
            table,
            preferences,
            config,
        })
    }

    fn typing_time(&self, rng: &mut StdRng) -> Option<f64> {
        if rng.gen::<f64>() < self.missing_time_rate {
            None
        } else {
            Some((150.0 + 100.0 * rng.gen::<f64>()).round())
        }
    }
}

fn value(features: &FeatureMap, name: &str) -> f64 {
    features.get(name).copied().unwrap_or(0.0)
}

impl SyntheticData {
    pub fn layout(&self) -> FeatureLayout {
        FeatureLayout {
            base: self.config.features.base_features.clone(),
            interactions: Vec::new(),
            control: self.config.features.control_features.clone(),
        }
    }

    pub fn dataset(&self) -> Result<PreferenceDataset, ModelError> {
        PreferenceDataset::from_preferences(self.preferences.clone(), self.layout())
    }

    /// Write judgments in the CSV layout `PreferenceDataset::load` reads.
    pub fn write_judgments_csv(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record(REQUIRED_COLUMNS)?;
        let time = |t: Option<f64>| t.map(|v| v.to_string()).unwrap_or_default();
        for pref in &self.preferences {
            let chosen = if pref.preferred {
                pref.bigram1
            } else {
                pref.bigram2
            };
            writer.write_record([
                pref.bigram1.to_string(),
                pref.bigram2.to_string(),
                pref.participant_id.clone(),
                chosen.to_string(),
                time(pref.typing_time1),
                time(pref.typing_time2),
                "1".to_string(),
                "1".to_string(),
                pref.confidence.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write `judgments.csv`, `features.csv` and `config.json` into `dir`.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<SyntheticPaths, ModelError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let paths = SyntheticPaths {
            judgments: dir.join("judgments.csv"),
            features: dir.join("features.csv"),
            config: dir.join("config.json"),
        };
        self.write_judgments_csv(&paths.judgments)?;
        self.table.write_csv(&paths.features)?;
        self.config.write_to(&paths.config)?;
        Ok(paths)
    }
}
