//! Bigram feature lookup and interaction terms.
//!
//! Feature geometry (finger, row, column maps) is computed elsewhere; this
//! module only consumes a precomputed table keyed by bigram.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Name of the per-judgment timing feature. It is not part of any feature
/// table and may be absent on either side of a preference.
pub const TYPING_TIME: &str = "typing_time";

/// Separator between components in an interaction feature name.
pub const INTERACTION_SEPARATOR: &str = "_x_";

pub type FeatureMap = BTreeMap<String, f64>;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid bigram '{0}': expected exactly two characters")]
    InvalidBigram(String),
    #[error("no features for bigram '{0}'")]
    UnknownBigram(Bigram),
    #[error("feature table error: {0}")]
    Table(String),
    #[error("feature table csv error: {0}")]
    Csv(#[from] csv::Error),
}

// ---------------------------------------------------------------------
//  Bigram
// ---------------------------------------------------------------------

/// Two characters typed in sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Bigram(pub char, pub char);

impl Bigram {
    /// True for bigrams like "ee" that repeat one key.
    pub fn is_repeated(&self) -> bool {
        self.0 == self.1
    }
}

impl FromStr for Bigram {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(a), Some(b), None) => Ok(Bigram(a, b)),
            _ => Err(FeatureError::InvalidBigram(s.to_string())),
        }
    }
}

impl fmt::Display for Bigram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0, self.1)
    }
}

impl From<Bigram> for String {
    fn from(b: Bigram) -> Self {
        b.to_string()
    }
}

impl TryFrom<String> for Bigram {
    type Error = FeatureError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------
//  Provider
// ---------------------------------------------------------------------

/// Source of named numeric features for a bigram.
pub trait FeatureProvider: Send + Sync + fmt::Debug {
    fn extract(&self, bigram: Bigram) -> Result<FeatureMap, FeatureError>;

    /// Every feature name `extract` may return.
    fn feature_names(&self) -> Vec<String>;
}

/// Precomputed per-bigram features, usually loaded from CSV with a `bigram`
/// column followed by one numeric column per feature.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    names: Vec<String>,
    rows: HashMap<Bigram, FeatureMap>,
}

impl FeatureTable {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            rows: HashMap::new(),
        }
    }

    /// Add or replace a row. `values` must follow the table's column order.
    pub fn insert(&mut self, bigram: Bigram, values: &[f64]) -> Result<(), FeatureError> {
        if values.len() != self.names.len() {
            return Err(FeatureError::Table(format!(
                "bigram '{bigram}' has {} values, expected {}",
                values.len(),
                self.names.len()
            )));
        }
        let map = self
            .names
            .iter()
            .cloned()
            .zip(values.iter().copied())
            .collect();
        self.rows.insert(bigram, map);
        Ok(())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FeatureError> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let headers = reader.headers()?.clone();
        if headers.get(0).map(str::trim) != Some("bigram") {
            return Err(FeatureError::Table(
                "first column of a feature table must be 'bigram'".to_string(),
            ));
        }
        let names: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();
        let mut table = FeatureTable::new(names);

        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let bigram: Bigram = record.get(0).unwrap_or_default().trim().parse()?;
            let mut values = Vec::with_capacity(table.names.len());
            for (idx, raw) in record.iter().skip(1).enumerate() {
                let value: f64 = raw.trim().parse().map_err(|_| {
                    FeatureError::Table(format!(
                        "row {} column '{}': '{raw}' is not a number",
                        line + 2,
                        table.names[idx]
                    ))
                })?;
                values.push(value);
            }
            table.insert(bigram, &values)?;
        }
        Ok(table)
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), FeatureError> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        let mut header = vec!["bigram".to_string()];
        header.extend(self.names.iter().cloned());
        writer.write_record(&header)?;

        let mut bigrams: Vec<&Bigram> = self.rows.keys().collect();
        bigrams.sort();
        for bigram in bigrams {
            let row = &self.rows[bigram];
            let mut record = vec![bigram.to_string()];
            record.extend(
                self.names
                    .iter()
                    .map(|n| row.get(n).copied().unwrap_or(0.0).to_string()),
            );
            writer.write_record(&record)?;
        }
        writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FeatureProvider for FeatureTable {
    fn extract(&self, bigram: Bigram) -> Result<FeatureMap, FeatureError> {
        self.rows
            .get(&bigram)
            .cloned()
            .ok_or(FeatureError::UnknownBigram(bigram))
    }

    fn feature_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

// ---------------------------------------------------------------------
//  Interactions
// ---------------------------------------------------------------------

/// Product of two or more base features. Components are kept sorted so the
/// name does not depend on configuration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub components: Vec<String>,
    pub name: String,
}

impl Interaction {
    pub fn new<S: AsRef<str>>(components: &[S]) -> Self {
        let mut components: Vec<String> =
            components.iter().map(|c| c.as_ref().to_string()).collect();
        components.sort();
        components.dedup();
        let name = components.join(INTERACTION_SEPARATOR);
        Self { components, name }
    }

    /// Product of the components. A missing component makes the whole term 0.
    pub fn value(&self, features: &FeatureMap) -> f64 {
        let mut product = 1.0;
        for component in &self.components {
            match features.get(component) {
                Some(v) => product *= v,
                None => {
                    warn!(
                        interaction = %self.name,
                        component = %component,
                        "interaction component missing; using 0.0"
                    );
                    return 0.0;
                }
            }
        }
        product
    }

    pub fn involves(&self, feature: &str) -> bool {
        self.components.iter().any(|c| c == feature)
    }
}

/// Insert every interaction's value into `features`.
pub fn add_interactions(features: &mut FeatureMap, interactions: &[Interaction]) {
    for interaction in interactions {
        let value = interaction.value(features);
        features.insert(interaction.name.clone(), value);
    }
}

/// Feature names a dataset carries, by role.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureLayout {
    pub base: Vec<String>,
    pub interactions: Vec<Interaction>,
    pub control: Vec<String>,
}

impl FeatureLayout {
    /// Base features followed by interaction names.
    pub fn main_names(&self) -> Vec<String> {
        let mut names = self.base.clone();
        names.extend(self.interactions.iter().map(|i| i.name.clone()));
        names
    }

    pub fn names(&self, include_control: bool) -> Vec<String> {
        let mut names = self.main_names();
        if include_control {
            names.extend(self.control.iter().cloned());
        }
        names
    }

    pub fn contains(&self, feature: &str) -> bool {
        feature == TYPING_TIME
            || self.base.iter().any(|n| n == feature)
            || self.control.iter().any(|n| n == feature)
            || self.interactions.iter().any(|i| i.name == feature)
    }

    pub fn interaction(&self, name: &str) -> Option<&Interaction> {
        self.interactions.iter().find(|i| i.name == name)
    }
}
