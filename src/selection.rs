//! Round-robin feature selection tournament.
//!
//! Each round scores every remaining candidate, plays all pairwise
//! majority-vote comparisons, and appends the winner if it clears enough of
//! the raw-metric thresholds. Selection stops at the first round whose winner
//! does not.

use serde::Serialize;
use tracing::{info, warn};

use crate::dataset::PreferenceDataset;
use crate::error::ModelError;
use crate::importance::{FeatureImportanceCalculator, FeatureMetrics};
use crate::model::PreferenceModel;
use crate::report::MetricsReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionRound {
    pub round: usize,
    pub candidates: Vec<FeatureMetrics>,
    /// Pairwise wins, parallel to `candidates`.
    pub wins: Vec<usize>,
    pub winner: String,
    pub thresholds_passed: usize,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionResult {
    /// Controls followed by selected main features, in selection order.
    pub selected_features: Vec<String>,
    pub main_features: Vec<String>,
    pub control_features: Vec<String>,
    pub rounds: Vec<SelectionRound>,
    /// Set when no candidate passed and the strongest raw effect was taken.
    pub forced: Option<String>,
}

impl SelectionResult {
    pub fn report(&self) -> MetricsReport {
        MetricsReport::from_selection(self)
    }
}

/// Index of the round winner: most wins, then largest normalized metric
/// sum, then earliest candidate.
pub fn tournament_winner(metrics: &[FeatureMetrics]) -> Option<(usize, Vec<usize>)> {
    if metrics.is_empty() {
        return None;
    }
    let mut wins = vec![0usize; metrics.len()];
    for i in 0..metrics.len() {
        for j in (i + 1)..metrics.len() {
            if metrics[i].is_better(&metrics[j]) {
                wins[i] += 1;
            } else if metrics[j].is_better(&metrics[i]) {
                wins[j] += 1;
            }
        }
    }
    let mut best = 0;
    for idx in 1..metrics.len() {
        let more_wins = wins[idx] > wins[best];
        let tie_better =
            wins[idx] == wins[best] && metrics[idx].score_sum() > metrics[best].score_sum();
        if more_wins || tie_better {
            best = idx;
        }
    }
    Some((best, wins))
}

impl PreferenceModel {
    /// Grow the main feature set one tournament round at a time, then fit
    /// the model on controls plus the selected features.
    ///
    /// Candidates that are configured controls are ignored; controls are
    /// always part of the final fit.
    pub fn select_features(
        &mut self,
        dataset: &PreferenceDataset,
        candidates: &[String],
    ) -> Result<SelectionResult, ModelError> {
        let layout = dataset.layout();
        if let Some(unknown) = candidates.iter().find(|c| !layout.contains(c)) {
            return Err(ModelError::value(format!(
                "candidate '{unknown}' is not part of the dataset"
            )));
        }
        let mut pool: Vec<String> = Vec::new();
        for c in candidates {
            if !self.config().is_control(c) && !pool.contains(c) {
                pool.push(c.clone());
            }
        }
        let controls = self.config().features.control_features.clone();
        let thresholds = self.config().selection.thresholds.clone();
        let min_passed = self.config().selection.min_metrics_passed;

        let mut calculator = FeatureImportanceCalculator::new(self.config().selection.clone());
        let mut selected: Vec<String> = Vec::new();
        let mut rounds: Vec<SelectionRound> = Vec::new();

        loop {
            let remaining: Vec<&String> = pool.iter().filter(|c| !selected.contains(c)).collect();
            if remaining.is_empty() {
                break;
            }
            let round = rounds.len() + 1;
            let model: &PreferenceModel = self;
            let mut scored: Vec<FeatureMetrics> = remaining
                .iter()
                .map(|c| calculator.evaluate_feature(c, dataset, model, &selected))
                .collect();
            calculator.normalize(&mut scored);

            let Some((best, wins)) = tournament_winner(&scored) else {
                break;
            };
            let winner = scored[best].feature.clone();
            let passed = scored[best].thresholds_passed(&thresholds);
            let accepted = scored[best].evaluated && passed >= min_passed;
            info!(round, %winner, wins = wins[best], passed, accepted, "selection round");
            rounds.push(SelectionRound {
                round,
                candidates: scored,
                wins,
                winner: winner.clone(),
                thresholds_passed: passed,
                accepted,
            });
            if !accepted {
                break;
            }
            selected.push(winner);
        }

        let mut forced = None;
        if selected.is_empty() {
            let strongest = rounds.last().and_then(|r| {
                r.candidates
                    .iter()
                    .filter(|m| m.evaluated)
                    .fold(None::<&FeatureMetrics>, |best, m| match best {
                        Some(b) if b.raw_model_effect >= m.raw_model_effect => Some(b),
                        _ => Some(m),
                    })
            });
            if let Some(m) = strongest {
                warn!(feature = %m.feature, "no candidate passed; keeping strongest effect");
                forced = Some(m.feature.clone());
                selected.push(m.feature.clone());
            }
        }

        let mut final_features = controls.clone();
        final_features.extend(selected.iter().cloned());
        self.fit(dataset, &final_features)?;
        info!(selected = ?selected, "feature selection finished");

        Ok(SelectionResult {
            selected_features: final_features,
            main_features: selected,
            control_features: controls,
            rounds,
            forced,
        })
    }
}
