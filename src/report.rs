//! Metrics report for feature selection runs.

use std::path::Path;

use serde::Serialize;

use crate::error::ModelError;
use crate::importance::FeatureCategory;
use crate::selection::SelectionResult;

/// One candidate evaluation in one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRow {
    pub round: usize,
    pub feature: String,
    pub category: FeatureCategory,
    pub model_effect: f64,
    pub effect_consistency: f64,
    pub predictive_power: f64,
    pub raw_model_effect: f64,
    pub raw_effect_consistency: f64,
    pub raw_predictive_power: f64,
    pub weight: f64,
    pub weight_std: f64,
    pub wins: usize,
    pub round_winner: bool,
    /// Part of the final feature set.
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub selected_features: Vec<String>,
    pub forced: Option<String>,
    pub rows: Vec<MetricsRow>,
}

impl MetricsReport {
    pub fn from_selection(result: &SelectionResult) -> Self {
        let mut rows = Vec::new();
        for round in &result.rounds {
            for (metrics, wins) in round.candidates.iter().zip(&round.wins) {
                rows.push(MetricsRow {
                    round: round.round,
                    feature: metrics.feature.clone(),
                    category: metrics.category,
                    model_effect: metrics.model_effect,
                    effect_consistency: metrics.effect_consistency,
                    predictive_power: metrics.predictive_power,
                    raw_model_effect: metrics.raw_model_effect,
                    raw_effect_consistency: metrics.raw_effect_consistency,
                    raw_predictive_power: metrics.raw_predictive_power,
                    weight: metrics.weight,
                    weight_std: metrics.weight_std,
                    wins: *wins,
                    round_winner: metrics.feature == round.winner,
                    selected: result.main_features.contains(&metrics.feature),
                });
            }
        }
        Self {
            selected_features: result.selected_features.clone(),
            forced: result.forced.clone(),
            rows,
        }
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Feature Selection Report\n\n");
        out.push_str(&format!(
            "- Selected features: {}\n",
            if self.selected_features.is_empty() {
                "(none)".to_string()
            } else {
                self.selected_features.join(", ")
            }
        ));
        if let Some(forced) = &self.forced {
            out.push_str(&format!("- Forced selection: `{forced}`\n"));
        }

        let mut current_round = 0;
        for row in &self.rows {
            if row.round != current_round {
                current_round = row.round;
                out.push_str(&format!("\n## Round {current_round}\n\n"));
                out.push_str("| feature | effect | consistency | power | weight | wins |\n");
                out.push_str("|---|---|---|---|---|---|\n");
            }
            let marker = if row.round_winner { " *" } else { "" };
            out.push_str(&format!(
                "| `{}`{} | {:.3} ({:.3}) | {:.3} ({:.3}) | {:.3} ({:.3}) | {:.3} ± {:.3} | {} |\n",
                row.feature,
                marker,
                row.model_effect,
                row.raw_model_effect,
                row.effect_consistency,
                row.raw_effect_consistency,
                row.predictive_power,
                row.raw_predictive_power,
                row.weight,
                row.weight_std,
                row.wins
            ));
        }
        out
    }
}
