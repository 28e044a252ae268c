//! Scoring helpers shared by evaluation, cross-validation and importance.

use statrs::statistics::Statistics;

/// Numerically stable logistic function.
pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Mean and population standard deviation; (0, 0) for an empty slice.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().mean();
    let std = if values.len() > 1 {
        values.iter().population_std_dev()
    } else {
        0.0
    };
    (mean, std)
}

/// Fraction of predictions on the right side of 0.5.
pub fn accuracy(labels: &[bool], probabilities: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0.5;
    }
    let correct = labels
        .iter()
        .zip(probabilities)
        .filter(|&(&label, &p)| (p > 0.5) == label)
        .count();
    correct as f64 / labels.len() as f64
}

/// Area under the ROC curve via the Mann-Whitney rank statistic, with tied
/// scores sharing their average rank. 0.5 when only one class is present.
pub fn auc(labels: &[bool], scores: &[f64]) -> f64 {
    let n_pos = labels.iter().filter(|&&l| l).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i + 1;
        while j < order.len() && scores[order[j]] == scores[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; ties share the average of positions i+1..=j.
        let avg = (i + 1 + j) as f64 / 2.0;
        for &idx in &order[i..j] {
            ranks[idx] = avg;
        }
        i = j;
    }

    let rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|&(&l, _)| l)
        .map(|(_, r)| r)
        .sum();
    let u = rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    u / (n_pos * n_neg) as f64
}

/// `1 − clip(MAD / mean|effect|, 0, 1)`, where MAD is the mean absolute
/// deviation from the mean effect. 0 for no effects or an all-zero effect.
pub fn effect_consistency(effects: &[f64]) -> f64 {
    if effects.is_empty() {
        return 0.0;
    }
    let n = effects.len() as f64;
    let mean_abs = effects.iter().map(|e| e.abs()).sum::<f64>() / n;
    if mean_abs <= 0.0 || !mean_abs.is_finite() {
        return 0.0;
    }
    let mean = effects.iter().sum::<f64>() / n;
    let mad = effects.iter().map(|e| (e - mean).abs()).sum::<f64>() / n;
    1.0 - (mad / mean_abs).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logistic_is_symmetric_and_stable() {
        assert_eq!(logistic(0.0), 0.5);
        assert!((logistic(2.0) + logistic(-2.0) - 1.0).abs() < 1e-15);
        assert!(logistic(-800.0) >= 0.0);
        assert!(logistic(800.0) <= 1.0);
    }

    #[test]
    fn auc_handles_perfect_random_and_ties() {
        let labels = [true, true, false, false];
        assert_eq!(auc(&labels, &[0.9, 0.8, 0.2, 0.1]), 1.0);
        assert_eq!(auc(&labels, &[0.1, 0.2, 0.8, 0.9]), 0.0);
        assert_eq!(auc(&labels, &[0.5, 0.5, 0.5, 0.5]), 0.5);
        // One tie across classes counts half.
        assert!((auc(&labels, &[0.9, 0.5, 0.5, 0.1]) - 0.875).abs() < 1e-12);
        assert_eq!(auc(&[true, true], &[0.2, 0.9]), 0.5);
    }

    #[test]
    fn accuracy_uses_half_threshold() {
        let labels = [true, false, true, false];
        assert_eq!(accuracy(&labels, &[0.7, 0.3, 0.5, 0.5]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.5);
    }

    #[test]
    fn consistency_rewards_stable_effects() {
        assert_eq!(effect_consistency(&[1.0, 1.0, 1.0]), 1.0);
        assert_eq!(effect_consistency(&[0.0, 0.0]), 0.0);
        assert_eq!(effect_consistency(&[]), 0.0);
        // mean 0, MAD 1, mean|e| 1 -> fully inconsistent.
        assert_eq!(effect_consistency(&[1.0, -1.0]), 0.0);
        let c = effect_consistency(&[0.9, 1.1]);
        assert!((c - 0.9).abs() < 1e-12);
    }

    #[test]
    fn mean_std_population() {
        let (m, s) = mean_std(&[1.0, 3.0]);
        assert_eq!(m, 2.0);
        assert!((s - 1.0).abs() < 1e-12);
        assert_eq!(mean_std(&[]), (0.0, 0.0));
        assert_eq!(mean_std(&[4.0]), (4.0, 0.0));
    }
}
