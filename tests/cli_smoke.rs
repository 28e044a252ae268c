use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct Metrics {
    accuracy: f64,
    auc: f64,
    n_evaluated: usize,
}

#[derive(Debug, serde::Deserialize)]
struct SelectSummary {
    selected_features: Vec<String>,
    train_participants: usize,
    test_participants: usize,
    train: Metrics,
    test: Metrics,
}

#[derive(Debug, serde::Deserialize)]
struct PairPrediction {
    bigram1: String,
    bigram2: String,
    probability: f64,
}

#[derive(Debug, serde::Deserialize)]
struct Transitivity {
    triples_checked: usize,
    violation_rate: f64,
}

fn comfort(args: &[&str], paths: &[(&str, &Path)]) -> String {
    let mut command = Command::new(env!("CARGO_BIN_EXE_comfort"));
    command.args(args);
    for (flag, path) in paths {
        command.arg(flag).arg(path);
    }
    let output = command.output().unwrap();
    assert!(
        output.status.success(),
        "comfort {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn simulate_select_and_query() {
    let dir = tempdir().unwrap();
    let study = dir.path().join("study");
    let stdout = comfort(
        &["simulate", "--participants", "6", "--per-participant", "30"],
        &[("--out-dir", study.as_path())],
    );
    assert_eq!(stdout.lines().count(), 3);

    let config = study.join("config.json");
    let data = study.join("judgments.csv");
    let features = study.join("features.csv");
    let model = dir.path().join("model.json");
    let report = dir.path().join("report.csv");
    let summary_path = dir.path().join("summary.json");

    comfort(
        &["select", "--test-fraction", "0.34"],
        &[
            ("--config", config.as_path()),
            ("--data", data.as_path()),
            ("--features", features.as_path()),
            ("--model-out", model.as_path()),
            ("--report", report.as_path()),
            ("--out", summary_path.as_path()),
        ],
    );
    let summary: SelectSummary =
        serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(summary.train_participants, 4);
    assert_eq!(summary.test_participants, 2);
    assert!(summary.selected_features.contains(&"frequency".to_string()));
    assert!(summary.selected_features.contains(&"strong".to_string()));
    assert!(summary.train.n_evaluated > 0);
    assert!((0.0..=1.0).contains(&summary.test.accuracy));
    assert!((0.0..=1.0).contains(&summary.train.auc));

    let report_csv = std::fs::read_to_string(&report).unwrap();
    assert!(report_csv.starts_with("round,feature,category"));
    assert!(report_csv.lines().count() > 1);

    let stdout = comfort(
        &["predict", "--pair", "ab,cd", "--pair", "cd,ab"],
        &[("--model", model.as_path()), ("--features", features.as_path())],
    );
    let predictions: Vec<PairPrediction> = serde_json::from_str(&stdout).unwrap();
    assert_eq!(predictions.len(), 2);
    assert_eq!(predictions[0].bigram1, "ab");
    assert_eq!(predictions[1].bigram2, "ab");
    assert!((predictions[0].probability + predictions[1].probability - 1.0).abs() < 1e-9);

    let stdout = comfort(
        &["evaluate"],
        &[("--model", model.as_path()), ("--data", data.as_path()), ("--features", features.as_path())],
    );
    let metrics: Metrics = serde_json::from_str(&stdout).unwrap();
    assert_eq!(metrics.n_evaluated, 180);

    let stdout = comfort(
        &["transitivity"],
        &[("--config", config.as_path()), ("--data", data.as_path()), ("--features", features.as_path())],
    );
    let transitivity: Transitivity = serde_json::from_str(&stdout).unwrap();
    assert!(transitivity.triples_checked > 0 || transitivity.violation_rate == 0.0);
    assert!((0.0..=1.0).contains(&transitivity.violation_rate));
}

#[test]
fn predict_without_a_model_fails() {
    let dir = tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_comfort"))
        .args(["predict", "--pair", "ab,cd"])
        .arg("--model")
        .arg(dir.path().join("missing.json"))
        .arg("--features")
        .arg(dir.path().join("missing.csv"))
        .output()
        .unwrap();
    assert!(!output.status.success());
}
