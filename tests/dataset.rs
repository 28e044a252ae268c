use std::path::Path;

use bigram_comfort::config::FeatureSettings;
use bigram_comfort::{FeatureTable, ModelError, PreferenceDataset};
use tempfile::tempdir;

const HEADER: &str = "bigram1,bigram2,user_id,chosen_bigram,bigram1_time,bigram2_time,\
chosen_bigram_correct,unchosen_bigram_correct,abs_sliderValue";

fn write_features(dir: &Path) -> FeatureTable {
    let path = dir.join("features.csv");
    std::fs::write(
        &path,
        "bigram,roll,same_finger,freq\n\
         ab,1.0,0.0,0.3\n\
         cd,0.0,1.0,0.1\n\
         ef,0.5,0.0,0.2\n\
         gh,0.2,1.0,0.4\n",
    )
    .unwrap();
    FeatureTable::from_path(&path).unwrap()
}

fn settings() -> FeatureSettings {
    FeatureSettings {
        base_features: Vec::new(),
        control_features: vec!["freq".to_string()],
        interactions: vec![vec!["same_finger".to_string(), "roll".to_string()]],
    }
}

#[test]
fn loads_valid_rows_and_skips_the_rest() {
    let dir = tempdir().unwrap();
    let table = write_features(dir.path());
    let data = dir.path().join("judgments.csv");
    std::fs::write(
        &data,
        format!(
            "{HEADER}\n\
             ab,cd,p1,ab,120,140,1,1,-40\n\
             cd,ef,p1,ef,,150,1,1,10\n\
             aa,cd,p1,aa,100,100,1,1,5\n\
             ab,zz,p2,ab,100,100,1,1,5\n\
             ab,gh,p2,xy,100,100,1,1,5\n\
             gh,ef,,gh,100,100,1,1,5\n\
             ef,gh,p2,gh,130,125,1,1,not-a-number\n\
             gh,ab,p2,gh,130,125,1,1,75\n"
        ),
    )
    .unwrap();

    let dataset = PreferenceDataset::load(&data, &table, &settings()).unwrap();
    assert_eq!(dataset.len(), 3);
    assert_eq!(
        dataset.participants().iter().cloned().collect::<Vec<_>>(),
        vec!["p1".to_string(), "p2".to_string()]
    );

    let first = &dataset.preferences()[0];
    assert!(first.preferred);
    assert_eq!(first.confidence, 40.0);
    assert_eq!(first.typing_time1, Some(120.0));
    assert_eq!(first.features1["roll"], 1.0);
    assert_eq!(first.features2["same_finger"], 1.0);

    let second = &dataset.preferences()[1];
    assert!(!second.preferred);
    assert_eq!(second.typing_time1, None);
    assert_eq!(second.feature_pair("typing_time"), None);

    // Base features come from the table minus controls, then interactions.
    let layout = dataset.layout();
    assert_eq!(layout.base, vec!["roll".to_string(), "same_finger".to_string()]);
    assert_eq!(
        dataset.feature_names(false),
        vec![
            "roll".to_string(),
            "same_finger".to_string(),
            "roll_x_same_finger".to_string()
        ]
    );
    assert_eq!(dataset.feature_names(true).last().unwrap(), "freq");

    let last = &dataset.preferences()[2];
    assert_eq!(last.features1["roll_x_same_finger"], 0.2);
    assert_eq!(last.features2["roll_x_same_finger"], 0.0);
}

#[test]
fn missing_columns_fail_the_load() {
    let dir = tempdir().unwrap();
    let table = write_features(dir.path());
    let data = dir.path().join("judgments.csv");
    std::fs::write(&data, "bigram1,bigram2,user_id\nab,cd,p1\n").unwrap();

    let err = PreferenceDataset::load(&data, &table, &settings()).unwrap_err();
    match err {
        ModelError::DataFormat(message) => {
            assert!(message.contains("chosen_bigram"), "{message}");
            assert!(message.contains("abs_sliderValue"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn file_without_usable_rows_is_an_error() {
    let dir = tempdir().unwrap();
    let table = write_features(dir.path());
    let data = dir.path().join("judgments.csv");
    std::fs::write(&data, format!("{HEADER}\naa,bb,p1,aa,1,1,1,1,1\n")).unwrap();

    let err = PreferenceDataset::load(&data, &table, &settings()).unwrap_err();
    assert!(matches!(err, ModelError::DataFormat(_)));
    assert!(!err.is_retryable());
}

#[test]
fn participant_splits_never_share_participants() {
    let data = bigram_comfort::synthetic::SyntheticStudy {
        n_participants: 10,
        preferences_per_participant: 6,
        ..Default::default()
    }
    .generate()
    .unwrap();
    let dataset = data.dataset().unwrap();

    let (train, test) = dataset.split_by_participants(0.3, 11).unwrap();
    assert_eq!(test.participants().len(), 3);
    assert_eq!(train.participants().len(), 7);
    assert!(train.participants().is_disjoint(test.participants()));
    assert_eq!(train.len() + test.len(), dataset.len());

    let again = dataset.split_by_participants(0.3, 11).unwrap();
    assert_eq!(again.1.participants(), test.participants());

    assert!(dataset.split_by_participants(0.0, 1).is_err());
    assert!(dataset.split_by_participants(1.0, 1).is_err());

    let folds = dataset.cv_splits(4, 42).unwrap();
    assert_eq!(folds.len(), 4);
    let mut covered: Vec<usize> = folds.iter().flat_map(|f| f.test.clone()).collect();
    covered.sort_unstable();
    assert_eq!(covered, (0..dataset.len()).collect::<Vec<_>>());
    for fold in &folds {
        let test = dataset.subset(&fold.test).unwrap();
        let train = dataset.subset(&fold.train).unwrap();
        assert!(train.participants().is_disjoint(test.participants()));
    }
}

#[test]
fn subset_rejects_empty_or_out_of_range_indices() {
    let data = bigram_comfort::synthetic::SyntheticStudy {
        n_participants: 2,
        preferences_per_participant: 5,
        ..Default::default()
    }
    .generate()
    .unwrap();
    let dataset = data.dataset().unwrap();

    assert!(matches!(dataset.subset(&[]), Err(ModelError::Value(_))));
    assert!(matches!(
        dataset.subset(&[0, dataset.len()]),
        Err(ModelError::Value(_))
    ));
    assert_eq!(dataset.subset(&[1, 3]).unwrap().len(), 2);
}
