#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use bigram_comfort::synthetic::SyntheticStudy;
use bigram_comfort::{
    Config, EvaluationMetrics, FeatureProvider, FeatureTable, PreferenceDataset, PreferenceModel,
};

#[derive(Parser)]
#[command(name = "comfort", version, about = "Bigram comfort modelling CLI")]
struct Cli {
    /// trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic study (judgments, feature table, config)
    Simulate {
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 8)]
        participants: usize,
        #[arg(long, default_value_t = 40)]
        per_participant: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Select features on a training split, fit, and evaluate held-out participants
    Select {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        features: PathBuf,
        #[arg(long)]
        model_out: PathBuf,
        /// Per-round metrics CSV
        #[arg(long)]
        report: Option<PathBuf>,
        /// Markdown rendering of the same report
        #[arg(long)]
        report_md: Option<PathBuf>,
        #[arg(long, default_value_t = 0.2)]
        test_fraction: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Evaluate a saved model on a judgments file
    Evaluate {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        features: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Predict preferences for bigram pairs such as `th,qz`
    Predict {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        features: PathBuf,
        #[arg(long = "pair", required = true)]
        pairs: Vec<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Latent comfort scores for single bigrams
    Score {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        features: PathBuf,
        #[arg(long = "bigram", required = true)]
        bigrams: Vec<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Participant-grouped cross-validation with every configured feature
    CrossValidate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        features: PathBuf,
        #[arg(long, default_value_t = 5)]
        folds: usize,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Count intransitive preference cycles in a judgments file
    Transitivity {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        features: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct SelectSummary {
    selected_features: Vec<String>,
    forced: Option<String>,
    rounds: usize,
    train_participants: usize,
    test_participants: usize,
    train: EvaluationMetrics,
    test: EvaluationMetrics,
    feature_sparsity: f64,
    prediction_transitivity: f64,
}

#[derive(Serialize)]
struct PairPrediction {
    bigram1: String,
    bigram2: String,
    probability: f64,
    uncertainty: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level: Level = cli
        .log_level
        .parse()
        .map_err(|_| format!("unknown log level '{}'", cli.log_level))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Simulate {
            out_dir,
            participants,
            per_participant,
            seed,
        } => {
            let study = SyntheticStudy {
                n_participants: participants,
                preferences_per_participant: per_participant,
                seed,
                ..SyntheticStudy::default()
            };
            let paths = study.generate()?.write_to_dir(&out_dir)?;
            info!(dir = %out_dir.display(), "wrote synthetic study");
            println!("{}", paths.judgments.display());
            println!("{}", paths.features.display());
            println!("{}", paths.config.display());
        }
        Commands::Select {
            config,
            data,
            features,
            model_out,
            report,
            report_md,
            test_fraction,
            seed,
            out,
        } => {
            let config = Config::from_path(&config)?;
            let provider = load_provider(&features)?;
            let dataset = PreferenceDataset::load(&data, provider.as_ref(), &config.features)?;
            let (train, test) = dataset.split_by_participants(test_fraction, seed)?;

            let mut model = PreferenceModel::new(config, Arc::clone(&provider))?;
            let candidates = train.feature_names(false);
            let result = model.select_features(&train, &candidates)?;
            model.save(&model_out)?;

            let metrics_report = result.report();
            if let Some(path) = report {
                metrics_report.write_csv(&path)?;
            }
            if let Some(path) = report_md {
                std::fs::write(&path, metrics_report.render_markdown())?;
            }

            let summary = SelectSummary {
                selected_features: result.selected_features.clone(),
                forced: result.forced.clone(),
                rounds: result.rounds.len(),
                train_participants: train.participants().len(),
                test_participants: test.participants().len(),
                train: model.evaluate(&train)?,
                test: model.evaluate(&test)?,
                feature_sparsity: model.feature_sparsity()?,
                prediction_transitivity: model.prediction_transitivity(&test)?,
            };
            emit(&summary, out.as_deref())?;
        }
        Commands::Evaluate {
            model,
            data,
            features,
            out,
        } => {
            let provider = load_provider(&features)?;
            let model = PreferenceModel::load(&model, Arc::clone(&provider))?;
            let dataset =
                PreferenceDataset::load(&data, provider.as_ref(), &model.config().features)?;
            emit(&model.evaluate(&dataset)?, out.as_deref())?;
        }
        Commands::Predict {
            model,
            features,
            pairs,
            out,
        } => {
            let provider = load_provider(&features)?;
            let model = PreferenceModel::load(&model, provider)?;
            let mut predictions = Vec::with_capacity(pairs.len());
            for pair in &pairs {
                let (bigram1, bigram2) = pair
                    .split_once(',')
                    .ok_or_else(|| format!("--pair must look like 'ab,cd', got '{pair}'"))?;
                let prediction = model.predict_preference(bigram1.trim(), bigram2.trim())?;
                predictions.push(PairPrediction {
                    bigram1: bigram1.trim().to_string(),
                    bigram2: bigram2.trim().to_string(),
                    probability: prediction.probability,
                    uncertainty: prediction.uncertainty,
                });
            }
            emit(&predictions, out.as_deref())?;
        }
        Commands::Score {
            model,
            features,
            bigrams,
            out,
        } => {
            let provider = load_provider(&features)?;
            let model = PreferenceModel::load(&model, provider)?;
            let scores = bigrams
                .iter()
                .map(|b| model.comfort_score(b))
                .collect::<Result<Vec<_>, _>>()?;
            emit(&scores, out.as_deref())?;
        }
        Commands::CrossValidate {
            config,
            data,
            features,
            folds,
            out,
        } => {
            let config = Config::from_path(&config)?;
            let provider = load_provider(&features)?;
            let dataset = PreferenceDataset::load(&data, provider.as_ref(), &config.features)?;
            let model = PreferenceModel::new(config, provider)?;
            emit(&model.cross_validate(&dataset, folds)?, out.as_deref())?;
        }
        Commands::Transitivity {
            config,
            data,
            features,
            out,
        } => {
            let config = Config::from_path(&config)?;
            let provider = load_provider(&features)?;
            let dataset = PreferenceDataset::load(&data, provider.as_ref(), &config.features)?;
            emit(&dataset.check_transitivity(), out.as_deref())?;
        }
    }

    Ok(())
}

fn load_provider(path: &Path) -> Result<Arc<dyn FeatureProvider>, Box<dyn std::error::Error>> {
    let table = FeatureTable::from_path(path)?;
    info!(bigrams = table.len(), "loaded feature table");
    Ok(Arc::new(table))
}

fn emit<T: Serialize>(value: &T, out: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}
