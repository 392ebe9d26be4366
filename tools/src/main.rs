mod corpus;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use libslu_core::{CombineMethod, Config, DaiClassifier, ParseInput, TrainOpts, Utterance};

#[derive(Parser)]
#[command(name = "slu", about = "Train and run dialogue-act item classifiers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model from a JSON-lines corpus.
    Train {
        #[arg(long)]
        corpus: PathBuf,

        #[arg(long, default_value = "model.slu.gz")]
        model: PathBuf,

        /// Optional TOML configuration.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        min_feature_count: Option<usize>,

        #[arg(long)]
        min_dai_count: Option<usize>,

        #[arg(long)]
        sparsification: Option<f64>,

        /// Skip the feature-space reduction before saving.
        #[arg(long)]
        no_reduce: bool,
    },

    /// Parse an utterance with a trained model.
    Parse {
        #[arg(long)]
        model: PathBuf,

        /// Probability combination method: new, max, add, arit, harm.
        #[arg(long, default_value = "max")]
        combine: String,

        utterance: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Args::parse().command {
        Command::Train {
            corpus,
            model,
            config,
            min_feature_count,
            min_dai_count,
            sparsification,
            no_reduce,
        } => {
            let config = match config {
                Some(path) => Config::load_toml(&path)
                    .map_err(|err| anyhow::anyhow!("load config {}: {err}", path.display()))?,
                None => Config::default(),
            };
            let data = corpus::load(&corpus)?;

            let mut clser = DaiClassifier::new(&config, None);
            clser.extract_features(data).context("extract features")?;
            clser
                .prune_features(
                    min_feature_count.or(Some(config.min_feature_count)),
                    Some(config.min_conc_feature_count),
                )
                .context("prune features")?;
            clser.prune_classifiers(
                min_dai_count.unwrap_or(config.min_dai_count),
                None,
                None,
                None::<fn(&libslu_core::DialogueActItem, usize) -> bool>,
            );
            let report = clser
                .train(&TrainOpts {
                    sparsification: sparsification.unwrap_or(config.sparsification),
                    balance: config.balance,
                    calibrate: config.calibrate,
                    ..Default::default()
                })
                .context("train")?;

            for (dai, reason) in &report.skipped {
                println!("skipped {dai}: {reason:?}");
            }
            clser
                .save_model(&model, !no_reduce, None)
                .context("save model")?;
            println!(
                "Trained {} classifiers over {} features, wrote {}",
                report.fitted.len(),
                clser.n_features(),
                model.display()
            );
        }

        Command::Parse {
            model,
            combine,
            utterance,
        } => {
            let combine: CombineMethod = combine
                .parse()
                .map_err(|err: String| anyhow::anyhow!(err))?;
            let mut clser = DaiClassifier::new(&Config::default(), None);
            clser.load_model(&model).context("load model")?;

            let utterance: Utterance = utterance.parse().expect("infallible");
            let confnet = clser
                .parse_1_best(
                    ParseInput {
                        utterance: Some(&utterance),
                        ..Default::default()
                    },
                    combine,
                )
                .context("parse")?;
            print!("{confnet}");
        }
    }
    Ok(())
}
