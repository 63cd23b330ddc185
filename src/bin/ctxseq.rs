//! Train and evaluate context-aware next-item recommenders.
//!
//! ```bash
//! ctxseq --dataset data/Beauty.txt --model SITAR --split 0.8 --sequence-length 50
//! ```
extern crate clap;
extern crate ctxseq;
extern crate failure;
#[macro_use]
extern crate tracing;
extern crate tracing_subscriber;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ctxseq::training::{run, Config, EpochPolicy};

/// Train a context-aware recurrent recommender and report ranking metrics.
#[derive(Parser, Debug)]
#[command(name = "ctxseq", version, about, long_about = None)]
struct Cli {
    /// JSON-lines file with one event list per entity
    #[arg(long)]
    dataset: PathBuf,

    /// Model variant: STAR or SITAR
    #[arg(long, default_value = "STAR")]
    model: String,

    /// Checkpoint to resume from and save to
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Fraction of each sequence used for training; 1 holds out the last event
    #[arg(long, default_value = "0.8")]
    split: f64,

    /// Evaluate the stored model without training
    #[arg(long)]
    evaluate_only: bool,

    /// Train window; -1 keeps whole train segments
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    sequence_length: i64,

    /// Entities per training batch
    #[arg(long, default_value = "64")]
    batch_size: usize,

    /// Hidden state size
    #[arg(long, default_value = "40")]
    hidden_size: usize,

    /// Adam learning rate
    #[arg(long, default_value = "0.001")]
    learning_rate: f32,

    /// Last epoch to train
    #[arg(long, default_value = "100")]
    max_epoch: usize,

    /// always-advance or retry-until-improved
    #[arg(long, default_value = "always-advance")]
    epoch_policy: String,

    /// Stop after this many training passes
    #[arg(long)]
    max_passes: Option<usize>,

    /// Directory of derived checkpoint paths
    #[arg(long, default_value = "./output/model/")]
    model_dir: PathBuf,

    /// Directory of results files
    #[arg(long, default_value = "./output/results/")]
    output_dir: PathBuf,
}

impl Cli {
    fn config(self) -> Result<Config, failure::Error> {
        let mut config = Config::new(self.dataset)
            .variant_name(&self.model)?
            .seed(self.seed)
            .split_ratio(self.split)
            .sequence_length(self.sequence_length)
            .max_epoch(self.max_epoch)
            .directories(self.model_dir, self.output_dir);

        config.checkpoint_path = self.model_path;
        config.evaluate_only = self.evaluate_only;
        config.batch_size = self.batch_size;
        config.hidden_dim = self.hidden_size;
        config.learning_rate = self.learning_rate;
        config.epoch_policy = self.epoch_policy.parse::<EpochPolicy>()?;
        config.max_passes = self.max_passes;

        config.validate()?;

        Ok(config)
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ctxseq=info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = match Cli::parse().config() {
        Ok(config) => config,
        Err(error) => {
            error!("Invalid configuration: {}", error);
            process::exit(1);
        }
    };

    info!("{:?}", config);

    if let Err(error) = run(&config) {
        error!("{}", error);
        for cause in error.iter_causes() {
            error!("caused by: {}", cause);
        }
        process::exit(1);
    }
}
