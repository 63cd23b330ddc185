//! The epoch loop: train, evaluate, checkpoint on improvement.
//!
//! [`run`](fn.run.html) reads a dataset, resumes from a checkpoint when
//! one exists, and alternates training passes with evaluation passes until
//! the epoch ceiling is reached. Every evaluation is appended as one JSON
//! line to a results file; the model is checkpointed whenever top-`K`
//! nDCG beats the best value seen so far.
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use failure;
use rand::{Rng, SeedableRng, XorShiftRng};
use serde_json;

use checkpoint::{Checkpoint, OptimizerState};
use data::{read_events, SequenceStore};
use evaluation::{evaluate, EvaluationReport, EvaluationSettings, RankLogTable};
use models::{Hyperparameters, Variant};

/// Longest accepted train window.
pub const MAX_SEQUENCE_LENGTH: i64 = 200;

/// Invalid configuration values.
#[derive(Debug, Fail)]
pub enum ConfigError {
    /// No dataset path was given.
    #[fail(display = "No dataset given.")]
    MissingDataset,
    /// The model variant is not known.
    #[fail(display = "Unknown model variant {:?}: choose from STAR, SITAR.", _0)]
    UnknownVariant(String),
    /// The epoch policy is not known.
    #[fail(
        display = "Unknown epoch policy {:?}: choose from always-advance, retry-until-improved.",
        _0
    )]
    UnknownEpochPolicy(String),
    /// The train window exceeds the supported maximum.
    #[fail(display = "Sequence length {} exceeds the maximum of 200.", _0)]
    SequenceLengthTooLong(i64),
    /// The train window is neither `-1` nor positive.
    #[fail(display = "Sequence length must be -1 or positive, got {}.", _0)]
    InvalidSequenceLength(i64),
    /// The split ratio is outside `(0, 1]`.
    #[fail(display = "Split ratio must lie in (0, 1], got {}.", _0)]
    InvalidSplitRatio(f64),
    /// A size that must be positive is zero.
    #[fail(display = "{} must be positive.", _0)]
    NotPositive(&'static str),
}

/// What happens to the epoch counter after an epoch that did not
/// improve the best score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpochPolicy {
    /// Every pass advances the counter.
    AlwaysAdvance,
    /// Only improving passes advance the counter; others are retried.
    RetryUntilImproved,
}

impl FromStr for EpochPolicy {
    type Err = ConfigError;
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "always-advance" => Ok(EpochPolicy::AlwaysAdvance),
            "retry-until-improved" => Ok(EpochPolicy::RetryUntilImproved),
            other => Err(ConfigError::UnknownEpochPolicy(other.to_owned())),
        }
    }
}

impl fmt::Display for EpochPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            EpochPolicy::AlwaysAdvance => write!(f, "always-advance"),
            EpochPolicy::RetryUntilImproved => write!(f, "retry-until-improved"),
        }
    }
}

/// Training run configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON-lines file with one event list per entity.
    pub dataset: PathBuf,
    /// Step function to train.
    pub variant: Variant,
    /// Checkpoint to resume from and write to. Derived from the run
    /// parameters when absent.
    pub checkpoint_path: Option<PathBuf>,
    /// Seeds parameter initialisation, batch order and negative sampling.
    pub seed: u64,
    /// Fraction of each sequence used for training; `1.0` holds out the
    /// last event only.
    pub split_ratio: f64,
    /// Evaluate the stored model once instead of training.
    pub evaluate_only: bool,
    /// Train window; `-1` keeps whole train segments.
    pub sequence_length: i64,
    /// Hidden state and embedding size.
    pub hidden_dim: usize,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// L2 penalty.
    pub l2_penalty: f32,
    /// Entities per training batch.
    pub batch_size: usize,
    /// Cutoff of the top-`K` metrics.
    pub top_k: usize,
    /// Negatives ranked against each true item.
    pub num_negatives: usize,
    /// The loop runs while the epoch counter is at most this.
    pub max_epoch: usize,
    /// Epoch counter policy.
    pub epoch_policy: EpochPolicy,
    /// Stop after this many training passes even if the epoch ceiling
    /// has not been reached.
    pub max_passes: Option<usize>,
    /// Directory of derived checkpoint paths.
    pub model_dir: PathBuf,
    /// Directory of per-run results files.
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dataset: PathBuf::new(),
            variant: Variant::Star,
            checkpoint_path: None,
            seed: 42,
            split_ratio: 0.8,
            evaluate_only: false,
            sequence_length: -1,
            hidden_dim: 40,
            learning_rate: 0.001,
            l2_penalty: 0.0,
            batch_size: 64,
            top_k: 10,
            num_negatives: 100,
            max_epoch: 100,
            epoch_policy: EpochPolicy::AlwaysAdvance,
            max_passes: None,
            model_dir: PathBuf::from("./output/model/"),
            output_dir: PathBuf::from("./output/results/"),
        }
    }
}

impl Config {
    /// Default configuration for `dataset`.
    pub fn new<P: Into<PathBuf>>(dataset: P) -> Self {
        Config {
            dataset: dataset.into(),
            ..Config::default()
        }
    }

    /// Set the model variant by name.
    pub fn variant_name(mut self, name: &str) -> Result<Self, ConfigError> {
        self.variant = name
            .parse()
            .map_err(|_| ConfigError::UnknownVariant(name.to_owned()))?;
        Ok(self)
    }

    /// Set the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the train window; `-1` disables it.
    pub fn sequence_length(mut self, sequence_length: i64) -> Self {
        self.sequence_length = sequence_length;
        self
    }

    /// Set the split ratio.
    pub fn split_ratio(mut self, split_ratio: f64) -> Self {
        self.split_ratio = split_ratio;
        self
    }

    /// Set the epoch ceiling.
    pub fn max_epoch(mut self, max_epoch: usize) -> Self {
        self.max_epoch = max_epoch;
        self
    }

    /// Set the directories for checkpoints and results.
    pub fn directories<P: Into<PathBuf>, Q: Into<PathBuf>>(mut self, model_dir: P, output_dir: Q) -> Self {
        self.model_dir = model_dir.into();
        self.output_dir = output_dir.into();
        self
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.as_os_str().is_empty() {
            return Err(ConfigError::MissingDataset);
        }

        if self.sequence_length > MAX_SEQUENCE_LENGTH {
            return Err(ConfigError::SequenceLengthTooLong(self.sequence_length));
        }

        if self.sequence_length == 0 || self.sequence_length < -1 {
            return Err(ConfigError::InvalidSequenceLength(self.sequence_length));
        }

        if !(self.split_ratio > 0.0 && self.split_ratio <= 1.0) {
            return Err(ConfigError::InvalidSplitRatio(self.split_ratio));
        }

        for &(name, value) in &[
            ("batch_size", self.batch_size),
            ("hidden_dim", self.hidden_dim),
            ("top_k", self.top_k),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }

        Ok(())
    }

    /// The train window, if any.
    pub fn train_window(&self) -> Option<usize> {
        if self.sequence_length > 0 {
            Some(self.sequence_length as usize)
        } else {
            None
        }
    }

    fn run_name(&self, dataset_name: &str) -> String {
        format!("{}_{}_{}", self.variant, dataset_name, self.hidden_dim)
    }

    /// Where the checkpoint is read from and written to.
    pub fn checkpoint_file(&self, dataset_name: &str) -> PathBuf {
        match self.checkpoint_path {
            Some(ref path) => path.clone(),
            None => self
                .model_dir
                .join(format!("{}.mdl", self.run_name(dataset_name))),
        }
    }

    /// Where per-epoch evaluation results are appended.
    pub fn results_file(&self, dataset_name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.txt", self.run_name(dataset_name)))
    }

    fn evaluation_settings(&self) -> EvaluationSettings {
        EvaluationSettings {
            top_k: self.top_k,
            num_negatives: self.num_negatives,
        }
    }
}

/// Short name of a dataset, used in file names and checkpoints.
pub fn dataset_name<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();
    let lowered = path.to_string_lossy().to_lowercase();

    if lowered.contains("movielens") || lowered.contains("ml-1m") {
        "movielens".to_owned()
    } else if lowered.contains("books") {
        "Books".to_owned()
    } else if lowered.contains("beauty") {
        "Beauty".to_owned()
    } else {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_owned())
    }
}

/// Format a duration as `HH:MM:SS.ss`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let fraction = elapsed.subsec_nanos() as f64 / 1e9;

    format!(
        "{:02}:{:02}:{:05.2}",
        seconds / 3600,
        (seconds % 3600) / 60,
        (seconds % 60) as f64 + fraction
    )
}

fn seed_bytes(seed: u64) -> [u8; 16] {
    let mut bytes = [0; 16];
    for idx in 0..8 {
        bytes[idx] = (seed >> (8 * idx)) as u8;
        bytes[idx + 8] = (!seed >> (8 * idx)) as u8;
    }
    bytes
}

#[derive(Serialize)]
struct EpochRecord<'a> {
    epoch: usize,
    loss: f32,
    report: &'a EvaluationReport,
}

/// Outcome of a run.
#[derive(Clone, Debug)]
pub struct TrainingSummary {
    /// First epoch number trained or evaluated in this run.
    pub first_epoch: usize,
    /// Best top-`K` nDCG, including any restored from a checkpoint.
    pub best_score: f64,
    /// Epoch in which `best_score` was reached.
    pub best_epoch: usize,
    /// Training passes run.
    pub num_passes: usize,
    /// The last evaluation.
    pub last_report: Option<EvaluationReport>,
    /// Wall-clock time of the run.
    pub elapsed: Duration,
}

/// Run training (or a single evaluation) as configured.
pub fn run(config: &Config) -> Result<TrainingSummary, failure::Error> {
    let start = Instant::now();
    config.validate()?;

    let name = dataset_name(&config.dataset);
    let raw = read_events(&config.dataset)?;
    let store = SequenceStore::build(&raw, config.split_ratio, config.train_window());

    info!(
        "Loaded {} of {} entities from {:?} ({} items)",
        store.len(),
        raw.len(),
        config.dataset,
        store.num_items()
    );
    if store.num_skipped() > 0 {
        info!(
            "{} entities are shorter than the train window of {}",
            store.num_skipped(),
            config.sequence_length
        );
    }

    let table = RankLogTable::new(store.num_items());
    let settings = config.evaluation_settings();
    let mut rng = XorShiftRng::from_seed(seed_bytes(config.seed));
    let checkpoint_path = config.checkpoint_file(&name);

    let mut state = match Checkpoint::load(&checkpoint_path)? {
        Some(checkpoint) => {
            checkpoint.check_compatible(store.num_items(), config.variant, config.hidden_dim)?;
            info!(
                "Resuming from {:?}: epoch {}, best nDCG@{} {:.4}",
                checkpoint_path, checkpoint.epoch, config.top_k, checkpoint.best_score
            );
            checkpoint
        }
        None => {
            info!("No checkpoint at {:?}, starting from scratch", checkpoint_path);
            let model = Hyperparameters::new(store.num_items(), config.hidden_dim)
                .variant(config.variant)
                .learning_rate(config.learning_rate)
                .l2_penalty(config.l2_penalty)
                .from_seed(rng.gen())
                .build();

            Checkpoint {
                hidden_size: config.hidden_dim,
                dataset_name: name.clone(),
                best_score: 0.0,
                epoch: 0,
                optimizer_state: OptimizerState {
                    learning_rate: config.learning_rate,
                    l2_penalty: config.l2_penalty,
                    num_steps: 0,
                },
                model_state: model,
            }
        }
    };

    let first_epoch = state.epoch + 1;
    let mut summary = TrainingSummary {
        first_epoch: first_epoch,
        best_score: state.best_score,
        best_epoch: state.epoch,
        num_passes: 0,
        last_report: None,
        elapsed: Duration::from_secs(0),
    };

    if config.evaluate_only {
        let report = evaluate(&state.model_state, &store, &table, &settings, &mut rng)?;
        info!("Evaluation: {}", report);
        summary.last_report = Some(report);
        summary.elapsed = start.elapsed();
        info!("Done in {}", format_elapsed(summary.elapsed));
        return Ok(summary);
    }

    let results_path = config.results_file(&name);
    if let Some(parent) = results_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut results = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&results_path)?;

    let optimizer = state.optimizer_state.optimizer();
    let mut epoch = first_epoch;

    while epoch <= config.max_epoch {
        let pass = state
            .model_state
            .fit_epoch(&store, &optimizer, config.batch_size, &mut rng)?;
        state.optimizer_state.num_steps += pass.num_updates;
        summary.num_passes += 1;
        info!("Epoch {}: loss {:.4} over {} batches", epoch, pass.loss, pass.num_updates);

        let report = evaluate(&state.model_state, &store, &table, &settings, &mut rng)?;
        info!("Epoch {}: {}", epoch, report);

        writeln!(
            results,
            "{}",
            serde_json::to_string(&EpochRecord {
                epoch: epoch,
                loss: pass.loss,
                report: &report,
            })?
        )?;

        let improved = report.ndcg_at_k > state.best_score;
        if improved {
            state.best_score = report.ndcg_at_k;
            state.epoch = epoch;
            state.save(&checkpoint_path)?;
            info!(
                "nDCG@{} improved to {:.4}, saved {:?}",
                config.top_k, state.best_score, checkpoint_path
            );

            summary.best_score = state.best_score;
            summary.best_epoch = epoch;
        }

        summary.last_report = Some(report);

        if improved || config.epoch_policy == EpochPolicy::AlwaysAdvance {
            epoch += 1;
        }

        if config.max_passes.map_or(false, |cap| summary.num_passes >= cap) {
            info!("Stopping at epoch {} after {} passes", epoch, summary.num_passes);
            break;
        }
    }

    summary.elapsed = start.elapsed();
    info!(
        "Best nDCG@{} {:.4} at epoch {}; done in {}",
        config.top_k,
        summary.best_score,
        summary.best_epoch,
        format_elapsed(summary.elapsed)
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn validation() {
        let config = Config::new("data.txt");
        assert!(config.validate().is_ok());
        assert!(config.clone().sequence_length(200).validate().is_ok());
        assert!(config.clone().split_ratio(1.0).validate().is_ok());

        assert!(Config::default().validate().is_err());
        assert!(config.clone().sequence_length(201).validate().is_err());
        assert!(config.clone().sequence_length(0).validate().is_err());
        assert!(config.clone().sequence_length(-2).validate().is_err());
        assert!(config.clone().split_ratio(0.0).validate().is_err());
        assert!(config.clone().split_ratio(1.5).validate().is_err());
        assert!(config.clone().variant_name("GRU4Rec").is_err());

        let mut config = config;
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn train_window_from_sequence_length() {
        assert_eq!(Config::new("x").train_window(), None);
        assert_eq!(Config::new("x").sequence_length(50).train_window(), Some(50));
    }

    #[test]
    fn dataset_names() {
        assert_eq!(dataset_name("data/ml-1m/ratings.json"), "movielens");
        assert_eq!(dataset_name("data/MovieLens.json"), "movielens");
        assert_eq!(dataset_name("/tmp/amazon_books.json"), "Books");
        assert_eq!(dataset_name("/tmp/Beauty.txt"), "Beauty");
        assert_eq!(dataset_name("/tmp/steam.jsonl"), "steam");
    }

    #[test]
    fn file_names() {
        let config = Config::new("/tmp/Beauty.txt")
            .variant_name("SITAR")
            .unwrap()
            .directories("/models", "/results");

        assert_eq!(
            config.checkpoint_file("Beauty"),
            PathBuf::from("/models/SITAR_Beauty_40.mdl")
        );
        assert_eq!(
            config.results_file("Beauty"),
            PathBuf::from("/results/SITAR_Beauty_40.txt")
        );
    }

    #[test]
    fn epoch_policy_names() {
        for policy in &[EpochPolicy::AlwaysAdvance, EpochPolicy::RetryUntilImproved] {
            assert_eq!(&policy.to_string().parse::<EpochPolicy>().unwrap(), policy);
        }
        assert!("forever".parse::<EpochPolicy>().is_err());
    }

    #[test]
    fn elapsed_format() {
        assert_eq!(format_elapsed(Duration::from_millis(3_723_450)), "01:02:03.45");
        assert_eq!(format_elapsed(Duration::from_millis(500)), "00:00:00.50");
    }

    fn write_dataset(dir: &Path) -> PathBuf {
        let path = dir.join("synthetic.jsonl");
        let mut file = fs::File::create(&path).unwrap();

        for entity in 0..10 {
            let events: Vec<[usize; 4]> = (0..8)
                .map(|step| [1 + (entity + step) % 11, 1 + step % 7, 1 + step, step % 3])
                .collect();
            writeln!(file, "{}", serde_json::to_string(&events).unwrap()).unwrap();
        }

        path
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::new(write_dataset(dir))
            .directories(dir.join("model"), dir.join("results"))
            .max_epoch(2);
        config.hidden_dim = 4;
        config.batch_size = 4;
        config.learning_rate = 0.01;
        // Every event ranks within the top K of this small catalog.
        config.top_k = 20;
        config.num_negatives = 5;
        config
    }

    #[test]
    fn run_trains_checkpoints_and_resumes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());

        let summary = run(&config).unwrap();
        assert_eq!(summary.first_epoch, 1);
        assert_eq!(summary.num_passes, 2);
        assert!(summary.best_score > 0.0);

        let results = fs::File::open(config.results_file("synthetic")).unwrap();
        assert_eq!(BufReader::new(results).lines().count(), 2);

        let checkpoint = Checkpoint::load(config.checkpoint_file("synthetic"))
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.epoch, summary.best_epoch);
        assert_eq!(checkpoint.dataset_name, "synthetic");

        let resumed = run(&config.clone().max_epoch(3)).unwrap();
        assert_eq!(resumed.first_epoch, checkpoint.epoch + 1);
        assert_eq!(resumed.num_passes, 3 - checkpoint.epoch);
        assert!(resumed.best_score >= summary.best_score);
    }

    #[test]
    fn evaluate_only_does_not_train() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.evaluate_only = true;

        let summary = run(&config).unwrap();
        assert_eq!(summary.num_passes, 0);
        assert!(summary.last_report.is_some());
        assert!(!config.results_file("synthetic").exists());
    }

    fn recorded_epochs(path: &Path) -> Vec<u64> {
        BufReader::new(fs::File::open(path).unwrap())
            .lines()
            .map(|line| {
                let record: serde_json::Value = serde_json::from_str(&line.unwrap()).unwrap();
                record["epoch"].as_u64().unwrap()
            })
            .collect()
    }

    #[test]
    fn only_improving_passes_checkpoint() {
        for (policy, expected) in vec![
            (EpochPolicy::RetryUntilImproved, vec![1u64, 2, 2, 2]),
            (EpochPolicy::AlwaysAdvance, vec![1u64, 2, 3]),
        ] {
            let dir = TempDir::new().unwrap();
            let mut config = test_config(dir.path()).max_epoch(3);
            // A frozen model scores the same every pass after the first.
            config.learning_rate = 0.0;
            config.epoch_policy = policy;
            config.max_passes = Some(4);

            let summary = run(&config).unwrap();
            assert_eq!(summary.num_passes, expected.len());
            assert_eq!(summary.best_epoch, 1);
            assert!(summary.best_score > 0.0);

            assert_eq!(recorded_epochs(&config.results_file("synthetic")), expected);

            let checkpoint = Checkpoint::load(config.checkpoint_file("synthetic"))
                .unwrap()
                .unwrap();
            assert_eq!(checkpoint.epoch, 1);
            assert_eq!(checkpoint.optimizer_state.num_steps, 3);
            assert!((checkpoint.best_score - summary.best_score).abs() < 1e-12);
        }
    }
}
