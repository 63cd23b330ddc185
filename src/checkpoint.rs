//! Persisting and restoring training state.
//!
//! A checkpoint holds everything needed to resume training where it
//! stopped: the model parameters (whose Adam moment estimates travel with
//! them), the optimizer settings, the best score so far and the epoch it
//! was reached in.
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use failure;
use serde_json;
use wyrm::optim::Adam;

use models::{Model, StepModelParameters, Variant};

/// Optimizer settings and progress.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Adam learning rate.
    pub learning_rate: f32,
    /// L2 penalty.
    pub l2_penalty: f32,
    /// Optimizer steps taken so far.
    pub num_steps: usize,
}

impl OptimizerState {
    /// Rebuild the optimizer.
    pub fn optimizer(&self) -> Adam {
        Adam::new()
            .learning_rate(self.learning_rate)
            .l2_penalty(self.l2_penalty)
    }
}

/// Reasons a stored checkpoint cannot be resumed.
#[derive(Debug, Fail)]
pub enum CheckpointError {
    /// The checkpoint was trained on a different catalog.
    #[fail(
        display = "Checkpoint covers {} items but the dataset has {}.",
        stored, expected
    )]
    IncompatibleCatalog {
        /// Catalog size of the dataset.
        expected: usize,
        /// Catalog size of the checkpoint.
        stored: usize,
    },
    /// The checkpoint has a different hidden size.
    #[fail(
        display = "Checkpoint has hidden size {} but {} was requested.",
        stored, expected
    )]
    IncompatibleHiddenSize {
        /// Requested hidden size.
        expected: usize,
        /// Hidden size of the checkpoint.
        stored: usize,
    },
    /// The checkpoint holds another model variant.
    #[fail(
        display = "Checkpoint holds a {} model but {} was requested.",
        stored, expected
    )]
    IncompatibleVariant {
        /// Requested variant.
        expected: Variant,
        /// Variant of the checkpoint.
        stored: Variant,
    },
}

/// A resumable snapshot of training.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Hidden size of the model.
    pub hidden_size: usize,
    /// Name of the dataset trained on.
    pub dataset_name: String,
    /// Best top-`K` nDCG reached so far.
    pub best_score: f64,
    /// Epoch in which `best_score` was reached.
    pub epoch: usize,
    /// Optimizer settings and progress.
    pub optimizer_state: OptimizerState,
    /// Model parameters.
    pub model_state: Model,
}

impl Checkpoint {
    /// Write the checkpoint as JSON, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), failure::Error> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;

        Ok(())
    }

    /// Read a checkpoint. A missing file yields `Ok(None)`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Checkpoint>, failure::Error> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(File::open(path)?);

        Ok(Some(serde_json::from_reader(reader)?))
    }

    /// Check that training on a catalog of `num_items` with the given
    /// variant and hidden size can resume from this checkpoint.
    pub fn check_compatible(
        &self,
        num_items: usize,
        variant: Variant,
        hidden_size: usize,
    ) -> Result<(), CheckpointError> {
        if self.model_state.num_items() != num_items {
            return Err(CheckpointError::IncompatibleCatalog {
                expected: num_items,
                stored: self.model_state.num_items(),
            });
        }

        if self.hidden_size != hidden_size {
            return Err(CheckpointError::IncompatibleHiddenSize {
                expected: hidden_size,
                stored: self.hidden_size,
            });
        }

        if self.model_state.variant() != variant {
            return Err(CheckpointError::IncompatibleVariant {
                expected: variant,
                stored: self.model_state.variant(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, XorShiftRng};
    use tempfile::TempDir;

    use super::*;
    use data::{Event, SequenceStore};
    use models::Hyperparameters;

    fn trained_checkpoint() -> Checkpoint {
        let raw: Vec<Vec<Event>> = (0..6)
            .map(|entity| {
                (0..5)
                    .map(|step| Event::new(1 + (entity + step) % 9, 1 + step, 1 + step, step))
                    .collect()
            })
            .collect();
        let store = SequenceStore::build(&raw, 0.8, None);

        let model = Hyperparameters::new(store.num_items(), 4)
            .variant(Variant::Sitar)
            .learning_rate(0.01)
            .build();
        let optimizer = model.optimizer();
        let summary = model
            .fit_epoch(&store, &optimizer, 3, &mut XorShiftRng::from_seed([2; 16]))
            .unwrap();

        Checkpoint {
            hidden_size: 4,
            dataset_name: "synthetic".to_owned(),
            best_score: 0.25,
            epoch: 3,
            optimizer_state: OptimizerState {
                learning_rate: 0.01,
                l2_penalty: 0.0,
                num_steps: summary.num_updates,
            },
            model_state: model,
        }
    }

    #[test]
    fn save_then_load_is_lossless() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("SITAR_synthetic_4.mdl");

        let checkpoint = trained_checkpoint();
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap().unwrap();

        assert_eq!(
            serde_json::to_string(&checkpoint).unwrap(),
            serde_json::to_string(&loaded).unwrap()
        );
        assert_eq!(loaded.epoch, 3);
        assert_eq!(loaded.optimizer_state, checkpoint.optimizer_state);
        assert_eq!(loaded.model_state.num_parameters(), checkpoint.model_state.num_parameters());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();

        assert!(Checkpoint::load(dir.path().join("absent.mdl")).unwrap().is_none());
    }

    #[test]
    fn incompatible_checkpoints_are_rejected() {
        let checkpoint = trained_checkpoint();
        let num_items = checkpoint.model_state.num_items();

        assert!(checkpoint.check_compatible(num_items, Variant::Sitar, 4).is_ok());
        assert!(checkpoint.check_compatible(num_items + 1, Variant::Sitar, 4).is_err());
        assert!(checkpoint.check_compatible(num_items, Variant::Sitar, 8).is_err());
        assert!(checkpoint.check_compatible(num_items, Variant::Star, 4).is_err());
    }
}
