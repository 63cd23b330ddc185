#![deny(missing_docs)]
//! # ctxseq
//!
//! `ctxseq` trains and evaluates recurrent next-item recommenders whose
//! inputs are time-stamped interaction sequences annotated with context:
//! the hour of day, the weekday, and the interval since the previous event.
//!
//! Given a user's past interactions, the model scores every item in the
//! catalog as the possible next interaction. Models are evaluated by
//! replaying each user's history one event at a time and measuring
//! hit rate and nDCG of the true next item, both over the full catalog
//! and over a sampled set of negatives.
//!
//! ## Example
//! Fit a small model on synthetic sequences and evaluate it:
//!
//! ```rust
//! # extern crate ctxseq;
//! # extern crate rand;
//! # use rand::SeedableRng;
//! use ctxseq::data::{Event, SequenceStore};
//! use ctxseq::evaluation::{evaluate, EvaluationSettings, RankLogTable};
//! use ctxseq::models::{Hyperparameters, Variant};
//!
//! let raw: Vec<Vec<Event>> = (0..20)
//!     .map(|user| {
//!         (0..8)
//!             .map(|step| Event::new(1 + (user * 7 + step) % 150, 1 + step % 7, 1 + step % 24, step % 4))
//!             .collect()
//!     })
//!     .collect();
//!
//! let store = SequenceStore::build(&raw, 0.8, None);
//! let mut rng = rand::XorShiftRng::from_seed([42; 16]);
//!
//! let model = Hyperparameters::new(store.num_items(), 8)
//!     .variant(Variant::Star)
//!     .learning_rate(0.01)
//!     .from_seed([7; 16])
//!     .build();
//!
//! let optimizer = model.optimizer();
//! let summary = model
//!     .fit_epoch(&store, &optimizer, 4, &mut rng)
//!     .unwrap();
//!
//! let table = RankLogTable::new(store.num_items());
//! let report = evaluate(&model, &store, &table, &EvaluationSettings::default(), &mut rng).unwrap();
//!
//! println!("Loss {} and nDCG@10 {}", summary.loss, report.ndcg_at_k);
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;
#[macro_use]
extern crate tracing;

extern crate rand;
extern crate serde;
extern crate serde_json;

extern crate wyrm;

#[cfg(test)]
extern crate tempfile;

pub mod checkpoint;
pub mod data;
pub mod evaluation;
pub mod models;
pub mod training;

/// Alias for entity (user or session) indices.
pub type EntityId = usize;
/// Alias for item indices. `0` is reserved for padding.
pub type ItemId = usize;

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
}

/// Fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// No interactions were given.
    #[fail(display = "No interactions were supplied.")]
    NoInteractions,
    /// The loss diverged.
    #[fail(display = "Invalid loss value: non-finite or not a number.")]
    InvalidLossValue,
}
