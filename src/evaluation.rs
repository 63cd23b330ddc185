//! Ranking evaluation of next-item predictions.
//!
//! Every scorable test event is ranked three ways: within the top `K`
//! of the whole catalog, by its position in the whole catalog, and
//! within the top `K` of a candidate set made of the true item plus
//! sampled negatives.
use std::collections::HashSet;
use std::fmt;

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use data::SequenceStore;
use models::sequence_model::Replay;
use models::StepModelParameters;
use {ItemId, PredictionError};

/// Evaluation knobs.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSettings {
    /// Cutoff of the top-`K` metrics.
    pub top_k: usize,
    /// Number of negatives ranked against each true item.
    pub num_negatives: usize,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        EvaluationSettings {
            top_k: 10,
            num_negatives: 100,
        }
    }
}

/// Evaluation failures.
#[derive(Debug, Fail)]
pub enum EvaluationError {
    /// No test event could be scored, so no average exists.
    #[fail(display = "No test events to evaluate on.")]
    NoTestEvents,
    /// The catalog is too small to draw the requested negatives.
    #[fail(
        display = "Cannot draw {} distinct negatives: only {} candidate items remain.",
        requested, available
    )]
    NegativeSamplingExhausted {
        /// Negatives requested.
        requested: usize,
        /// Items eligible as negatives.
        available: usize,
    },
    /// The model produced unusable scores.
    #[fail(display = "{}", _0)]
    Prediction(#[cause] PredictionError),
}

/// `log2(k)` for rank positions `k` in `1..=num_items + 1`.
#[derive(Clone, Debug)]
pub struct RankLogTable {
    logs: Vec<f64>,
}

impl RankLogTable {
    /// Build the table for a catalog of `num_items` ids.
    pub fn new(num_items: usize) -> Self {
        RankLogTable {
            logs: (0..num_items + 2).map(|k| (k as f64).log2()).collect(),
        }
    }

    /// `1 / log2(position + 1)` for a 1-based rank position.
    pub fn discount(&self, position: usize) -> f64 {
        let log = match self.logs.get(position + 1) {
            Some(&log) => log,
            None => ((position + 1) as f64).log2(),
        };

        1.0 / log
    }
}

/// Draws items uniformly from `[1, num_items)`.
#[derive(Clone, Debug)]
pub struct NegativeSampler {
    num_items: usize,
    range: Option<Uniform<ItemId>>,
}

impl NegativeSampler {
    /// Sampler over a catalog of `num_items` ids, padding included.
    pub fn new(num_items: usize) -> Self {
        NegativeSampler {
            num_items: num_items,
            range: if num_items > 1 {
                Some(Uniform::new(1, num_items))
            } else {
                None
            },
        }
    }

    fn available(&self, exclude: &HashSet<ItemId>) -> usize {
        let excluded = exclude
            .iter()
            .filter(|&&item| item >= 1 && item < self.num_items)
            .count();

        self.num_items.saturating_sub(1) - excluded
    }

    /// One item not in `exclude`, or `None` when every item is excluded.
    pub fn sample<R: Rng>(&self, exclude: &HashSet<ItemId>, rng: &mut R) -> Option<ItemId> {
        let range = match self.range {
            Some(ref range) => range,
            None => return None,
        };

        if self.available(exclude) == 0 {
            return None;
        }

        loop {
            let item = range.sample(rng);
            if !exclude.contains(&item) {
                return Some(item);
            }
        }
    }

    /// `count` distinct items, none of them in `exclude`.
    pub fn sample_distinct<R: Rng>(
        &self,
        count: usize,
        exclude: &HashSet<ItemId>,
        rng: &mut R,
    ) -> Result<Vec<ItemId>, EvaluationError> {
        let available = self.available(exclude);

        if count > available {
            return Err(EvaluationError::NegativeSamplingExhausted {
                requested: count,
                available: available,
            });
        }

        let mut drawn = exclude.clone();
        let mut negatives = Vec::with_capacity(count);

        while negatives.len() < count {
            if let Some(item) = self.sample(&drawn, rng) {
                drawn.insert(item);
                negatives.push(item);
            }
        }

        Ok(negatives)
    }
}

/// Normalise logits into log-probabilities.
///
/// Ranking on these keeps distinct logits distinct, where probabilities
/// far below the maximum would underflow to the same zero.
pub fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .fold(::std::f64::NEG_INFINITY, |max, &logit| max.max(logit as f64));
    let total: f64 = logits.iter().map(|&logit| (logit as f64 - max).exp()).sum();
    let normalizer = max + total.ln();

    logits.iter().map(|&logit| logit as f64 - normalizer).collect()
}

/// 1-based rank of `scores[target]` among `scores[first..]`.
///
/// Ties go to the lower index.
pub fn rank_position(scores: &[f64], target: usize, first: usize) -> usize {
    let target_score = scores[target];

    1 + scores
        .iter()
        .enumerate()
        .skip(first)
        .filter(|&(idx, &score)| score > target_score || (score == target_score && idx < target))
        .count()
}

/// Running sums of the ranking metrics.
#[derive(Clone, Debug, Default)]
pub struct RankingMetrics {
    hits: f64,
    ndcg: f64,
    ndcg_full: f64,
    negative_hits: f64,
    negative_ndcg: f64,
    num_events: usize,
}

impl RankingMetrics {
    /// Add one event ranked at `position` in the catalog and at
    /// `negative_position` among the sampled candidates.
    pub fn record(
        &mut self,
        position: usize,
        negative_position: usize,
        top_k: usize,
        table: &RankLogTable,
    ) {
        if position <= top_k {
            self.hits += 1.0;
            self.ndcg += table.discount(position);
        }

        self.ndcg_full += table.discount(position);

        if negative_position <= top_k {
            self.negative_hits += 1.0;
            self.negative_ndcg += table.discount(negative_position);
        }

        self.num_events += 1;
    }

    fn report(
        &self,
        num_items: usize,
        num_entities: usize,
        settings: &EvaluationSettings,
    ) -> Result<EvaluationReport, EvaluationError> {
        if self.num_events == 0 {
            return Err(EvaluationError::NoTestEvents);
        }

        let count = self.num_events as f64;

        Ok(EvaluationReport {
            top_k: settings.top_k,
            hit_at_k: self.hits / count,
            ndcg_at_k: self.ndcg / count,
            ndcg_full: self.ndcg_full / count,
            negative_hit_at_k: self.negative_hits / count,
            negative_ndcg_at_k: self.negative_ndcg / count,
            num_items: num_items,
            num_entities: num_entities,
            num_events: self.num_events,
        })
    }
}

/// Averaged ranking metrics of one evaluation pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Cutoff used by the top-`K` metrics.
    pub top_k: usize,
    /// Fraction of events whose item ranked in the catalog top `K`.
    pub hit_at_k: f64,
    /// nDCG within the catalog top `K`.
    pub ndcg_at_k: f64,
    /// nDCG over the whole catalog ranking.
    pub ndcg_full: f64,
    /// Fraction of events whose item ranked in the top `K` of its candidates.
    pub negative_hit_at_k: f64,
    /// nDCG within the top `K` of the candidates.
    pub negative_ndcg_at_k: f64,
    /// Catalog size, padding included.
    pub num_items: usize,
    /// Entities with at least one test event, scored or not.
    pub num_entities: usize,
    /// Scored events.
    pub num_events: usize,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "hit@{k}: {:.4}, nDCG@{k}: {:.4}, nDCG_full: {:.4}, \
             negative_hit@{k}: {:.4}, negative_nDCG@{k}: {:.4} \
             ({} items, {} entities, {} events)",
            self.hit_at_k,
            self.ndcg_at_k,
            self.ndcg_full,
            self.negative_hit_at_k,
            self.negative_ndcg_at_k,
            self.num_items,
            self.num_entities,
            self.num_events,
            k = self.top_k
        )
    }
}

/// Replay every entity of `store` through `model` and rank each
/// predictable test event.
pub fn evaluate<P: StepModelParameters, R: Rng>(
    model: &P,
    store: &SequenceStore,
    table: &RankLogTable,
    settings: &EvaluationSettings,
    rng: &mut R,
) -> Result<EvaluationReport, EvaluationError> {
    let sampler = NegativeSampler::new(store.num_items());
    let mut metrics = RankingMetrics::default();
    let mut num_entities = 0;

    for (_, entity) in store.iter() {
        if entity.test.is_empty() {
            continue;
        }

        num_entities += 1;
        let exclude: HashSet<ItemId> = entity.test.items().iter().cloned().collect();

        for prediction in Replay::new(model, entity) {
            let prediction = prediction.map_err(EvaluationError::Prediction)?;
            let scores = log_softmax(&prediction.logits);
            let target = prediction.target.item;

            let position = rank_position(&scores, target, 1);

            let negatives = sampler.sample_distinct(settings.num_negatives, &exclude, rng)?;
            let candidates: Vec<f64> = Some(scores[target])
                .into_iter()
                .chain(negatives.iter().map(|&item| scores[item]))
                .collect();
            let negative_position = rank_position(&candidates, 0, 0);

            metrics.record(position, negative_position, settings.top_k, table);
        }
    }

    metrics.report(store.num_items(), num_entities, settings)
}
