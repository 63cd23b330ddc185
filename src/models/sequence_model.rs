//! Drives a step function across time: teacher-forced unrolling over
//! padded batches for training, and one-event-at-a-time replay of a
//! single entity for evaluation.
use rand::Rng;

use wyrm::optim::{Adam, Optimizer};
use wyrm::{Arr, BoxedNode, IndexInputNode, InputNode, Variable};

use super::{HiddenState, StepGraph, StepInputs, StepModelParameters, StepOutput};
use data::{Batch, Entity, Event, SequenceStore, PADDING};
use {FittingError, PredictionError};

/// Outcome of one training pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Batch losses summed over the pass.
    pub loss: f32,
    /// Number of optimizer steps taken.
    pub num_updates: usize,
}

struct Unrolled {
    loss: Option<Variable<BoxedNode>>,
    hidden: HiddenState,
}

/// Per-row `[rows, dim]` masks selecting the new state for real inputs
/// and the carried state for padding.
fn padding_masks(items: &[usize], dim: usize) -> (Arr, Arr) {
    let mut keep = Arr::zeros((items.len(), dim));
    let mut hold = Arr::zeros((items.len(), dim));

    for (row, &item) in items.iter().enumerate() {
        let mask = if item == PADDING { &mut hold } else { &mut keep };
        for col in 0..dim {
            mask[(row, col)] = 1.0;
        }
    }

    (keep, hold)
}

fn hold_padding(
    inputs: &StepInputs,
    previous: HiddenState,
    next: HiddenState,
    dim: usize,
) -> HiddenState {
    if inputs.items.iter().all(|&item| item != PADDING) {
        return next;
    }

    let (keep, hold) = padding_masks(inputs.items, dim);

    HiddenState::new(
        next.tensors()
            .iter()
            .zip(previous.tensors())
            .map(|(next, previous)| {
                (next.clone() * InputNode::new(keep.clone())
                    + previous.clone() * InputNode::new(hold.clone()))
                    .boxed()
            })
            .collect(),
    )
}

/// Row maxima of `logits`, both broadcast to `[rows, cols]` and as a
/// `[rows, 1]` column. Non-finite maxima are replaced by zero.
fn row_maxima(logits: &Arr) -> (Arr, Arr) {
    let (rows, cols) = logits.dim();
    let mut shift = Arr::zeros((rows, cols));
    let mut maxima = Arr::zeros((rows, 1));

    for row in 0..rows {
        let max = (0..cols).fold(::std::f32::NEG_INFINITY, |max, col| max.max(logits[(row, col)]));
        let max = if max.is_finite() { max } else { 0.0 };

        maxima[(row, 0)] = max;
        for col in 0..cols {
            shift[(row, col)] = max;
        }
    }

    (shift, maxima)
}

/// Softmax cross-entropy of `logits` against `targets`, averaged over the
/// rows where both the input and the target are real events.
fn transition_loss<G: StepGraph>(
    graph: &G,
    output: &StepOutput,
    inputs: &[usize],
    targets: &[usize],
    num_items: usize,
) -> Option<Variable<BoxedNode>> {
    let valid = |row: usize| inputs[row] != PADDING && targets[row] != PADDING;
    let count = (0..targets.len()).filter(|&row| valid(row)).count();

    if count == 0 {
        return None;
    }

    let mut weights = Arr::zeros((1, targets.len()));
    for row in (0..targets.len()).filter(|&row| valid(row)) {
        weights[(0, row)] = 1.0 / count as f32;
    }

    // Node values are computed on construction, so the maxima are current.
    let (shift, maxima) = row_maxima(&output.logits.value());

    let ones = InputNode::new(Arr::from_elem((num_items, 1), 1.0));
    let log_normalizer = (output.logits.clone() - InputNode::new(shift))
        .exp()
        .dot(&ones)
        .ln()
        + InputNode::new(maxima);
    let target_scores = graph.target_scores(output, &IndexInputNode::new(targets));

    Some(
        InputNode::new(weights)
            .dot(&(log_normalizer - target_scores))
            .boxed(),
    )
}

fn unroll<G: StepGraph>(graph: &G, batch: &Batch, num_items: usize, dim: usize) -> Unrolled {
    let mut hidden = graph.initial_state(batch.len());
    let mut loss: Option<Variable<BoxedNode>> = None;

    for t in 0..batch.width() {
        let inputs = batch.inputs(t);
        let output = graph.step(&inputs, Some(&hidden));

        if t + 1 < batch.width() {
            let targets = batch.items.column(t + 1);
            if let Some(step_loss) = transition_loss(graph, &output, inputs.items, targets, num_items) {
                loss = Some(match loss {
                    Some(total) => (total + step_loss).boxed(),
                    None => step_loss,
                });
            }
        }

        hidden = hold_padding(&inputs, hidden, output.hidden, dim);
    }

    Unrolled {
        loss: loss,
        hidden: hidden,
    }
}

/// Fit a single batch: unroll, backpropagate the summed loss and take one
/// optimizer step. Returns `None` when the batch holds no transition.
pub fn fit_batch<P: StepModelParameters>(
    parameters: &P,
    batch: &Batch,
    optimizer: &Adam,
) -> Result<Option<f32>, FittingError> {
    let graph = parameters.build();
    let unrolled = unroll(&graph, batch, parameters.num_items(), parameters.hidden_dim());

    let mut loss = match unrolled.loss {
        Some(loss) => loss,
        None => return Ok(None),
    };

    loss.forward();
    let loss_value = loss.value()[(0, 0)];

    if !loss_value.is_finite() {
        return Err(FittingError::InvalidLossValue);
    }

    loss.backward(1.0);
    optimizer.step(loss.parameters());

    Ok(Some(loss_value))
}

/// One pass over every entity of `store` in shuffled batches.
pub fn fit_epoch<P: StepModelParameters, R: Rng>(
    parameters: &P,
    store: &SequenceStore,
    optimizer: &Adam,
    batch_size: usize,
    rng: &mut R,
) -> Result<EpochSummary, FittingError> {
    if store.is_empty() {
        return Err(FittingError::NoInteractions);
    }

    let mut summary = EpochSummary::default();

    for entity_ids in store.minibatches(batch_size, rng) {
        let batch = store.assemble(&entity_ids);

        if let Some(loss) = fit_batch(parameters, &batch, optimizer)? {
            summary.loss += loss;
            summary.num_updates += 1;
        }
    }

    Ok(summary)
}

/// A model's scores for one held-out event, computed before the event
/// was fed to the model.
#[derive(Clone, Debug)]
pub struct Prediction {
    /// Logits over every item id, padding included.
    pub logits: Vec<f32>,
    /// The event that actually happened.
    pub target: Event,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplayState {
    Start,
    Warmup,
    Predict,
    Done,
}

/// Replays one entity through a model event by event.
///
/// The train segment warms up the hidden state. Each test event is then
/// yielded together with the logits the model produced before seeing it,
/// after which it is fed to the model. A test event with no prior input
/// has nothing to be scored against and is skipped.
pub struct Replay<'a, P: StepModelParameters + 'a> {
    graph: P::Graph,
    entity: &'a Entity,
    hidden: Option<Vec<Arr>>,
    logits: Option<Vec<f32>>,
    position: usize,
    state: ReplayState,
}

impl<'a, P: StepModelParameters + 'a> Replay<'a, P> {
    /// Start replaying `entity`.
    pub fn new(parameters: &P, entity: &'a Entity) -> Self {
        Replay {
            graph: parameters.build(),
            entity: entity,
            hidden: None,
            logits: None,
            position: 0,
            state: ReplayState::Start,
        }
    }

    /// Detached hidden state after the events consumed so far.
    pub fn hidden(&self) -> Option<&[Arr]> {
        self.hidden.as_ref().map(|hidden| hidden.as_slice())
    }

    fn advance(&mut self, event: Event) -> Result<(), PredictionError> {
        let (items, hours, weekdays, intervals) =
            ([event.item], [event.hour], [event.weekday], [event.interval]);
        let inputs = StepInputs {
            items: &items,
            hours: &hours,
            weekdays: &weekdays,
            intervals: &intervals,
        };

        let hidden = self.hidden.as_ref().map(|values| HiddenState::from_values(values));
        let output = self.graph.step(&inputs, hidden.as_ref());

        output.logits.forward();
        let logits: Vec<f32> = output.logits.value().iter().cloned().collect();

        if logits.iter().any(|logit| !logit.is_finite()) {
            return Err(PredictionError::InvalidPredictionValue);
        }

        self.hidden = Some(output.hidden.values());
        self.logits = Some(logits);

        Ok(())
    }
}

impl<'a, P: StepModelParameters + 'a> Iterator for Replay<'a, P> {
    type Item = Result<Prediction, PredictionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                ReplayState::Start => {
                    self.position = 0;
                    self.state = ReplayState::Warmup;
                }
                ReplayState::Warmup => {
                    if self.position < self.entity.train.len() {
                        let event = self.entity.train.event(self.position);
                        self.position += 1;

                        if let Err(error) = self.advance(event) {
                            self.state = ReplayState::Done;
                            return Some(Err(error));
                        }
                    } else {
                        self.position = 0;
                        self.state = ReplayState::Predict;
                    }
                }
                ReplayState::Predict => {
                    if self.position >= self.entity.test.len() {
                        self.state = ReplayState::Done;
                        continue;
                    }

                    let target = self.entity.test.event(self.position);
                    let logits = self.logits.take();
                    self.position += 1;

                    if self.position < self.entity.test.len() {
                        if let Err(error) = self.advance(target) {
                            self.state = ReplayState::Done;
                            return Some(Err(error));
                        }
                    }

                    if let Some(logits) = logits {
                        return Some(Ok(Prediction {
                            logits: logits,
                            target: target,
                        }));
                    }
                }
                ReplayState::Done => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, XorShiftRng};

    use super::*;
    use data::SequenceStore;
    use models::{Hyperparameters, Variant};

    fn synthetic(num_entities: usize, len: usize) -> Vec<Vec<Event>> {
        (0..num_entities)
            .map(|entity| {
                (0..len)
                    .map(|step| {
                        Event::new(
                            1 + (entity + step) % 12,
                            1 + (entity + step) % 7,
                            1 + step % 24,
                            (entity * step) % 5,
                        )
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn padding_does_not_disturb_state() {
        let mut raw = synthetic(2, 8);
        raw[1].truncate(3);
        let store = SequenceStore::build(&raw, 1.0, None);

        for &variant in &[Variant::Star, Variant::Sitar] {
            let model = Hyperparameters::new(store.num_items(), 6)
                .variant(variant)
                .build();
            let graph = model.build();

            // Row 1 carries five padding steps before its two train events.
            let batch = store.assemble(&[0, 1]);
            assert_eq!(batch.width(), 7);

            let unrolled = unroll(&graph, &batch, model.num_items(), model.hidden_dim());
            let batched = unrolled.hidden.values();

            let entity = store.get(1).unwrap();
            let mut replay = Replay::new(&model, entity);
            let predictions: Vec<_> = replay.by_ref().collect();
            assert_eq!(predictions.len(), 1);

            let replayed = replay.hidden().unwrap().to_owned();

            for (batched, replayed) in batched.iter().zip(replayed.iter()) {
                for col in 0..6 {
                    assert!((batched[(1, col)] - replayed[(0, col)]).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn training_reduces_loss() {
        let raw = synthetic(30, 10);
        let store = SequenceStore::build(&raw, 0.8, None);
        let mut rng = XorShiftRng::from_seed([5; 16]);

        for &variant in &[Variant::Star, Variant::Sitar] {
            let model = Hyperparameters::new(store.num_items(), 8)
                .variant(variant)
                .learning_rate(0.05)
                .build();
            let optimizer = model.optimizer();

            let first = fit_epoch(&model, &store, &optimizer, 8, &mut rng).unwrap();
            let mut last = first;
            for _ in 0..10 {
                last = fit_epoch(&model, &store, &optimizer, 8, &mut rng).unwrap();
            }

            assert_eq!(first.num_updates, 4);
            assert!(first.loss.is_finite());
            assert!(last.loss < first.loss);
        }
    }

    #[test]
    fn short_batches_are_skipped() {
        let raw = vec![vec![Event::new(1, 1, 1, 0)], vec![Event::new(2, 1, 1, 0)]];
        let store = SequenceStore::build(&raw, 0.5, None);
        let model = Hyperparameters::new(store.num_items(), 4).build();

        let optimizer = model.optimizer();
        let mut rng = XorShiftRng::from_seed([1; 16]);

        let summary = fit_epoch(&model, &store, &optimizer, 2, &mut rng).unwrap();
        assert_eq!(summary.num_updates, 0);

        let empty = SequenceStore::build(&[], 0.8, None);
        assert!(fit_epoch(&model, &empty, &optimizer, 2, &mut rng).is_err());
    }

    #[test]
    fn replay_scores_every_predictable_test_event() {
        let raw = vec![
            synthetic(1, 10).remove(0),
            // Nothing to warm up on: the first test event cannot be scored.
            vec![Event::new(3, 1, 1, 0), Event::new(4, 2, 2, 1)],
        ];
        let store = SequenceStore::build(&raw, 0.6, None);
        let model = Hyperparameters::new(store.num_items(), 4).variant(Variant::Sitar).build();

        let first: Vec<_> = Replay::new(&model, store.get(0).unwrap())
            .map(|prediction| prediction.unwrap())
            .collect();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|prediction| prediction.logits.len() == store.num_items()));
        assert_eq!(first[0].target, store.get(0).unwrap().test.event(0));

        // 0.6 * 2 = 1.2, so one train event and one test event.
        let second: Vec<_> = Replay::new(&model, store.get(1).unwrap()).collect();
        assert_eq!(second.len(), 1);

        let empty_train = vec![vec![Event::new(3, 1, 1, 0)]];
        let store = SequenceStore::build(&empty_train, 0.5, None);
        let model = Hyperparameters::new(store.num_items(), 4).build();
        assert_eq!(Replay::new(&model, store.get(0).unwrap()).count(), 0);
    }

    fn logits_after<P: StepModelParameters>(parameters: &P, events: &[Event]) -> Vec<f32> {
        let graph = parameters.build();
        let mut hidden: Option<Vec<Arr>> = None;
        let mut logits = Vec::new();

        for event in events {
            let (items, hours, weekdays, intervals) =
                ([event.item], [event.hour], [event.weekday], [event.interval]);
            let inputs = StepInputs {
                items: &items,
                hours: &hours,
                weekdays: &weekdays,
                intervals: &intervals,
            };

            let state = hidden.as_ref().map(|values| HiddenState::from_values(values));
            let output = graph.step(&inputs, state.as_ref());
            logits = output.logits.value().iter().cloned().collect();
            hidden = Some(output.hidden.values());
        }

        logits
    }

    #[test]
    fn replay_scores_before_feeding_the_event() {
        let raw = synthetic(1, 10);
        let store = SequenceStore::build(&raw, 0.6, None);
        let entity = store.get(0).unwrap();

        for &variant in &[Variant::Star, Variant::Sitar] {
            let model = Hyperparameters::new(store.num_items(), 4).variant(variant).build();
            let predictions: Vec<_> = Replay::new(&model, entity)
                .map(|prediction| prediction.unwrap())
                .collect();
            assert_eq!(predictions.len(), entity.test.len());

            let mut seen: Vec<Event> = (0..entity.train.len())
                .map(|idx| entity.train.event(idx))
                .collect();

            for (idx, prediction) in predictions.iter().enumerate() {
                let before = logits_after(&model, &seen);
                assert!(prediction
                    .logits
                    .iter()
                    .zip(before.iter())
                    .all(|(x, y)| (x - y).abs() < 1e-6));

                seen.push(entity.test.event(idx));

                let after = logits_after(&model, &seen);
                assert!(prediction
                    .logits
                    .iter()
                    .zip(after.iter())
                    .any(|(x, y)| (x - y).abs() > 1e-6));
            }
        }
    }
}
