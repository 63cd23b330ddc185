//! Models module.
//!
//! A model is a recurrent step function over four aligned input channels
//! (item, hour, weekday, interval). Parameters live in shared
//! [`HogwildParameter`](wyrm::HogwildParameter)s; every training batch and every
//! evaluation step builds a fresh computation graph over them.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::distributions::{Distribution, Normal};
use rand::{Rng, SeedableRng, XorShiftRng};

use wyrm;
use wyrm::optim::Adam;
use wyrm::{Arr, BoxedNode, HogwildParameter, IndexInputNode, InputNode, ParameterNode, Variable};

use data::{SequenceStore, HOUR_SIZE, INTERVAL_SIZE, WEEKDAY_SIZE};
use {FittingError, ItemId};

pub mod sequence_model;
pub mod sitar;
pub mod star;

pub use self::sequence_model::EpochSummary;

fn embedding_init<T: Rng>(rows: usize, cols: usize, rng: &mut T) -> wyrm::Arr {
    let normal = Normal::new(0.0, 1.0 / cols as f64);
    Arr::zeros((rows, cols)).map(|_| normal.sample(rng) as f32)
}

fn dense_init<T: Rng>(rows: usize, cols: usize, rng: &mut T) -> wyrm::Arr {
    let normal = Normal::new(0.0, (2.0 / (rows + cols) as f64).sqrt());
    Arr::zeros((rows, cols)).map(|_| normal.sample(rng) as f32)
}

fn shared(value: Arr) -> Arc<HogwildParameter> {
    Arc::new(HogwildParameter::new(value))
}

/// Which step-function implementation to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variant {
    /// Single-state cell over the sum of all four context embeddings.
    #[serde(rename = "STAR")]
    Star,
    /// Two-state cell whose slow memory is gated by the inter-event interval.
    #[serde(rename = "SITAR")]
    Sitar,
}

/// Returned when a variant name is not recognised.
#[derive(Debug, Fail)]
#[fail(display = "Unknown model variant {:?}: choose from STAR, SITAR.", _0)]
pub struct UnknownVariant(pub String);

impl FromStr for Variant {
    type Err = UnknownVariant;
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "STAR" => Ok(Variant::Star),
            "SITAR" => Ok(Variant::Sitar),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Variant::Star => write!(f, "STAR"),
            Variant::Sitar => write!(f, "SITAR"),
        }
    }
}

/// Hyperparameters shared by all model variants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    num_items: usize,
    hidden_dim: usize,
    learning_rate: f32,
    l2_penalty: f32,
    variant: Variant,
    seed: [u8; 16],
}

impl Hyperparameters {
    /// Build new hyperparameters for a catalog of `num_items` ids
    /// (including the padding id `0`).
    pub fn new(num_items: usize, hidden_dim: usize) -> Self {
        Hyperparameters {
            num_items: num_items,
            hidden_dim: hidden_dim,
            learning_rate: 0.001,
            l2_penalty: 0.0,
            variant: Variant::Star,
            seed: [42; 16],
        }
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the L2 penalty.
    pub fn l2_penalty(mut self, l2_penalty: f32) -> Self {
        self.l2_penalty = l2_penalty;
        self
    }

    /// Set the model variant.
    pub fn variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    /// Set the seed used to initialise the parameters.
    pub fn from_seed(mut self, seed: [u8; 16]) -> Self {
        self.seed = seed;
        self
    }

    /// Number of item ids, padding included.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Dimensionality of the hidden state and all embeddings.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// The optimizer that trains models built from these hyperparameters.
    pub fn optimizer(&self) -> Adam {
        Adam::new()
            .learning_rate(self.learning_rate)
            .l2_penalty(self.l2_penalty)
    }

    fn rng(&self) -> XorShiftRng {
        XorShiftRng::from_seed(self.seed)
    }

    /// Build the model variant these hyperparameters describe.
    pub fn build(self) -> Model {
        match self.variant {
            Variant::Star => Model::Star(star::Parameters::new(self)),
            Variant::Sitar => Model::Sitar(sitar::Parameters::new(self)),
        }
    }
}

/// One time step of input: column `t` of every channel, one entry per row.
#[derive(Clone, Copy, Debug)]
pub struct StepInputs<'a> {
    /// Item ids.
    pub items: &'a [ItemId],
    /// Hours of day, `1..=24`.
    pub hours: &'a [usize],
    /// Weekdays, `1..=7`.
    pub weekdays: &'a [usize],
    /// Shifted intervals, `1..=32`.
    pub intervals: &'a [usize],
}

impl<'a> StepInputs<'a> {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The recurrent state threaded through successive steps. Holds one
/// `[rows, hidden_dim]` tensor per state component of the cell.
#[derive(Clone)]
pub struct HiddenState {
    tensors: Vec<Variable<BoxedNode>>,
}

impl HiddenState {
    /// Wrap graph nodes as a hidden state.
    pub fn new(tensors: Vec<Variable<BoxedNode>>) -> Self {
        HiddenState { tensors: tensors }
    }

    /// The "no prior state" value: `components` all-zero tensors.
    pub fn zeros(components: usize, rows: usize, dim: usize) -> Self {
        Self::new(
            (0..components)
                .map(|_| InputNode::new(Arr::zeros((rows, dim))).boxed())
                .collect(),
        )
    }

    /// Re-enter previously computed state values into a new graph.
    pub fn from_values(values: &[Arr]) -> Self {
        Self::new(
            values
                .iter()
                .map(|value| InputNode::new(value.clone()).boxed())
                .collect(),
        )
    }

    /// The state components.
    pub fn tensors(&self) -> &[Variable<BoxedNode>] {
        &self.tensors
    }

    /// Run the graph forward and detach the state values.
    pub fn values(&self) -> Vec<Arr> {
        self.tensors
            .iter()
            .map(|tensor| {
                tensor.forward();
                tensor.value().to_owned()
            })
            .collect()
    }
}

/// Result of one step.
pub struct StepOutput {
    /// Unnormalised scores over the whole catalog, `[rows, num_items]`.
    pub logits: Variable<BoxedNode>,
    /// The representation the logits were computed from, `[rows, hidden_dim]`.
    pub representation: Variable<BoxedNode>,
    /// State to feed into the next step.
    pub hidden: HiddenState,
}

/// A computation graph over a model's parameters.
pub trait StepGraph {
    /// The zero state for `rows` fresh sequences.
    fn initial_state(&self, rows: usize) -> HiddenState;
    /// Advance every row by one event. `None` starts fresh sequences.
    fn step(&self, inputs: &StepInputs, hidden: Option<&HiddenState>) -> StepOutput;
    /// The logit of `targets[row]` for every row, `[rows, 1]`.
    fn target_scores(
        &self,
        output: &StepOutput,
        targets: &Variable<IndexInputNode>,
    ) -> Variable<BoxedNode>;
}

/// Trait expressing the parameters of a step-function model.
pub trait StepModelParameters {
    /// The graph type built from these parameters.
    type Graph: StepGraph;
    /// Materialise the parameters as nodes of a fresh graph.
    fn build(&self) -> Self::Graph;
    /// Hyperparameters the model was built from.
    fn hyper(&self) -> &Hyperparameters;
    /// All trainable parameter blocks.
    fn parameters(&self) -> Vec<&Arc<HogwildParameter>>;

    /// Number of item ids, padding included.
    fn num_items(&self) -> usize {
        self.hyper().num_items
    }
    /// Hidden state dimensionality.
    fn hidden_dim(&self) -> usize {
        self.hyper().hidden_dim
    }
    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .map(|parameter| parameter.value().len())
            .sum()
    }
}

/// Embedding tables for the four input channels plus the output layer
/// scoring every catalog item. Shared by all variants.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextParameters {
    item_embedding: Arc<HogwildParameter>,
    hour_embedding: Arc<HogwildParameter>,
    weekday_embedding: Arc<HogwildParameter>,
    interval_embedding: Arc<HogwildParameter>,
    output_embedding: Arc<HogwildParameter>,
    output_bias: Arc<HogwildParameter>,
}

impl ContextParameters {
    fn new<R: Rng>(num_items: usize, dim: usize, rng: &mut R) -> Self {
        ContextParameters {
            item_embedding: shared(embedding_init(num_items, dim, rng)),
            hour_embedding: shared(embedding_init(HOUR_SIZE, dim, rng)),
            weekday_embedding: shared(embedding_init(WEEKDAY_SIZE, dim, rng)),
            interval_embedding: shared(embedding_init(INTERVAL_SIZE, dim, rng)),
            output_embedding: shared(embedding_init(num_items, dim, rng)),
            output_bias: shared(Arr::zeros((num_items, 1))),
        }
    }

    fn build(&self) -> ContextLayer {
        ContextLayer {
            item_embedding: ParameterNode::shared(self.item_embedding.clone()),
            hour_embedding: ParameterNode::shared(self.hour_embedding.clone()),
            weekday_embedding: ParameterNode::shared(self.weekday_embedding.clone()),
            interval_embedding: ParameterNode::shared(self.interval_embedding.clone()),
            output_embedding: ParameterNode::shared(self.output_embedding.clone()),
            output_bias: ParameterNode::shared(self.output_bias.clone()),
        }
    }

    fn parameters(&self) -> Vec<&Arc<HogwildParameter>> {
        vec![
            &self.item_embedding,
            &self.hour_embedding,
            &self.weekday_embedding,
            &self.interval_embedding,
            &self.output_embedding,
            &self.output_bias,
        ]
    }
}

struct ContextLayer {
    item_embedding: Variable<ParameterNode>,
    hour_embedding: Variable<ParameterNode>,
    weekday_embedding: Variable<ParameterNode>,
    interval_embedding: Variable<ParameterNode>,
    output_embedding: Variable<ParameterNode>,
    output_bias: Variable<ParameterNode>,
}

impl ContextLayer {
    /// Sum of item, hour and weekday embeddings, `[rows, dim]`.
    fn embed_events(&self, inputs: &StepInputs) -> Variable<BoxedNode> {
        let items = self.item_embedding.index(&IndexInputNode::new(inputs.items));
        let hours = self.hour_embedding.index(&IndexInputNode::new(inputs.hours));
        let weekdays = self
            .weekday_embedding
            .index(&IndexInputNode::new(inputs.weekdays));

        (items + hours + weekdays).boxed()
    }

    fn embed_intervals(&self, inputs: &StepInputs) -> Variable<BoxedNode> {
        self.interval_embedding
            .index(&IndexInputNode::new(inputs.intervals))
            .boxed()
    }

    fn output(&self, representation: Variable<BoxedNode>, hidden: HiddenState, rows: usize) -> StepOutput {
        let ones = InputNode::new(Arr::from_elem((rows, 1), 1.0));
        let logits = (representation.dot(&self.output_embedding.t())
            + ones.dot(&self.output_bias.t()))
            .boxed();

        StepOutput {
            logits: logits,
            representation: representation,
            hidden: hidden,
        }
    }

    fn target_scores(
        &self,
        representation: &Variable<BoxedNode>,
        targets: &Variable<IndexInputNode>,
    ) -> Variable<BoxedNode> {
        let target_embeddings = self.output_embedding.index(targets);
        let target_biases = self.output_bias.index(targets);

        (representation.vector_dot(&target_embeddings) + target_biases).boxed()
    }
}

/// Repeat a `[1, dim]` bias for every row.
fn broadcast(bias: &Variable<ParameterNode>, rows: usize) -> Variable<BoxedNode> {
    bias.index(&IndexInputNode::new(&vec![0; rows])).boxed()
}

/// A model whose variant was resolved at construction.
#[derive(Debug, Serialize, Deserialize)]
pub enum Model {
    /// See [`star`](star/index.html).
    Star(star::Parameters),
    /// See [`sitar`](sitar/index.html).
    Sitar(sitar::Parameters),
}

/// Graph of a [`Model`](enum.Model.html).
pub enum ModelGraph {
    /// STAR graph.
    Star(star::Graph),
    /// SITAR graph.
    Sitar(sitar::Graph),
}

impl Model {
    /// Which variant this is.
    pub fn variant(&self) -> Variant {
        match *self {
            Model::Star(_) => Variant::Star,
            Model::Sitar(_) => Variant::Sitar,
        }
    }

    /// The optimizer that trains this model.
    pub fn optimizer(&self) -> Adam {
        self.hyper().optimizer()
    }

    /// Run one teacher-forced training pass over every entity in `store`.
    pub fn fit_epoch<R: Rng>(
        &self,
        store: &SequenceStore,
        optimizer: &Adam,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<EpochSummary, FittingError> {
        sequence_model::fit_epoch(self, store, optimizer, batch_size, rng)
    }
}

impl StepModelParameters for Model {
    type Graph = ModelGraph;
    fn build(&self) -> ModelGraph {
        match *self {
            Model::Star(ref parameters) => ModelGraph::Star(parameters.build()),
            Model::Sitar(ref parameters) => ModelGraph::Sitar(parameters.build()),
        }
    }
    fn hyper(&self) -> &Hyperparameters {
        match *self {
            Model::Star(ref parameters) => parameters.hyper(),
            Model::Sitar(ref parameters) => parameters.hyper(),
        }
    }
    fn parameters(&self) -> Vec<&Arc<HogwildParameter>> {
        match *self {
            Model::Star(ref parameters) => parameters.parameters(),
            Model::Sitar(ref parameters) => parameters.parameters(),
        }
    }
}

impl StepGraph for ModelGraph {
    fn initial_state(&self, rows: usize) -> HiddenState {
        match *self {
            ModelGraph::Star(ref graph) => graph.initial_state(rows),
            ModelGraph::Sitar(ref graph) => graph.initial_state(rows),
        }
    }
    fn step(&self, inputs: &StepInputs, hidden: Option<&HiddenState>) -> StepOutput {
        match *self {
            ModelGraph::Star(ref graph) => graph.step(inputs, hidden),
            ModelGraph::Sitar(ref graph) => graph.step(inputs, hidden),
        }
    }
    fn target_scores(
        &self,
        output: &StepOutput,
        targets: &Variable<IndexInputNode>,
    ) -> Variable<BoxedNode> {
        match *self {
            ModelGraph::Star(ref graph) => graph.target_scores(output, targets),
            ModelGraph::Sitar(ref graph) => graph.target_scores(output, targets),
        }
    }
}
