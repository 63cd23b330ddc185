//! SITAR: a two-state recurrent cell with an interval-controlled memory.
//!
//! The fast state `s` reads the item, hour and weekday embeddings. The slow
//! memory `m` mixes in the fast state at a rate set by the interval since
//! the previous event:
//! ```text
//! s_t = tanh(x_t W_x + s_{t-1} W_h + b)
//! g_t = sigmoid(v_t W_g + b_g)
//! m_t = g_t * m_{t-1} + (1 - g_t) * s_t
//! ```
//! where `x_t` is the summed event embedding and `v_t` the interval
//! embedding. Items are scored from `m_t`.
use std::sync::Arc;

use wyrm::{BoxedNode, HogwildParameter, IndexInputNode, ParameterNode, Variable};

use super::{
    broadcast, dense_init, shared, ContextLayer, ContextParameters, HiddenState,
    Hyperparameters, StepGraph, StepInputs, StepModelParameters, StepOutput,
};

/// Parameters of the SITAR model.
#[derive(Debug, Serialize, Deserialize)]
pub struct Parameters {
    hyper: Hyperparameters,
    context: ContextParameters,
    input_weights: Arc<HogwildParameter>,
    hidden_weights: Arc<HogwildParameter>,
    bias: Arc<HogwildParameter>,
    gate_weights: Arc<HogwildParameter>,
    gate_bias: Arc<HogwildParameter>,
}

impl Parameters {
    /// Initialise the parameters from `hyper`'s seed.
    pub fn new(hyper: Hyperparameters) -> Self {
        let mut rng = hyper.rng();
        let dim = hyper.hidden_dim;

        let context = ContextParameters::new(hyper.num_items, dim, &mut rng);

        Parameters {
            input_weights: shared(dense_init(dim, dim, &mut rng)),
            hidden_weights: shared(dense_init(dim, dim, &mut rng)),
            bias: shared(wyrm::Arr::zeros((1, dim))),
            gate_weights: shared(dense_init(dim, dim, &mut rng)),
            gate_bias: shared(wyrm::Arr::zeros((1, dim))),
            context: context,
            hyper: hyper,
        }
    }
}

/// Computation graph of the SITAR model.
pub struct Graph {
    dim: usize,
    context: ContextLayer,
    input_weights: Variable<ParameterNode>,
    hidden_weights: Variable<ParameterNode>,
    bias: Variable<ParameterNode>,
    gate_weights: Variable<ParameterNode>,
    gate_bias: Variable<ParameterNode>,
}

impl StepModelParameters for Parameters {
    type Graph = Graph;
    fn build(&self) -> Graph {
        Graph {
            dim: self.hyper.hidden_dim,
            context: self.context.build(),
            input_weights: ParameterNode::shared(self.input_weights.clone()),
            hidden_weights: ParameterNode::shared(self.hidden_weights.clone()),
            bias: ParameterNode::shared(self.bias.clone()),
            gate_weights: ParameterNode::shared(self.gate_weights.clone()),
            gate_bias: ParameterNode::shared(self.gate_bias.clone()),
        }
    }
    fn hyper(&self) -> &Hyperparameters {
        &self.hyper
    }
    fn parameters(&self) -> Vec<&Arc<HogwildParameter>> {
        let mut parameters = self.context.parameters();
        parameters.extend(vec![
            &self.input_weights,
            &self.hidden_weights,
            &self.bias,
            &self.gate_weights,
            &self.gate_bias,
        ]);
        parameters
    }
}

impl StepGraph for Graph {
    fn initial_state(&self, rows: usize) -> HiddenState {
        HiddenState::zeros(2, rows, self.dim)
    }

    fn step(&self, inputs: &StepInputs, hidden: Option<&HiddenState>) -> StepOutput {
        let rows = inputs.len();
        let hidden = match hidden {
            Some(hidden) => hidden.clone(),
            None => self.initial_state(rows),
        };
        let (previous_state, previous_memory) =
            (hidden.tensors()[0].clone(), hidden.tensors()[1].clone());

        let state = (self.context.embed_events(inputs).dot(&self.input_weights)
            + previous_state.dot(&self.hidden_weights)
            + broadcast(&self.bias, rows))
            .tanh()
            .boxed();

        let gate = (self.context.embed_intervals(inputs).dot(&self.gate_weights)
            + broadcast(&self.gate_bias, rows))
            .sigmoid()
            .boxed();
        let memory = (gate.clone() * previous_memory + (1.0 - gate) * state.clone()).boxed();

        self.context.output(
            memory.clone(),
            HiddenState::new(vec![state, memory]),
            rows,
        )
    }

    fn target_scores(
        &self,
        output: &StepOutput,
        targets: &Variable<IndexInputNode>,
    ) -> Variable<BoxedNode> {
        self.context.target_scores(&output.representation, targets)
    }
}
