//! STAR: a recurrent cell over the sum of all context embeddings.
//!
//! At every step the item, hour, weekday and interval embeddings are summed
//! into a single input vector `x_t`, and the state is updated as
//! ```text
//! h_t = tanh(x_t W_x + h_{t-1} W_h + b)
//! ```
//! Scores for every catalog item are read off `h_t` through the shared
//! output layer.
use std::sync::Arc;

use wyrm::{BoxedNode, HogwildParameter, IndexInputNode, ParameterNode, Variable};

use super::{
    broadcast, dense_init, shared, ContextLayer, ContextParameters, HiddenState,
    Hyperparameters, StepGraph, StepInputs, StepModelParameters, StepOutput,
};

/// Parameters of the STAR model.
#[derive(Debug, Serialize, Deserialize)]
pub struct Parameters {
    hyper: Hyperparameters,
    context: ContextParameters,
    input_weights: Arc<HogwildParameter>,
    hidden_weights: Arc<HogwildParameter>,
    bias: Arc<HogwildParameter>,
}

impl Parameters {
    /// Initialise the parameters from `hyper`'s seed.
    pub fn new(hyper: Hyperparameters) -> Self {
        let mut rng = hyper.rng();
        let dim = hyper.hidden_dim;

        let context = ContextParameters::new(hyper.num_items, dim, &mut rng);
        let input_weights = shared(dense_init(dim, dim, &mut rng));
        let hidden_weights = shared(dense_init(dim, dim, &mut rng));
        let bias = shared(wyrm::Arr::zeros((1, dim)));

        Parameters {
            hyper: hyper,
            context: context,
            input_weights: input_weights,
            hidden_weights: hidden_weights,
            bias: bias,
        }
    }
}

/// Computation graph of the STAR model.
pub struct Graph {
    dim: usize,
    context: ContextLayer,
    input_weights: Variable<ParameterNode>,
    hidden_weights: Variable<ParameterNode>,
    bias: Variable<ParameterNode>,
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
        }
    }
    fn hyper(&self) -> &Hyperparameters {
        &self.hyper
    }
    fn parameters(&self) -> Vec<&Arc<HogwildParameter>> {
        let mut parameters = self.context.parameters();
        parameters.extend(vec![&self.input_weights, &self.hidden_weights, &self.bias]);
        parameters
    }
}

impl StepGraph for Graph {
    fn initial_state(&self, rows: usize) -> HiddenState {
        HiddenState::zeros(1, rows, self.dim)
    }

    fn step(&self, inputs: &StepInputs, hidden: Option<&HiddenState>) -> StepOutput {
        let rows = inputs.len();
        let previous = match hidden {
            Some(hidden) => hidden.tensors()[0].clone(),
            None => self.initial_state(rows).tensors()[0].clone(),
        };

        let input = self.context.embed_events(inputs) + self.context.embed_intervals(inputs);
        let state = (input.dot(&self.input_weights)
            + previous.dot(&self.hidden_weights)
            + broadcast(&self.bias, rows))
            .tanh()
            .boxed();

        self.context
            .output(state.clone(), HiddenState::new(vec![state]), rows)
    }

    fn target_scores(
        &self,
        output: &StepOutput,
        targets: &Variable<IndexInputNode>,
    ) -> Variable<BoxedNode> {
        self.context.target_scores(&output.representation, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_parameters() {
        let first = Parameters::new(Hyperparameters::new(20, 8).from_seed([3; 16]));
        let second = Parameters::new(Hyperparameters::new(20, 8).from_seed([3; 16]));
        let third = Parameters::new(Hyperparameters::new(20, 8).from_seed([4; 16]));

        assert_eq!(
            first.input_weights.value(),
            second.input_weights.value()
        );
        assert!(first.input_weights.value() != third.input_weights.value());
    }

    #[test]
    fn state_depends_on_history() {
        let parameters = Parameters::new(Hyperparameters::new(20, 8));
        let graph = parameters.build();

        let inputs = StepInputs {
            items: &[4],
            hours: &[10],
            weekdays: &[3],
            intervals: &[2],
        };

        let fresh = graph.step(&inputs, None);
        let fresh_state = fresh.hidden.values();

        let continued = graph.step(&inputs, Some(&fresh.hidden));
        let continued_state = continued.hidden.values();

        assert_eq!(fresh_state.len(), 1);
        assert!(fresh_state[0] != continued_state[0]);
        assert!(fresh_state[0].iter().all(|x| x.abs() <= 1.0));
    }

    #[test]
    fn large_logits_give_a_finite_loss() {
        use data::{Event, SequenceStore};
        use models::sequence_model::fit_batch;

        let raw = vec![vec![
            Event::new(3, 1, 1, 0),
            Event::new(4, 2, 2, 1),
            Event::new(2, 3, 3, 1),
        ]];
        let store = SequenceStore::build(&raw, 1.0, None);

        let mut parameters = Parameters::new(Hyperparameters::new(store.num_items(), 4));
        let mut bias = wyrm::Arr::zeros((store.num_items(), 1));
        bias[(1, 0)] = 100.0;
        parameters.context.output_bias = shared(bias);

        let optimizer = parameters.hyper().optimizer();
        let batch = store.assemble(&[0]);
        let loss = fit_batch(&parameters, &batch, &optimizer).unwrap().unwrap();

        // Item 1 dominates; the target scores near zero.
        assert!(loss.is_finite());
        assert!(loss > 90.0 && loss < 110.0);
    }
}
