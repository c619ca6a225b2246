use serde::{Deserialize, Serialize};

pub use layer::{LayerValues, NodeValue};

pub mod layer;
pub mod nn;

/// Elementwise gate nonlinearities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkActivationMode {
    Sigmoid,
    Tanh,
}

impl NetworkActivationMode {
    pub fn apply(&self, inputs: &[NodeValue]) -> LayerValues {
        match self {
            NetworkActivationMode::Sigmoid => inputs.iter().map(|&x| sigmoid(x)).collect(),
            NetworkActivationMode::Tanh => inputs.iter().map(|x| x.tanh()).collect(),
        }
    }

    /// Derivative in terms of the activation output, `y = apply(x)`.
    pub fn derivative(&self, activation: &[NodeValue]) -> LayerValues {
        match self {
            NetworkActivationMode::Sigmoid => activation.iter().map(|y| y * (1.0 - y)).collect(),
            NetworkActivationMode::Tanh => activation.iter().map(|y| 1.0 - y * y).collect(),
        }
    }
}

fn sigmoid(x: NodeValue) -> NodeValue {
    1.0 / (1.0 + (-x).exp())
}
