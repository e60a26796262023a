// Optimizers
// Update a module's parameters in place from their accumulated gradients

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::checkpoint::SavedTensor;
use crate::error::{Error, Result};
use crate::module::{named_parameters, Module};

/// Serializable optimizer state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Keyed by dotted parameter path
    pub momentum_buffers: BTreeMap<String, SavedTensor>,
}

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// Clear every parameter gradient of `model`
    fn zero_grad(&self, model: &dyn Module) {
        for (_, param) in named_parameters(model) {
            param.zero_grad();
        }
    }

    /// Apply one update to every parameter that has a gradient
    fn step(&mut self, model: &dyn Module) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}

/// Stochastic gradient descent with momentum and L2 weight decay
#[derive(Debug)]
pub struct Sgd {
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: BTreeMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: BTreeMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, model: &dyn Module) -> Result<()> {
        let lr = self.learning_rate as f32;
        let mu = self.momentum as f32;
        let wd = self.weight_decay as f32;

        for (name, param) in named_parameters(model) {
            let Some(grad) = param.grad() else {
                continue;
            };
            let mut update = grad;
            if wd != 0.0 {
                let value = param.value();
                if value.shape() != update.shape() {
                    return Err(Error::InvalidShape(format!(
                        "gradient of '{}' has shape {:?}, parameter {:?}",
                        name,
                        update.shape(),
                        value.shape()
                    )));
                }
                update.scaled_add(wd, &value);
            }
            if mu != 0.0 {
                let velocity = match self.velocity.remove(&name) {
                    Some(mut v) if v.shape() == update.shape() => {
                        v *= mu;
                        v += &update;
                        v
                    }
                    _ => update,
                };
                update = velocity.clone();
                self.velocity.insert(name, velocity);
            }
            param.update(|value| value.scaled_add(-lr, &update));
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            momentum_buffers: self
                .velocity
                .iter()
                .map(|(name, v)| (name.clone(), SavedTensor::from_array(v)))
                .collect(),
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let mut velocity = BTreeMap::new();
        for (name, saved) in state.momentum_buffers {
            velocity.insert(name, saved.to_array()?);
        }
        self.learning_rate = state.learning_rate;
        self.momentum = state.momentum;
        self.weight_decay = state.weight_decay;
        self.velocity = velocity;
        Ok(())
    }
}
