// Learning-rate schedule

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::optim::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LrPolicy {
    /// Half-cosine decay over every iteration of the run
    Cosine,
    /// Divide by 10 every 30 epochs
    Step,
}

/// Rate for iteration `iteration` of `epoch`
pub fn learning_rate(
    policy: LrPolicy,
    base_lr: f64,
    epoch: usize,
    num_epochs: usize,
    iteration: usize,
    iterations_per_epoch: usize,
) -> f64 {
    match policy {
        LrPolicy::Cosine => {
            let total = (num_epochs * iterations_per_epoch).max(1) as f64;
            let current = ((epoch % num_epochs.max(1)) * iterations_per_epoch + iteration) as f64;
            0.5 * base_lr * (1.0 + (PI * current / total).cos())
        }
        LrPolicy::Step => base_lr * 0.1f64.powi((epoch / 30) as i32),
    }
}

/// Compute the rate for this iteration and install it on the optimizer
pub fn adjust_learning_rate(
    optimizer: &mut dyn Optimizer,
    policy: LrPolicy,
    base_lr: f64,
    epoch: usize,
    num_epochs: usize,
    iteration: usize,
    iterations_per_epoch: usize,
) -> f64 {
    let lr = learning_rate(policy, base_lr, epoch, num_epochs, iteration, iterations_per_epoch);
    optimizer.set_learning_rate(lr);
    lr
}
