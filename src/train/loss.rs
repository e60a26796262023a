// Loss functions

use ndarray::{Array2, Axis, Ix2};

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Scalar loss plus its gradient w.r.t. the logits
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f64,
    pub grad: Tensor,
}

pub trait Criterion {
    fn forward(&self, output: &Tensor, target: &[usize]) -> Result<LossOutput>;
}

/// Mean softmax cross entropy over a batch of logits
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }
}

impl Criterion for CrossEntropyLoss {
    fn forward(&self, output: &Tensor, target: &[usize]) -> Result<LossOutput> {
        let logits = output
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| {
                Error::InvalidShape(format!(
                    "cross entropy expects 2-D logits, got {:?}",
                    output.shape()
                ))
            })?;
        let (batch, classes) = logits.dim();
        if batch != target.len() || batch == 0 {
            return Err(Error::InvalidShape(format!(
                "{} targets for a batch of {}",
                target.len(),
                batch
            )));
        }

        let mut grad = Array2::<f32>::zeros((batch, classes));
        let mut total = 0.0f64;
        let rows = logits.axis_iter(Axis(0)).zip(grad.axis_iter_mut(Axis(0)));
        for ((row, mut grad_row), &t) in rows.zip(target) {
            if t >= classes {
                return Err(Error::InvalidShape(format!(
                    "target {} out of range for {} classes",
                    t, classes
                )));
            }
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exp: Vec<f64> = row.iter().map(|&v| ((v - max) as f64).exp()).collect();
            let sum: f64 = exp.iter().sum();
            total += sum.ln() - (row[t] - max) as f64;
            for (j, g) in grad_row.iter_mut().enumerate() {
                let indicator = if j == t { 1.0 } else { 0.0 };
                *g = ((exp[j] / sum - indicator) / batch as f64) as f32;
            }
        }

        Ok(LossOutput {
            loss: total / batch as f64,
            grad: Tensor::from_array(grad.into_dyn()),
        })
    }
}
