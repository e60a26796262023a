// Running averages and top-k accuracy

use ndarray::Axis;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Computes and stores the average and current value
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub avg: f64,
    pub sum: f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record `val` observed `n` times
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

/// Percentage of rows whose target is among the `k` highest logits, for
/// each `k` in `topk`. `k` larger than the class count counts every row.
pub fn accuracy(output: &Tensor, target: &[usize], topk: &[usize]) -> Result<Vec<f64>> {
    let shape = output.shape();
    if shape.len() != 2 || shape[0] != target.len() {
        return Err(Error::InvalidShape(format!(
            "accuracy expects [{}, classes] logits, got {:?}",
            target.len(),
            shape
        )));
    }
    let batch = target.len().max(1) as f64;

    // rank of the target logit within its row; ties resolve to the earlier class
    let ranks: Vec<usize> = output
        .data
        .axis_iter(Axis(0))
        .zip(target)
        .map(|(row, &t)| {
            let score = row.get(t).copied().unwrap_or(f32::NEG_INFINITY);
            row.iter()
                .enumerate()
                .filter(|&(j, &v)| v > score || (v == score && j < t))
                .count()
        })
        .collect();

    Ok(topk
        .iter()
        .map(|&k| ranks.iter().filter(|&&rank| rank < k).count() as f64 * 100.0 / batch)
        .collect())
}
