// Per-iteration timing report
// Rebuilds iteration boundaries from the flat record log

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use super::record::EventRecord;
use crate::error::{Error, Result};

const RULE: &str = "=================================";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerTiming {
    /// 1-based position of the line within its section
    pub layer: usize,
    pub name: String,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationTiming {
    /// 0-based; the text header prints it from 1
    pub iteration: usize,
    pub forward: Vec<LayerTiming>,
    /// Last layer first; layers without a backward record are absent
    pub backward: Vec<LayerTiming>,
}

/// Structured form of the text report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileReport {
    pub layer_num: usize,
    pub iterations: Vec<IterationTiming>,
}

fn backward_record(records: &[EventRecord], index: usize) -> Result<&EventRecord> {
    records.get(index).ok_or(Error::MissingBackwardRecord { index })
}

impl ProfileReport {
    /// Group records into iterations of `layer_num` forward records each.
    ///
    /// Backward layer `j` of iteration `i` is read from backward record
    /// `i*k + k - j - 1`, so backward sections list layers last to first.
    pub fn build(
        layer_num: usize,
        forward: &[EventRecord],
        backward: &[EventRecord],
    ) -> Result<Self> {
        if layer_num == 0 {
            return Ok(Self::default());
        }
        if forward.len() % layer_num != 0 {
            return Err(Error::RecordCountMismatch {
                records: forward.len(),
                layers: layer_num,
            });
        }

        let k = layer_num;
        let iterations = (0..forward.len() / k)
            .map(|i| {
                let forward_lines = forward[i * k..(i + 1) * k]
                    .iter()
                    .enumerate()
                    .map(|(j, record)| LayerTiming {
                        layer: j + 1,
                        name: record.name.clone(),
                        elapsed_ms: record.elapsed_ms(),
                    })
                    .collect();

                let mut backward_lines = Vec::with_capacity(k);
                for j in 0..k {
                    match backward_record(backward, i * k + k - j - 1) {
                        Ok(record) => backward_lines.push(LayerTiming {
                            layer: j + 1,
                            name: record.name.clone(),
                            elapsed_ms: record.elapsed_ms(),
                        }),
                        Err(e) => debug!("iteration {} layer {}: {}", i, j + 1, e),
                    }
                }

                IterationTiming {
                    iteration: i,
                    forward: forward_lines,
                    backward: backward_lines,
                }
            })
            .collect();

        Ok(Self { layer_num, iterations })
    }

    pub fn iteration_count(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, line: &LayerTiming) -> fmt::Result {
    writeln!(
        f,
        "layer{:3}:          {:.6} ms          ({})",
        line.layer, line.elapsed_ms, line.name
    )
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for iteration in &self.iterations {
            writeln!(f, "\n{} Iteration {} {}", RULE, iteration.iteration + 1, RULE)?;
            f.write_str("\nFORWARD TIME:\n\n")?;
            for line in &iteration.forward {
                write_line(f, line)?;
            }
            f.write_str("\nBACKWARD TIME:\n\n")?;
            for line in &iteration.backward {
                write_line(f, line)?;
            }
        }
        Ok(())
    }
}
