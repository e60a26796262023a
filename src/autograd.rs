//! Reverse-mode gradient tape.
//!
//! Every differentiable kernel records one entry holding its backward
//! closure. `Tape::backward` replays entries newest first, so module
//! backward hooks fire in exactly the reverse of the forward order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::ArrayD;

use crate::error::{Error, Result};
use crate::module::Module;
use crate::tensor::Tensor;

pub type VarId = usize;

/// Gradient of the entry output in, gradients of the entry inputs out
pub type BackwardFn<'a> = Box<dyn FnOnce(&ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> + 'a>;

/// A value tracked by a tape
#[derive(Clone)]
pub struct Var {
    id: VarId,
    tensor: Arc<Tensor>,
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var {{ id: {}, shape: {:?} }}", self.id, self.tensor.shape())
    }
}

impl Var {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.tensor.data
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }
}

struct TapeEntry<'a> {
    inputs: Vec<VarId>,
    output: VarId,
    backward: BackwardFn<'a>,
}

/// Range of tape entries produced by one hooked module call
struct WatchedSpan<'a> {
    module: &'a dyn Module,
    first: usize,
    last: usize,
    output: VarId,
}

pub struct Tape<'a> {
    next_id: VarId,
    grad_enabled: bool,
    entries: Vec<TapeEntry<'a>>,
    spans: Vec<WatchedSpan<'a>>,
}

impl<'a> Default for Tape<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> fmt::Debug for Tape<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tape")
            .field("grad_enabled", &self.grad_enabled)
            .field("entries", &self.entries.len())
            .field("watched", &self.spans.len())
            .finish()
    }
}

impl<'a> Tape<'a> {
    /// Tape that records backward steps
    pub fn new() -> Self {
        Self {
            next_id: 0,
            grad_enabled: true,
            entries: Vec::new(),
            spans: Vec::new(),
        }
    }

    /// Tape for inference: kernels run but nothing is recorded
    pub fn no_grad() -> Self {
        Self {
            grad_enabled: false,
            ..Self::new()
        }
    }

    pub fn is_grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    /// Number of recorded entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_var(&mut self, tensor: Tensor) -> Var {
        let id = self.next_id;
        self.next_id += 1;
        Var {
            id,
            tensor: Arc::new(tensor),
        }
    }

    /// Introduce a value with no producer (network input)
    pub fn input(&mut self, tensor: Tensor) -> Var {
        self.next_var(tensor)
    }

    /// Record a kernel output together with its backward step
    pub fn record<F>(&mut self, output: Tensor, inputs: &[&Var], backward: F) -> Var
    where
        F: FnOnce(&ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> + 'a,
    {
        let var = self.next_var(output);
        if self.grad_enabled {
            self.entries.push(TapeEntry {
                inputs: inputs.iter().map(|v| v.id).collect(),
                output: var.id,
                backward: Box::new(backward),
            });
        }
        var
    }

    /// Mark the entries recorded since `first` as belonging to `module`
    pub(crate) fn watch(&mut self, module: &'a dyn Module, first: usize, output: &Var) {
        if !self.grad_enabled || self.entries.len() <= first {
            return;
        }
        self.spans.push(WatchedSpan {
            module,
            first,
            last: self.entries.len() - 1,
            output: output.id,
        });
    }

    /// Propagate `seed` (the gradient of `root`) back through the tape.
    ///
    /// Consumes the recorded entries. Entries whose output received no
    /// gradient are skipped, and so are the hooks of their module.
    pub fn backward(&mut self, root: &Var, seed: ArrayD<f32>) -> Result<()> {
        if !self.grad_enabled {
            return Err(Error::AutogradError(
                "backward called on a tape created with no_grad".to_string(),
            ));
        }
        if seed.shape() != root.shape() {
            return Err(Error::InvalidShape(format!(
                "seed gradient {:?} does not match root {:?}",
                seed.shape(),
                root.shape()
            )));
        }

        let entries = std::mem::take(&mut self.entries);
        let spans = std::mem::take(&mut self.spans);
        let mut grads: HashMap<VarId, ArrayD<f32>> = HashMap::new();
        grads.insert(root.id, seed);
        let mut pending: HashMap<usize, Tensor> = HashMap::new();

        for (index, entry) in entries.into_iter().enumerate().rev() {
            for (span_index, span) in spans.iter().enumerate().filter(|(_, s)| s.last == index) {
                if let Some(grad) = grads.get(&span.output) {
                    let grad_output = Tensor::from_array(grad.clone());
                    span.module.hooks().fire_backward_pre(span.module, &[&grad_output]);
                    pending.insert(span_index, grad_output);
                }
            }

            let TapeEntry { inputs, output, backward } = entry;
            let Some(grad_output) = grads.remove(&output) else {
                continue;
            };
            let grad_inputs = backward(&grad_output)?;
            if grad_inputs.len() != inputs.len() {
                return Err(Error::AutogradError(format!(
                    "backward step returned {} gradients for {} inputs",
                    grad_inputs.len(),
                    inputs.len()
                )));
            }

            for (span_index, span) in spans.iter().enumerate().filter(|(_, s)| s.first == index) {
                if let Some(grad_output) = pending.remove(&span_index) {
                    let grad_tensors: Vec<Tensor> =
                        grad_inputs.iter().cloned().map(Tensor::from_array).collect();
                    let grad_refs: Vec<&Tensor> = grad_tensors.iter().collect();
                    span.module.hooks().fire_backward(span.module, &grad_refs, &[&grad_output]);
                }
            }

            for (id, grad) in inputs.into_iter().zip(grad_inputs) {
                match grads.get_mut(&id) {
                    Some(existing) if existing.shape() == grad.shape() => *existing += &grad,
                    Some(existing) => {
                        return Err(Error::InvalidShape(format!(
                            "gradient {:?} does not match accumulated {:?}",
                            grad.shape(),
                            existing.shape()
                        )))
                    }
                    None => {
                        grads.insert(id, grad);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::invoke;
    use crate::module::test_support::Probe;
    use ndarray::IxDyn;
    use std::sync::Mutex;

    fn scale<'a>(tape: &mut Tape<'a>, x: &Var, factor: f32) -> Var {
        let out = Tensor::from_array(x.data() * factor);
        tape.record(out, &[x], move |g| Ok(vec![g * factor]))
    }

    #[test]
    fn test_chain_backward_consumes_tape() {
        let mut tape = Tape::new();
        let x = tape.input(Tensor::from_array(ArrayD::from_elem(IxDyn(&[2]), 1.0)));
        let a = scale(&mut tape, &x, 2.0);
        let b = scale(&mut tape, &a, 3.0);
        assert_eq!(tape.len(), 2);
        assert_eq!(b.data()[[0]], 6.0);
        tape.backward(&b, ArrayD::from_elem(IxDyn(&[2]), 1.0)).unwrap();
        assert!(tape.is_empty());
    }

    #[test]
    fn test_backward_hooks_fire_in_reverse_order() {
        let tree = Probe::node(
            "Sequential",
            vec![Probe::leaf("A"), Probe::leaf("B"), Probe::leaf("C")],
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        for (_, child) in tree.children() {
            let order = Arc::clone(&order);
            child.hooks().register_backward_hook(move |m, grad_in, grad_out| {
                assert_eq!(grad_in.len(), 1);
                assert_eq!(grad_out.len(), 1);
                order.lock().unwrap().push(m.type_name().to_string());
            });
        }

        let mut tape = Tape::new();
        let x = tape.input(Tensor::new(&[4], crate::tensor::DataType::Float32));
        let y = invoke(&tree, &x, &mut tape).unwrap();
        tape.backward(&y, ArrayD::ones(IxDyn(&[4]))).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_no_grad_tape_rejects_backward() {
        let mut tape = Tape::no_grad();
        let x = tape.input(Tensor::new(&[1], crate::tensor::DataType::Float32));
        let y = scale(&mut tape, &x, 2.0);
        assert!(tape.is_empty());
        assert!(matches!(
            tape.backward(&y, ArrayD::ones(IxDyn(&[1]))),
            Err(Error::AutogradError(_))
        ));
    }

    #[test]
    fn test_seed_shape_must_match_root() {
        let mut tape = Tape::new();
        let x = tape.input(Tensor::new(&[3], crate::tensor::DataType::Float32));
        let y = scale(&mut tape, &x, 1.0);
        assert!(tape.backward(&y, ArrayD::ones(IxDyn(&[2]))).is_err());
    }
}
