//! The module tree the profiler walks.
//!
//! A [`Module`] is one node of a network: it has a type tag, ordered named
//! children (empty for leaves), named parameters and a [`HookSet`] that
//! observers attach to. Hooks never change what a module computes.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use log::warn;

use crate::autograd::{Tape, Var};
use crate::error::Result;
use crate::tensor::{Parameter, Tensor};

/// Called with the module inputs before its forward computation
pub type ForwardPreHook = Arc<dyn Fn(&dyn Module, &[&Tensor]) + Send + Sync>;
/// Called with the module inputs and output after its forward computation
pub type ForwardHook = Arc<dyn Fn(&dyn Module, &[&Tensor], &Tensor) + Send + Sync>;
/// Called with the gradient flowing into the module output, before its backward step
pub type BackwardPreHook = Arc<dyn Fn(&dyn Module, &[&Tensor]) + Send + Sync>;
/// Called with the gradients w.r.t. the module inputs and output, after its backward step
pub type BackwardHook = Arc<dyn Fn(&dyn Module, &[&Tensor], &[&Tensor]) + Send + Sync>;

/// Observer callbacks registered on a module
#[derive(Default)]
pub struct HookSet {
    forward_pre: RwLock<Vec<ForwardPreHook>>,
    forward: RwLock<Vec<ForwardHook>>,
    backward_pre: RwLock<Vec<BackwardPreHook>>,
    backward: RwLock<Vec<BackwardHook>>,
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("forward_pre", &snapshot(&self.forward_pre).len())
            .field("forward", &snapshot(&self.forward).len())
            .field("backward_pre", &snapshot(&self.backward_pre).len())
            .field("backward", &snapshot(&self.backward).len())
            .finish()
    }
}

fn snapshot<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn push<T>(lock: &RwLock<Vec<T>>, hook: T) {
    lock.write().unwrap_or_else(|e| e.into_inner()).push(hook);
}

/// Run one hook, containing any panic so the wrapped computation carries on
fn guarded<F: FnOnce()>(kind: &str, module: &dyn Module, hook: F) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!("{} hook on '{}' panicked; ignoring", kind, module.type_name());
    }
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_forward_pre_hook<F>(&self, hook: F)
    where
        F: Fn(&dyn Module, &[&Tensor]) + Send + Sync + 'static,
    {
        push(&self.forward_pre, Arc::new(hook) as ForwardPreHook);
    }

    pub fn register_forward_hook<F>(&self, hook: F)
    where
        F: Fn(&dyn Module, &[&Tensor], &Tensor) + Send + Sync + 'static,
    {
        push(&self.forward, Arc::new(hook) as ForwardHook);
    }

    pub fn register_backward_pre_hook<F>(&self, hook: F)
    where
        F: Fn(&dyn Module, &[&Tensor]) + Send + Sync + 'static,
    {
        push(&self.backward_pre, Arc::new(hook) as BackwardPreHook);
    }

    pub fn register_backward_hook<F>(&self, hook: F)
    where
        F: Fn(&dyn Module, &[&Tensor], &[&Tensor]) + Send + Sync + 'static,
    {
        push(&self.backward, Arc::new(hook) as BackwardHook);
    }

    pub fn has_forward_hooks(&self) -> bool {
        !snapshot(&self.forward_pre).is_empty() || !snapshot(&self.forward).is_empty()
    }

    pub fn has_backward_hooks(&self) -> bool {
        !snapshot(&self.backward_pre).is_empty() || !snapshot(&self.backward).is_empty()
    }

    /// Total number of registered callbacks
    pub fn len(&self) -> usize {
        snapshot(&self.forward_pre).len()
            + snapshot(&self.forward).len()
            + snapshot(&self.backward_pre).len()
            + snapshot(&self.backward).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fire_forward_pre(&self, module: &dyn Module, inputs: &[&Tensor]) {
        for hook in snapshot(&self.forward_pre) {
            guarded("forward pre", module, || hook(module, inputs));
        }
    }

    pub fn fire_forward(&self, module: &dyn Module, inputs: &[&Tensor], output: &Tensor) {
        for hook in snapshot(&self.forward) {
            guarded("forward", module, || hook(module, inputs, output));
        }
    }

    pub fn fire_backward_pre(&self, module: &dyn Module, grad_outputs: &[&Tensor]) {
        for hook in snapshot(&self.backward_pre) {
            guarded("backward pre", module, || hook(module, grad_outputs));
        }
    }

    pub fn fire_backward(
        &self,
        module: &dyn Module,
        grad_inputs: &[&Tensor],
        grad_outputs: &[&Tensor],
    ) {
        for hook in snapshot(&self.backward) {
            guarded("backward", module, || hook(module, grad_inputs, grad_outputs));
        }
    }
}

/// Trait implemented by every node of a network
pub trait Module: Send + Sync {
    /// Type tag used for classification and qualified names
    fn type_name(&self) -> &str;

    fn hooks(&self) -> &HookSet;

    /// Compute the output, recording backward steps on the tape.
    ///
    /// Containers must call their children through [`invoke`] so the
    /// children's hooks fire.
    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var>;

    /// Ordered named sub-modules; empty for leaves
    fn children(&self) -> Vec<(String, &dyn Module)> {
        Vec::new()
    }

    /// Learnable tensors owned directly by this module
    fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        Vec::new()
    }

    /// Non-learnable state owned directly by this module
    fn buffers(&self) -> Vec<(&'static str, &Parameter)> {
        Vec::new()
    }

    fn weight(&self) -> Option<&Parameter> {
        None
    }

    fn bias(&self) -> Option<&Parameter> {
        None
    }

    /// Switch between training and evaluation behaviour
    fn set_training(&self, _training: bool) {}
}

/// Run a module's forward computation, firing its hooks around it
pub fn invoke<'a>(module: &'a dyn Module, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
    let hooks = module.hooks();
    let observe_forward = hooks.has_forward_hooks();
    let observe_backward = hooks.has_backward_hooks();
    if !observe_forward && !observe_backward {
        return module.forward(input, tape);
    }

    if observe_forward {
        hooks.fire_forward_pre(module, &[input.tensor()]);
    }
    let first_entry = tape.len();
    let output = module.forward(input, tape)?;
    if observe_forward {
        hooks.fire_forward(module, &[input.tensor()], output.tensor());
    }
    if observe_backward {
        tape.watch(module, first_entry, &output);
    }
    Ok(output)
}

/// Recursively switch a module tree between training and evaluation
pub fn set_training(module: &dyn Module, training: bool) {
    module.set_training(training);
    for (_, child) in module.children() {
        set_training(child, training);
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn collect<'m>(
    module: &'m dyn Module,
    prefix: &str,
    buffers: bool,
    out: &mut Vec<(String, &'m Parameter)>,
) {
    let own = if buffers { module.buffers() } else { module.parameters() };
    for (name, param) in own {
        out.push((join(prefix, name), param));
    }
    for (name, child) in module.children() {
        collect(child, &join(prefix, &name), buffers, out);
    }
}

/// All learnable parameters of a tree with dotted paths (`features.stemblock.stem1.conv.weight`)
pub fn named_parameters(module: &dyn Module) -> Vec<(String, &Parameter)> {
    let mut out = Vec::new();
    collect(module, "", false, &mut out);
    out
}

/// All buffers of a tree with dotted paths
pub fn named_buffers(module: &dyn Module) -> Vec<(String, &Parameter)> {
    let mut out = Vec::new();
    collect(module, "", true, &mut out);
    out
}

/// Number of scalar learnable values in a tree
pub fn parameter_count(module: &dyn Module) -> usize {
    named_parameters(module)
        .iter()
        .map(|(_, p)| p.shape().iter().product::<usize>())
        .sum()
}
