//! Composite modules.

use crate::autograd::{Tape, Var};
use crate::error::Result;
use crate::module::{invoke, HookSet, Module};

/// Named children applied in insertion order
#[derive(Default)]
pub struct Sequential {
    modules: Vec<(String, Box<dyn Module>)>,
    hooks: HookSet,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Sequential::push`]
    pub fn add(mut self, name: impl Into<String>, module: impl Module + 'static) -> Self {
        self.push(name, Box::new(module));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, module: Box<dyn Module>) {
        self.modules.push((name.into(), module));
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Module for Sequential {
    fn type_name(&self) -> &str {
        "Sequential"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let mut x = input.clone();
        for (_, module) in &self.modules {
            x = invoke(module.as_ref(), &x, tape)?;
        }
        Ok(x)
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        self.modules
            .iter()
            .map(|(name, module)| (name.clone(), module.as_ref() as &dyn Module))
            .collect()
    }
}

/// Positionally indexed modules; children are named `0`, `1`, ...
///
/// Its forward pass applies the elements in order.
#[derive(Default)]
pub struct ModuleList {
    modules: Vec<Box<dyn Module>>,
    hooks: HookSet,
}

impl ModuleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Module> {
        self.modules.iter().map(|m| m.as_ref() as &dyn Module)
    }
}

impl FromIterator<Box<dyn Module>> for ModuleList {
    fn from_iter<I: IntoIterator<Item = Box<dyn Module>>>(iter: I) -> Self {
        Self {
            modules: iter.into_iter().collect(),
            hooks: HookSet::new(),
        }
    }
}

impl Module for ModuleList {
    fn type_name(&self) -> &str {
        "ModuleList"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let mut x = input.clone();
        for module in &self.modules {
            x = invoke(module.as_ref(), &x, tape)?;
        }
        Ok(x)
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(index, module)| (index.to_string(), module.as_ref() as &dyn Module))
            .collect()
    }
}

/// Data-parallel wrapper.
///
/// Only the nesting is modelled: the wrapped module runs on the calling
/// thread and no gradients are exchanged.
pub struct DataParallel {
    module: Box<dyn Module>,
    hooks: HookSet,
}

impl DataParallel {
    pub fn new(module: Box<dyn Module>) -> Self {
        Self {
            module,
            hooks: HookSet::new(),
        }
    }

    pub fn inner(&self) -> &dyn Module {
        self.module.as_ref()
    }
}

impl Module for DataParallel {
    fn type_name(&self) -> &str {
        "DataParallel"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        invoke(self.module.as_ref(), input, tape)
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![("module".to_string(), self.module.as_ref() as &dyn Module)]
    }
}
