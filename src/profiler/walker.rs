// Module tree walker
// Classifies every node of a module tree and hands each leaf, with its
// qualified name, to an attach callback

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::{Error, Result};
use crate::module::Module;

/// How the walker treats a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum NodeKind {
    /// Recurse into every named child; children append their own tag
    NamedContainer,
    /// Append the container tag once, then visit every element with that prefix
    IndexedContainer,
    /// Instrumented; never descended into
    Leaf,
}

/// Closed table of container type tags.
///
/// Anything not listed is a leaf. The two sets never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleClassifier {
    named: BTreeSet<String>,
    indexed: BTreeSet<String>,
}

impl Default for ModuleClassifier {
    fn default() -> Self {
        Self::peleenet()
    }
}

impl ModuleClassifier {
    /// A table that treats every node as a leaf
    pub fn empty() -> Self {
        Self {
            named: BTreeSet::new(),
            indexed: BTreeSet::new(),
        }
    }

    /// Containers of the PeleeNet family
    pub fn peleenet() -> Self {
        [
            "PeleeNet",
            "DataParallel",
            "Sequential",
            "StemBlock",
            "DenseBlock",
            "DenseLayer",
            "TransitionBlock",
            "BasicConv2d",
        ]
        .into_iter()
        .fold(Self::empty(), |c, tag| c.with_named(tag))
        .with_indexed("ModuleList")
    }

    pub fn with_named(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.indexed.remove(&tag);
        self.named.insert(tag);
        self
    }

    pub fn with_indexed(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.named.remove(&tag);
        self.indexed.insert(tag);
        self
    }

    pub fn classify(&self, type_name: &str) -> NodeKind {
        if self.named.contains(type_name) {
            NodeKind::NamedContainer
        } else if self.indexed.contains(type_name) {
            NodeKind::IndexedContainer
        } else {
            NodeKind::Leaf
        }
    }
}

/// Options for building qualified names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingOptions {
    /// Append `[i]` to an indexed container's segment per element, so
    /// identical elements get distinct names
    pub index_list_elements: bool,
}

/// `[pid] Root/Tag/.../Tag`, fixed at walk time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName(Arc<str>);

impl QualifiedName {
    pub fn root(pid: &str, type_name: &str) -> Self {
        Self(Arc::from(format!("[{}] {}", pid, type_name)))
    }

    pub fn child(&self, segment: &str) -> Self {
        Self(Arc::from(format!("{}/{}", self.0, segment)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recursive classifier over a module tree
pub struct ModuleTreeWalker<'c> {
    classifier: &'c ModuleClassifier,
    naming: NamingOptions,
}

impl<'c> ModuleTreeWalker<'c> {
    pub fn new(classifier: &'c ModuleClassifier) -> Self {
        Self {
            classifier,
            naming: NamingOptions::default(),
        }
    }

    pub fn with_naming(mut self, naming: NamingOptions) -> Self {
        self.naming = naming;
        self
    }

    /// Visit every node below `root`, calling `attach` once per leaf in
    /// child order. Returns the number of leaves.
    ///
    /// The root itself is always treated as a named container, so a root
    /// with no children yields zero leaves.
    pub fn walk<F>(&self, root: &dyn Module, pid: &str, mut attach: F) -> Result<usize>
    where
        F: FnMut(&dyn Module, QualifiedName),
    {
        if root.type_name().is_empty() {
            return Err(Error::InvalidModel("root module has an empty type name".to_string()));
        }
        let children = root.children();
        if children.is_empty() {
            debug!("'{}' has no sub-modules to instrument", root.type_name());
        }

        let prefix = QualifiedName::root(pid, root.type_name());
        let mut leaves = 0;
        for (_, child) in children {
            self.visit(child, &prefix, &mut attach, &mut leaves);
        }
        Ok(leaves)
    }

    fn visit<F>(
        &self,
        node: &dyn Module,
        parent: &QualifiedName,
        attach: &mut F,
        leaves: &mut usize,
    ) where
        F: FnMut(&dyn Module, QualifiedName),
    {
        let tag = node.type_name();
        match self.classifier.classify(tag) {
            NodeKind::NamedContainer => {
                let prefix = parent.child(tag);
                for (_, child) in node.children() {
                    self.visit(child, &prefix, attach, leaves);
                }
            }
            NodeKind::IndexedContainer => {
                let shared = parent.child(tag);
                for (index, (_, element)) in node.children().into_iter().enumerate() {
                    if self.naming.index_list_elements {
                        let prefix = parent.child(&format!("{}[{}]", tag, index));
                        self.visit(element, &prefix, attach, leaves);
                    } else {
                        self.visit(element, &shared, attach, leaves);
                    }
                }
            }
            NodeKind::Leaf => {
                if !node.children().is_empty() {
                    debug!("'{}' is not a registered container; instrumenting it as a leaf", tag);
                }
                attach(node, parent.child(tag));
                *leaves += 1;
            }
        }
    }

    /// Qualified names of all leaves, in walk order
    pub fn leaf_names(&self, root: &dyn Module, pid: &str) -> Result<Vec<QualifiedName>> {
        let mut names = Vec::new();
        self.walk(root, pid, |_, name| names.push(name))?;
        Ok(names)
    }
}
