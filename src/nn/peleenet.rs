//! PeleeNet: a DenseNet variant with a stem block, two-way dense layers
//! and 1x1 transition layers.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::autograd::{Tape, Var};
use crate::error::{Error, Result};
use crate::module::{invoke, HookSet, Module};
use crate::nn::container::{ModuleList, Sequential};
use crate::nn::functional::{cat_channels, flatten, global_avg_pool};
use crate::nn::layers::{AvgPool2d, BatchNorm2d, Conv2d, Linear, MaxPool2d, ReLU};

/// Architecture hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeleeNetConfig {
    pub growth_rate: usize,
    /// Dense layers per stage
    pub block_config: Vec<usize>,
    pub num_init_features: usize,
    /// Bottleneck multiplier per stage
    pub bottleneck_width: Vec<usize>,
    pub num_classes: usize,
}

impl Default for PeleeNetConfig {
    fn default() -> Self {
        Self {
            growth_rate: 32,
            block_config: vec![3, 4, 8, 6],
            num_init_features: 32,
            bottleneck_width: vec![1, 2, 4, 4],
            num_classes: 1000,
        }
    }
}

impl PeleeNetConfig {
    /// Two-stage network small enough for tests and demos
    pub fn tiny(num_classes: usize) -> Self {
        Self {
            growth_rate: 8,
            block_config: vec![1, 1],
            num_init_features: 8,
            bottleneck_width: vec![1, 2],
            num_classes,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_config.is_empty() {
            return Err(Error::InvalidConfig(
                "block_config must name at least one stage".to_string(),
            ));
        }
        if self.block_config.len() != self.bottleneck_width.len() {
            return Err(Error::InvalidConfig(format!(
                "{} stages but {} bottleneck widths",
                self.block_config.len(),
                self.bottleneck_width.len()
            )));
        }
        if self.growth_rate < 2 || self.num_init_features < 2 || self.num_classes == 0 {
            return Err(Error::InvalidConfig(
                "growth_rate and num_init_features must be >= 2, num_classes >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Conv, batch norm and an optional ReLU
pub struct BasicConv2d {
    conv: Conv2d,
    norm: BatchNorm2d,
    relu: Option<ReLU>,
    hooks: HookSet,
}

impl BasicConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: bool,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            conv: Conv2d::new(in_channels, out_channels, kernel_size, stride, padding, false, rng),
            norm: BatchNorm2d::new(out_channels),
            relu: activation.then(ReLU::new),
            hooks: HookSet::new(),
        }
    }
}

impl Module for BasicConv2d {
    fn type_name(&self) -> &str {
        "BasicConv2d"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let x = invoke(&self.conv, input, tape)?;
        let x = invoke(&self.norm, &x, tape)?;
        match &self.relu {
            Some(relu) => invoke(relu, &x, tape),
            None => Ok(x),
        }
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        let mut children: Vec<(String, &dyn Module)> = vec![
            ("conv".to_string(), &self.conv as &dyn Module),
            ("norm".to_string(), &self.norm as &dyn Module),
        ];
        if let Some(relu) = &self.relu {
            children.push(("relu".to_string(), relu as &dyn Module));
        }
        children
    }
}

/// Stride-4 stem: a strided conv, then a conv branch and a pooling branch joined by a 1x1 conv
pub struct StemBlock {
    stem1: BasicConv2d,
    stem2a: BasicConv2d,
    stem2b: BasicConv2d,
    stem2p: MaxPool2d,
    stem3: BasicConv2d,
    hooks: HookSet,
}

impl StemBlock {
    pub fn new(in_channels: usize, num_init_features: usize, rng: &mut StdRng) -> Self {
        let half = (num_init_features / 2).max(1);
        Self {
            stem1: BasicConv2d::new(in_channels, num_init_features, 3, 2, 1, true, rng),
            stem2a: BasicConv2d::new(num_init_features, half, 1, 1, 0, true, rng),
            stem2b: BasicConv2d::new(half, num_init_features, 3, 2, 1, true, rng),
            stem2p: MaxPool2d::new(2, 2),
            stem3: BasicConv2d::new(2 * num_init_features, num_init_features, 1, 1, 0, true, rng),
            hooks: HookSet::new(),
        }
    }
}

impl Module for StemBlock {
    fn type_name(&self) -> &str {
        "StemBlock"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let out = invoke(&self.stem1, input, tape)?;
        let branch2 = invoke(&self.stem2a, &out, tape)?;
        let branch2 = invoke(&self.stem2b, &branch2, tape)?;
        let branch1 = invoke(&self.stem2p, &out, tape)?;
        let joined = cat_channels(tape, &[&branch1, &branch2])?;
        invoke(&self.stem3, &joined, tape)
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![
            ("stem1".to_string(), &self.stem1 as &dyn Module),
            ("stem2a".to_string(), &self.stem2a as &dyn Module),
            ("stem2b".to_string(), &self.stem2b as &dyn Module),
            ("stem2p".to_string(), &self.stem2p as &dyn Module),
            ("stem3".to_string(), &self.stem3 as &dyn Module),
        ]
    }
}

/// Two-way dense layer: a 3x3 branch and a stacked 3x3 branch, both
/// concatenated onto the input
pub struct DenseLayer {
    branch1a: BasicConv2d,
    branch1b: BasicConv2d,
    branch2a: BasicConv2d,
    branch2b: BasicConv2d,
    branch2c: BasicConv2d,
    hooks: HookSet,
}

impl DenseLayer {
    pub fn new(
        num_input_features: usize,
        growth_rate: usize,
        bottleneck_width: usize,
        rng: &mut StdRng,
    ) -> Self {
        let half = (growth_rate / 2).max(1);
        let mut inter = half * bottleneck_width / 4 * 4;
        if inter > num_input_features / 2 {
            inter = num_input_features / 8 * 4;
        }
        let inter = inter.max(1);
        Self {
            branch1a: BasicConv2d::new(num_input_features, inter, 1, 1, 0, true, rng),
            branch1b: BasicConv2d::new(inter, half, 3, 1, 1, true, rng),
            branch2a: BasicConv2d::new(num_input_features, inter, 1, 1, 0, true, rng),
            branch2b: BasicConv2d::new(inter, half, 3, 1, 1, true, rng),
            branch2c: BasicConv2d::new(half, half, 3, 1, 1, true, rng),
            hooks: HookSet::new(),
        }
    }

    /// Channels this layer adds to its input
    pub fn added_features(growth_rate: usize) -> usize {
        2 * (growth_rate / 2).max(1)
    }
}

impl Module for DenseLayer {
    fn type_name(&self) -> &str {
        "DenseLayer"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let branch1 = invoke(&self.branch1a, input, tape)?;
        let branch1 = invoke(&self.branch1b, &branch1, tape)?;
        let branch2 = invoke(&self.branch2a, input, tape)?;
        let branch2 = invoke(&self.branch2b, &branch2, tape)?;
        let branch2 = invoke(&self.branch2c, &branch2, tape)?;
        cat_channels(tape, &[input, &branch1, &branch2])
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![
            ("branch1a".to_string(), &self.branch1a as &dyn Module),
            ("branch1b".to_string(), &self.branch1b as &dyn Module),
            ("branch2a".to_string(), &self.branch2a as &dyn Module),
            ("branch2b".to_string(), &self.branch2b as &dyn Module),
            ("branch2c".to_string(), &self.branch2c as &dyn Module),
        ]
    }
}

/// A stage of dense layers held in a [`ModuleList`]
pub struct DenseBlock {
    layers: ModuleList,
    hooks: HookSet,
}

impl DenseBlock {
    pub fn new(
        num_layers: usize,
        num_input_features: usize,
        bottleneck_width: usize,
        growth_rate: usize,
        rng: &mut StdRng,
    ) -> Self {
        let step = DenseLayer::added_features(growth_rate);
        let layers = (0..num_layers)
            .map(|i| {
                let in_features = num_input_features + i * step;
                Box::new(DenseLayer::new(in_features, growth_rate, bottleneck_width, rng))
                    as Box<dyn Module>
            })
            .collect();
        Self {
            layers,
            hooks: HookSet::new(),
        }
    }
}

impl Module for DenseBlock {
    fn type_name(&self) -> &str {
        "DenseBlock"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let mut x = input.clone();
        for layer in self.layers.iter() {
            x = invoke(layer, &x, tape)?;
        }
        Ok(x)
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![("layers".to_string(), &self.layers as &dyn Module)]
    }
}

/// 1x1 conv between stages, followed by 2x2 average pooling except after the last stage
pub struct TransitionBlock {
    conv: BasicConv2d,
    pool: Option<AvgPool2d>,
    hooks: HookSet,
}

impl TransitionBlock {
    pub fn new(num_features: usize, with_pooling: bool, rng: &mut StdRng) -> Self {
        Self {
            conv: BasicConv2d::new(num_features, num_features, 1, 1, 0, true, rng),
            pool: with_pooling.then(|| AvgPool2d::new(2, 2)),
            hooks: HookSet::new(),
        }
    }
}

impl Module for TransitionBlock {
    fn type_name(&self) -> &str {
        "TransitionBlock"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let x = invoke(&self.conv, input, tape)?;
        match &self.pool {
            Some(pool) => invoke(pool, &x, tape),
            None => Ok(x),
        }
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        let mut children: Vec<(String, &dyn Module)> =
            vec![("conv".to_string(), &self.conv as &dyn Module)];
        if let Some(pool) = &self.pool {
            children.push(("pool".to_string(), pool as &dyn Module));
        }
        children
    }
}

pub struct PeleeNet {
    features: Sequential,
    classifier: Linear,
    num_features: usize,
    hooks: HookSet,
}

impl PeleeNet {
    pub fn new(config: &PeleeNetConfig, rng: &mut StdRng) -> Result<Self> {
        config.validate()?;
        let mut features =
            Sequential::new().add("stemblock", StemBlock::new(3, config.num_init_features, rng));
        let mut num_features = config.num_init_features;
        let last = config.block_config.len() - 1;
        let stages = config.block_config.iter().zip(&config.bottleneck_width);
        for (i, (&num_layers, &width)) in stages.enumerate() {
            let block = DenseBlock::new(num_layers, num_features, width, config.growth_rate, rng);
            features.push(format!("denseblock{}", i + 1), Box::new(block));
            num_features += num_layers * DenseLayer::added_features(config.growth_rate);
            features.push(
                format!("transition{}", i + 1),
                Box::new(TransitionBlock::new(num_features, i != last, rng)),
            );
        }
        Ok(Self {
            features,
            classifier: Linear::new(num_features, config.num_classes, rng),
            num_features,
            hooks: HookSet::new(),
        })
    }

    /// Width of the feature vector fed to the classifier
    pub fn num_features(&self) -> usize {
        self.num_features
    }
}

impl Module for PeleeNet {
    fn type_name(&self) -> &str {
        "PeleeNet"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let features = invoke(&self.features, input, tape)?;
        let pooled = global_avg_pool(tape, &features)?;
        let flat = flatten(tape, &pooled)?;
        invoke(&self.classifier, &flat, tape)
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![
            ("features".to_string(), &self.features as &dyn Module),
            ("classifier".to_string(), &self.classifier as &dyn Module),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{named_buffers, named_parameters, parameter_count};
    use crate::tensor::Tensor;
    use ndarray::{ArrayD, IxDyn};
    use rand::SeedableRng;

    #[test]
    fn test_tiny_forward_and_backward() {
        let mut rng = StdRng::seed_from_u64(11);
        let net = PeleeNet::new(&PeleeNetConfig::tiny(5), &mut rng).unwrap();
        // 8 init + 1 layer * 8 + 1 layer * 8
        assert_eq!(net.num_features(), 24);

        let mut tape = Tape::new();
        let x = tape.input(Tensor::from_array(ArrayD::from_elem(IxDyn(&[2, 3, 16, 16]), 0.5)));
        let logits = invoke(&net, &x, &mut tape).unwrap();
        assert_eq!(logits.shape(), &[2, 5]);
        tape.backward(&logits, ArrayD::ones(IxDyn(&[2, 5]))).unwrap();

        let params = named_parameters(&net);
        assert!(params.iter().all(|(_, p)| p.grad().is_some()));
        assert_eq!(params[0].0, "features.stemblock.stem1.conv.weight");
        assert!(parameter_count(&net) > 0);
        assert!(named_buffers(&net).iter().any(|(n, _)| n.ends_with("norm.running_var")));
    }

    #[test]
    fn test_odd_input_sizes_line_up_in_stem() {
        let mut rng = StdRng::seed_from_u64(2);
        let stem = StemBlock::new(3, 8, &mut rng);
        let mut tape = Tape::no_grad();
        let x = tape.input(Tensor::new(&[1, 3, 30, 30], crate::tensor::DataType::Float32));
        assert_eq!(invoke(&stem, &x, &mut tape).unwrap().shape(), &[1, 8, 8, 8]);
    }

    #[test]
    fn test_mismatched_stage_config_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = PeleeNetConfig {
            bottleneck_width: vec![1],
            ..PeleeNetConfig::tiny(3)
        };
        assert!(matches!(PeleeNet::new(&config, &mut rng), Err(Error::InvalidConfig(_))));
    }
}
