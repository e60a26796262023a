//! Leaf layers of the reference network.

use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::{Array1, ArrayD, Ix1, Ix2, Ix4, IxDyn};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::autograd::{Tape, Var};
use crate::error::Result;
use crate::module::{HookSet, Module};
use crate::nn::functional as F;
use crate::tensor::{Parameter, Tensor};

/// He-normal initialisation for a weight with `fan_in` inputs per output
fn kaiming_normal(shape: &[usize], fan_in: usize, rng: &mut StdRng) -> ArrayD<f32> {
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.sample::<f32, _>(StandardNormal) * std)
}

pub struct Conv2d {
    weight: Parameter,
    bias: Option<Parameter>,
    stride: usize,
    padding: usize,
    hooks: HookSet,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        rng: &mut StdRng,
    ) -> Self {
        let shape = [out_channels, in_channels, kernel_size, kernel_size];
        Self {
            weight: Parameter::new(kaiming_normal(
                &shape,
                in_channels * kernel_size * kernel_size,
                rng,
            )),
            bias: bias.then(|| Parameter::new(ArrayD::zeros(IxDyn(&[out_channels])))),
            stride,
            padding,
            hooks: HookSet::new(),
        }
    }
}

impl Module for Conv2d {
    fn type_name(&self) -> &str {
        "Conv2d"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let x = input.data().view().into_dimensionality::<Ix4>()?;
        let weight = self.weight.value().into_dimensionality::<Ix4>()?;
        let bias = match &self.bias {
            Some(b) => Some(b.value().into_dimensionality::<Ix1>()?),
            None => None,
        };
        let (output, cache) = F::conv2d_forward(
            x,
            weight.view(),
            bias.as_ref().map(|b| b.view()),
            self.stride,
            self.padding,
        )?;

        let (weight_param, bias_param) = (&self.weight, self.bias.as_ref());
        Ok(tape.record(Tensor::from_array(output.into_dyn()), &[input], move |grad| {
            let grad = grad.view().into_dimensionality::<Ix4>()?;
            let (d_input, d_weight, d_bias) = F::conv2d_backward(grad, weight.view(), &cache)?;
            weight_param.accumulate_grad(&d_weight.into_dyn());
            if let Some(bias) = bias_param {
                bias.accumulate_grad(&d_bias.into_dyn());
            }
            Ok(vec![d_input.into_dyn()])
        }))
    }

    fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        let mut params = vec![("weight", &self.weight)];
        if let Some(bias) = &self.bias {
            params.push(("bias", bias));
        }
        params
    }

    fn weight(&self) -> Option<&Parameter> {
        Some(&self.weight)
    }

    fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }
}

/// Batch normalization over the channel axis of NCHW input
pub struct BatchNorm2d {
    weight: Parameter,
    bias: Parameter,
    running_mean: Parameter,
    running_var: Parameter,
    eps: f32,
    momentum: f32,
    training: AtomicBool,
    hooks: HookSet,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> Self {
        let dim = IxDyn(&[num_features]);
        Self {
            weight: Parameter::new(ArrayD::ones(dim.clone())),
            bias: Parameter::new(ArrayD::zeros(dim.clone())),
            running_mean: Parameter::buffer(ArrayD::zeros(dim.clone())),
            running_var: Parameter::buffer(ArrayD::ones(dim)),
            eps: 1e-5,
            momentum: 0.1,
            training: AtomicBool::new(true),
            hooks: HookSet::new(),
        }
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn update_running_stats(&self, mean: &Array1<f32>, var: &Array1<f32>, count: usize) {
        let momentum = self.momentum;
        let correction = if count > 1 { count as f32 / (count - 1) as f32 } else { 1.0 };
        self.running_mean.update(|rm| {
            rm.zip_mut_with(&mean.view().into_dyn(), |r, &m| {
                *r = (1.0 - momentum) * *r + momentum * m
            })
        });
        self.running_var.update(|rv| {
            rv.zip_mut_with(&var.view().into_dyn(), |r, &v| {
                *r = (1.0 - momentum) * *r + momentum * v * correction
            })
        });
    }
}

impl Module for BatchNorm2d {
    fn type_name(&self) -> &str {
        "BatchNorm2d"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let x = input.data().view().into_dimensionality::<Ix4>()?;
        let gamma = self.weight.value().into_dimensionality::<Ix1>()?;
        let beta = self.bias.value().into_dimensionality::<Ix1>()?;
        let training = self.is_training();
        let (mean, var) = if training {
            let (mean, var) = F::channel_statistics(x);
            let (n, _, h, w) = x.dim();
            self.update_running_stats(&mean, &var, n * h * w);
            (mean, var)
        } else {
            (
                self.running_mean.value().into_dimensionality::<Ix1>()?,
                self.running_var.value().into_dimensionality::<Ix1>()?,
            )
        };
        let (output, cache) = F::batch_norm_forward(
            x,
            gamma.view(),
            beta.view(),
            mean.view(),
            var.view(),
            self.eps,
            training,
        )?;

        let (weight_param, bias_param) = (&self.weight, &self.bias);
        Ok(tape.record(Tensor::from_array(output.into_dyn()), &[input], move |grad| {
            let grad = grad.view().into_dimensionality::<Ix4>()?;
            let (d_input, d_gamma, d_beta) = F::batch_norm_backward(grad, gamma.view(), &cache);
            weight_param.accumulate_grad(&d_gamma.into_dyn());
            bias_param.accumulate_grad(&d_beta.into_dyn());
            Ok(vec![d_input.into_dyn()])
        }))
    }

    fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        vec![("weight", &self.weight), ("bias", &self.bias)]
    }

    fn buffers(&self) -> Vec<(&'static str, &Parameter)> {
        vec![("running_mean", &self.running_mean), ("running_var", &self.running_var)]
    }

    fn weight(&self) -> Option<&Parameter> {
        Some(&self.weight)
    }

    fn bias(&self) -> Option<&Parameter> {
        Some(&self.bias)
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct ReLU {
    hooks: HookSet,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for ReLU {
    fn type_name(&self) -> &str {
        "ReLU"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let output = F::relu_forward(input.data());
        let saved = input.data().clone();
        Ok(tape.record(Tensor::from_array(output), &[input], move |grad| {
            Ok(vec![F::relu_backward(grad, &saved)])
        }))
    }
}

/// Max pooling with ceil-mode output size
pub struct MaxPool2d {
    kernel_size: usize,
    stride: usize,
    hooks: HookSet,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
            hooks: HookSet::new(),
        }
    }
}

impl Module for MaxPool2d {
    fn type_name(&self) -> &str {
        "MaxPool2d"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let x = input.data().view().into_dimensionality::<Ix4>()?;
        let (_, _, height, width) = x.dim();
        let (output, argmax) = F::max_pool2d_forward(x, self.kernel_size, self.stride)?;
        Ok(tape.record(Tensor::from_array(output.into_dyn()), &[input], move |grad| {
            let grad = grad.view().into_dimensionality::<Ix4>()?;
            Ok(vec![F::max_pool2d_backward(grad, &argmax, height, width).into_dyn()])
        }))
    }
}

pub struct AvgPool2d {
    kernel_size: usize,
    stride: usize,
    hooks: HookSet,
}

impl AvgPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
            hooks: HookSet::new(),
        }
    }
}

impl Module for AvgPool2d {
    fn type_name(&self) -> &str {
        "AvgPool2d"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let x = input.data().view().into_dimensionality::<Ix4>()?;
        let (_, _, height, width) = x.dim();
        let output = F::avg_pool2d_forward(x, self.kernel_size, self.stride)?;
        let (kernel, stride) = (self.kernel_size, self.stride);
        Ok(tape.record(Tensor::from_array(output.into_dyn()), &[input], move |grad| {
            let grad = grad.view().into_dimensionality::<Ix4>()?;
            Ok(vec![F::avg_pool2d_backward(grad, kernel, stride, height, width).into_dyn()])
        }))
    }
}

/// Fully connected layer on `(N, IN)` input
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
    hooks: HookSet,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: Parameter::new(kaiming_normal(&[out_features, in_features], in_features, rng)),
            bias: Parameter::new(ArrayD::zeros(IxDyn(&[out_features]))),
            hooks: HookSet::new(),
        }
    }
}

impl Module for Linear {
    fn type_name(&self) -> &str {
        "Linear"
    }

    fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    fn forward<'a>(&'a self, input: &Var, tape: &mut Tape<'a>) -> Result<Var> {
        let x = F::as_matrix(input.data())?;
        let weight = self.weight.value().into_dimensionality::<Ix2>()?;
        let bias = self.bias.value().into_dimensionality::<Ix1>()?;
        let output = F::linear_forward(x, weight.view(), Some(bias.view()))?;

        let saved = x.to_owned();
        let (weight_param, bias_param) = (&self.weight, &self.bias);
        Ok(tape.record(Tensor::from_array(output.into_dyn()), &[input], move |grad| {
            let grad = F::as_matrix(grad)?;
            let (d_input, d_weight, d_bias) = F::linear_backward(grad, saved.view(), weight.view());
            weight_param.accumulate_grad(&d_weight.into_dyn());
            bias_param.accumulate_grad(&d_bias.into_dyn());
            Ok(vec![d_input.into_dyn()])
        }))
    }

    fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        vec![("weight", &self.weight), ("bias", &self.bias)]
    }

    fn weight(&self) -> Option<&Parameter> {
        Some(&self.weight)
    }

    fn bias(&self) -> Option<&Parameter> {
        Some(&self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::invoke;
    use ndarray::Array;
    use rand::SeedableRng;

    fn image(shape: &[usize]) -> Tensor {
        let len = shape.iter().product();
        let values = (0..len).map(|i| ((i as f32) * 0.61).cos()).collect();
        Tensor::from_shape_vec(shape, values).unwrap()
    }

    #[test]
    fn test_conv_accumulates_parameter_gradients() {
        let mut rng = StdRng::seed_from_u64(7);
        let conv = Conv2d::new(3, 4, 3, 1, 1, true, &mut rng);
        let mut tape = Tape::new();
        let x = tape.input(image(&[2, 3, 5, 5]));
        let y = invoke(&conv, &x, &mut tape).unwrap();
        assert_eq!(y.shape(), &[2, 4, 5, 5]);
        tape.backward(&y, ArrayD::ones(IxDyn(&[2, 4, 5, 5]))).unwrap();

        let d_bias = conv.bias().unwrap().grad().unwrap();
        assert_eq!(d_bias[[0]], 50.0);
        assert_eq!(conv.weight().unwrap().grad().unwrap().shape(), &[4, 3, 3, 3]);
    }

    #[test]
    fn test_batch_norm_switches_statistics() {
        let bn = BatchNorm2d::new(2);
        let mut tape = Tape::no_grad();
        let x = tape.input(image(&[2, 2, 3, 3]));
        invoke(&bn, &x, &mut tape).unwrap();
        let running_mean = bn.buffers()[0].1.value();
        assert!(running_mean.iter().any(|&m| m != 0.0));

        bn.set_training(false);
        assert!(!bn.is_training());
        let y = invoke(&bn, &x, &mut tape).unwrap();
        let running_var = bn.buffers()[1].1.value()[[0]];
        let direct = (x.data()[[0, 0, 0, 0]] - running_mean[[0]]) / (running_var + 1e-5).sqrt();
        assert!((y.data()[[0, 0, 0, 0]] - direct).abs() < 1e-5);
    }

    #[test]
    fn test_linear_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let fc = Linear::new(6, 3, &mut rng);
        let mut tape = Tape::new();
        let x = tape.input(image(&[4, 6]));
        let y = invoke(&fc, &x, &mut tape).unwrap();
        assert_eq!(y.shape(), &[4, 3]);
        tape.backward(&y, Array::ones((4, 3)).into_dyn()).unwrap();
        assert_eq!(fc.bias().unwrap().grad().unwrap()[[2]], 4.0);
    }

    #[test]
    fn test_pool_layers() {
        let (max_pool, avg_pool, activation) =
            (MaxPool2d::new(2, 2), AvgPool2d::new(2, 2), ReLU::new());
        let mut tape = Tape::no_grad();
        let x = tape.input(image(&[1, 2, 6, 6]));
        let max = invoke(&max_pool, &x, &mut tape).unwrap();
        let avg = invoke(&avg_pool, &x, &mut tape).unwrap();
        assert_eq!(max.shape(), &[1, 2, 3, 3]);
        assert_eq!(avg.shape(), &[1, 2, 3, 3]);
        assert!(max.data().iter().zip(avg.data().iter()).all(|(m, a)| m >= a));
        let relu = invoke(&activation, &x, &mut tape).unwrap();
        assert!(relu.data().iter().all(|&v| v >= 0.0));
    }
}
