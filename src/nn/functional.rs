//! # Layer kernels
//!
//! Forward and backward math for the layers of the reference network, on
//! NCHW `f32` arrays. Convolution uses the im2col + GEMM strategy: each
//! image is unfolded into a `(C*KH*KW, OH*OW)` column buffer and multiplied
//! by the `(OC, C*KH*KW)` kernel matrix. The column buffers are kept for
//! the backward pass.
//!
//! The tape-level helpers at the bottom (`cat_channels`, `global_avg_pool`,
//! `flatten`) are functional ops used inside `forward` bodies; they are not
//! modules and carry no hooks.

use ndarray::linalg::general_mat_mul;
use ndarray::{
    Array, Array1, Array2, Array3, Array4, ArrayD, ArrayView1, ArrayView2, ArrayView3, ArrayView4,
    ArrayViewD, Axis, Ix2, Ix4, Slice, Zip,
};

use crate::autograd::{Tape, Var};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Output length of a sliding window along one axis (floor mode)
pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<usize> {
    let padded = input + 2 * padding;
    if stride == 0 || kernel == 0 || padded < kernel {
        return Err(Error::InvalidShape(format!(
            "window {} with stride {} does not fit input {} (padding {})",
            kernel, stride, input, padding
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// Output length of an unpadded pooling window in ceil mode.
///
/// The last window may hang over the edge but always starts inside the input.
pub fn pool_output_size_ceil(input: usize, kernel: usize, stride: usize) -> Result<usize> {
    if stride == 0 || kernel == 0 || input < kernel {
        return Err(Error::InvalidShape(format!(
            "pooling window {} with stride {} does not fit input {}",
            kernel, stride, input
        )));
    }
    let mut size = (input - kernel + stride - 1) / stride + 1;
    if (size - 1) * stride >= input {
        size -= 1;
    }
    Ok(size)
}

/// Copy any view into a standard-layout matrix, keeping logical order
fn matrix(view: ArrayViewD<f32>, rows: usize, cols: usize) -> Result<Array2<f32>> {
    Ok(Array2::from_shape_vec((rows, cols), view.iter().copied().collect())?)
}

#[derive(Debug, Clone, Copy)]
struct Window {
    kernel_h: usize,
    kernel_w: usize,
    stride: usize,
    padding: usize,
    out_h: usize,
    out_w: usize,
}

impl Window {
    /// Input coordinate covered by kernel offset `k` at output position `o`
    fn source(&self, o: usize, k: usize, limit: usize) -> Option<usize> {
        let pos = (o * self.stride + k) as isize - self.padding as isize;
        if pos >= 0 && (pos as usize) < limit {
            Some(pos as usize)
        } else {
            None
        }
    }
}

/// Unfold one CHW image into a `(C*KH*KW, OH*OW)` column buffer
fn im2col(image: ArrayView3<f32>, window: &Window) -> Array2<f32> {
    let (channels, height, width) = image.dim();
    let mut cols = Array2::zeros((
        channels * window.kernel_h * window.kernel_w,
        window.out_h * window.out_w,
    ));
    for c in 0..channels {
        for kh in 0..window.kernel_h {
            for kw in 0..window.kernel_w {
                let row = (c * window.kernel_h + kh) * window.kernel_w + kw;
                for oh in 0..window.out_h {
                    let Some(ih) = window.source(oh, kh, height) else {
                        continue;
                    };
                    for ow in 0..window.out_w {
                        if let Some(iw) = window.source(ow, kw, width) {
                            cols[[row, oh * window.out_w + ow]] = image[[c, ih, iw]];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Fold a column buffer back into a CHW image, summing overlaps
fn col2im(
    cols: &Array2<f32>,
    channels: usize,
    height: usize,
    width: usize,
    window: &Window,
) -> Array3<f32> {
    let mut image = Array3::zeros((channels, height, width));
    for c in 0..channels {
        for kh in 0..window.kernel_h {
            for kw in 0..window.kernel_w {
                let row = (c * window.kernel_h + kh) * window.kernel_w + kw;
                for oh in 0..window.out_h {
                    let Some(ih) = window.source(oh, kh, height) else {
                        continue;
                    };
                    for ow in 0..window.out_w {
                        if let Some(iw) = window.source(ow, kw, width) {
                            image[[c, ih, iw]] += cols[[row, oh * window.out_w + ow]];
                        }
                    }
                }
            }
        }
    }
    image
}

/// Saved state of a convolution forward pass
#[derive(Debug, Clone)]
pub struct ConvCache {
    cols: Vec<Array2<f32>>,
    input_dim: (usize, usize, usize, usize),
    window: Window,
}

/// 2D convolution (square stride/padding, no groups, no dilation)
pub fn conv2d_forward(
    input: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
    stride: usize,
    padding: usize,
) -> Result<(Array4<f32>, ConvCache)> {
    let (batch, channels, height, width) = input.dim();
    let (out_channels, kernel_channels, kernel_h, kernel_w) = weight.dim();
    if kernel_channels != channels {
        return Err(Error::InvalidShape(format!(
            "convolution expects {} input channels, got {}",
            kernel_channels, channels
        )));
    }
    if let Some(b) = bias.as_ref() {
        if b.len() != out_channels {
            return Err(Error::InvalidShape(format!(
                "bias has {} values for {} output channels",
                b.len(),
                out_channels
            )));
        }
    }

    let window = Window {
        kernel_h,
        kernel_w,
        stride,
        padding,
        out_h: conv_output_size(height, kernel_h, stride, padding)?,
        out_w: conv_output_size(width, kernel_w, stride, padding)?,
    };
    let patch = channels * kernel_h * kernel_w;
    let spatial = window.out_h * window.out_w;
    let kernel_matrix = matrix(weight.into_dyn(), out_channels, patch)?;

    let mut output = Array4::zeros((batch, out_channels, window.out_h, window.out_w));
    let mut cols = Vec::with_capacity(batch);
    for b in 0..batch {
        let col = im2col(input.index_axis(Axis(0), b), &window);
        let mut out_matrix = Array2::zeros((out_channels, spatial));
        general_mat_mul(1.0, &kernel_matrix, &col, 0.0, &mut out_matrix);
        if let Some(bias) = bias.as_ref() {
            for (mut row, &value) in out_matrix.rows_mut().into_iter().zip(bias.iter()) {
                row += value;
            }
        }
        let out_image = out_matrix.into_shape((out_channels, window.out_h, window.out_w))?;
        output.index_axis_mut(Axis(0), b).assign(&out_image);
        cols.push(col);
    }

    Ok((
        output,
        ConvCache {
            cols,
            input_dim: (batch, channels, height, width),
            window,
        },
    ))
}

/// Gradients of a convolution: `(d_input, d_weight, d_bias)`
pub fn conv2d_backward(
    grad: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    cache: &ConvCache,
) -> Result<(Array4<f32>, Array4<f32>, Array1<f32>)> {
    let (batch, channels, height, width) = cache.input_dim;
    let (out_channels, _, kernel_h, kernel_w) = weight.dim();
    let patch = channels * kernel_h * kernel_w;
    let spatial = cache.window.out_h * cache.window.out_w;
    let kernel_matrix = matrix(weight.into_dyn(), out_channels, patch)?;

    let mut d_weight = Array2::<f32>::zeros((out_channels, patch));
    let mut d_bias = Array1::<f32>::zeros(out_channels);
    let mut d_input = Array4::<f32>::zeros((batch, channels, height, width));
    for (b, col) in cache.cols.iter().enumerate() {
        let g = matrix(grad.index_axis(Axis(0), b).into_dyn(), out_channels, spatial)?;
        general_mat_mul(1.0, &g, &col.t(), 1.0, &mut d_weight);
        d_bias += &g.sum_axis(Axis(1));
        let d_cols = kernel_matrix.t().dot(&g);
        let image = col2im(&d_cols, channels, height, width, &cache.window);
        d_input.index_axis_mut(Axis(0), b).assign(&image);
    }
    let d_weight = d_weight.into_shape((out_channels, channels, kernel_h, kernel_w))?;
    Ok((d_input, d_weight, d_bias))
}

/// Saved state of a batch normalization forward pass
#[derive(Debug, Clone)]
pub struct BatchNormCache {
    normalized: Array4<f32>,
    inv_std: Array1<f32>,
    batch_statistics: bool,
}

/// Per-channel statistics of a batch: `(mean, biased variance)`
pub fn channel_statistics(input: ArrayView4<f32>) -> (Array1<f32>, Array1<f32>) {
    let (batch, channels, height, width) = input.dim();
    let count = (batch * height * width).max(1) as f32;
    let mut mean = Array1::zeros(channels);
    let mut var = Array1::zeros(channels);
    for c in 0..channels {
        let plane = input.index_axis(Axis(1), c);
        let mu = plane.sum() / count;
        mean[c] = mu;
        var[c] = plane.fold(0.0, |acc, &v| acc + (v - mu) * (v - mu)) / count;
    }
    (mean, var)
}

/// Normalize with the given statistics, then scale and shift.
///
/// `batch_statistics` marks that `mean`/`var` came from the input itself,
/// which changes the backward pass.
pub fn batch_norm_forward(
    input: ArrayView4<f32>,
    gamma: ArrayView1<f32>,
    beta: ArrayView1<f32>,
    mean: ArrayView1<f32>,
    var: ArrayView1<f32>,
    eps: f32,
    batch_statistics: bool,
) -> Result<(Array4<f32>, BatchNormCache)> {
    let channels = input.dim().1;
    if gamma.len() != channels
        || beta.len() != channels
        || mean.len() != channels
        || var.len() != channels
    {
        return Err(Error::InvalidShape(format!(
            "batch norm over {} channels got statistics of length {}",
            channels,
            gamma.len()
        )));
    }
    let inv_std = var.mapv(|v| 1.0 / (v + eps).sqrt());
    let mut normalized = Array4::zeros(input.dim());
    let mut output = Array4::zeros(input.dim());
    for c in 0..channels {
        let (mu, inv, g, b) = (mean[c], inv_std[c], gamma[c], beta[c]);
        Zip::from(normalized.index_axis_mut(Axis(1), c))
            .and(output.index_axis_mut(Axis(1), c))
            .and(input.index_axis(Axis(1), c))
            .for_each(|n, o, &x| {
                *n = (x - mu) * inv;
                *o = *n * g + b;
            });
    }
    Ok((
        output,
        BatchNormCache {
            normalized,
            inv_std,
            batch_statistics,
        },
    ))
}

/// Gradients of batch normalization: `(d_input, d_gamma, d_beta)`
pub fn batch_norm_backward(
    grad: ArrayView4<f32>,
    gamma: ArrayView1<f32>,
    cache: &BatchNormCache,
) -> (Array4<f32>, Array1<f32>, Array1<f32>) {
    let (batch, channels, height, width) = grad.dim();
    let count = (batch * height * width).max(1) as f32;
    let mut d_input = Array4::zeros(grad.dim());
    let mut d_gamma = Array1::zeros(channels);
    let mut d_beta = Array1::zeros(channels);
    for c in 0..channels {
        let g = grad.index_axis(Axis(1), c);
        let xhat = cache.normalized.index_axis(Axis(1), c);
        let sum_g = g.sum();
        let sum_gx = (&g * &xhat).sum();
        d_gamma[c] = sum_gx;
        d_beta[c] = sum_g;

        let scale = gamma[c] * cache.inv_std[c];
        let plane = if cache.batch_statistics {
            (&g * count - sum_g - &xhat * sum_gx) * (scale / count)
        } else {
            &g * scale
        };
        d_input.index_axis_mut(Axis(1), c).assign(&plane);
    }
    (d_input, d_gamma, d_beta)
}

pub fn relu_forward(input: &ArrayD<f32>) -> ArrayD<f32> {
    input.mapv(|v| v.max(0.0))
}

pub fn relu_backward(grad: &ArrayD<f32>, input: &ArrayD<f32>) -> ArrayD<f32> {
    let mut d_input = grad.clone();
    Zip::from(&mut d_input).and(input).for_each(|d, &x| {
        if x <= 0.0 {
            *d = 0.0;
        }
    });
    d_input
}

/// Max pooling in ceil mode; also returns the flat `h*w` index of each maximum
pub fn max_pool2d_forward(
    input: ArrayView4<f32>,
    kernel: usize,
    stride: usize,
) -> Result<(Array4<f32>, Array4<usize>)> {
    let (batch, channels, height, width) = input.dim();
    let out_h = pool_output_size_ceil(height, kernel, stride)?;
    let out_w = pool_output_size_ceil(width, kernel, stride)?;
    let mut output = Array4::zeros((batch, channels, out_h, out_w));
    let mut argmax = Array4::zeros((batch, channels, out_h, out_w));
    for b in 0..batch {
        for c in 0..channels {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_idx = 0;
                    for ih in oh * stride..(oh * stride + kernel).min(height) {
                        for iw in ow * stride..(ow * stride + kernel).min(width) {
                            let v = input[[b, c, ih, iw]];
                            if v > best {
                                best = v;
                                best_idx = ih * width + iw;
                            }
                        }
                    }
                    output[[b, c, oh, ow]] = best;
                    argmax[[b, c, oh, ow]] = best_idx;
                }
            }
        }
    }
    Ok((output, argmax))
}

pub fn max_pool2d_backward(
    grad: ArrayView4<f32>,
    argmax: &Array4<usize>,
    height: usize,
    width: usize,
) -> Array4<f32> {
    let (batch, channels, _, _) = grad.dim();
    let mut d_input = Array4::zeros((batch, channels, height, width));
    Zip::indexed(grad).and(argmax).for_each(|(b, c, _, _), &g, &idx| {
        d_input[[b, c, idx / width, idx % width]] += g;
    });
    d_input
}

/// Average pooling without padding (floor mode)
pub fn avg_pool2d_forward(
    input: ArrayView4<f32>,
    kernel: usize,
    stride: usize,
) -> Result<Array4<f32>> {
    let (batch, channels, height, width) = input.dim();
    let out_h = conv_output_size(height, kernel, stride, 0)?;
    let out_w = conv_output_size(width, kernel, stride, 0)?;
    let area = (kernel * kernel) as f32;
    let mut output = Array4::zeros((batch, channels, out_h, out_w));
    Zip::indexed(&mut output).for_each(|(b, c, oh, ow), o| {
        let (h0, w0) = (oh * stride, ow * stride);
        let window = input.slice(ndarray::s![b, c, h0..h0 + kernel, w0..w0 + kernel]);
        *o = window.sum() / area;
    });
    Ok(output)
}

pub fn avg_pool2d_backward(
    grad: ArrayView4<f32>,
    kernel: usize,
    stride: usize,
    height: usize,
    width: usize,
) -> Array4<f32> {
    let (batch, channels, _, _) = grad.dim();
    let area = (kernel * kernel) as f32;
    let mut d_input = Array4::zeros((batch, channels, height, width));
    Zip::indexed(grad).for_each(|(b, c, oh, ow), &g| {
        let (h0, w0) = (oh * stride, ow * stride);
        d_input
            .slice_mut(ndarray::s![b, c, h0..h0 + kernel, w0..w0 + kernel])
            .mapv_inplace(|v| v + g / area);
    });
    d_input
}

/// `input @ weight^T + bias` for `(N, IN)` inputs and `(OUT, IN)` weights
pub fn linear_forward(
    input: ArrayView2<f32>,
    weight: ArrayView2<f32>,
    bias: Option<ArrayView1<f32>>,
) -> Result<Array2<f32>> {
    if input.ncols() != weight.ncols() {
        return Err(Error::InvalidShape(format!(
            "linear layer expects {} features, got {}",
            weight.ncols(),
            input.ncols()
        )));
    }
    let output = input.dot(&weight.t());
    Ok(match bias {
        Some(bias) => output + &bias,
        None => output,
    })
}

/// Gradients of a linear layer: `(d_input, d_weight, d_bias)`
pub fn linear_backward(
    grad: ArrayView2<f32>,
    input: ArrayView2<f32>,
    weight: ArrayView2<f32>,
) -> (Array2<f32>, Array2<f32>, Array1<f32>) {
    (grad.dot(&weight), grad.t().dot(&input), grad.sum_axis(Axis(0)))
}

/// Concatenate along the channel axis
pub fn cat_channels<'a>(tape: &mut Tape<'a>, inputs: &[&Var]) -> Result<Var> {
    if inputs.is_empty() || inputs.iter().any(|v| v.shape().len() < 2) {
        return Err(Error::InvalidShape(
            "channel concatenation needs at least one input of rank >= 2".to_string(),
        ));
    }
    let views: Vec<ArrayViewD<f32>> = inputs.iter().map(|v| v.data().view()).collect();
    let output = ndarray::concatenate(Axis(1), &views)?;
    let widths: Vec<usize> = inputs.iter().map(|v| v.shape()[1]).collect();
    Ok(tape.record(Tensor::from_array(output), inputs, move |grad| {
        let mut start = 0;
        let mut grads = Vec::with_capacity(widths.len());
        for width in widths {
            grads.push(grad.slice_axis(Axis(1), Slice::from(start..start + width)).to_owned());
            start += width;
        }
        Ok(grads)
    }))
}

/// Average over the spatial axes: `(N, C, H, W)` to `(N, C, 1, 1)`
pub fn global_avg_pool<'a>(tape: &mut Tape<'a>, input: &Var) -> Result<Var> {
    let x = input.data().view().into_dimensionality::<Ix4>()?;
    let (batch, channels, height, width) = x.dim();
    let area = (height * width).max(1) as f32;
    let pooled = Array::from_shape_fn((batch, channels, 1, 1), |(b, c, _, _)| {
        x.slice(ndarray::s![b, c, .., ..]).sum() / area
    });
    Ok(tape.record(Tensor::from_array(pooled.into_dyn()), &[input], move |grad| {
        let g = grad.view().into_dimensionality::<Ix4>()?;
        let d_input = Array4::from_shape_fn((batch, channels, height, width), |(b, c, _, _)| {
            g[[b, c, 0, 0]] / area
        });
        Ok(vec![d_input.into_dyn()])
    }))
}

/// Collapse every axis after the first
pub fn flatten<'a>(tape: &mut Tape<'a>, input: &Var) -> Result<Var> {
    let shape = input.shape().to_vec();
    let batch = shape.first().copied().unwrap_or(1);
    let features = shape.iter().skip(1).product();
    let output = input.tensor().reshape(&[batch, features])?;
    Ok(tape.record(output, &[input], move |grad| {
        let values: Vec<f32> = grad.iter().copied().collect();
        Ok(vec![ArrayD::from_shape_vec(shape, values)?])
    }))
}

/// View a tensor as a matrix, erroring on any other rank
pub fn as_matrix(data: &ArrayD<f32>) -> Result<ArrayView2<'_, f32>> {
    Ok(data.view().into_dimensionality::<Ix2>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array, IxDyn};

    fn seeded(shape: (usize, usize, usize, usize), offset: f32) -> Array4<f32> {
        Array::from_shape_fn(shape, |(b, c, h, w)| {
            ((b * 7 + c * 5 + h * 3 + w) as f32 * 0.37 + offset).sin()
        })
    }

    #[test]
    fn test_conv2d() {
        // Input: [batch=1, channels=1, height=3, width=3]
        let input = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0])
            .into_shape((1, 1, 3, 3))
            .unwrap();
        // Kernel: [out_channels=1, in_channels=1, height=2, width=2]
        let kernel = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0]).into_shape((1, 1, 2, 2)).unwrap();

        let (output, _) = conv2d_forward(input.view(), kernel.view(), None, 1, 0).unwrap();
        assert_eq!(output.dim(), (1, 1, 2, 2));
        // [1*1 + 2*2 + 4*3 + 5*4, 2*1 + 3*2 + 5*3 + 6*4, ...]
        let expected = [37.0, 47.0, 67.0, 77.0];
        for (got, want) in output.iter().zip(expected.iter()) {
            assert_eq!(got, want);
        }

        let bias = arr1(&[1.0f32]);
        let (output, _) =
            conv2d_forward(input.view(), kernel.view(), Some(bias.view()), 1, 0).unwrap();
        assert_eq!(output[[0, 0, 1, 1]], 78.0);
    }

    #[test]
    fn test_conv2d_stride_padding_shape() {
        let input = seeded((2, 3, 7, 7), 0.0);
        let kernel = seeded((4, 3, 3, 3), 1.0);
        let (output, _) = conv2d_forward(input.view(), kernel.view(), None, 2, 1).unwrap();
        assert_eq!(output.dim(), (2, 4, 4, 4));

        let wrong = seeded((4, 2, 3, 3), 1.0);
        assert!(conv2d_forward(input.view(), wrong.view(), None, 1, 0).is_err());
    }

    #[test]
    fn test_conv2d_gradient_matches_finite_difference() {
        let input = seeded((1, 2, 5, 5), 0.3);
        let weight = seeded((3, 2, 3, 3), 0.9);
        let upstream = seeded((1, 3, 3, 3), 2.1);
        let loss = |x: &Array4<f32>, w: &Array4<f32>| -> f32 {
            let (out, _) = conv2d_forward(x.view(), w.view(), None, 2, 1).unwrap();
            (&out * &upstream).sum()
        };

        let (_, cache) = conv2d_forward(input.view(), weight.view(), None, 2, 1).unwrap();
        let (d_input, d_weight, d_bias) =
            conv2d_backward(upstream.view(), weight.view(), &cache).unwrap();
        assert!((d_bias[1] - upstream.index_axis(Axis(1), 1).sum()).abs() < 1e-4);

        let eps = 1e-2;
        for &(c, h, w) in &[(0, 0, 0), (1, 2, 3), (0, 4, 4)] {
            let mut plus = input.clone();
            plus[[0, c, h, w]] += eps;
            let mut minus = input.clone();
            minus[[0, c, h, w]] -= eps;
            let numeric = (loss(&plus, &weight) - loss(&minus, &weight)) / (2.0 * eps);
            assert!((numeric - d_input[[0, c, h, w]]).abs() < 1e-2, "d_input at {:?}", (c, h, w));
        }
        for &(o, c, h, w) in &[(0, 0, 0, 0), (2, 1, 1, 2)] {
            let mut plus = weight.clone();
            plus[[o, c, h, w]] += eps;
            let mut minus = weight.clone();
            minus[[o, c, h, w]] -= eps;
            let numeric = (loss(&input, &plus) - loss(&input, &minus)) / (2.0 * eps);
            assert!(
                (numeric - d_weight[[o, c, h, w]]).abs() < 1e-2,
                "d_weight at {:?}",
                (o, c, h, w)
            );
        }
    }

    #[test]
    fn test_batch_norm_train_gradient() {
        let input = seeded((2, 2, 3, 3), 0.5);
        let gamma = arr1(&[1.5f32, 0.5]);
        let beta = arr1(&[0.1f32, -0.2]);
        let upstream = seeded((2, 2, 3, 3), 1.7);
        let loss = |x: &Array4<f32>| -> f32 {
            let (mean, var) = channel_statistics(x.view());
            let (out, _) = batch_norm_forward(
                x.view(),
                gamma.view(),
                beta.view(),
                mean.view(),
                var.view(),
                1e-5,
                true,
            )
            .unwrap();
            (&out * &upstream).sum()
        };

        let (mean, var) = channel_statistics(input.view());
        let (out, cache) = batch_norm_forward(
            input.view(),
            gamma.view(),
            beta.view(),
            mean.view(),
            var.view(),
            1e-5,
            true,
        )
        .unwrap();
        let channel_mean = out.index_axis(Axis(1), 0).sum() / 18.0;
        assert!((channel_mean - 0.1).abs() < 1e-4);

        let (d_input, _, d_beta) = batch_norm_backward(upstream.view(), gamma.view(), &cache);
        assert!((d_beta[0] - upstream.index_axis(Axis(1), 0).sum()).abs() < 1e-4);

        let eps = 1e-2;
        for &(b, c, h, w) in &[(0, 0, 0, 0), (1, 1, 2, 1)] {
            let mut plus = input.clone();
            plus[[b, c, h, w]] += eps;
            let mut minus = input.clone();
            minus[[b, c, h, w]] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!((numeric - d_input[[b, c, h, w]]).abs() < 2e-2);
        }
    }

    #[test]
    fn test_max_pool_ceil_mode_and_routing() {
        let input = Array::from_shape_fn((1, 1, 5, 5), |(_, _, h, w)| (h * 5 + w) as f32);
        let (output, argmax) = max_pool2d_forward(input.view(), 2, 2).unwrap();
        assert_eq!(output.dim(), (1, 1, 3, 3));
        assert_eq!(output[[0, 0, 0, 0]], 6.0);
        assert_eq!(output[[0, 0, 2, 2]], 24.0);

        let grad = Array4::ones((1, 1, 3, 3));
        let d_input = max_pool2d_backward(grad.view(), &argmax, 5, 5);
        assert_eq!(d_input.sum(), 9.0);
        assert_eq!(d_input[[0, 0, 1, 1]], 1.0);
        assert_eq!(d_input[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_avg_pool_round_trip_mass() {
        let input = seeded((1, 2, 4, 4), 0.0);
        let output = avg_pool2d_forward(input.view(), 2, 2).unwrap();
        assert_eq!(output.dim(), (1, 2, 2, 2));
        let expected = input.slice(ndarray::s![0, 1, 0..2, 2..4]).sum() / 4.0;
        assert!((output[[0, 1, 0, 1]] - expected).abs() < 1e-6);

        let d_input = avg_pool2d_backward(Array4::ones((1, 2, 2, 2)).view(), 2, 2, 4, 4);
        assert!((d_input.sum() - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_linear_and_relu() {
        let x = Array2::from_shape_vec((1, 3), vec![1.0, -2.0, 3.0]).unwrap();
        let w = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0]).unwrap();
        let b = arr1(&[0.5f32, 0.0]);
        let y = linear_forward(x.view(), w.view(), Some(b.view())).unwrap();
        assert_eq!(y, Array2::from_shape_vec((1, 2), vec![1.5, 1.0]).unwrap());

        let (d_x, d_w, d_b) = linear_backward(Array2::ones((1, 2)).view(), x.view(), w.view());
        assert_eq!(d_x.row(0).to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(d_w.row(1).to_vec(), vec![1.0, -2.0, 3.0]);
        assert_eq!(d_b.to_vec(), vec![1.0, 1.0]);

        let input = x.into_dyn();
        let relu = relu_forward(&input);
        assert_eq!(relu.iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0, 3.0]);
        let d = relu_backward(&ArrayD::ones(IxDyn(&[1, 3])), &input);
        assert_eq!(d.iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_cat_splits_gradient_by_width() {
        let mut tape = Tape::new();
        let a = tape.input(Tensor::from_array(ArrayD::ones(IxDyn(&[1, 2, 2, 2]))));
        let b = tape.input(Tensor::from_array(ArrayD::zeros(IxDyn(&[1, 3, 2, 2]))));
        let joined = cat_channels(&mut tape, &[&a, &b]).unwrap();
        assert_eq!(joined.shape(), &[1, 5, 2, 2]);
        let pooled = global_avg_pool(&mut tape, &joined).unwrap();
        let flat = flatten(&mut tape, &pooled).unwrap();
        assert_eq!(flat.shape(), &[1, 5]);
        assert_eq!(flat.data()[[0, 1]], 1.0);
        assert_eq!(tape.len(), 3);
        tape.backward(&flat, ArrayD::ones(IxDyn(&[1, 5]))).unwrap();
    }
}
