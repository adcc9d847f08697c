//! Components to build a neural network
//!
//! Layers consume and produce batched [`Tensor`]s. Dense layers take `[batch, features]`,
//! convolutions and batch norm take NHWC images.

use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::{tensor::Tensor, values::Value};

/// Default negative slope of leaky ReLU
pub const LEAKY_RELU_ALPHA: f32 = 0.2;

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch, expected {expected} got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Expected a rank {expected} tensor, got rank {got}")]
    RankMismatch { expected: usize, got: usize },
    #[error("Layer expects {expected} input channels, got {got}")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("Stride must be at least 1")]
    InvalidStride,
    #[error("Kernel of size {kernel} does not fit an input of size {input} without padding")]
    KernelTooLarge { kernel: usize, input: usize },
    #[error("Batch is empty")]
    EmptyBatch,
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    /// Parameter groups keyed by a name local to the module, e.g. `conv.kernel`
    fn named_parameters(&self) -> Vec<(String, Vec<Value>)>;

    fn parameters(&self) -> Vec<Value> {
        self.named_parameters()
            .into_iter()
            .flat_map(|(_, params)| params)
            .collect()
    }

    fn forward(&self, inputs: &Tensor) -> Result<Tensor, NNError>;
}

/// Prefixes the parameter names of a submodule
pub fn scoped(prefix: &str, module: &dyn Module) -> Vec<(String, Vec<Value>)> {
    module
        .named_parameters()
        .into_iter()
        .map(|(name, params)| (format!("{prefix}.{name}"), params))
        .collect()
}

/// Element-wise non-linearity applied at the end of a layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Linear,
    ReLU,
    LeakyReLU(f32),
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, value: &Value) -> Value {
        match self {
            Activation::Linear => value.clone(),
            Activation::ReLU => value.relu(),
            Activation::LeakyReLU(alpha) => value.leaky_relu(*alpha),
            Activation::Sigmoid => value.sigmoid(),
        }
    }
}

/// He initialization to ensure the variance of the output is the same as the input
/// and keep weights relatively small to avoid exploding or vanishing gradients
fn he_init<R: Rng + ?Sized>(fan_in: usize, n: usize, rng: &mut R) -> Vec<Value> {
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    (0..n)
        .map(|_| {
            let z: f32 = rng.sample(StandardNormal);
            Value::new(std * z)
        })
        .collect()
}

/// A single neuron in a dense layer
pub struct Neuron {
    /// weights of the neuron
    pub weights: Vec<Value>,
    /// bias of the neuron
    pub bias: Value,
}

impl Neuron {
    fn new<R: Rng + ?Sized>(n_inputs: usize, rng: &mut R) -> Self {
        Self {
            weights: he_init(n_inputs, n_inputs, rng),
            bias: Value::new(0.0),
        }
    }

    pub fn forward(&self, inputs: &[Value]) -> Result<Value, NNError> {
        if inputs.len() != self.weights.len() {
            return Err(NNError::InputSizeMismatch {
                expected: self.weights.len(),
                got: inputs.len(),
            });
        }
        let terms = self
            .weights
            .iter()
            .zip(inputs.iter())
            .map(|(w, i)| w * i)
            .chain(std::iter::once(self.bias.clone()))
            .collect::<Vec<_>>();
        Ok(Value::sum_of(&terms))
    }
}

/// A fully connected layer
pub struct Dense {
    neurons: Vec<Neuron>,
    activation: Activation,
}

impl Dense {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new<R: Rng + ?Sized>(
        n_inputs: usize,
        n_outputs: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new(n_inputs, rng)).collect();
        Self {
            neurons,
            activation,
        }
    }
}

impl Module for Dense {
    fn named_parameters(&self) -> Vec<(String, Vec<Value>)> {
        let kernel = self
            .neurons
            .iter()
            .flat_map(|n| n.weights.iter().cloned())
            .collect();
        let bias = self.neurons.iter().map(|n| n.bias.clone()).collect();
        vec![("kernel".to_string(), kernel), ("bias".to_string(), bias)]
    }

    /// Computes forward pass for a `[batch, features]` input
    fn forward(&self, inputs: &Tensor) -> Result<Tensor, NNError> {
        let (n, features) = inputs.dims2()?;
        let mut outputs = Vec::with_capacity(n * self.neurons.len());
        for row in inputs.values().chunks(features.max(1)).take(n) {
            for neuron in &self.neurons {
                outputs.push(self.activation.apply(&neuron.forward(row)?));
            }
        }
        let n_output_nans = outputs.iter().filter(|v| v.data().is_nan()).count();
        let n_parameters_nans = self
            .parameters()
            .iter()
            .filter(|v| v.data().is_nan())
            .count();
        log::debug!(
            "n_output_nans: {}, n_parameters_nans: {}",
            n_output_nans,
            n_parameters_nans
        );
        Tensor::new(vec![n, self.neurons.len()], outputs)
    }
}

/// Padding scheme of a convolution, with the same semantics as TensorFlow's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Output size is `ceil(input / stride)`, zero padding split evenly with the extra
    /// row/column at the bottom/right
    Same,
    /// No padding, output size is `(input - kernel) / stride + 1`
    Valid,
}

impl Padding {
    /// Returns the output size and the leading padding along one spatial axis
    pub fn output_and_offset(
        self,
        input: usize,
        kernel: usize,
        stride: usize,
    ) -> Result<(usize, usize), NNError> {
        if stride == 0 {
            return Err(NNError::InvalidStride);
        }
        match self {
            Padding::Same => {
                let out = input.div_ceil(stride);
                let pad_total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
                Ok((out, pad_total / 2))
            }
            Padding::Valid => {
                if kernel > input {
                    return Err(NNError::KernelTooLarge { kernel, input });
                }
                Ok(((input - kernel) / stride + 1, 0))
            }
        }
    }
}

/// 2D convolution over NHWC images with a `[k, k, in, out]` kernel
pub struct Conv2d {
    in_channels: usize,
    filters: usize,
    kernel_size: usize,
    stride: usize,
    padding: Padding,
    activation: Activation,
    kernel: Vec<Value>,
    bias: Vec<Value>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let fan_in = kernel_size * kernel_size * in_channels;
        Self {
            in_channels,
            filters,
            kernel_size,
            stride,
            padding,
            activation,
            kernel: he_init(fan_in, fan_in * filters, rng),
            bias: (0..filters).map(|_| Value::new(0.0)).collect(),
        }
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    fn weight(&self, ky: usize, kx: usize, c: usize, f: usize) -> &Value {
        &self.kernel[((ky * self.kernel_size + kx) * self.in_channels + c) * self.filters + f]
    }
}

impl Module for Conv2d {
    fn named_parameters(&self) -> Vec<(String, Vec<Value>)> {
        vec![
            ("kernel".to_string(), self.kernel.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }

    fn forward(&self, inputs: &Tensor) -> Result<Tensor, NNError> {
        let (n, h, w, c) = inputs.dims4()?;
        if c != self.in_channels {
            return Err(NNError::ChannelMismatch {
                expected: self.in_channels,
                got: c,
            });
        }
        let k = self.kernel_size;
        let (out_h, pad_top) = self.padding.output_and_offset(h, k, self.stride)?;
        let (out_w, pad_left) = self.padding.output_and_offset(w, k, self.stride)?;

        let mut outputs = Vec::with_capacity(n * out_h * out_w * self.filters);
        let mut terms = Vec::with_capacity(k * k * c + 1);
        for b in 0..n {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    for f in 0..self.filters {
                        terms.clear();
                        for ky in 0..k {
                            // zero padding contributes nothing, so out of bounds taps are skipped
                            let Some(iy) = (oy * self.stride + ky).checked_sub(pad_top) else {
                                continue;
                            };
                            if iy >= h {
                                continue;
                            }
                            for kx in 0..k {
                                let Some(ix) = (ox * self.stride + kx).checked_sub(pad_left)
                                else {
                                    continue;
                                };
                                if ix >= w {
                                    continue;
                                }
                                for ch in 0..c {
                                    terms.push(inputs.at4(b, iy, ix, ch) * self.weight(ky, kx, ch, f));
                                }
                            }
                        }
                        terms.push(self.bias[f].clone());
                        outputs.push(self.activation.apply(&Value::sum_of(&terms)));
                    }
                }
            }
        }
        Tensor::new(vec![n, out_h, out_w, self.filters], outputs)
    }
}

/// Batch normalization in training mode: every forward pass normalizes with the statistics
/// of the batch itself, per channel over batch and spatial positions
pub struct BatchNorm {
    channels: usize,
    eps: f32,
    gamma: Vec<Value>,
    beta: Vec<Value>,
}

impl BatchNorm {
    pub fn new(channels: usize, eps: f32) -> Self {
        Self {
            channels,
            eps,
            gamma: (0..channels).map(|_| Value::new(1.0)).collect(),
            beta: (0..channels).map(|_| Value::new(0.0)).collect(),
        }
    }
}

impl Module for BatchNorm {
    fn named_parameters(&self) -> Vec<(String, Vec<Value>)> {
        vec![
            ("gamma".to_string(), self.gamma.clone()),
            ("beta".to_string(), self.beta.clone()),
        ]
    }

    /// Normalizes along the last dimension of any tensor of rank two or more
    fn forward(&self, inputs: &Tensor) -> Result<Tensor, NNError> {
        let c = inputs.shape().last().copied().unwrap_or(0);
        if inputs.shape().len() < 2 {
            return Err(NNError::RankMismatch {
                expected: 2,
                got: inputs.shape().len(),
            });
        }
        if c != self.channels {
            return Err(NNError::ChannelMismatch {
                expected: self.channels,
                got: c,
            });
        }
        let count = inputs.len() / c;
        if count == 0 {
            return Err(NNError::EmptyBatch);
        }
        let count_value = Value::new(count as f32);
        let eps = Value::new(self.eps);

        // (shift, scale) per channel such that y = (x - shift) * scale + beta
        let mut stats = Vec::with_capacity(c);
        for ch in 0..c {
            let xs = inputs.values().iter().skip(ch).step_by(c).cloned().collect::<Vec<_>>();
            let mean = &Value::sum_of(&xs) / &count_value;
            let squares = xs
                .iter()
                .map(|x| {
                    let d = x - &mean;
                    &d * &d
                })
                .collect::<Vec<_>>();
            let var = &Value::sum_of(&squares) / &count_value;
            let inv_std = &Value::new(1.0) / &(&var + &eps).sqrt();
            let scale = &inv_std * &self.gamma[ch];
            stats.push((mean, scale));
        }

        let outputs = inputs
            .values()
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let ch = i % c;
                let (mean, scale) = &stats[ch];
                &(&(x - mean) * scale) + &self.beta[ch]
            })
            .collect();
        Tensor::new(inputs.shape().to_vec(), outputs)
    }
}

/// Hyperparameters of a [`ConvBlock`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvBlockConfig {
    pub filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: Padding,
    pub activation: Activation,
    pub batch_norm: bool,
    pub bn_eps: f32,
}

impl ConvBlockConfig {
    /// A 3x3, stride 1, same padded block with batch norm
    pub fn new(filters: usize, activation: Activation) -> Self {
        Self {
            filters,
            kernel_size: 3,
            stride: 1,
            padding: Padding::Same,
            activation,
            batch_norm: true,
            bn_eps: 1e-5,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn without_batch_norm(mut self) -> Self {
        self.batch_norm = false;
        self
    }
}

/// Convolution followed by an optional batch norm, the building block shared by both networks
pub struct ConvBlock {
    conv: Conv2d,
    bn: Option<BatchNorm>,
}

impl ConvBlock {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, config: ConvBlockConfig, rng: &mut R) -> Self {
        let conv = Conv2d::new(
            in_channels,
            config.filters,
            config.kernel_size,
            config.stride,
            config.padding,
            config.activation,
            rng,
        );
        let bn = config
            .batch_norm
            .then(|| BatchNorm::new(config.filters, config.bn_eps));
        Self { conv, bn }
    }

    pub fn filters(&self) -> usize {
        self.conv.filters()
    }
}

impl Module for ConvBlock {
    fn named_parameters(&self) -> Vec<(String, Vec<Value>)> {
        let mut params = scoped("conv", &self.conv);
        if let Some(bn) = &self.bn {
            params.extend(scoped("bn", bn));
        }
        params
    }

    fn forward(&self, inputs: &Tensor) -> Result<Tensor, NNError> {
        let out = self.conv.forward(inputs)?;
        match &self.bn {
            Some(bn) => bn.forward(&out),
            None => Ok(out),
        }
    }
}

/// Nearest neighbour upsampling of an NHWC tensor by an integer factor
pub fn upsample_nearest(inputs: &Tensor, factor: usize) -> Result<Tensor, NNError> {
    let (n, h, w, c) = inputs.dims4()?;
    let (out_h, out_w) = (h * factor, w * factor);
    let mut outputs = Vec::with_capacity(n * out_h * out_w * c);
    for b in 0..n {
        for y in 0..out_h {
            for x in 0..out_w {
                for ch in 0..c {
                    outputs.push(inputs.at4(b, y / factor, x / factor, ch).clone());
                }
            }
        }
    }
    Tensor::new(vec![n, out_h, out_w, c], outputs)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::assert_eq_float;

    use super::*;

    fn fill(module: &dyn Module, value: f32) {
        for mut p in module.parameters() {
            p.set_data(value);
        }
    }

    #[test]
    fn test_dense_forward() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let layer = Dense::new(2, 3, Activation::Linear, &mut rng);
        fill(&layer, 1.0);
        let inputs = Tensor::from_f32(vec![2, 2], &[1.0, 2.0, -1.0, -1.0]).unwrap();
        let outputs = layer.forward(&inputs).unwrap();
        assert_eq!(outputs.shape(), &[2, 3]);
        assert_eq!(outputs.data(), vec![4.0, 4.0, 4.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_dense_dim_mismatch() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let layer = Dense::new(2, 3, Activation::Linear, &mut rng);
        let inputs = Tensor::from_f32(vec![1, 1], &[1.0]).unwrap();
        let err = layer.forward(&inputs).unwrap_err();
        assert!(matches!(
            err,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_padding_geometry() {
        assert_eq!(Padding::Same.output_and_offset(32, 3, 1).unwrap(), (32, 1));
        assert_eq!(Padding::Same.output_and_offset(32, 3, 2).unwrap(), (16, 0));
        assert_eq!(Padding::Same.output_and_offset(5, 3, 2).unwrap(), (3, 1));
        assert_eq!(Padding::Valid.output_and_offset(5, 3, 1).unwrap(), (3, 0));
        assert_eq!(Padding::Valid.output_and_offset(6, 3, 2).unwrap(), (2, 0));
        assert!(matches!(
            Padding::Valid.output_and_offset(2, 3, 1),
            Err(NNError::KernelTooLarge { kernel: 3, input: 2 })
        ));
        assert!(matches!(
            Padding::Same.output_and_offset(4, 3, 0),
            Err(NNError::InvalidStride)
        ));
    }

    #[test]
    fn test_conv_same_padding_sums_neighbourhood() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let conv = Conv2d::new(1, 1, 3, 1, Padding::Same, Activation::Linear, &mut rng);
        fill(&conv, 1.0);
        let inputs = Tensor::from_f32(vec![1, 3, 3, 1], &[1.0; 9]).unwrap();
        let out = conv.forward(&inputs).unwrap();
        assert_eq!(out.shape(), &[1, 3, 3, 1]);
        // corner sees 4 pixels, edge 6, centre 9, each plus a bias of 1
        assert_eq!(
            out.data(),
            vec![5.0, 7.0, 5.0, 7.0, 10.0, 7.0, 5.0, 7.0, 5.0]
        );

        out.values()[4].backward();
        for p in conv.named_parameters().into_iter().find(|(n, _)| n == "bias").unwrap().1 {
            assert_eq!(p.grad(), 1.0);
        }
    }

    #[test]
    fn test_conv_strided_valid() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let conv = Conv2d::new(2, 3, 2, 2, Padding::Valid, Activation::ReLU, &mut rng);
        let inputs = Tensor::from_f32(vec![2, 4, 4, 2], &[0.5; 64]).unwrap();
        let out = conv.forward(&inputs).unwrap();
        assert_eq!(out.shape(), &[2, 2, 2, 3]);
        assert!(out.data().iter().all(|v| *v >= 0.0));

        let wrong_channels = Tensor::from_f32(vec![1, 4, 4, 1], &[0.5; 16]).unwrap();
        assert!(matches!(
            conv.forward(&wrong_channels),
            Err(NNError::ChannelMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_batch_norm_normalizes_each_channel() {
        let bn = BatchNorm::new(2, 1e-5);
        // channel 0: 1, 3 -> mean 2, var 1; channel 1: 10, 10 -> var 0
        let inputs = Tensor::from_f32(vec![2, 1, 1, 2], &[1.0, 10.0, 3.0, 10.0]).unwrap();
        let out = bn.forward(&inputs).unwrap();
        let data = out.data();
        assert!((data[0] + 1.0).abs() < 1e-4);
        assert!((data[2] - 1.0).abs() < 1e-4);
        assert_eq_float!(data[1], 0.0);
        assert_eq_float!(data[3], 0.0);

        // the output of a normalized channel is invariant to its mean
        let loss = Value::sum_of(out.values());
        loss.backward();
        assert!(inputs.values()[0].grad().abs() < 1e-4);
        assert_eq!(bn.parameters().len(), 4);
    }

    #[test]
    fn test_conv_block_names_and_upsample() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let block = ConvBlock::new(1, ConvBlockConfig::new(2, Activation::ReLU), &mut rng);
        let names = block
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["conv.kernel", "conv.bias", "bn.gamma", "bn.beta"]);

        let inputs = Tensor::from_f32(vec![1, 2, 2, 1], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let up = upsample_nearest(&inputs, 2).unwrap();
        assert_eq!(up.shape(), &[1, 4, 4, 1]);
        assert_eq!(
            up.data(),
            vec![
                1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0
            ]
        );
        assert_eq!(block.forward(&up).unwrap().shape(), &[1, 4, 4, 2]);
    }
}
