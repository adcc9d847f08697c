//! The generator/discriminator pair and its adversarial training step
//!
//! Each network owns its parameters and its optimizer only ever sees those, so the two
//! updates never touch each other's weights.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

use crate::{
    config::SrganConfig,
    loss::{GanLosses, LsganLoss},
    nn::{
        Activation, BatchNorm, Conv2d, ConvBlock, ConvBlockConfig, Dense, LEAKY_RELU_ALPHA, Module,
        NNError, Padding, scoped, upsample_nearest,
    },
    optim::{Adam, LrDecay, Optim},
    tensor::Tensor,
    values::Value,
};

/// Filter counts of the discriminator blocks, as multiples of `df_dim`
pub const DISCRIMINATOR_FILTERS: [usize; 7] = [1, 2, 2, 4, 4, 8, 8];

/// Strided convolutional classifier producing the probability that an image is real
pub struct Discriminator {
    stem: Conv2d,
    blocks: Vec<ConvBlock>,
    fc: Dense,
    out: Dense,
}

impl Discriminator {
    pub fn new<R: Rng + ?Sized>(config: &SrganConfig, rng: &mut R) -> Self {
        let leaky = Activation::LeakyReLU(LEAKY_RELU_ALPHA);
        let stem = Conv2d::new(
            config.shape.channels,
            config.df_dim,
            3,
            1,
            Padding::Same,
            leaky,
            rng,
        );

        let mut in_channels = config.df_dim;
        let (mut h, mut w) = (config.shape.height, config.shape.width);
        let mut blocks = Vec::with_capacity(DISCRIMINATOR_FILTERS.len());
        for (i, multiplier) in DISCRIMINATOR_FILTERS.iter().enumerate() {
            // strides alternate 1, 2, 1, 2, ... halving the image three times
            let stride = 1 + i % 2;
            let mut block_config =
                ConvBlockConfig::new(multiplier * config.df_dim, leaky).with_stride(stride);
            block_config.bn_eps = config.bn_eps;
            let block = ConvBlock::new(in_channels, block_config, rng);
            in_channels = block.filters();
            h = h.div_ceil(stride);
            w = w.div_ceil(stride);
            blocks.push(block);
        }

        let fc = Dense::new(h * w * in_channels, config.fc_units, leaky, rng);
        let out = Dense::new(config.fc_units, 1, Activation::Sigmoid, rng);
        Self {
            stem,
            blocks,
            fc,
            out,
        }
    }
}

impl Module for Discriminator {
    fn named_parameters(&self) -> Vec<(String, Vec<Value>)> {
        let mut params = scoped("conv0", &self.stem);
        for (i, block) in self.blocks.iter().enumerate() {
            params.extend(scoped(&format!("block{}", i + 1), block));
        }
        params.extend(scoped("fc0", &self.fc));
        params.extend(scoped("fc1", &self.out));
        params
    }

    /// `[batch, h, w, c]` images to `[batch, 1]` probabilities
    fn forward(&self, inputs: &Tensor) -> Result<Tensor, NNError> {
        let mut x = self.stem.forward(inputs)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = self.fc.forward(&x.flatten()?)?;
        self.out.forward(&x)
    }
}

/// Maps noise vectors to images in `[0, 1]` by projecting to a quarter resolution feature
/// map and upsampling twice
pub struct Generator {
    project: Dense,
    project_bn: BatchNorm,
    base: (usize, usize, usize),
    up: ConvBlock,
    to_image: ConvBlock,
}

impl Generator {
    pub fn new<R: Rng + ?Sized>(config: &SrganConfig, rng: &mut R) -> Self {
        let base = (
            config.shape.height / 4,
            config.shape.width / 4,
            2 * config.gf_dim,
        );
        let project = Dense::new(
            config.z_dim,
            base.0 * base.1 * base.2,
            Activation::Linear,
            rng,
        );
        let mut up_config = ConvBlockConfig::new(config.gf_dim, Activation::ReLU);
        up_config.bn_eps = config.bn_eps;
        let up = ConvBlock::new(base.2, up_config, rng);
        let to_image = ConvBlock::new(
            config.gf_dim,
            ConvBlockConfig::new(config.shape.channels, Activation::Sigmoid).without_batch_norm(),
            rng,
        );
        Self {
            project,
            project_bn: BatchNorm::new(base.2, config.bn_eps),
            base,
            up,
            to_image,
        }
    }
}

impl Module for Generator {
    fn named_parameters(&self) -> Vec<(String, Vec<Value>)> {
        let mut params = scoped("fc0", &self.project);
        params.extend(scoped("bn0", &self.project_bn));
        params.extend(scoped("block1", &self.up));
        params.extend(scoped("conv2", &self.to_image));
        params
    }

    /// `[batch, z_dim]` noise to `[batch, h, w, c]` images
    fn forward(&self, inputs: &Tensor) -> Result<Tensor, NNError> {
        let n = inputs.batch_size();
        let (h, w, c) = self.base;
        let x = self.project.forward(inputs)?.reshape(vec![n, h, w, c])?;
        let x = self.project_bn.forward(&x)?.map(|v| v.relu());
        let x = self.up.forward(&upsample_nearest(&x, 2)?)?;
        self.to_image.forward(&upsample_nearest(&x, 2)?)
    }
}

/// The adversarial pair with one Adam optimizer per network
pub struct Srgan {
    config: SrganConfig,
    discriminator: Discriminator,
    generator: Generator,
    d_optim: Adam,
    g_optim: Adam,
    decay: LrDecay,
    rng: Pcg64Mcg,
}

impl Srgan {
    pub fn new(config: SrganConfig) -> Self {
        let mut rng = Pcg64Mcg::seed_from_u64(config.seed);
        let discriminator = Discriminator::new(&config, &mut rng);
        let generator = Generator::new(&config, &mut rng);
        let d_optim = Adam::new(
            discriminator.parameters(),
            config.d_lr,
            config.beta1,
            config.beta2,
        );
        let g_optim = Adam::new(
            generator.parameters(),
            config.g_lr,
            config.beta1,
            config.beta2,
        );
        log::info!(
            "Discriminator has {} parameters, generator has {}",
            d_optim.n_params(),
            g_optim.n_params()
        );
        Self {
            config,
            discriminator,
            generator,
            d_optim,
            g_optim,
            decay: LrDecay::new(config.lr_decay_rate, config.lr_floor),
            rng,
        }
    }

    pub fn config(&self) -> &SrganConfig {
        &self.config
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Every parameter group of both networks, prefixed with the owning network
    pub fn named_parameters(&self) -> Vec<(String, Vec<Value>)> {
        let mut params = scoped("discriminator", &self.discriminator);
        params.extend(scoped("generator", &self.generator));
        params
    }

    /// Learning rates of the discriminator and generator optimizers
    pub fn learning_rates(&self) -> (f32, f32) {
        (self.d_optim.lr(), self.g_optim.lr())
    }

    /// Decays both learning rates once, never below the configured floor
    pub fn decay_learning_rates(&mut self) -> (f32, f32) {
        let d_lr = self.decay.apply(&mut self.d_optim);
        let g_lr = self.decay.apply(&mut self.g_optim);
        log::info!("Decayed learning rates to d: {:e}, g: {:e}", d_lr, g_lr);
        (d_lr, g_lr)
    }

    /// Uniform noise in `[-1, 1)` of shape `[batch, z_dim]`
    pub fn sample_noise(&mut self, batch_size: usize) -> Result<Tensor, NNError> {
        let data = (0..batch_size * self.config.z_dim)
            .map(|_| self.rng.random_range(-1.0..1.0))
            .collect::<Vec<f32>>();
        Tensor::from_f32(vec![batch_size, self.config.z_dim], &data)
    }

    /// Generated images for the given noise, detached from the graph
    pub fn generate(&self, z: &Tensor) -> Result<Tensor, NNError> {
        let images = self.generator.forward(z)?;
        Tensor::from_f32(images.shape().to_vec(), &images.data())
    }

    fn losses(&self, real: &Tensor, z: &Tensor) -> Result<LossGraph, NNError> {
        let batch_size = real.batch_size();
        let fake = self.generator.forward(z)?;
        let d_real = self.discriminator.forward(real)?;
        let d_fake = self.discriminator.forward(&fake)?;

        // least squares targets: 1 for real, 0 for fake, and 1 for the generator
        let d_real_loss = LsganLoss::call(d_real.values(), 1.0, batch_size);
        let d_fake_loss = LsganLoss::call(d_fake.values(), 0.0, batch_size);
        let d_loss = &(&d_real_loss + &d_fake_loss) / &Value::new(2.0);
        let g_loss = LsganLoss::call(d_fake.values(), 1.0, batch_size);
        Ok(LossGraph {
            d_loss,
            d_real_loss,
            d_fake_loss,
            g_loss,
            d_real: mean(&d_real.data()),
            d_fake: mean(&d_fake.data()),
        })
    }

    /// Evaluates the losses without updating either network
    pub fn evaluate(&self, real: &Tensor, z: &Tensor) -> Result<GanLosses, NNError> {
        Ok(self.losses(real, z)?.scalars())
    }

    /// One discriminator update followed by one generator update. The reported losses are
    /// the ones the discriminator step was computed from, except `g_loss` which is the
    /// loss the generator step minimized.
    pub fn train_step(&mut self, real: &Tensor, z: &Tensor) -> Result<GanLosses, NNError> {
        if real.batch_size() == 0 {
            return Err(NNError::EmptyBatch);
        }
        if real.batch_size() != z.batch_size() {
            return Err(NNError::InputSizeMismatch {
                expected: real.batch_size(),
                got: z.batch_size(),
            });
        }

        let mut d_graph = self.losses(real, z)?;
        d_graph.d_loss.backward();
        self.d_optim.step();
        // also clears what leaked into the generator through the fake batch
        d_graph.d_loss.zero_grad();

        let mut g_graph = self.losses(real, z)?;
        g_graph.g_loss.backward();
        self.g_optim.step();
        g_graph.g_loss.zero_grad();

        Ok(GanLosses {
            g_loss: g_graph.g_loss.data(),
            ..d_graph.scalars()
        })
    }
}

/// Loss nodes of one forward pass through both networks
struct LossGraph {
    d_loss: Value,
    d_real_loss: Value,
    d_fake_loss: Value,
    g_loss: Value,
    d_real: f32,
    d_fake: f32,
}

impl LossGraph {
    fn scalars(&self) -> GanLosses {
        GanLosses {
            d_loss: self.d_loss.data(),
            d_real_loss: self.d_real_loss.data(),
            d_fake_loss: self.d_fake_loss.data(),
            g_loss: self.g_loss.data(),
            d_real: self.d_real,
            d_fake: self.d_fake,
        }
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::dataset::ImageShape;

    fn tiny_config() -> SrganConfig {
        SrganConfig {
            shape: ImageShape::new(8, 8, 1),
            z_dim: 4,
            df_dim: 1,
            gf_dim: 2,
            fc_units: 4,
            ..Default::default()
        }
    }

    fn real_batch(n: usize, shape: ImageShape) -> Tensor {
        let data = (0..n * shape.row_len())
            .map(|i| ((i * 7) % 11) as f32 / 10.0)
            .collect::<Vec<_>>();
        Tensor::from_f32(vec![n, shape.height, shape.width, shape.channels], &data).unwrap()
    }

    #[test]
    fn test_discriminator_downsamples_to_probability() {
        let config = tiny_config();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let d = Discriminator::new(&config, &mut rng);
        let out = d.forward(&real_batch(2, config.shape)).unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        assert!(out.data().iter().all(|p| *p > 0.0 && *p < 1.0));

        // 8x8 -> 1x1 after three stride 2 blocks with 8 * df_dim filters
        let fc_kernel = d
            .named_parameters()
            .into_iter()
            .find(|(n, _)| n == "fc0.kernel")
            .unwrap()
            .1;
        assert_eq!(fc_kernel.len(), 8 * config.fc_units);
    }

    #[test]
    fn test_generator_outputs_images() {
        let config = tiny_config();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let g = Generator::new(&config, &mut rng);
        let z = Tensor::from_f32(vec![3, 4], &[0.5, -0.5, 0.25, 1.0, -1.0, 0.0, 0.3, 0.7, 0.1, 0.2, -0.9, 0.4]).unwrap();
        let images = g.forward(&z).unwrap();
        assert_eq!(images.shape(), &[3, 8, 8, 1]);
        assert!(images.data().iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_parameter_scopes_are_disjoint() {
        let model = Srgan::new(tiny_config());
        let names = model
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect::<Vec<_>>();
        assert!(names.iter().all(|n| n.starts_with("discriminator.") || n.starts_with("generator.")));
        assert_eq!(names.iter().collect::<HashSet<_>>().len(), names.len());
        assert!(names.contains(&"discriminator.block7.bn.gamma".to_string()));
        assert!(names.contains(&"generator.conv2.conv.kernel".to_string()));
        assert_eq!(
            model.discriminator().parameters().len() + model.generator().parameters().len(),
            model
                .named_parameters()
                .iter()
                .map(|(_, p)| p.len())
                .sum::<usize>()
        );
    }

    #[test]
    fn test_train_step_updates_both_networks() {
        let config = tiny_config();
        let mut model = Srgan::new(config);
        let real = real_batch(2, config.shape);
        let z = model.sample_noise(2).unwrap();
        assert!(z.data().iter().all(|v| (-1.0..1.0).contains(v)));

        let d_before = model.discriminator().parameters().iter().map(|p| p.data()).collect::<Vec<_>>();
        let g_before = model.generator().parameters().iter().map(|p| p.data()).collect::<Vec<_>>();
        let before = model.evaluate(&real, &z).unwrap();

        let losses = model.train_step(&real, &z).unwrap();
        assert_eq!(losses.d_loss, before.d_loss);
        assert!(losses.d_loss.is_finite() && losses.g_loss.is_finite());
        assert!(losses.d_real > 0.0 && losses.d_real < 1.0);
        assert!((losses.d_loss - (losses.d_real_loss + losses.d_fake_loss) / 2.0).abs() < 1e-6);

        let d_after = model.discriminator().parameters().iter().map(|p| p.data()).collect::<Vec<_>>();
        let g_after = model.generator().parameters().iter().map(|p| p.data()).collect::<Vec<_>>();
        assert_ne!(d_before, d_after);
        assert_ne!(g_before, g_after);
        // gradients are cleared for the next step
        assert!(model.discriminator().parameters().iter().all(|p| p.grad() == 0.0));
        assert!(model.generator().parameters().iter().all(|p| p.grad() == 0.0));
    }

    #[test]
    fn test_train_step_rejects_mismatched_batches() {
        let config = tiny_config();
        let mut model = Srgan::new(config);
        let real = real_batch(2, config.shape);
        let z = model.sample_noise(3).unwrap();
        assert!(matches!(
            model.train_step(&real, &z),
            Err(NNError::InputSizeMismatch {
                expected: 2,
                got: 3
            })
        ));
    }

    #[test]
    fn test_learning_rate_decay_is_external() {
        let mut model = Srgan::new(SrganConfig {
            d_lr: 4e-5,
            g_lr: 1e-4,
            ..tiny_config()
        });
        assert_eq!(model.learning_rates(), (4e-5, 1e-4));
        model.decay_learning_rates();
        model.decay_learning_rates();
        let (d_lr, g_lr) = model.decay_learning_rates();
        assert_eq!(d_lr, 1e-5);
        assert!((g_lr - 1.25e-5).abs() < 1e-9);
    }
}
