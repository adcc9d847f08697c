//! Builds the Celeb-A image cache and trains the generator/discriminator pair on it
//! using the library provided by `srgan_rs`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- build-cache --image-dir img_align_celeba --cache-path celeb-a.safetensors
//! RUST_LOG=info cargo run -- train --cache-path celeb-a.safetensors
//! ```
//!
//! The scalar autograd engine is slow and memory hungry, shrink the geometry and filter
//! counts (see `train --help`) for real runs.

use std::{error::Error, path::PathBuf};

use srgan_rs::{
    config::{CacheMode, DatasetConfig, SrganConfig, TrainConfig},
    dataset::{CELEB_A_IMAGES, ChunkSpec, ImageCache, ImageShape},
};

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode the source images into the byte cache
    BuildCache(BuildCacheArgs),
    /// Train the GAN on a cache
    ///
    /// Every weight and activation is a node of a scalar autograd graph, so memory grows
    /// with image size times filter counts. The defaults (32x32x3, --df-dim 64,
    /// --fc-units 1024) need far more memory than a workstation has, start from
    /// `--height 8 --width 8 --channels 1 --df-dim 2 --gf-dim 4 --fc-units 16`.
    Train(TrainArgs),
}

#[derive(Args)]
struct ShapeArgs {
    #[clap(long, default_value_t = 32)]
    height: usize,
    #[clap(long, default_value_t = 32)]
    width: usize,
    #[clap(long, default_value_t = 3)]
    channels: usize,
}

impl ShapeArgs {
    fn shape(&self) -> ImageShape {
        ImageShape::new(self.height, self.width, self.channels)
    }
}

#[derive(Args)]
struct BuildCacheArgs {
    #[clap(short, long)]
    image_dir: PathBuf,
    #[clap(short, long, default_value = "celeb-a.safetensors")]
    cache_path: PathBuf,
    #[clap(short, long, default_value = "jpg")]
    extension: String,
    #[clap(flatten)]
    shape: ShapeArgs,
    #[clap(long, default_value_t = CELEB_A_IMAGES)]
    expected_images: usize,
    /// Accept any number of source images
    #[clap(long, default_value_t = false)]
    any_count: bool,
}

#[derive(Args)]
struct TrainArgs {
    #[clap(short, long, default_value = "celeb-a.safetensors")]
    cache_path: PathBuf,
    /// Source images, used to rebuild the cache in write mode
    #[clap(short, long)]
    image_dir: Option<PathBuf>,
    #[clap(long, default_value_t = CacheMode::Read)]
    mode: CacheMode,
    #[clap(long, default_value = "jpg")]
    extension: String,
    #[clap(long, default_value_t = CELEB_A_IMAGES)]
    expected_images: usize,
    #[clap(long, default_value_t = false)]
    any_count: bool,
    #[clap(flatten)]
    shape: ShapeArgs,
    #[clap(long)]
    chunk_size: Option<usize>,
    #[clap(long, default_value_t = 0)]
    chunk_index: usize,
    #[clap(long, default_value_t = 0.2)]
    split_rate: f32,
    #[clap(short, long, default_value_t = 16)]
    batch_size: usize,
    #[clap(short = 'n', long, default_value_t = 10)]
    epochs: usize,
    #[clap(long, default_value_t = 128)]
    z_dim: usize,
    #[clap(long, default_value_t = 64)]
    df_dim: usize,
    #[clap(long, default_value_t = 64)]
    gf_dim: usize,
    #[clap(long, default_value_t = 1024)]
    fc_units: usize,
    #[clap(long, default_value_t = 1e-4)]
    d_lr: f32,
    #[clap(long, default_value_t = 1e-4)]
    g_lr: f32,
    #[clap(long, default_value_t = 0.5)]
    lr_decay_rate: f32,
    #[clap(long, default_value_t = 1e-5)]
    lr_floor: f32,
    /// Decay the learning rates every this many epochs, 0 disables decay
    #[clap(long, default_value_t = 0)]
    decay_every: usize,
    #[clap(long, default_value_t = 42)]
    seed: u64,
    #[clap(long, default_value_t = 10)]
    log_every: usize,
    #[clap(long, default_value_t = 100)]
    save_every: usize,
    /// Images in each generated sample grid
    #[clap(long, default_value_t = 8)]
    sample_num: usize,
    #[clap(long, default_value = "model")]
    model_dir: PathBuf,
    #[clap(short, long, default_value = "output")]
    output_dir: PathBuf,
    /// Start from the last checkpoint in the model directory, if there is one
    #[clap(long, default_value_t = false)]
    restore: bool,
}

impl TrainArgs {
    fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            image_dir: self.image_dir.clone(),
            cache_path: self.cache_path.clone(),
            extension: self.extension.clone(),
            shape: self.shape.shape(),
            expected_images: (!self.any_count).then_some(self.expected_images),
            mode: self.mode,
            split_rate: self.split_rate,
            seed: self.seed,
            chunk: self.chunk_size.map(|size| ChunkSpec {
                size,
                index: self.chunk_index,
            }),
        }
    }

    fn model_config(&self) -> SrganConfig {
        SrganConfig {
            shape: self.shape.shape(),
            z_dim: self.z_dim,
            df_dim: self.df_dim,
            gf_dim: self.gf_dim,
            fc_units: self.fc_units,
            d_lr: self.d_lr,
            g_lr: self.g_lr,
            lr_decay_rate: self.lr_decay_rate,
            lr_floor: self.lr_floor,
            ..Default::default()
        }
    }

    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            batch_size: self.batch_size,
            epochs: self.epochs,
            decay_every: self.decay_every,
            log_every: self.log_every,
            save_every: self.save_every,
            model_dir: self.model_dir.clone(),
            output_dir: self.output_dir.clone(),
            seed: self.seed,
            sample_num: self.sample_num,
            restore: self.restore,
        }
    }
}

fn build_cache(args: BuildCacheArgs) -> Result<(), Box<dyn Error>> {
    let config = DatasetConfig {
        image_dir: Some(args.image_dir.clone()),
        cache_path: args.cache_path,
        extension: args.extension,
        shape: args.shape.shape(),
        expected_images: (!args.any_count).then_some(args.expected_images),
        mode: CacheMode::Write,
        ..Default::default()
    };
    config.validate()?;
    let cache = ImageCache::build(
        &args.image_dir,
        &config.extension,
        config.shape,
        config.expected_images,
    )?;
    cache.write(&config.cache_path)?;
    Ok(())
}

fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let report = srgan_rs::train::train(
        &args.dataset_config(),
        args.model_config(),
        &args.train_config(),
    )?;
    log::info!(
        "Trained for {} steps, checkpoint at '{}'",
        report.steps,
        report.checkpoint.display()
    );
    Ok(())
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::BuildCache(args) => build_cache(args),
        Command::Train(args) => train(args),
    };
    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
