//! Configuration for the dataset, the model and the training loop
//!
//! Built from command line arguments in `main`, with defaults matching Celeb-A at 32x32.

use std::{
    fmt::{self, Display},
    path::PathBuf,
};

use clap::ValueEnum;
use thiserror::Error;

use crate::dataset::{CELEB_A_IMAGES, ChunkSpec, ImageShape};

/// Errors for invalid configuration, reported before any work starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Write mode needs an image directory")]
    MissingImageDir,
    #[error("Image directory '{0}' does not exist")]
    ImageDirNotFound(PathBuf),
    #[error("Cache '{0}' does not exist, build it first or use write mode")]
    CacheNotFound(PathBuf),
    #[error("Image geometry {0} has a zero dimension")]
    ZeroDimension(ImageShape),
    #[error("Unsupported channel count {0}, expected 1, 3 or 4")]
    UnsupportedChannels(usize),
    #[error("Split rate must be in [0, 1), got {0}")]
    InvalidSplitRate(f32),
    #[error("The generator upsamples twice, image size {0} must be divisible by 4")]
    GeneratorGeometry(ImageShape),
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// Whether the cache is rebuilt from the source images or only read
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Read,
    Write,
}

impl Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMode::Read => write!(f, "read"),
            CacheMode::Write => write!(f, "write"),
        }
    }
}

/// Where the corpus lives and how it is turned into training data
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Directory of source images, only needed in write mode
    pub image_dir: Option<PathBuf>,
    pub cache_path: PathBuf,
    /// Extension of the source images, matched case insensitively
    pub extension: String,
    pub shape: ImageShape,
    /// Corpus size the source directory must match, `None` accepts any count
    pub expected_images: Option<usize>,
    pub mode: CacheMode,
    /// Fraction of images held out for testing
    pub split_rate: f32,
    pub seed: u64,
    pub chunk: Option<ChunkSpec>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            image_dir: None,
            cache_path: PathBuf::from("celeb-a.safetensors"),
            extension: "jpg".to_string(),
            shape: ImageShape::default(),
            expected_images: Some(CELEB_A_IMAGES),
            mode: CacheMode::Read,
            split_rate: 0.2,
            seed: 42,
            chunk: None,
        }
    }
}

impl DatasetConfig {
    /// Checks paths and geometry up front
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_shape(self.shape)?;
        if !(0.0..1.0).contains(&self.split_rate) {
            return Err(ConfigError::InvalidSplitRate(self.split_rate));
        }
        if matches!(self.chunk, Some(ChunkSpec { size: 0, .. })) {
            return Err(ConfigError::Zero("chunk size"));
        }
        match self.mode {
            CacheMode::Write => {
                let dir = self.image_dir.as_ref().ok_or(ConfigError::MissingImageDir)?;
                if !dir.is_dir() {
                    return Err(ConfigError::ImageDirNotFound(dir.clone()));
                }
            }
            CacheMode::Read => {
                if !self.cache_path.is_file() {
                    return Err(ConfigError::CacheNotFound(self.cache_path.clone()));
                }
            }
        }
        Ok(())
    }
}

fn validate_shape(shape: ImageShape) -> Result<(), ConfigError> {
    if shape.height == 0 || shape.width == 0 || shape.channels == 0 {
        return Err(ConfigError::ZeroDimension(shape));
    }
    if !matches!(shape.channels, 1 | 3 | 4) {
        return Err(ConfigError::UnsupportedChannels(shape.channels));
    }
    Ok(())
}

/// Hyperparameters of the generator/discriminator pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SrganConfig {
    pub shape: ImageShape,
    /// Noise dimension fed to the generator
    pub z_dim: usize,
    /// Base filter count of the discriminator
    pub df_dim: usize,
    /// Base filter count of the generator
    pub gf_dim: usize,
    /// Width of the discriminator's hidden dense layer
    pub fc_units: usize,
    pub d_lr: f32,
    pub g_lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub lr_decay_rate: f32,
    pub lr_floor: f32,
    pub bn_eps: f32,
    pub seed: u64,
}

impl Default for SrganConfig {
    fn default() -> Self {
        Self {
            shape: ImageShape::default(),
            z_dim: 128,
            df_dim: 64,
            gf_dim: 64,
            fc_units: 1024,
            d_lr: 1e-4,
            g_lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            lr_decay_rate: 0.5,
            lr_floor: 1e-5,
            bn_eps: 1e-5,
            seed: 777,
        }
    }
}

impl SrganConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_shape(self.shape)?;
        if self.shape.height % 4 != 0 || self.shape.width % 4 != 0 {
            return Err(ConfigError::GeneratorGeometry(self.shape));
        }
        for (name, value) in [
            ("z dim", self.z_dim),
            ("discriminator filters", self.df_dim),
            ("generator filters", self.gf_dim),
            ("dense units", self.fc_units),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }
}

/// Settings of the training loop itself
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub epochs: usize,
    /// Learning rates decay once every this many epochs, never when 0
    pub decay_every: usize,
    pub log_every: usize,
    pub save_every: usize,
    pub model_dir: PathBuf,
    pub output_dir: PathBuf,
    pub seed: u64,
    /// Images in each generated sample grid
    pub sample_num: usize,
    /// Load the newest checkpoint in `model_dir` before training
    pub restore: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            epochs: 10,
            decay_every: 0,
            log_every: 10,
            save_every: 100,
            model_dir: PathBuf::from("model"),
            output_dir: PathBuf::from("output"),
            seed: 42,
            sample_num: 8,
            restore: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("batch size", self.batch_size),
            ("log interval", self.log_every),
            ("save interval", self.save_every),
            ("sample count", self.sample_num),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_config_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DatasetConfig {
            cache_path: dir.path().join("missing.safetensors"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::CacheNotFound(_))));

        config.mode = CacheMode::Write;
        assert!(matches!(config.validate(), Err(ConfigError::MissingImageDir)));
        config.image_dir = Some(dir.path().join("nope"));
        assert!(matches!(config.validate(), Err(ConfigError::ImageDirNotFound(_))));
        config.image_dir = Some(dir.path().to_path_buf());
        assert!(config.validate().is_ok());

        config.split_rate = 1.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSplitRate(_))));
        config.split_rate = 0.2;
        config.shape = ImageShape::new(32, 0, 3);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroDimension(_))));
        config.shape = ImageShape::new(32, 32, 2);
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedChannels(2))));
    }

    #[test]
    fn test_model_config_validation() {
        assert!(SrganConfig::default().validate().is_ok());
        let config = SrganConfig {
            shape: ImageShape::new(30, 32, 3),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::GeneratorGeometry(_))));
        let config = SrganConfig {
            fc_units: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("dense units"))));
        assert!(TrainConfig::default().validate().is_ok());
    }
}
