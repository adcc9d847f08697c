//! The training loop: alternating GAN updates over the train split with periodic logging,
//! checkpoints, sample grids and test evaluation

use std::path::PathBuf;

use thiserror::Error;

use crate::{
    checkpoint::{CheckpointError, Saver},
    config::{ConfigError, DatasetConfig, SrganConfig, TrainConfig},
    dataloader::{DataIterator, DataLoaderError},
    dataset::{CelebADataset, DatasetError, Images},
    loss::GanLosses,
    models::Srgan,
    nn::NNError,
    summary::{LossHistory, plot_losses, save_image_grid},
    tensor::Tensor,
};

/// Columns of the generated sample grids
const GRID_COLUMNS: usize = 4;

/// Errors for a training run
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    #[error(transparent)]
    Model(#[from] NNError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write samples: {0}")]
    Samples(String),
}

/// What a finished run produced
#[derive(Debug)]
pub struct TrainReport {
    pub steps: usize,
    pub history: LossHistory,
    /// Test split losses as `(step, losses)`
    pub evaluations: Vec<(usize, GanLosses)>,
    /// Discriminator and generator learning rates at the end of the run
    pub learning_rates: (f32, f32),
    /// Checkpoint the run started from
    pub restored: Option<PathBuf>,
    /// Checkpoint written at the end of the run
    pub checkpoint: PathBuf,
    /// Loss plot, `None` when there was nothing to plot or plotting failed
    pub plot: Option<PathBuf>,
}

type ImageIterator = DataIterator<Vec<f32>>;

/// Batches over both splits. The test split is skipped when it cannot fill one batch,
/// and it is shuffled with its own seed.
fn iterators(
    train: Images,
    test: Images,
    config: &TrainConfig,
) -> Result<(ImageIterator, Option<ImageIterator>), DataLoaderError> {
    let train_iter = DataIterator::unlabeled(train.into_rows(), config.batch_size, config.seed)?;
    let test_iter = if test.len() >= config.batch_size {
        Some(DataIterator::unlabeled(
            test.into_rows(),
            config.batch_size,
            config.seed.wrapping_add(1),
        )?)
    } else {
        log::warn!(
            "Test split has {} images, fewer than one batch of {}, skipping evaluation",
            test.len(),
            config.batch_size
        );
        None
    };
    Ok((train_iter, test_iter))
}

/// Trains a fresh (or restored) model on the dataset for `config.epochs` epochs
pub fn train(
    dataset_config: &DatasetConfig,
    model_config: SrganConfig,
    config: &TrainConfig,
) -> Result<TrainReport, TrainError> {
    dataset_config.validate()?;
    model_config.validate()?;
    config.validate()?;

    let dataset = CelebADataset::open(dataset_config)?;
    let shape = dataset.train.shape();
    let (mut train_iter, mut test_iter) = iterators(dataset.train, dataset.test, config)?;

    let mut model = Srgan::new(model_config);
    let saver = Saver::new(&config.model_dir);
    let restored = if config.restore {
        saver.restore_latest(&model.named_parameters())?
    } else {
        None
    };
    std::fs::create_dir_all(&config.output_dir)?;
    let sample_z = model.sample_noise(config.sample_num)?;

    let mut history = LossHistory::new();
    let mut evaluations = vec![];
    let mut step = 0;
    for epoch in 0..config.epochs {
        for batch in train_iter.iterate() {
            let real = Tensor::from_rows(&shape.dims(), &batch.features)?;
            let z = model.sample_noise(batch.len())?;
            let losses = model.train_step(&real, &z)?;
            step += 1;

            if step % config.log_every == 0 {
                log::info!(
                    "epoch: {}, step: {}, d_loss: {:.6}, g_loss: {:.6}, d_real: {:.4}, d_fake: {:.4}",
                    epoch + 1,
                    step,
                    losses.d_loss,
                    losses.g_loss,
                    losses.d_real,
                    losses.d_fake
                );
                history.record(step, losses);
            }

            if step % config.save_every == 0 {
                saver.save(step, &model.named_parameters())?;
                let samples = model.generate(&sample_z)?;
                let file_name = config.output_dir.join(format!("samples_step_{step}.png"));
                save_image_grid(&samples.data(), shape, GRID_COLUMNS, &file_name)
                    .map_err(|e| TrainError::Samples(e.to_string()))?;

                if let Some(test_iter) = test_iter.as_mut() {
                    let batch = test_iter.next_batch();
                    let real = Tensor::from_rows(&shape.dims(), &batch.features)?;
                    let z = model.sample_noise(batch.len())?;
                    let eval = model.evaluate(&real, &z)?;
                    log::info!(
                        "step: {}, test d_loss: {:.6}, test g_loss: {:.6}",
                        step,
                        eval.d_loss,
                        eval.g_loss
                    );
                    evaluations.push((step, eval));
                }
            }
        }
        if config.decay_every > 0 && (epoch + 1) % config.decay_every == 0 {
            model.decay_learning_rates();
        }
    }

    let checkpoint = saver.save(step, &model.named_parameters())?;
    if let Some((last_step, losses)) = history.last() {
        log::info!(
            "Finished after {} steps, last logged step {}: d_loss: {:.6}, g_loss: {:.6}",
            step,
            last_step,
            losses.d_loss,
            losses.g_loss
        );
    }

    let plot = if history.is_empty() {
        None
    } else {
        let file_name = config.output_dir.join("losses.png");
        // plotting needs a system font, failing only warns
        match plot_losses(&history, &file_name) {
            Ok(()) => Some(file_name),
            Err(e) => {
                log::warn!("Could not plot losses: {}", e);
                None
            }
        }
    };

    Ok(TrainReport {
        steps: step,
        history,
        evaluations,
        learning_rates: model.learning_rates(),
        restored,
        checkpoint,
        plot,
    })
}
