//! Keep-last checkpoints of the model parameters
//!
//! Every parameter group is stored as an `F32` tensor under its scoped name, e.g.
//! `discriminator.block1.conv.kernel`, in `srgan-<step>.safetensors`.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use safetensors::{Dtype, SafeTensorError, SafeTensors, tensor::TensorView};
use thiserror::Error;

use crate::values::Value;

const PREFIX: &str = "srgan-";
const EXTENSION: &str = "safetensors";

/// Errors for saving and restoring checkpoints
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checkpoint container error: {0}")]
    Container(#[from] SafeTensorError),
    #[error("Checkpoint has no tensor `{0}`")]
    MissingTensor(String),
    #[error("Tensor `{name}` holds {found} values, the model expects {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("Tensor `{name}` has dtype {dtype:?}, expected F32")]
    DtypeMismatch { name: String, dtype: Dtype },
}

/// Saves checkpoints to a directory, keeping only the most recent one
pub struct Saver {
    dir: PathBuf,
}

impl Saver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{step}.{EXTENSION}"))
    }

    /// Existing checkpoints as `(step, path)`, oldest first
    fn checkpoints(&self) -> Result<Vec<(usize, PathBuf)>, CheckpointError> {
        if !self.dir.is_dir() {
            return Ok(vec![]);
        }
        let mut found = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(PREFIX))
                .and_then(|n| n.strip_suffix(EXTENSION))
                .and_then(|n| n.strip_suffix('.'))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(step) = step {
                found.push((step, path));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Path of the newest checkpoint, if any
    pub fn latest(&self) -> Result<Option<PathBuf>, CheckpointError> {
        Ok(self.checkpoints()?.pop().map(|(_, path)| path))
    }

    /// Writes all parameters for `step`, then removes every older checkpoint
    pub fn save(
        &self,
        step: usize,
        params: &[(String, Vec<Value>)],
    ) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let buffers = params
            .iter()
            .map(|(name, values)| {
                let bytes = values
                    .iter()
                    .flat_map(|v| v.data().to_le_bytes())
                    .collect::<Vec<u8>>();
                (name.as_str(), values.len(), bytes)
            })
            .collect::<Vec<_>>();
        let views = buffers
            .iter()
            .map(|(name, len, bytes)| Ok((*name, TensorView::new(Dtype::F32, vec![*len], bytes)?)))
            .collect::<Result<Vec<_>, SafeTensorError>>()?;
        let metadata = HashMap::from([("step".to_string(), step.to_string())]);
        let bytes = safetensors::serialize(views, Some(metadata))?;

        let path = self.path_for(step);
        fs::write(&path, bytes)?;
        for (_, old) in self.checkpoints()? {
            if old != path {
                fs::remove_file(&old)?;
            }
        }
        log::info!("Saved checkpoint to '{}'", path.display());
        Ok(path)
    }

    /// Loads the newest checkpoint into `params`, returns its path or `None` if there is none
    pub fn restore_latest(
        &self,
        params: &[(String, Vec<Value>)],
    ) -> Result<Option<PathBuf>, CheckpointError> {
        let Some(path) = self.latest()? else {
            return Ok(None);
        };
        restore(&path, params)?;
        log::info!("Restored checkpoint from '{}'", path.display());
        Ok(Some(path))
    }
}

/// Copies the tensors stored at `path` into the matching parameters
pub fn restore(path: &Path, params: &[(String, Vec<Value>)]) -> Result<(), CheckpointError> {
    let bytes = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes)?;
    for (name, values) in params {
        let view = tensors
            .tensor(name)
            .map_err(|_| CheckpointError::MissingTensor(name.clone()))?;
        if view.dtype() != Dtype::F32 {
            return Err(CheckpointError::DtypeMismatch {
                name: name.clone(),
                dtype: view.dtype(),
            });
        }
        let data = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect::<Vec<_>>();
        if data.len() != values.len() {
            return Err(CheckpointError::SizeMismatch {
                name: name.clone(),
                expected: values.len(),
                found: data.len(),
            });
        }
        for (value, new) in values.iter().zip(data) {
            value.clone().set_data(new);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(values: &[f32]) -> Vec<(String, Vec<Value>)> {
        vec![
            (
                "net.kernel".to_string(),
                values.iter().map(|v| Value::new(*v)).collect(),
            ),
            ("net.bias".to_string(), vec![Value::new(0.5)]),
        ]
    }

    #[test]
    fn test_keeps_only_the_last_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let saver = Saver::new(dir.path().join("model"));
        assert_eq!(saver.latest().unwrap(), None);

        saver.save(10, &params(&[1.0, 2.0])).unwrap();
        let last = saver.save(20, &params(&[3.0, 4.0])).unwrap();
        assert_eq!(saver.latest().unwrap(), Some(last.clone()));
        assert_eq!(fs::read_dir(dir.path().join("model")).unwrap().count(), 1);
        assert!(last.ends_with("srgan-20.safetensors"));
    }

    #[test]
    fn test_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let saver = Saver::new(dir.path());
        saver.save(3, &params(&[1.5, -2.25])).unwrap();

        let target = params(&[0.0, 0.0]);
        target[1].1[0].clone().set_data(9.0);
        assert!(saver.restore_latest(&target).unwrap().is_some());
        assert_eq!(
            target[0].1.iter().map(|v| v.data()).collect::<Vec<_>>(),
            vec![1.5, -2.25]
        );
        assert_eq!(target[1].1[0].data(), 0.5);

        let wrong = params(&[0.0, 0.0, 0.0]);
        assert!(matches!(
            saver.restore_latest(&wrong),
            Err(CheckpointError::SizeMismatch {
                expected: 3,
                found: 2,
                ..
            })
        ));
        let missing = vec![("other".to_string(), vec![Value::new(0.0)])];
        assert!(matches!(
            saver.restore_latest(&missing),
            Err(CheckpointError::MissingTensor(_))
        ));
    }
}
