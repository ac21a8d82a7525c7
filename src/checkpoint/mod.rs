//! Checkpoint Storage
//!
//! Snapshots every learnable parameter in safetensors format, one file per
//! (dataset, epoch), with a JSON sidecar carrying metadata:
//!
//! ```text
//! <dir>/
//!   best_so_far_<dataset>_epoch_<epoch>.safetensors   # named f32 tensors
//!   best_so_far_<dataset>_epoch_<epoch>.json          # CheckpointMeta
//! ```
//!
//! Loading checks the file's SHA-256 digest against the sidecar, then
//! requires every requested parameter to be present with the same shape.

use crate::{ExplainerError, Result};
use candle_core::{Tensor, Var};
use chrono::{DateTime, Utc};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name and shape of one stored parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub shape: Vec<usize>,
}

/// Sidecar metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub dataset: String,
    pub epoch: usize,
    pub saved_at: DateTime<Utc>,
    /// Hex SHA-256 of the safetensors file
    pub digest: String,
    pub parameters: Vec<ParameterInfo>,
}

/// Directory of best-so-far checkpoints
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(dataset: &str, epoch: usize) -> String {
        format!("best_so_far_{}_epoch_{}", dataset, epoch)
    }

    /// Tensor file for `(dataset, epoch)`
    pub fn path_for(&self, dataset: &str, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}.safetensors", Self::stem(dataset, epoch)))
    }

    fn meta_path_for(&self, dataset: &str, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}.json", Self::stem(dataset, epoch)))
    }

    pub fn exists(&self, dataset: &str, epoch: usize) -> bool {
        self.path_for(dataset, epoch).exists() && self.meta_path_for(dataset, epoch).exists()
    }

    /// Hex SHA-256 of raw bytes
    pub fn digest(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Write every named variable; returns the tensor file path
    pub fn save(&self, dataset: &str, epoch: usize, vars: &[(String, Var)]) -> Result<PathBuf> {
        let mut names = HashSet::new();
        if let Some((dup, _)) = vars.iter().find(|(n, _)| !names.insert(n.as_str())) {
            return Err(ExplainerError::Checkpoint(format!("duplicate parameter name '{}'", dup)));
        }

        std::fs::create_dir_all(&self.dir)?;

        let mut data_store: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            let tensor = var.as_tensor();
            let data: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
            data_store.push((name.clone(), tensor.dims().to_vec(), data));
        }

        let mut views = Vec::with_capacity(data_store.len());
        for (name, shape, data) in &data_store {
            let view = TensorView::new(
                safetensors::tensor::Dtype::F32,
                shape.clone(),
                bytemuck::cast_slice(data),
            )
            .map_err(|e| ExplainerError::Serialization(e.to_string()))?;
            views.push((name.clone(), view));
        }

        let path = self.path_for(dataset, epoch);
        safetensors::serialize_to_file(views, &None, &path)
            .map_err(|e| ExplainerError::Serialization(e.to_string()))?;

        let bytes = std::fs::read(&path)?;
        let meta = CheckpointMeta {
            dataset: dataset.to_string(),
            epoch,
            saved_at: Utc::now(),
            digest: Self::digest(&bytes),
            parameters: data_store
                .iter()
                .map(|(name, shape, _)| ParameterInfo {
                    name: name.clone(),
                    shape: shape.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| ExplainerError::Serialization(e.to_string()))?;
        std::fs::write(self.meta_path_for(dataset, epoch), json)?;

        info!(
            path = %path.display(),
            parameters = meta.parameters.len(),
            "saved checkpoint"
        );
        Ok(path)
    }

    pub fn read_meta(&self, dataset: &str, epoch: usize) -> Result<CheckpointMeta> {
        let path = self.meta_path_for(dataset, epoch);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ExplainerError::Checkpoint(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| ExplainerError::Serialization(e.to_string()))
    }

    /// Overwrite every named variable with the stored values
    ///
    /// Nothing is written unless the digest matches and every variable is
    /// present with its current shape.
    pub fn load_into(&self, dataset: &str, epoch: usize, vars: &[(String, Var)]) -> Result<CheckpointMeta> {
        let meta = self.read_meta(dataset, epoch)?;
        let path = self.path_for(dataset, epoch);
        let bytes = std::fs::read(&path).map_err(|e| {
            ExplainerError::Checkpoint(format!("cannot read {}: {}", path.display(), e))
        })?;

        let digest = Self::digest(&bytes);
        if digest != meta.digest {
            return Err(ExplainerError::Checkpoint(format!(
                "digest mismatch for {}: expected {}, found {}",
                path.display(),
                meta.digest,
                digest
            )));
        }

        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| ExplainerError::Serialization(e.to_string()))?;

        let mut staged = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            let view = tensors.tensor(name).map_err(|_| {
                ExplainerError::Checkpoint(format!("parameter '{}' missing from {}", name, path.display()))
            })?;
            if view.shape() != var.as_tensor().dims() {
                return Err(ExplainerError::Checkpoint(format!(
                    "parameter '{}' has shape {:?}, expected {:?}",
                    name,
                    view.shape(),
                    var.as_tensor().dims()
                )));
            }
            let float_data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
            let tensor = Tensor::from_vec(float_data, view.shape(), var.device())
                .map_err(|e| ExplainerError::Tensor(e.to_string()))?;
            staged.push((var, tensor));
        }

        for (var, tensor) in staged {
            var.set(&tensor)?;
        }

        debug!(path = %path.display(), epoch, "restored checkpoint");
        Ok(meta)
    }
}
