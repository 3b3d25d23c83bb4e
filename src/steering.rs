//! Steering-vector extraction
//!
//! Runs the two sequence groups through the encoder in batches, collects
//! the per-layer hidden-state stacks, mean-pools each group across its
//! sequences, and takes the high-minus-low difference (sign-flipped for
//! the MFE contrast, where lower is the desired direction). The result is
//! persisted as a `.npy` array.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array4;
use ndarray_npy::write_npy;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::corpus::{ContrastGroups, DataType};
use crate::model::SteerModel;

/// Batching parameters for the forward passes
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub batch_size: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self { batch_size: 32 }
    }
}

/// Per-layer steering vectors, shape `(n_layers, 1, max_length, d_model)`
pub struct SteeringVectors {
    data: Tensor,
}

impl SteeringVectors {
    /// Wrap a `(n_layers, 1, max_length, d_model)` tensor
    pub fn new(data: Tensor) -> Result<Self> {
        let dims = data.dims();
        anyhow::ensure!(
            dims.len() == 4 && dims[1] == 1,
            "Steering vectors must have shape (n_layers, 1, max_length, d_model), got {dims:?}"
        );
        Ok(Self { data })
    }

    /// Number of encoder layers covered
    pub fn n_layers(&self) -> usize {
        self.data.dims()[0]
    }

    /// Token length of each per-layer vector
    pub fn max_length(&self) -> usize {
        self.data.dims()[2]
    }

    /// Hidden dimension
    pub fn d_model(&self) -> usize {
        self.data.dims()[3]
    }

    /// Full shape
    pub fn shape(&self) -> [usize; 4] {
        let dims = self.data.dims();
        [dims[0], dims[1], dims[2], dims[3]]
    }

    /// The underlying tensor
    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    /// Convert to an `ndarray` array for export
    pub fn to_array4(&self) -> Result<Array4<f32>> {
        let [l, o, s, d] = self.shape();
        let flat: Vec<f32> = self
            .data
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;
        let arr = Array4::from_shape_vec((l, o, s, d), flat)
            .context("Steering tensor does not match its own shape")?;
        Ok(arr)
    }

    /// Write `steering_vectors_<save_name>.npy` under `save_dir`, creating
    /// the directory if absent. Returns the written path.
    pub fn save(&self, save_dir: &Path, save_name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(save_dir)
            .with_context(|| format!("Failed to create {}", save_dir.display()))?;
        let path = save_dir.join(format!("steering_vectors_{save_name}.npy"));
        let arr = self.to_array4()?;
        write_npy(&path, &arr)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved steering vectors {:?} to {}", self.shape(), path.display());
        Ok(path)
    }
}

fn progress_bar(n_batches: usize, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(n_batches as u64);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(label.to_string());
    pb
}

/// Mean per-layer activation for one group.
///
/// Runs `input_ids` (shape `(n, max_length)`) through the encoder in
/// batches, concatenates the per-batch `(n_layers, batch, max_length,
/// d_model)` stacks along the sequence dimension on the CPU, and averages
/// over it with keepdim, yielding `(n_layers, 1, max_length, d_model)`.
pub fn group_mean_states(
    model: &SteerModel,
    input_ids: &Tensor,
    config: &ExtractConfig,
    label: &str,
) -> Result<Tensor> {
    let n = input_ids.dim(0)?;
    anyhow::ensure!(n > 0, "Cannot average over an empty sequence group");
    let batch_size = config.batch_size.max(1);

    let n_batches = n.div_ceil(batch_size);
    let pb = progress_bar(n_batches, label);

    let mut stacks = Vec::with_capacity(n_batches);
    let mut i = 0;
    while i < n {
        let len = batch_size.min(n - i);
        let batch = input_ids.narrow(0, i, len)?;
        let states = model.layer_states(&batch)?;
        // Keep the accumulated stacks on the CPU so long groups don't
        // exhaust device memory.
        stacks.push(states.to_device(&Device::Cpu)?);
        pb.inc(1);
        i += len;
    }
    pb.finish_and_clear();

    let stack = Tensor::cat(&stacks, 1)?;
    Ok(stack.mean_keepdim(1)?)
}

/// High-minus-low contrast of the two mean activation stacks.
///
/// For the `mfe` data type the difference is negated: the score column
/// ranks by normalized MFE, but lower MFE is the desired direction.
pub fn contrast(high_mean: &Tensor, low_mean: &Tensor, data_type: DataType) -> Result<Tensor> {
    anyhow::ensure!(
        high_mean.dims() == low_mean.dims(),
        "Group activation shapes differ: {:?} vs {:?}",
        high_mean.dims(),
        low_mean.dims()
    );
    let diff = (high_mean - low_mean)?;
    if data_type == DataType::Mfe {
        Ok(diff.neg()?)
    } else {
        Ok(diff)
    }
}

/// Extract the steering vectors for a pair of contrast groups.
pub fn extract(
    model: &SteerModel,
    groups: &ContrastGroups,
    data_type: DataType,
    config: &ExtractConfig,
) -> Result<SteeringVectors> {
    info!(
        "Computing steering vectors: {} high / {} low sequences, {} layers",
        groups.high.len(),
        groups.low.len(),
        model.n_layers()
    );

    let high_ids = model.encode_batch(&groups.high)?;
    let low_ids = model.encode_batch(&groups.low)?;
    anyhow::ensure!(
        high_ids.dim(1)? == low_ids.dim(1)?,
        "High and low groups tokenized to different lengths"
    );

    let high_mean = group_mean_states(model, &high_ids, config, "high group")?;
    let low_mean = group_mean_states(model, &low_ids, config, "low group")?;

    let vectors = contrast(&high_mean, &low_mean, data_type)?;
    SteeringVectors::new(vectors)
}
