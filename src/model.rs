//! SteerModel wrapper: checkpoint resolution, adapter merging, and
//! batched hidden-state extraction

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::adapter::{load_adapter_weights, merge_adapter, LoraConfig};
use crate::forward_bert::{BertConfig, CodonBert};
use crate::tokenizer::CodonTokenizer;

/// A resolved checkpoint source: a local directory or a HuggingFace repo
enum ModelDir {
    Local(PathBuf),
    Hub(hf_hub::api::sync::ApiRepo),
}

impl ModelDir {
    /// Treat `spec` as a local directory when it exists, otherwise as a
    /// HuggingFace model id.
    fn open(spec: &str) -> Result<Self> {
        let path = Path::new(spec);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        info!("'{spec}' is not a local directory, treating it as a hub model id");
        let api = Api::new()?;
        let repo = api.repo(Repo::new(spec.to_string(), RepoType::Model));
        Ok(Self::Hub(repo))
    }

    /// Fetch a required file
    fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                anyhow::ensure!(
                    path.is_file(),
                    "Checkpoint file not found: {}",
                    path.display()
                );
                Ok(path)
            }
            Self::Hub(repo) => repo
                .get(file)
                .with_context(|| format!("Failed to download {file}")),
        }
    }

    /// Fetch an optional file
    fn find(&self, file: &str) -> Option<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                path.is_file().then_some(path)
            }
            Self::Hub(repo) => repo.get(file).ok(),
        }
    }
}

/// Load a checkpoint's weight map, safetensors only
fn load_weights(dir: &ModelDir, device: &Device) -> Result<HashMap<String, Tensor>> {
    if let Some(path) = dir.find("model.safetensors") {
        return candle_core::safetensors::load(&path, device)
            .with_context(|| format!("Failed to load weights: {}", path.display()));
    }
    if dir.find("pytorch_model.bin").is_some() {
        anyhow::bail!(
            "Checkpoint only has pytorch_model.bin; convert it to model.safetensors first"
        );
    }
    anyhow::bail!("Checkpoint has no model.safetensors")
}

/// High-level model wrapper for steering-vector extraction
pub struct SteerModel {
    model: CodonBert,
    tokenizer: CodonTokenizer,
    device: Device,
}

impl SteerModel {
    /// Load a checkpoint (tries CUDA, falls back to CPU).
    ///
    /// When the checkpoint contains `adapter_config.json` it is treated as
    /// a PEFT/LoRA adapter: the base model named by the adapter config is
    /// loaded and the low-rank deltas are merged into its weights before
    /// the encoder is built.
    pub fn from_pretrained(
        model_path: &str,
        max_length: usize,
        force_cpu: Option<bool>,
    ) -> Result<Self> {
        let device = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };

        info!("Loading model: {model_path}");
        let checkpoint = ModelDir::open(model_path)?;

        let (config, weights, vocab_file) =
            if let Some(adapter_config_path) = checkpoint.find("adapter_config.json") {
                let lora_config = LoraConfig::load(&adapter_config_path)?;
                info!(
                    "Found LoRA adapter (r={}, alpha={}), base model: {}",
                    lora_config.r, lora_config.lora_alpha, lora_config.base_model_name_or_path
                );

                let base = ModelDir::open(&lora_config.base_model_name_or_path)?;
                let config = BertConfig::load(&base.get("config.json")?)?;
                let mut weights = load_weights(&base, &device)?;

                let adapter_path = checkpoint.get("adapter_model.safetensors")?;
                let adapter = load_adapter_weights(&adapter_path, &device)?;
                merge_adapter(&mut weights, &adapter, &lora_config)?;

                let vocab_file = checkpoint
                    .find("vocab.txt")
                    .or_else(|| base.find("vocab.txt"));
                (config, weights, vocab_file)
            } else {
                let config = BertConfig::load(&checkpoint.get("config.json")?)?;
                let weights = load_weights(&checkpoint, &device)?;
                let vocab_file = checkpoint.find("vocab.txt");
                (config, weights, vocab_file)
            };

        let tokenizer = match vocab_file {
            Some(path) => {
                info!("Using checkpoint vocabulary: {}", path.display());
                CodonTokenizer::from_vocab_file(&path, max_length)?
            }
            None => CodonTokenizer::new(max_length),
        };
        if tokenizer.vocab_size() != config.vocab_size {
            warn!(
                "Tokenizer vocab ({}) differs from model vocab ({})",
                tokenizer.vocab_size(),
                config.vocab_size
            );
        }

        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = CodonBert::load(vb, &config)?;

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    /// Assemble a model from already-built parts (used by tests)
    pub fn from_parts(model: CodonBert, tokenizer: CodonTokenizer, device: Device) -> Self {
        Self {
            model,
            tokenizer,
            device,
        }
    }

    /// Number of encoder layers
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Hidden dimension
    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    /// Fixed token length every sequence is padded/truncated to
    pub fn max_length(&self) -> usize {
        self.tokenizer.max_length()
    }

    /// Compute device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Tokenize a batch of sequences to a `(n, max_length)` id tensor on
    /// the compute device
    pub fn encode_batch(&self, seqs: &[String]) -> Result<Tensor> {
        self.tokenizer.encode_batch(seqs, &self.device)
    }

    /// Per-layer hidden states for one tokenized batch, stacked as
    /// `(n_layers, batch, max_length, d_model)`
    pub fn layer_states(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.model.forward_layer_stack(input_ids)
    }
}
