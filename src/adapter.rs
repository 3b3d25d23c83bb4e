//! PEFT/LoRA adapter loading and weight merging
//!
//! A fine-tuned checkpoint stores a small set of low-rank matrices next to
//! a frozen base model. Before inference the deltas are folded into the
//! base weights (`W' = W + (lora_alpha / r) * B @ A`), the equivalent of
//! PEFT's `merge_and_unload`, so the merged model runs as a plain encoder.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Adapter configuration (matches adapter_config.json)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f64,
    pub base_model_name_or_path: String,
    #[serde(default)]
    pub target_modules: Vec<String>,
}

impl LoraConfig {
    /// Load adapter_config.json
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read adapter config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&config_str)?;
        anyhow::ensure!(config.r > 0, "LoRA rank must be positive");
        Ok(config)
    }

    /// Merge scaling factor
    pub fn scale(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

/// Load the adapter weight tensors from adapter_model.safetensors
pub fn load_adapter_weights(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load adapter weights: {}", path.display()))
}

/// Map an adapter tensor name to the base weight it patches.
///
/// PEFT names adapter tensors
/// `base_model.model.<module>.lora_A.weight` / `...lora_B.weight`; the
/// patched base weight is `<module>.weight`.
fn base_key_for(lora_a_key: &str) -> Option<String> {
    let stripped = lora_a_key.strip_suffix(".lora_A.weight")?;
    let stripped = stripped
        .strip_prefix("base_model.model.")
        .unwrap_or(stripped);
    Some(format!("{stripped}.weight"))
}

/// Fold every LoRA delta into the base weight map, in place.
///
/// Returns the number of weights patched. Errors when an adapter pair is
/// incomplete or its target weight is absent from the base model.
pub fn merge_adapter(
    base: &mut HashMap<String, Tensor>,
    adapter: &HashMap<String, Tensor>,
    config: &LoraConfig,
) -> Result<usize> {
    let scale = config.scale();
    let mut merged = 0;

    for (key, lora_a) in adapter {
        let Some(base_key) = base_key_for(key) else {
            continue;
        };
        let b_key = key.replace(".lora_A.weight", ".lora_B.weight");
        let lora_b = adapter
            .get(&b_key)
            .with_context(|| format!("Adapter is missing '{b_key}' for '{key}'"))?;

        let weight = base
            .get(&base_key)
            .with_context(|| format!("Base model has no weight '{base_key}' targeted by adapter"))?;

        // lora_B (out, r) @ lora_A (r, in) -> (out, in), same as the Linear weight
        let delta = (lora_b.matmul(lora_a)? * scale)?;
        anyhow::ensure!(
            delta.dims() == weight.dims(),
            "Adapter delta shape {:?} does not match '{base_key}' {:?}",
            delta.dims(),
            weight.dims()
        );

        let patched = (weight + &delta)?;
        base.insert(base_key.clone(), patched);
        debug!("Merged adapter delta into {base_key}");
        merged += 1;
    }

    anyhow::ensure!(merged > 0, "Adapter contained no mergeable LoRA weights");
    info!("Merged {merged} LoRA deltas (scale {scale:.4})");
    Ok(merged)
}
