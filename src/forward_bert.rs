//! BERT encoder forward pass with per-layer hidden-state capture
//!
//! Custom implementation that runs layer-by-layer so the output hidden
//! state of every encoder layer can be collected for steering-vector
//! extraction. Matches the HuggingFace `BertModel` weight layout used by
//! codon language model checkpoints (post-norm layers, learned absolute
//! position embeddings, GELU intermediate).

use anyhow::{Context, Result};
use candle_core::{DType, Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

/// Model configuration (matches the checkpoint's config.json)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
}

fn default_max_position_embeddings() -> usize {
    1024
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

impl BertConfig {
    /// Load config.json from a checkpoint directory file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&config_str)?;
        Ok(config)
    }
}

fn apply_hidden_act(x: &Tensor, act: &str) -> Result<Tensor> {
    match act {
        "gelu" | "gelu_new" => Ok(x.gelu_erf()?),
        "relu" => Ok(x.relu()?),
        other => anyhow::bail!("Unsupported hidden_act '{other}'"),
    }
}

/// Word + position + token-type embeddings with post LayerNorm
struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl BertEmbeddings {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let word_embeddings = embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("word_embeddings"),
        )?;
        let position_embeddings = embedding(
            config.max_position_embeddings,
            config.hidden_size,
            vb.pp("position_embeddings"),
        )?;
        let token_type_embeddings = embedding(
            config.type_vocab_size,
            config.hidden_size,
            vb.pp("token_type_embeddings"),
        )?;
        let layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("LayerNorm"),
        )?;

        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            layer_norm,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let device = input_ids.device();

        let word = self.word_embeddings.forward(input_ids)?;

        let position_ids = Tensor::arange(0u32, seq_len as u32, device)?.unsqueeze(0)?;
        let position = self.position_embeddings.forward(&position_ids)?;

        let token_type_ids = Tensor::zeros((1, seq_len), DType::U32, device)?;
        let token_type = self.token_type_embeddings.forward(&token_type_ids)?;

        let embeddings = word
            .broadcast_add(&position)?
            .broadcast_add(&token_type)?;
        Ok(self.layer_norm.forward(&embeddings)?)
    }
}

/// Bidirectional multi-head self-attention.
///
/// No attention mask is applied: the extraction tool feeds fixed-length
/// padded batches and lets attention see the padding, reproducing the
/// checkpoint's original inference behavior.
struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl BertSelfAttention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let head_dim = config.hidden_size / config.num_attention_heads;
        let query = linear(config.hidden_size, config.hidden_size, vb.pp("query"))?;
        let key = linear(config.hidden_size, config.hidden_size, vb.pp("key"))?;
        let value = linear(config.hidden_size, config.hidden_size, vb.pp("value"))?;

        Ok(Self {
            query,
            key,
            value,
            num_heads: config.num_attention_heads,
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;

        // Reshape for multi-head attention
        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // Scaled dot-product attention, no mask (bidirectional encoder)
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // Reshape back
        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, seq_len, ()))?;
        Ok(attn_output)
    }
}

/// Attention output projection + residual + LayerNorm (post-norm)
struct BertAttention {
    self_attn: BertSelfAttention,
    output_dense: Linear,
    output_layer_norm: LayerNorm,
}

impl BertAttention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let self_attn = BertSelfAttention::load(vb.pp("self"), config)?;
        let output_dense = linear(
            config.hidden_size,
            config.hidden_size,
            vb.pp("output").pp("dense"),
        )?;
        let output_layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("output").pp("LayerNorm"),
        )?;

        Ok(Self {
            self_attn,
            output_dense,
            output_layer_norm,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let attn = self.self_attn.forward(x)?;
        let attn = self.output_dense.forward(&attn)?;
        Ok(self.output_layer_norm.forward(&(attn + x)?)?)
    }
}

/// Single encoder layer: attention, GELU intermediate, output projection,
/// each followed by residual + LayerNorm
struct BertLayer {
    attention: BertAttention,
    intermediate_dense: Linear,
    output_dense: Linear,
    output_layer_norm: LayerNorm,
    hidden_act: String,
}

impl BertLayer {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let attention = BertAttention::load(vb.pp("attention"), config)?;
        let intermediate_dense = linear(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("intermediate").pp("dense"),
        )?;
        let output_dense = linear(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("output").pp("dense"),
        )?;
        let output_layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("output").pp("LayerNorm"),
        )?;

        Ok(Self {
            attention,
            intermediate_dense,
            output_dense,
            output_layer_norm,
            hidden_act: config.hidden_act.clone(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.attention.forward(x)?;

        let intermediate = self.intermediate_dense.forward(&x)?;
        let intermediate = apply_hidden_act(&intermediate, &self.hidden_act)?;
        let output = self.output_dense.forward(&intermediate)?;
        Ok(self.output_layer_norm.forward(&(output + x)?)?)
    }
}

/// Codon BERT encoder with per-layer hidden-state capture
pub struct CodonBert {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    n_layers: usize,
    n_heads: usize,
    hidden_size: usize,
    vocab_size: usize,
}

impl CodonBert {
    /// Build the model from a `VarBuilder` over the checkpoint weights.
    ///
    /// Checkpoints saved as `BertForPreTraining` carry a `bert.` key
    /// prefix; plain `BertModel` checkpoints do not. Both are accepted.
    pub fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let vb = if vb.contains_tensor("bert.embeddings.word_embeddings.weight") {
            vb.pp("bert")
        } else {
            vb
        };

        let embeddings = BertEmbeddings::load(vb.pp("embeddings"), config)?;

        let vb_encoder = vb.pp("encoder");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let layer = BertLayer::load(vb_encoder.pp(format!("layer.{i}")), config)?;
            layers.push(layer);
        }

        info!(
            "Encoder loaded: {} layers, {} hidden, {} heads, {} vocab",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.vocab_size
        );

        Ok(Self {
            embeddings,
            layers,
            n_layers: config.num_hidden_layers,
            n_heads: config.num_attention_heads,
            hidden_size: config.hidden_size,
            vocab_size: config.vocab_size,
        })
    }

    /// Number of encoder layers
    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// Hidden dimension
    pub fn d_model(&self) -> usize {
        self.hidden_size
    }

    /// Number of attention heads
    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// Vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Forward pass collecting the output hidden state of every encoder
    /// layer.
    ///
    /// Returns one `(batch, seq_len, d_model)` tensor per layer. The
    /// embedding output itself is not included: only true encoder-layer
    /// outputs are captured.
    pub fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<Vec<Tensor>> {
        let mut hidden = self.embeddings.forward(input_ids)?;

        let mut states = Vec::with_capacity(self.n_layers);
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
            states.push(hidden.clone());
        }
        Ok(states)
    }

    /// Forward pass stacking per-layer hidden states along a new leading
    /// dimension: `(n_layers, batch, seq_len, d_model)`.
    pub fn forward_layer_stack(&self, input_ids: &Tensor) -> Result<Tensor> {
        let states = self.forward_hidden_states(input_ids)?;
        Ok(Tensor::stack(&states, 0)?)
    }
}
