// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // x, q, k, v standard in math
#![allow(clippy::module_name_repetitions)] // SteerModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns

//! steervec-rs: steering-vector extraction from codon language models
//!
//! Computes the mean difference in per-layer hidden-state activations
//! between a "high" and a "low" group of biological sequences, producing
//! one activation-space direction per encoder layer that can later bias
//! generation toward a target property (higher CAI, lower MFE).
//!
//! ## Architecture
//!
//! - `model`: High-level SteerModel wrapper (checkpoint resolution, LoRA
//!   merge, device selection, batched hidden-state extraction)
//! - `forward_bert`: BERT encoder forward pass with per-layer capture
//! - `adapter`: PEFT/LoRA adapter config and weight merging
//! - `tokenizer`: Codon 3-mer tokenizer with fixed-length encoding
//! - `corpus`: FASTA loading, score table, contrast-group selection
//! - `steering`: Group aggregation, high-minus-low contrast, npy export

pub mod adapter;
pub mod corpus;
pub mod forward_bert;
pub mod model;
pub mod steering;
pub mod tokenizer;

pub use adapter::{load_adapter_weights, merge_adapter, LoraConfig};
pub use corpus::{
    groups_from_fasta, read_fasta, read_fasta_map, select_groups, ContrastGroups, DataType,
    FastaRecord, ScoreRow, ScoreTable, SelectionConfig,
};
pub use forward_bert::{BertConfig, CodonBert};
pub use model::SteerModel;
pub use steering::{contrast, extract, group_mean_states, ExtractConfig, SteeringVectors};
pub use tokenizer::{kmerize, CodonTokenizer};
