//! Codon 3-mer tokenizer
//!
//! The codon language model uses a fixed 3-mer vocabulary that is not
//! covered by the HuggingFace `tokenizers` crate. This module implements
//! the same scheme in Rust: sequences are uppercased, `T` is normalized to
//! `U`, split into consecutive 3-character tokens (window 3, stride 3) and
//! mapped through a codon vocabulary with `[CLS]`/`[SEP]` framing, `[PAD]`
//! padding and truncation to a fixed length.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const MASK_TOKEN: &str = "[MASK]";

/// RNA bases used to enumerate the built-in codon vocabulary
const BASES: [char; 4] = ['A', 'U', 'G', 'C'];

/// Split a sequence into k-mers with the given stride.
///
/// Input is uppercased and `T` is normalized to `U` (the model is trained
/// on mRNA). A trailing fragment shorter than `k` is dropped.
pub fn kmerize(seq: &str, k: usize, stride: usize) -> Vec<String> {
    let chars: Vec<char> = seq
        .chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c == 'T' {
                'U'
            } else {
                c
            }
        })
        .collect();

    let mut kmers = Vec::new();
    let mut i = 0;
    while i + k <= chars.len() {
        kmers.push(chars[i..i + k].iter().collect());
        i += stride;
    }
    kmers
}

/// Fixed-vocabulary codon tokenizer producing fixed-length id sequences
#[derive(Debug)]
pub struct CodonTokenizer {
    vocab: HashMap<String, u32>,
    max_length: usize,
}

impl CodonTokenizer {
    /// Build the tokenizer with the built-in codon vocabulary.
    ///
    /// Ids: `[PAD]`=0, `[UNK]`=1, `[CLS]`=2, `[SEP]`=3, `[MASK]`=4,
    /// then the 64 codons over `AUGC` in lexicographic base order.
    pub fn new(max_length: usize) -> Self {
        let mut vocab = HashMap::new();
        for (id, tok) in [PAD_TOKEN, UNK_TOKEN, CLS_TOKEN, SEP_TOKEN, MASK_TOKEN]
            .iter()
            .enumerate()
        {
            vocab.insert((*tok).to_string(), id as u32);
        }

        let mut next_id = vocab.len() as u32;
        for a in BASES {
            for b in BASES {
                for c in BASES {
                    vocab.insert(format!("{a}{b}{c}"), next_id);
                    next_id += 1;
                }
            }
        }

        Self { vocab, max_length }
    }

    /// Load a vocabulary file (HuggingFace format: one token per line,
    /// line number = token id).
    pub fn from_vocab_file(path: &Path, max_length: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocab file: {}", path.display()))?;

        let mut vocab = HashMap::new();
        for (id, line) in content.lines().enumerate() {
            let tok = line.trim();
            if tok.is_empty() {
                continue;
            }
            vocab.insert(tok.to_string(), id as u32);
        }

        for tok in [PAD_TOKEN, UNK_TOKEN, CLS_TOKEN, SEP_TOKEN] {
            anyhow::ensure!(
                vocab.contains_key(tok),
                "Vocab file {} is missing required special token {tok}",
                path.display()
            );
        }

        Ok(Self { vocab, max_length })
    }

    /// Number of entries in the vocabulary
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Fixed output length of [`encode`](Self::encode)
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Look up a token id, falling back to `[UNK]`
    fn token_id(&self, tok: &str) -> u32 {
        self.vocab
            .get(tok)
            .or_else(|| self.vocab.get(UNK_TOKEN))
            .copied()
            .unwrap_or(1)
    }

    /// Encode one sequence to exactly `max_length` token ids:
    /// `[CLS] codon… [SEP] [PAD]…`, truncating the codons when the
    /// framed sequence would exceed `max_length`.
    pub fn encode(&self, seq: &str) -> Vec<u32> {
        let pad_id = self.token_id(PAD_TOKEN);
        let cls_id = self.token_id(CLS_TOKEN);
        let sep_id = self.token_id(SEP_TOKEN);

        // room for the [CLS]/[SEP] frame
        let body = self.max_length.saturating_sub(2);
        let mut kmers = kmerize(seq, 3, 3);
        if kmers.len() > body {
            kmers.truncate(body);
        }

        let mut ids = Vec::with_capacity(self.max_length);
        ids.push(cls_id);
        ids.extend(kmers.iter().map(|k| self.token_id(k)));
        ids.push(sep_id);
        ids.resize(self.max_length, pad_id);
        ids
    }

    /// Encode a batch of sequences into a `(n, max_length)` U32 tensor
    pub fn encode_batch(&self, seqs: &[String], device: &Device) -> Result<Tensor> {
        let n = seqs.len();
        let mut flat = Vec::with_capacity(n * self.max_length);
        for seq in seqs {
            flat.extend(self.encode(seq));
        }
        let ids = Tensor::new(&flat[..], device)?.reshape((n, self.max_length))?;
        Ok(ids)
    }
}
