//! Sequence loading and contrast-group selection
//!
//! Supplies the two sequence groups ("high" and "low") whose mean
//! activations are contrasted. Groups come either directly from a pair of
//! FASTA files, or from a per-sequence score table ranked by MFE, CAI, or
//! a blended score.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Which property the contrast targets, and where the groups come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// High/low groups given directly as two FASTA files
    Fasta,
    /// Rank by normalized minimum free energy (lower is better)
    Mfe,
    /// Rank by codon adaptation index (higher is better)
    Cai,
    /// Rank by the blended score `-MFE_normalized + lambda * log_CAI`
    MfeCai,
}

impl DataType {
    /// Parse a data-type flag. Unrecognized values are a fatal error.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fasta" => Ok(Self::Fasta),
            "mfe" => Ok(Self::Mfe),
            "cai" => Ok(Self::Cai),
            "mfe_cai" => Ok(Self::MfeCai),
            other => {
                anyhow::bail!("data_type must be 'mfe', 'cai', 'mfe_cai' or 'fasta', got '{other}'")
            }
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fasta => "fasta",
            Self::Mfe => "mfe",
            Self::Cai => "cai",
            Self::MfeCai => "mfe_cai",
        };
        f.write_str(s)
    }
}

/// A single FASTA record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastaRecord {
    pub id: String,
    pub seq: String,
}

/// Read all records from a FASTA file.
///
/// The record id is the header token up to the first whitespace; sequence
/// lines are concatenated and uppercased.
pub fn read_fasta(path: &Path) -> Result<Vec<FastaRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read FASTA file: {}", path.display()))?;

    let mut records = Vec::new();
    let mut id: Option<String> = None;
    let mut seq = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            if let Some(prev_id) = id.take() {
                records.push(FastaRecord {
                    id: prev_id,
                    seq: std::mem::take(&mut seq),
                });
            }
            let token = header.split_whitespace().next().unwrap_or("");
            id = Some(token.to_string());
        } else if id.is_some() {
            seq.push_str(&line.to_ascii_uppercase());
        }
    }
    if let Some(prev_id) = id {
        records.push(FastaRecord { id: prev_id, seq });
    }

    anyhow::ensure!(
        !records.is_empty(),
        "No FASTA records found in {}",
        path.display()
    );
    Ok(records)
}

/// Read a FASTA file into an id → sequence map
pub fn read_fasta_map(path: &Path) -> Result<HashMap<String, String>> {
    let records = read_fasta(path)?;
    Ok(records.into_iter().map(|r| (r.id, r.seq)).collect())
}

/// One row of the per-sequence score table
#[derive(Debug, Clone)]
pub struct ScoreRow {
    pub id: String,
    pub mfe_normalized: f64,
    pub cai: f64,
    pub log_cai: f64,
}

/// Per-sequence score table loaded from a CSV file with header
///
/// Required columns: `ID`, `MFE_normalized`, `CAI`. An optional `log_CAI`
/// column is used when present; otherwise `ln(CAI)` is computed.
#[derive(Debug, Clone)]
pub struct ScoreTable {
    rows: Vec<ScoreRow>,
}

impl ScoreTable {
    /// Load the table from a CSV file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read score table: {}", path.display()))?;

        let mut lines = content.lines();
        let header = lines
            .next()
            .with_context(|| format!("Score table {} is empty", path.display()))?;
        let columns: Vec<&str> = header.split(',').map(str::trim).collect();

        let col = |name: &str| -> Result<usize> {
            columns
                .iter()
                .position(|c| *c == name)
                .with_context(|| format!("Score table is missing column '{name}'"))
        };
        let id_col = col("ID")?;
        let mfe_col = col("MFE_normalized")?;
        let cai_col = col("CAI")?;
        let log_cai_col = columns.iter().position(|c| *c == "log_CAI");

        let mut rows = Vec::new();
        for (lineno, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let field = |idx: usize| -> Result<&str> {
                fields
                    .get(idx)
                    .copied()
                    .with_context(|| format!("Score table line {} is short", lineno + 2))
            };
            let parse_f64 = |idx: usize| -> Result<f64> {
                field(idx)?
                    .parse::<f64>()
                    .with_context(|| format!("Invalid number on score table line {}", lineno + 2))
            };

            let cai = parse_f64(cai_col)?;
            let log_cai = match log_cai_col {
                Some(idx) => parse_f64(idx)?,
                None => cai.ln(),
            };
            rows.push(ScoreRow {
                id: field(id_col)?.to_string(),
                mfe_normalized: parse_f64(mfe_col)?,
                cai,
                log_cai,
            });
        }

        Ok(Self { rows })
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All rows
    pub fn rows(&self) -> &[ScoreRow] {
        &self.rows
    }
}

/// Parameters for score-based group selection
#[derive(Debug, Clone)]
pub struct SelectionConfig {
    pub data_type: DataType,
    /// Fraction of the (filtered) table taken per group
    pub percent: Option<f64>,
    /// Blend coefficient for the `mfe_cai` combined score
    pub lambda: Option<f64>,
    /// Sequence-length filter bounds (inclusive)
    pub min_seq_len: usize,
    pub max_seq_len: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            data_type: DataType::Fasta,
            percent: None,
            lambda: None,
            min_seq_len: 300,
            max_seq_len: 3072 - 6,
        }
    }
}

/// The two disjoint sequence lists to contrast
#[derive(Debug, Clone)]
pub struct ContrastGroups {
    pub high: Vec<String>,
    pub low: Vec<String>,
}

/// Select the high/low groups from a score table.
///
/// Rows are kept when their sequence (looked up by `ID`) exists and its
/// length is within the configured bounds; the top and bottom `percent`
/// fractions by the mode's score column form the two groups.
pub fn select_groups(
    config: &SelectionConfig,
    sequences: &HashMap<String, String>,
    table: &ScoreTable,
) -> Result<ContrastGroups> {
    let percent = config
        .percent
        .context("Must provide 'percent' for score-based selection")?;
    anyhow::ensure!(
        percent > 0.0 && percent <= 0.5,
        "percent must be in (0, 0.5], got {percent}"
    );

    // Score per row, by data type
    let score = |row: &ScoreRow| -> Result<f64> {
        match config.data_type {
            DataType::Mfe => Ok(row.mfe_normalized),
            DataType::Cai => Ok(row.cai),
            DataType::MfeCai => {
                let lambda = config
                    .lambda
                    .context("Must provide 'lambda' for 'mfe_cai' data type")?;
                Ok(-row.mfe_normalized + lambda * row.log_cai)
            }
            DataType::Fasta => {
                anyhow::bail!("select_groups is not applicable to the 'fasta' data type")
            }
        }
    };

    // Length filter, keeping only rows with a known sequence
    let mut scored: Vec<(&ScoreRow, f64)> = Vec::new();
    for row in table.rows() {
        let Some(seq) = sequences.get(&row.id) else {
            continue;
        };
        if seq.len() < config.min_seq_len || seq.len() > config.max_seq_len {
            continue;
        }
        scored.push((row, score(row)?));
    }
    anyhow::ensure!(
        !scored.is_empty(),
        "No score-table rows survived the sequence-length filter"
    );

    let n = (scored.len() as f64 * percent) as usize;
    anyhow::ensure!(
        n > 0,
        "percent {percent} selects zero rows from {} candidates",
        scored.len()
    );

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let lookup = |rows: &[(&ScoreRow, f64)]| -> Vec<String> {
        rows.iter()
            .map(|(row, _)| sequences[&row.id].clone())
            .collect()
    };
    let high = lookup(&scored[..n]);
    let low = {
        // bottom-n in ascending score order, matching nsmallest
        let mut tail: Vec<(&ScoreRow, f64)> = scored[scored.len() - n..].to_vec();
        tail.reverse();
        lookup(&tail)
    };

    Ok(ContrastGroups { high, low })
}

/// Load the high/low groups directly from two FASTA files
pub fn groups_from_fasta(high_path: &Path, low_path: &Path) -> Result<ContrastGroups> {
    let high = read_fasta(high_path)?.into_iter().map(|r| r.seq).collect();
    let low = read_fasta(low_path)?.into_iter().map(|r| r.seq).collect();
    Ok(ContrastGroups { high, low })
}
