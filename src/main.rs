//! steervec-rs CLI: steering-vector extraction

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use steervec_rs::{
    corpus, extract, DataType, ExtractConfig, SelectionConfig, SteerModel,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "steervec-rs")]
#[command(about = "Extract per-layer steering vectors from a codon language model")]
#[command(version)]
struct Cli {
    /// Model checkpoint: local directory or hub id (base model or PEFT
    /// adapter; adapters are merged into their base model)
    #[arg(long = "model_path")]
    model_path: String,

    /// FASTA file supplying the high-value group (fasta mode)
    #[arg(long = "high_fa_path")]
    high_fa_path: Option<PathBuf>,

    /// FASTA file supplying the low-value group (fasta mode)
    #[arg(long = "low_fa_path")]
    low_fa_path: Option<PathBuf>,

    /// Contrast type: fasta, mfe, cai or mfe_cai
    #[arg(long = "data_type", default_value = "fasta")]
    data_type: String,

    /// FASTA file with all candidate sequences (scored modes)
    #[arg(long = "seq_path")]
    seq_path: Option<PathBuf>,

    /// CSV score table with ID, MFE_normalized, CAI columns (scored modes)
    #[arg(long = "score_path")]
    score_path: Option<PathBuf>,

    /// Fraction of the table taken per group (scored modes)
    #[arg(long)]
    percent: Option<f64>,

    /// Blend coefficient for the mfe_cai combined score
    #[arg(long)]
    lambda: Option<f64>,

    /// Minimum sequence length kept by the filter (scored modes)
    #[arg(long = "min_seq_len", default_value_t = 300)]
    min_seq_len: usize,

    /// Maximum sequence length kept by the filter (scored modes)
    #[arg(long = "max_seq_len", default_value_t = 3072 - 6)]
    max_seq_len: usize,

    /// Label used in the output file name
    #[arg(long = "save_name")]
    save_name: String,

    /// Directory the steering vectors are written to
    #[arg(long = "save_dir", default_value = "../data")]
    save_dir: PathBuf,

    /// Forward-pass batch size
    #[arg(long = "batch_size", default_value_t = 32)]
    batch_size: usize,

    /// Fixed token length (padding/truncation)
    #[arg(long = "max_length", default_value_t = 1024)]
    max_length: usize,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_type = DataType::parse(&cli.data_type)?;

    println!("=== steervec-rs: steering-vector extraction ===");
    println!("Model:     {}", cli.model_path);
    println!("Data type: {data_type}");
    println!("Output:    {}", cli.save_dir.display());
    if cli.cpu {
        println!("Mode:      CPU (forced)");
    }

    // Select the contrast groups before paying for model loading
    let groups = match data_type {
        DataType::Fasta => {
            let (Some(high), Some(low)) = (&cli.high_fa_path, &cli.low_fa_path) else {
                anyhow::bail!(
                    "data_type 'fasta' requires both --high_fa_path and --low_fa_path"
                );
            };
            corpus::groups_from_fasta(high, low)?
        }
        DataType::Mfe | DataType::Cai | DataType::MfeCai => {
            let seq_path = cli
                .seq_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("data_type '{data_type}' requires --seq_path"))?;
            let score_path = cli
                .score_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("data_type '{data_type}' requires --score_path"))?;

            let sequences = corpus::read_fasta_map(seq_path)?;
            let table = corpus::ScoreTable::load(score_path)?;
            info!(
                "Loaded {} sequences and {} score rows",
                sequences.len(),
                table.len()
            );

            let selection = SelectionConfig {
                data_type,
                percent: cli.percent,
                lambda: cli.lambda,
                min_seq_len: cli.min_seq_len,
                max_seq_len: cli.max_seq_len,
            };
            corpus::select_groups(&selection, &sequences, &table)?
        }
    };
    info!(
        "Contrast groups: {} high / {} low sequences",
        groups.high.len(),
        groups.low.len()
    );

    // Load model (merging any LoRA adapter into the base weights)
    let model = SteerModel::from_pretrained(&cli.model_path, cli.max_length, Some(cli.cpu))?;
    info!(
        "Model: {} layers, {} hidden, max_length {}",
        model.n_layers(),
        model.d_model(),
        model.max_length()
    );

    println!("Computing steering vectors...");
    let config = ExtractConfig {
        batch_size: cli.batch_size,
    };
    let vectors = extract(&model, &groups, data_type, &config)?;

    let path = vectors.save(&cli.save_dir, &cli.save_name)?;
    println!("Shape: {:?}", vectors.shape());
    println!("Saved steering vectors to {}", path.display());

    Ok(())
}
