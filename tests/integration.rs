//! Integration tests for steervec-rs
//!
//! The pipeline tests run against a tiny CodonBert built from an
//! in-memory weight map, so no checkpoint download or GPU is needed.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use steervec_rs::{
    contrast, corpus, extract, group_mean_states, BertConfig, CodonBert, CodonTokenizer,
    DataType, ExtractConfig, SelectionConfig, SteerModel,
};
use tempfile::NamedTempFile;

const MAX_LENGTH: usize = 16;

fn tiny_config() -> BertConfig {
    serde_json::from_str(
        r#"{
            "vocab_size": 69,
            "hidden_size": 8,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "intermediate_size": 16,
            "max_position_embeddings": 16,
            "type_vocab_size": 2,
            "layer_norm_eps": 1e-12,
            "hidden_act": "gelu"
        }"#,
    )
    .unwrap()
}

/// Deterministic small-valued weight map for the tiny config
fn tiny_weights(config: &BertConfig, device: &Device) -> HashMap<String, Tensor> {
    let mut weights = HashMap::new();

    let ramp = |rows: usize, cols: usize| -> Tensor {
        let n = rows * cols;
        let t = Tensor::arange(0f32, n as f32, device).unwrap();
        // small, sign-alternating values keep the softmax well-behaved
        let t = ((t * 0.013).unwrap().sin().unwrap() * 0.05).unwrap();
        t.reshape((rows, cols)).unwrap()
    };
    let ramp1 = |size: usize| -> Tensor {
        let t = Tensor::arange(0f32, size as f32, device).unwrap();
        ((t * 0.017).unwrap().sin().unwrap() * 0.05).unwrap()
    };
    let ones = |size: usize| Tensor::ones((size,), DType::F32, device).unwrap();
    let zeros = |size: usize| Tensor::zeros((size,), DType::F32, device).unwrap();

    let h = config.hidden_size;
    let inter = config.intermediate_size;

    weights.insert(
        "embeddings.word_embeddings.weight".to_string(),
        ramp(config.vocab_size, h),
    );
    weights.insert(
        "embeddings.position_embeddings.weight".to_string(),
        ramp(config.max_position_embeddings, h),
    );
    weights.insert(
        "embeddings.token_type_embeddings.weight".to_string(),
        ramp(config.type_vocab_size, h),
    );
    weights.insert("embeddings.LayerNorm.weight".to_string(), ones(h));
    weights.insert("embeddings.LayerNorm.bias".to_string(), zeros(h));

    for i in 0..config.num_hidden_layers {
        let p = format!("encoder.layer.{i}");
        for proj in ["query", "key", "value"] {
            weights.insert(format!("{p}.attention.self.{proj}.weight"), ramp(h, h));
            weights.insert(format!("{p}.attention.self.{proj}.bias"), ramp1(h));
        }
        weights.insert(format!("{p}.attention.output.dense.weight"), ramp(h, h));
        weights.insert(format!("{p}.attention.output.dense.bias"), ramp1(h));
        weights.insert(format!("{p}.attention.output.LayerNorm.weight"), ones(h));
        weights.insert(format!("{p}.attention.output.LayerNorm.bias"), zeros(h));
        weights.insert(format!("{p}.intermediate.dense.weight"), ramp(inter, h));
        weights.insert(format!("{p}.intermediate.dense.bias"), ramp1(inter));
        weights.insert(format!("{p}.output.dense.weight"), ramp(h, inter));
        weights.insert(format!("{p}.output.dense.bias"), ramp1(h));
        weights.insert(format!("{p}.output.LayerNorm.weight"), ones(h));
        weights.insert(format!("{p}.output.LayerNorm.bias"), zeros(h));
    }

    weights
}

fn tiny_model() -> SteerModel {
    let device = Device::Cpu;
    let config = tiny_config();
    let vb = VarBuilder::from_tensors(tiny_weights(&config, &device), DType::F32, &device);
    let model = CodonBert::load(vb, &config).unwrap();
    SteerModel::from_parts(model, CodonTokenizer::new(MAX_LENGTH), device)
}

fn fasta_file(records: &[(&str, &str)]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for (id, seq) in records {
        writeln!(file, ">{id}\n{seq}").unwrap();
    }
    file
}

fn to_vec(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

#[test]
fn test_fasta_pipeline_output_shape() {
    let model = tiny_model();
    let high = fasta_file(&[("h1", "AUGGCUUACGGA"), ("h2", "AUGCCGUUAGGA")]);
    let low = fasta_file(&[("l1", "AUGAAAUUUGGG"), ("l2", "AUGGGGCCCAAA")]);

    let groups = corpus::groups_from_fasta(high.path(), low.path()).unwrap();
    let vectors = extract(&model, &groups, DataType::Fasta, &ExtractConfig::default()).unwrap();

    // (n_layers, 1, max_length, d_model)
    assert_eq!(vectors.shape(), [2, 1, MAX_LENGTH, 8]);
    assert_eq!(vectors.n_layers(), model.n_layers());
}

#[test]
fn test_identical_groups_yield_zero_vector() {
    let model = tiny_model();
    let seqs = vec!["AUGGCUUACGGA".to_string(), "AUGCCGUUAGGA".to_string()];
    let groups = corpus::ContrastGroups {
        high: seqs.clone(),
        low: seqs,
    };

    let vectors = extract(&model, &groups, DataType::Fasta, &ExtractConfig::default()).unwrap();
    assert!(to_vec(vectors.tensor()).iter().all(|&v| v.abs() < 1e-6));
}

#[test]
fn test_group_swap_negates_vector() {
    let model = tiny_model();
    let high = vec!["AUGGCUUACGGA".to_string()];
    let low = vec!["AUGAAAUUUGGG".to_string()];

    let forward = extract(
        &model,
        &corpus::ContrastGroups {
            high: high.clone(),
            low: low.clone(),
        },
        DataType::Fasta,
        &ExtractConfig::default(),
    )
    .unwrap();
    let swapped = extract(
        &model,
        &corpus::ContrastGroups { high: low, low: high },
        DataType::Fasta,
        &ExtractConfig::default(),
    )
    .unwrap();

    for (a, b) in to_vec(forward.tensor())
        .iter()
        .zip(to_vec(swapped.tensor()).iter())
    {
        assert!((a + b).abs() < 1e-5);
    }
}

#[test]
fn test_mfe_result_is_negated_difference() {
    let model = tiny_model();
    let groups = corpus::ContrastGroups {
        high: vec!["AUGGCUUACGGA".to_string()],
        low: vec!["AUGAAAUUUGGG".to_string()],
    };

    let raw = extract(&model, &groups, DataType::Cai, &ExtractConfig::default()).unwrap();
    let mfe = extract(&model, &groups, DataType::Mfe, &ExtractConfig::default()).unwrap();

    for (a, b) in to_vec(raw.tensor()).iter().zip(to_vec(mfe.tensor()).iter()) {
        assert!((a + b).abs() < 1e-5);
    }
}

#[test]
fn test_batching_does_not_change_mean() {
    let model = tiny_model();
    let seqs: Vec<String> = (0..5)
        .map(|i| format!("AUG{}UAA", "GCU".repeat(i + 1)))
        .collect();
    let ids = model.encode_batch(&seqs).unwrap();

    let single = group_mean_states(&model, &ids, &ExtractConfig { batch_size: 1 }, "t").unwrap();
    let batched = group_mean_states(&model, &ids, &ExtractConfig { batch_size: 4 }, "t").unwrap();

    for (a, b) in to_vec(&single).iter().zip(to_vec(&batched).iter()) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn test_contrast_matches_manual_difference() {
    let model = tiny_model();
    let groups = corpus::ContrastGroups {
        high: vec!["AUGGCUUACGGA".to_string()],
        low: vec!["AUGAAAUUUGGG".to_string()],
    };

    let config = ExtractConfig::default();
    let high_ids = model.encode_batch(&groups.high).unwrap();
    let low_ids = model.encode_batch(&groups.low).unwrap();
    let high_mean = group_mean_states(&model, &high_ids, &config, "h").unwrap();
    let low_mean = group_mean_states(&model, &low_ids, &config, "l").unwrap();

    let manual = contrast(&high_mean, &low_mean, DataType::Fasta).unwrap();
    let extracted = extract(&model, &groups, DataType::Fasta, &config).unwrap();

    for (a, b) in to_vec(&manual)
        .iter()
        .zip(to_vec(extracted.tensor()).iter())
    {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_score_table_pipeline() {
    let model = tiny_model();

    // 4 sequences long enough to survive a relaxed length filter
    let seqs: Vec<(String, String)> = ["AAA", "CCC", "GGG", "UUU"]
        .iter()
        .enumerate()
        .map(|(i, base)| (format!("seq{i}"), base.repeat(4)))
        .collect();
    let sequences: HashMap<String, String> = seqs.iter().cloned().collect();

    let mut csv = String::from("ID,MFE_normalized,CAI\n");
    for (i, (id, _)) in seqs.iter().enumerate() {
        csv.push_str(&format!("{id},{},{}\n", -(i as f64) * 0.1, (i + 1) as f64 * 0.2));
    }
    let mut table_file = NamedTempFile::new().unwrap();
    table_file.write_all(csv.as_bytes()).unwrap();
    let table = corpus::ScoreTable::load(table_file.path()).unwrap();

    let selection = SelectionConfig {
        data_type: DataType::Cai,
        percent: Some(0.25),
        min_seq_len: 1,
        max_seq_len: 100,
        ..Default::default()
    };
    let groups = corpus::select_groups(&selection, &sequences, &table).unwrap();
    assert_eq!(groups.high.len(), 1);
    assert_eq!(groups.low.len(), 1);

    let vectors = extract(&model, &groups, DataType::Cai, &ExtractConfig::default()).unwrap();
    assert_eq!(vectors.shape(), [2, 1, MAX_LENGTH, 8]);
}

#[test]
fn test_save_roundtrip_path() {
    let model = tiny_model();
    let groups = corpus::ContrastGroups {
        high: vec!["AUGGCUUACGGA".to_string()],
        low: vec!["AUGAAAUUUGGG".to_string()],
    };
    let vectors = extract(&model, &groups, DataType::Fasta, &ExtractConfig::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    // nested directory is created on demand
    let out: PathBuf = dir.path().join("vectors");
    let path = vectors.save(&out, "integration").unwrap();

    assert!(path.is_file());
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        "steering_vectors_integration.npy"
    );
}

#[test]
fn test_invalid_data_type_is_rejected() {
    assert!(DataType::parse("tai").is_err());
}

#[test]
fn test_mfe_cai_without_lambda_is_rejected() {
    let mut table_file = NamedTempFile::new().unwrap();
    table_file
        .write_all(b"ID,MFE_normalized,CAI\na,-0.1,0.9\nb,-0.2,0.5\n")
        .unwrap();
    let table = corpus::ScoreTable::load(table_file.path()).unwrap();

    let sequences: HashMap<String, String> = [
        ("a".to_string(), "AUG".repeat(4)),
        ("b".to_string(), "GCU".repeat(4)),
    ]
    .into_iter()
    .collect();

    let selection = SelectionConfig {
        data_type: DataType::MfeCai,
        percent: Some(0.5),
        lambda: None,
        min_seq_len: 1,
        max_seq_len: 100,
    };
    assert!(corpus::select_groups(&selection, &sequences, &table).is_err());
}
