//! Round-trip tests for weight I/O

use super::*;
use crate::nn::{ArchRegistry, BuildOptions, Network, StateDict, TensorRecord};
use std::io::Write;
use tempfile::TempDir;

fn dict() -> StateDict {
    let mut dict = StateDict::new();
    dict.insert(
        "backbone.patch_embed.weight".to_string(),
        TensorRecord {
            shape: vec![2, 3],
            data: vec![0.0, 1.0, -2.5, 3.25, 1e-7, f32::MAX],
        },
    );
    dict.insert(
        "backbone.cls_token".to_string(),
        TensorRecord {
            shape: vec![1, 1, 2],
            data: vec![0.5, -0.5],
        },
    );
    dict
}

#[test]
fn test_safetensors_round_trip_keeps_shapes_and_bits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("weights.safetensors");
    let meta = WeightsMetadata::new("teacher", "vit_small").with_streams(2);
    save_safetensors(&path, &dict(), &meta).unwrap();

    let (loaded, loaded_meta) = load_safetensors(&path).unwrap();
    assert_eq!(loaded, dict());
    assert_eq!(loaded_meta, meta);
}

#[test]
fn test_pretrained_strips_prefixes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("weights.safetensors");
    save_safetensors(&path, &dict(), &WeightsMetadata::new("t", "vit_small")).unwrap();
    let loaded = load_pretrained(&path).unwrap();
    assert!(loaded.contains_key("cls_token"));
    assert!(loaded.contains_key("patch_embed.weight"));
}

#[test]
fn test_pretrained_from_checkpoint_json_uses_teacher() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    let body = serde_json::json!({
        "student": {},
        "teacher": {"module.pos": {"shape": [2], "data": [1.0, 2.0]}},
        "epoch": 4,
    });
    std::fs::File::create(&path)
        .unwrap()
        .write_all(body.to_string().as_bytes())
        .unwrap();
    let loaded = load_pretrained(&path).unwrap();
    assert_eq!(loaded["pos"].data, vec![1.0, 2.0]);
}

#[test]
fn test_pretrained_rejects_unknown_extension() {
    assert!(load_pretrained(std::path::Path::new("weights.pth")).is_err());
}

#[test]
fn test_invalid_safetensors_bytes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.safetensors");
    std::fs::write(&path, b"not valid safetensors binary data").unwrap();
    assert!(load_safetensors(&path).is_err());
}

#[test]
fn test_exported_network_loads_strictly() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("teacher.safetensors");
    let opts = BuildOptions {
        patch_size: 4,
        in_chans: 1,
        out_dim: 6,
        head_hidden_dim: 8,
        bottleneck_dim: 4,
        embed_dim: Some(8),
        num_heads: Some(2),
        ..BuildOptions::default()
    };
    let registry = ArchRegistry::with_builtins();
    let net = registry.build("vit_tiny", &opts).unwrap();
    export_network(&path, net.as_ref(), "teacher").unwrap();

    let (loaded, meta) = load_safetensors(&path).unwrap();
    assert_eq!(meta.architecture, "vit_tiny");
    let mut fresh = registry
        .build(
            "vit_tiny",
            &BuildOptions {
                seed: 99,
                ..opts
            },
        )
        .unwrap();
    let report = fresh.load_state_dict(&loaded, true).unwrap();
    assert!(report.is_clean());
    assert_eq!(fresh.state_dict(), net.state_dict());
}
