//! Weight import

use super::save::WeightsMetadata;
use crate::error::{Error, Result};
use crate::nn::{strip_prefix, StateDict, TensorRecord};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::path::Path;

/// Prefixes removed from pretrained keys
const KEY_PREFIXES: [&str; 2] = ["module.", "backbone."];

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    match bytemuck::try_cast_slice::<u8, f32>(bytes) {
        Ok(values) => values.to_vec(),
        // unaligned buffer
        Err(_) => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

/// Read an f32 safetensors file
pub fn load_safetensors(path: &Path) -> Result<(StateDict, WeightsMetadata)> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Serialization(format!("Failed to read {}: {e}", path.display())))?;
    let (_, header) = SafeTensors::read_metadata(&data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
    let metadata = WeightsMetadata::from_header(header.metadata().as_ref());

    let tensors = SafeTensors::deserialize(&data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
    let mut dict = StateDict::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(Error::Serialization(format!(
                "tensor '{name}' has dtype {:?}, only F32 is supported",
                view.dtype()
            )));
        }
        dict.insert(
            name,
            TensorRecord {
                shape: view.shape().to_vec(),
                data: f32_values(view.data()),
            },
        );
    }
    Ok((dict, metadata))
}

/// Pretrained weights from `.safetensors` or from the `teacher` entry of a
/// checkpoint `.json`, with wrapper prefixes stripped
pub fn load_pretrained(path: &Path) -> Result<StateDict> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or_default();
    let dict = match ext {
        "safetensors" => load_safetensors(path)?.0,
        "json" => {
            let bytes = std::fs::read(path)?;
            let mut value: serde_json::Value = serde_json::from_slice(&bytes)?;
            let teacher = value
                .get_mut("teacher")
                .map(serde_json::Value::take)
                .ok_or_else(|| {
                    Error::Checkpoint(format!("{} has no 'teacher' entry", path.display()))
                })?;
            serde_json::from_value(teacher)?
        }
        other => {
            return Err(Error::Serialization(format!(
                "Unsupported weights extension '{other}' (expected safetensors or json)"
            )))
        }
    };
    Ok(KEY_PREFIXES
        .iter()
        .fold(dict, |dict, prefix| strip_prefix(dict, prefix)))
}
