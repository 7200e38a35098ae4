//! Weight export

use crate::error::{Error, Result};
use crate::nn::{Network, StateDict};
use safetensors::tensor::{Dtype, TensorView};
use std::collections::HashMap;
use std::path::Path;

/// Descriptive fields stored in the safetensors header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsMetadata {
    pub name: String,
    pub architecture: String,
    pub version: String,
    pub num_streams: usize,
}

impl WeightsMetadata {
    pub fn new(name: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            architecture: architecture.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            num_streams: 1,
        }
    }

    pub fn with_streams(mut self, num_streams: usize) -> Self {
        self.num_streams = num_streams;
        self
    }

    pub(crate) fn to_header(&self) -> HashMap<String, String> {
        let mut header = HashMap::new();
        header.insert("name".to_string(), self.name.clone());
        header.insert("architecture".to_string(), self.architecture.clone());
        header.insert("version".to_string(), self.version.clone());
        header.insert("num_streams".to_string(), self.num_streams.to_string());
        header
    }

    pub(crate) fn from_header(header: Option<&HashMap<String, String>>) -> Self {
        let get = |key: &str| header.and_then(|m| m.get(key).cloned());
        Self {
            name: get("name").unwrap_or_else(|| "unknown".to_string()),
            architecture: get("architecture").unwrap_or_else(|| "unknown".to_string()),
            version: get("version").unwrap_or_default(),
            num_streams: get("num_streams").and_then(|s| s.parse().ok()).unwrap_or(1),
        }
    }
}

/// Write a state dict as little-endian f32 safetensors
pub fn save_safetensors(path: &Path, dict: &StateDict, metadata: &WeightsMetadata) -> Result<()> {
    let views = dict
        .iter()
        .map(|(name, record)| {
            let bytes: &[u8] = bytemuck::cast_slice(&record.data);
            TensorView::new(Dtype::F32, record.shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| Error::Serialization(format!("tensor '{name}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = safetensors::serialize(views, &Some(metadata.to_header()))
        .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Export every parameter of `network`
pub fn export_network(path: &Path, network: &dyn Network, name: &str) -> Result<()> {
    let metadata = WeightsMetadata::new(name, network.arch()).with_streams(network.num_streams());
    save_safetensors(path, &network.state_dict(), &metadata)
}
