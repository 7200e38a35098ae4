//! Named parameter snapshots

use super::Tensor;
use crate::error::{Error, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serialized form of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            data: tensor.data().to_vec(),
        }
    }
}

/// Parameter name to record map, ordered by name
pub type StateDict = BTreeMap<String, TensorRecord>;

/// Outcome of a state-dict load
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Parameters of the network absent from the dict
    pub missing: Vec<String>,
    /// Dict entries with no matching parameter
    pub unexpected: Vec<String>,
    /// Entries present on both sides but with different shapes
    pub shape_mismatched: Vec<String>,
    pub loaded: usize,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.shape_mismatched.is_empty()
    }
}

impl std::fmt::Display for LoadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "loaded {} tensors; missing {:?}; unexpected {:?}; shape mismatched {:?}",
            self.loaded, self.missing, self.unexpected, self.shape_mismatched
        )
    }
}

/// Build a state dict from parallel name/parameter slices
pub fn collect_state(names: &[String], params: &[Tensor]) -> StateDict {
    names
        .iter()
        .zip(params)
        .map(|(name, t)| (name.clone(), TensorRecord::from_tensor(t)))
        .collect()
}

/// Copy matching entries of `dict` into `params`.
///
/// In strict mode any discrepancy is an error and nothing is written.
pub fn apply_state(
    names: &[String],
    params: &mut [Tensor],
    dict: &StateDict,
    strict: bool,
) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    for (name, param) in names.iter().zip(params.iter()) {
        match dict.get(name) {
            None => report.missing.push(name.clone()),
            Some(rec) if rec.shape != param.shape() || rec.data.len() != param.len() => {
                report.shape_mismatched.push(name.clone())
            }
            Some(_) => {}
        }
    }
    report.unexpected = dict
        .keys()
        .filter(|k| !names.contains(k))
        .cloned()
        .collect();

    if strict && !report.is_clean() {
        return Err(Error::Checkpoint(format!("strict state-dict load failed: {report}")));
    }

    for (name, param) in names.iter().zip(params.iter_mut()) {
        if let Some(rec) = dict.get(name) {
            if rec.shape == param.shape() && rec.data.len() == param.len() {
                *param.data_mut() = Array1::from(rec.data.clone());
                report.loaded += 1;
            }
        }
    }
    Ok(report)
}

/// Strip a key prefix (e.g. `module.` or `backbone.`) from every entry that carries it
pub fn strip_prefix(dict: StateDict, prefix: &str) -> StateDict {
    dict.into_iter()
        .map(|(k, v)| match k.strip_prefix(prefix) {
            Some(stripped) => (stripped.to_string(), v),
            None => (k, v),
        })
        .collect()
}
