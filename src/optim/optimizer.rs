//! Optimizer trait and parameter groups

use crate::error::{Error, Result};
use crate::nn::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A set of parameters sharing learning rate and weight decay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub description: String,
    /// Positions in the network's parameter list
    pub indices: Vec<usize>,
    pub lr: f32,
    pub weight_decay: f32,
}

impl ParamGroup {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            indices: Vec::new(),
            lr: 0.0,
            weight_decay: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Split parameters into a regularized group and a decay-free group.
///
/// Biases and other 1-D parameters go to the second group, which keeps a
/// weight decay of zero for the whole run.
pub fn regularized_groups(names: &[String], params: &[Tensor]) -> Vec<ParamGroup> {
    let mut regularized = ParamGroup::new("regularized");
    let mut not_regularized = ParamGroup::new("not_regularized");
    for (i, (name, p)) in names.iter().zip(params).enumerate() {
        if !p.requires_grad() {
            continue;
        }
        if name.ends_with(".bias") || p.ndim() == 1 {
            not_regularized.indices.push(i);
        } else {
            regularized.indices.push(i);
        }
    }
    vec![regularized, not_regularized]
}

/// Per-parameter `(lr, weight_decay)` lookup; `None` for parameters in no group
pub(crate) fn hyperparams(groups: &[ParamGroup], n: usize) -> Vec<Option<(f32, f32)>> {
    let mut out = vec![None; n];
    for g in groups {
        for &i in &g.indices {
            if i < n {
                out[i] = Some((g.lr, g.weight_decay));
            }
        }
    }
    out
}

/// Serializable optimizer state for checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub name: String,
    pub step: u64,
    pub param_groups: Vec<ParamGroup>,
    /// Per-parameter buffers keyed by buffer name; `None` before first update
    pub buffers: BTreeMap<String, Vec<Option<Vec<f32>>>>,
}

/// Trait for optimization algorithms
pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    /// Perform a single optimization step
    fn step(&mut self, params: &mut [Tensor]);

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [Tensor]) {
        for param in params {
            param.zero_grad();
        }
    }

    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Learning rate of the first group
    fn lr(&self) -> f32 {
        self.param_groups().first().map_or(0.0, |g| g.lr)
    }

    /// Set the learning rate of every group
    fn set_lr(&mut self, lr: f32) {
        for g in self.param_groups_mut() {
            g.lr = lr;
        }
    }

    /// Weight decay of the first group
    fn weight_decay(&self) -> f32 {
        self.param_groups().first().map_or(0.0, |g| g.weight_decay)
    }

    /// Only the first group is regularized
    fn set_weight_decay(&mut self, wd: f32) {
        if let Some(g) = self.param_groups_mut().first_mut() {
            g.weight_decay = wd;
        }
    }

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: &OptimizerState) -> Result<()>;
}

pub(crate) fn check_state_name(expected: &str, state: &OptimizerState) -> Result<()> {
    if state.name != expected {
        return Err(Error::Checkpoint(format!(
            "optimizer state is for '{}', not '{expected}'",
            state.name
        )));
    }
    Ok(())
}

pub(crate) fn buffer_to_state(buf: &[Option<ndarray::Array1<f32>>]) -> Vec<Option<Vec<f32>>> {
    buf.iter().map(|b| b.as_ref().map(|a| a.to_vec())).collect()
}

pub(crate) fn buffer_from_state(
    state: &OptimizerState,
    key: &str,
) -> Result<Vec<Option<ndarray::Array1<f32>>>> {
    let buf = state
        .buffers
        .get(key)
        .ok_or_else(|| Error::Checkpoint(format!("optimizer state lacks '{key}'")))?;
    Ok(buf
        .iter()
        .map(|b| b.as_ref().map(|v| ndarray::Array1::from(v.clone())))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_biases_and_vectors_are_not_regularized() {
        let names = vec![
            "patch_embed.weight".to_string(),
            "patch_embed.bias".to_string(),
            "cls_token".to_string(),
            "head.last_layer.weight".to_string(),
        ];
        let params = vec![
            Tensor::zeros(&[4, 3], true),
            Tensor::zeros(&[4], true),
            Tensor::zeros(&[4], true),
            Tensor::zeros(&[2, 4], true),
        ];
        let groups = regularized_groups(&names, &params);
        assert_eq!(groups[0].indices, vec![0, 3]);
        assert_eq!(groups[1].indices, vec![1, 2]);
    }

    #[test]
    fn test_frozen_params_join_no_group() {
        let names = vec!["a".to_string()];
        let params = vec![Tensor::zeros(&[2, 2], false)];
        let groups = regularized_groups(&names, &params);
        assert!(groups.iter().all(ParamGroup::is_empty));
    }
}
