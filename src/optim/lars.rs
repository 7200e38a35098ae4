//! Layer-wise Adaptive Rate Scaling

use super::optimizer::{
    buffer_from_state, buffer_to_state, check_state_name, hyperparams, OptimizerState, ParamGroup,
};
use super::Optimizer;
use crate::error::Result;
use crate::nn::Tensor;
use ndarray::Array1;

/// LARS for large-batch training.
///
/// Matrix-shaped parameters get L2 decay and a per-tensor trust ratio
/// `eta * ‖θ‖ / ‖g‖`; 1-D parameters (biases, tokens) take a plain momentum
/// step.
pub struct Lars {
    groups: Vec<ParamGroup>,
    momentum: f32,
    eta: f32,
    t: u64,
    mu: Vec<Option<Array1<f32>>>,
}

impl Lars {
    pub fn new(groups: Vec<ParamGroup>, momentum: f32, eta: f32) -> Self {
        Self {
            groups,
            momentum,
            eta,
            t: 0,
            mu: Vec::new(),
        }
    }

    /// momentum 0.9, eta 0.001
    pub fn default_params(groups: Vec<ParamGroup>) -> Self {
        Self::new(groups, 0.9, 0.001)
    }
}

fn l2(a: &Array1<f32>) -> f32 {
    a.dot(a).sqrt()
}

impl Optimizer for Lars {
    fn name(&self) -> &'static str {
        "lars"
    }

    fn step(&mut self, params: &mut [Tensor]) {
        if self.mu.len() != params.len() {
            self.mu = vec![None; params.len()];
        }
        self.t += 1;
        let hyper = hyperparams(&self.groups, params.len());

        for (i, param) in params.iter_mut().enumerate() {
            let Some((lr, wd)) = hyper[i] else { continue };
            let Some(grad) = param.grad() else { continue };
            let mut dp = grad.clone();

            if param.ndim() != 1 {
                dp.scaled_add(wd, param.data());
                let param_norm = l2(param.data());
                let update_norm = l2(&dp);
                let q = if param_norm > 0.0 && update_norm > 0.0 {
                    self.eta * param_norm / update_norm
                } else {
                    1.0
                };
                dp.mapv_inplace(|v| v * q);
            }

            let mu = match &self.mu[i] {
                Some(m) => m * self.momentum + &dp,
                None => dp,
            };
            param.data_mut().scaled_add(-lr, &mu);
            self.mu[i] = Some(mu);
        }
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState {
            name: self.name().to_string(),
            step: self.t,
            param_groups: self.groups.clone(),
            ..OptimizerState::default()
        };
        state.buffers.insert("mu".to_string(), buffer_to_state(&self.mu));
        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        check_state_name(self.name(), state)?;
        self.mu = buffer_from_state(state, "mu")?;
        self.t = state.step;
        self.groups = state.param_groups.clone();
        Ok(())
    }
}
