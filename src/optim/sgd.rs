//! Stochastic Gradient Descent optimizer

use super::optimizer::{
    buffer_from_state, buffer_to_state, check_state_name, hyperparams, OptimizerState, ParamGroup,
};
use super::Optimizer;
use crate::error::Result;
use crate::nn::Tensor;
use ndarray::Array1;

/// SGD with momentum and coupled (L2) weight decay
///
/// ```text
/// g' = g + λ θ
/// v  = μ v + g'
/// θ  = θ - lr v
/// ```
pub struct SGD {
    groups: Vec<ParamGroup>,
    momentum: f32,
    t: u64,
    velocities: Vec<Option<Array1<f32>>>,
}

impl SGD {
    pub fn new(groups: Vec<ParamGroup>, momentum: f32) -> Self {
        Self {
            groups,
            momentum,
            t: 0,
            velocities: Vec::new(),
        }
    }

    fn ensure_velocities(&mut self, n: usize) {
        if self.velocities.len() != n {
            self.velocities = vec![None; n];
        }
    }
}

impl Optimizer for SGD {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn step(&mut self, params: &mut [Tensor]) {
        self.ensure_velocities(params.len());
        self.t += 1;
        let hyper = hyperparams(&self.groups, params.len());

        for (i, param) in params.iter_mut().enumerate() {
            let Some((lr, wd)) = hyper[i] else { continue };
            let Some(grad) = param.grad() else { continue };
            let mut d_p = grad.clone();
            if wd != 0.0 {
                d_p.scaled_add(wd, param.data());
            }
            if self.momentum > 0.0 {
                let velocity = match &self.velocities[i] {
                    Some(v) => v * self.momentum + &d_p,
                    None => d_p,
                };
                param.data_mut().scaled_add(-lr, &velocity);
                self.velocities[i] = Some(velocity);
            } else {
                param.data_mut().scaled_add(-lr, &d_p);
            }
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
        state
            .buffers
            .insert("momentum_buffer".to_string(), buffer_to_state(&self.velocities));
        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        check_state_name(self.name(), state)?;
        self.velocities = buffer_from_state(state, "momentum_buffer")?;
        self.t = state.step;
        self.groups = state.param_groups.clone();
        Ok(())
    }
}
