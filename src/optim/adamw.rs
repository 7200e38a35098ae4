//! AdamW optimizer (Adam with decoupled Weight decay)

use super::optimizer::{
    buffer_from_state, buffer_to_state, check_state_name, hyperparams, OptimizerState, ParamGroup,
};
use super::Optimizer;
use crate::error::Result;
use crate::nn::Tensor;
use ndarray::Array1;

/// AdamW optimizer
///
/// AdamW decouples weight decay from the gradient-based update. Instead of
/// adding weight decay to the gradient, it shrinks the parameters directly:
///
/// ```text
/// θ_t = (1 - lr * λ) * θ_{t-1} - lr * m̂_t / (√v̂_t + ε)
/// ```
///
/// Learning rate and λ come from the parameter's group, so the decay-free
/// group is never shrunk.
pub struct AdamW {
    groups: Vec<ParamGroup>,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: u64,
    m: Vec<Option<Array1<f32>>>, // First moment
    v: Vec<Option<Array1<f32>>>, // Second moment
}

impl AdamW {
    pub fn new(groups: Vec<ParamGroup>, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            groups,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// AdamW with β = (0.9, 0.999), ε = 1e-8
    pub fn default_params(groups: Vec<ParamGroup>) -> Self {
        Self::new(groups, 0.9, 0.999, 1e-8)
    }

    fn ensure_moments(&mut self, n: usize) {
        if self.m.len() != n {
            self.m = vec![None; n];
            self.v = vec![None; n];
        }
    }
}

impl Optimizer for AdamW {
    fn name(&self) -> &'static str {
        "adamw"
    }

    fn step(&mut self, params: &mut [Tensor]) {
        self.ensure_moments(params.len());
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);
        let hyper = hyperparams(&self.groups, params.len());

        for (i, param) in params.iter_mut().enumerate() {
            let Some((lr, wd)) = hyper[i] else { continue };
            let Some(grad) = param.grad().cloned() else { continue };

            // m_t = β1 * m_{t-1} + (1 - β1) * g
            let m_t = match &self.m[i] {
                Some(m) => m * self.beta1 + &grad * (1.0 - self.beta1),
                None => &grad * (1.0 - self.beta1),
            };
            // v_t = β2 * v_{t-1} + (1 - β2) * g²
            let grad_sq = &grad * &grad;
            let v_t = match &self.v[i] {
                Some(v) => v * self.beta2 + &grad_sq * (1.0 - self.beta2),
                None => &grad_sq * (1.0 - self.beta2),
            };

            let denom = v_t.mapv(|x| (x / bias2).sqrt() + self.epsilon);
            let update = &m_t / &denom * (lr / bias1);
            let data = param.data_mut();
            data.mapv_inplace(|x| x * (1.0 - lr * wd));
            *data -= &update;

            self.m[i] = Some(m_t);
            self.v[i] = Some(v_t);
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
        state.buffers.insert("exp_avg".to_string(), buffer_to_state(&self.m));
        state.buffers.insert("exp_avg_sq".to_string(), buffer_to_state(&self.v));
        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        check_state_name(self.name(), state)?;
        self.m = buffer_from_state(state, "exp_avg")?;
        self.v = buffer_from_state(state, "exp_avg_sq")?;
        self.t = state.step;
        self.groups = state.param_groups.clone();
        Ok(())
    }
}
