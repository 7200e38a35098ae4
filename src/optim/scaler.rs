//! Gradient-scaling policies for mixed-precision training

use super::clip::{has_non_finite_gradients, scale_gradients};
use super::Optimizer;
use crate::error::{Error, Result};
use crate::nn::Tensor;
use serde::{Deserialize, Serialize};

/// Loss-scaling contract used by the training loop.
///
/// The loop multiplies its backward seeds by [`GradScaling::scale`], calls
/// [`GradScaling::unscale`] once per parameter set before clipping, then
/// [`GradScaling::step`] for every optimizer and [`GradScaling::update`].
pub trait GradScaling: Send {
    /// Multiplier applied to the loss gradient
    fn scale(&self) -> f32;

    /// Divide gradients by the scale in place and record overflow
    fn unscale(&mut self, params: &mut [Tensor]);

    /// Step the optimizer unless any unscaled set overflowed; returns whether it stepped
    fn step(&mut self, optimizer: &mut dyn Optimizer, params: &mut [Tensor]) -> bool;

    /// Adjust the scale for the next iteration
    fn update(&mut self);

    /// Serializable state, `None` for policies without state
    fn state(&self) -> Option<ScalerState>;

    fn load_state(&mut self, state: &ScalerState) -> Result<()>;
}

/// No-op policy for full-precision runs
#[derive(Debug, Default, Clone)]
pub struct FullPrecision;

impl GradScaling for FullPrecision {
    fn scale(&self) -> f32 {
        1.0
    }

    fn unscale(&mut self, _params: &mut [Tensor]) {}

    fn step(&mut self, optimizer: &mut dyn Optimizer, params: &mut [Tensor]) -> bool {
        optimizer.step(params);
        true
    }

    fn update(&mut self) {}

    fn state(&self) -> Option<ScalerState> {
        None
    }

    fn load_state(&mut self, _state: &ScalerState) -> Result<()> {
        Ok(())
    }
}

/// Checkpointed state of [`DynamicGradScaler`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: u32,
    pub growth_tracker: u32,
}

/// Dynamic loss scaler.
///
/// The scale backs off when a step overflows and grows after
/// `growth_interval` consecutive clean steps.
#[derive(Debug, Clone)]
pub struct DynamicGradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u32,
    growth_tracker: u32,
    min_scale: f32,
    max_scale: f32,
    found_inf: bool,
}

impl DynamicGradScaler {
    /// Builds a new scaler with explicit growth/backoff configuration.
    pub fn new(
        scale: f32,
        growth_factor: f32,
        backoff_factor: f32,
        growth_interval: u32,
    ) -> Result<Self> {
        if scale <= 0.0 || !scale.is_finite() {
            return Err(Error::InvalidParameter(format!("grad scaler scale {scale}")));
        }
        if growth_factor <= 1.0 || !growth_factor.is_finite() {
            return Err(Error::InvalidParameter(format!(
                "grad scaler growth factor {growth_factor}"
            )));
        }
        if backoff_factor <= 0.0 || backoff_factor >= 1.0 {
            return Err(Error::InvalidParameter(format!(
                "grad scaler backoff factor {backoff_factor}"
            )));
        }
        if growth_interval == 0 {
            return Err(Error::InvalidParameter(
                "grad scaler growth interval must be positive".to_string(),
            ));
        }
        Ok(Self {
            scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            growth_tracker: 0,
            min_scale: 1.0,
            max_scale: 16_777_216.0,
            found_inf: false,
        })
    }

    pub fn found_inf(&self) -> bool {
        self.found_inf
    }
}

impl Default for DynamicGradScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            min_scale: 1.0,
            max_scale: 16_777_216.0,
            found_inf: false,
        }
    }
}

impl GradScaling for DynamicGradScaler {
    fn scale(&self) -> f32 {
        self.scale
    }

    fn unscale(&mut self, params: &mut [Tensor]) {
        self.found_inf |= has_non_finite_gradients(params);
        scale_gradients(params, 1.0 / self.scale);
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer, params: &mut [Tensor]) -> bool {
        if self.found_inf {
            tracing::warn!(scale = self.scale, "gradient overflow, skipping optimizer step");
            return false;
        }
        optimizer.step(params);
        true
    }

    fn update(&mut self) {
        if self.found_inf {
            self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale = (self.scale * self.growth_factor).min(self.max_scale);
                self.growth_tracker = 0;
            }
        }
        self.found_inf = false;
    }

    fn state(&self) -> Option<ScalerState> {
        Some(ScalerState {
            scale: self.scale,
            growth_factor: self.growth_factor,
            backoff_factor: self.backoff_factor,
            growth_interval: self.growth_interval,
            growth_tracker: self.growth_tracker,
        })
    }

    fn load_state(&mut self, state: &ScalerState) -> Result<()> {
        let restored = Self::new(
            state.scale,
            state.growth_factor,
            state.backoff_factor,
            state.growth_interval,
        )?;
        self.scale = restored.scale;
        self.growth_factor = restored.growth_factor;
        self.backoff_factor = restored.backoff_factor;
        self.growth_interval = restored.growth_interval;
        self.growth_tracker = state.growth_tracker;
        Ok(())
    }
}
