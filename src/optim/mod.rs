//! Optimizers, gradient handling and schedules

mod adamw;
mod clip;
mod lars;
mod optimizer;
mod scaler;
mod scheduler;
mod sgd;

#[cfg(test)]
mod tests;

pub use adamw::AdamW;
pub use clip::{
    cancel_gradients_last_layer, clip_gradients, has_non_finite_gradients, scale_gradients,
};
pub use lars::Lars;
pub use optimizer::{regularized_groups, Optimizer, OptimizerState, ParamGroup};
pub use scaler::{DynamicGradScaler, FullPrecision, GradScaling, ScalerState};
pub use scheduler::{
    cosine_scheduler, linspace, Schedule, Schedules, StepValues, TemperatureSchedule,
};
pub use sgd::SGD;

use crate::error::{Error, Result};
use crate::nn::Tensor;

/// Build an optimizer by name over the regularized/decay-free split
pub fn build_optimizer(
    name: &str,
    names: &[String],
    params: &[Tensor],
) -> Result<Box<dyn Optimizer>> {
    let groups = regularized_groups(names, params);
    match name.to_lowercase().as_str() {
        "adamw" => Ok(Box::new(AdamW::default_params(groups))),
        // lr is set by the scheduler
        "sgd" => Ok(Box::new(SGD::new(groups, 0.9))),
        "lars" => Ok(Box::new(Lars::default_params(groups))),
        other => Err(Error::ConfigError(format!(
            "Unknown optimizer: {other} (must be one of: adamw, sgd, lars)"
        ))),
    }
}
