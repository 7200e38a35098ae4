//! Gradient clipping and last-layer freezing

use crate::nn::Tensor;

/// Clip every parameter's gradient to a maximum L2 norm
///
/// Unlike global-norm clipping, each gradient is judged on its own:
///
/// ```text
/// clip_coef = max_norm / (‖g‖ + 1e-6)
/// g *= clip_coef      if clip_coef < 1
/// ```
///
/// # Returns
/// The per-parameter gradient norms before clipping (parameters without a
/// gradient are skipped)
pub fn clip_gradients(params: &mut [Tensor], max_norm: f32) -> Vec<f32> {
    let mut norms = Vec::with_capacity(params.len());
    for param in params.iter_mut() {
        if let Some(grad) = param.grad_mut() {
            let norm = grad.iter().map(|&g| g * g).sum::<f32>().sqrt();
            norms.push(norm);
            let clip_coef = max_norm / (norm + 1e-6);
            if clip_coef < 1.0 {
                grad.mapv_inplace(|g| g * clip_coef);
            }
        }
    }
    norms
}

/// Drop the gradients of the projection head's last layer during the first
/// `freeze_last_layer` epochs
pub fn cancel_gradients_last_layer(
    epoch: usize,
    names: &[String],
    params: &mut [Tensor],
    freeze_last_layer: usize,
) -> usize {
    if epoch >= freeze_last_layer {
        return 0;
    }
    let mut cancelled = 0;
    for (name, param) in names.iter().zip(params.iter_mut()) {
        if name.contains("last_layer") && param.grad().is_some() {
            param.zero_grad();
            cancelled += 1;
        }
    }
    cancelled
}

/// Multiply every gradient by `factor`
pub fn scale_gradients(params: &mut [Tensor], factor: f32) {
    for param in params.iter_mut() {
        if let Some(grad) = param.grad_mut() {
            grad.mapv_inplace(|g| g * factor);
        }
    }
}

/// True if any gradient holds a NaN or infinity
pub fn has_non_finite_gradients(params: &[Tensor]) -> bool {
    params
        .iter()
        .filter_map(Tensor::grad)
        .any(|g| g.iter().any(|v| !v.is_finite()))
}
