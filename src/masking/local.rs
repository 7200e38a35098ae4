//! Tube masks of local views

use crate::error::{Error, Result};
use crate::nn::TokenMask;
use ndarray::Array3;

/// Reshape dataset tube masks `(batch, frames, tokens)` to `(batch * frames, grid_h, grid_w)`.
///
/// The pattern itself is produced by the data pipeline and passes through unchanged.
pub fn local_masks(raw: &[Array3<bool>], grid: (usize, usize)) -> Result<Vec<TokenMask>> {
    raw.iter()
        .map(|m| {
            let (batch, frames, tokens) = m.dim();
            if tokens != grid.0 * grid.1 {
                return Err(Error::ShapeMismatch {
                    expected: vec![batch, frames, grid.0 * grid.1],
                    got: m.shape().to_vec(),
                });
            }
            let standard = m.as_standard_layout().into_owned();
            Ok(standard.into_shape((batch * frames, grid.0, grid.1))?)
        })
        .collect()
}
