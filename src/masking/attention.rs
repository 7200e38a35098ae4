//! Class-token attention extraction

use crate::error::{Error, Result};
use ndarray::{s, Array2, Array3, Array4, Axis};

/// Attention of the class token to every patch token, averaged over heads.
///
/// `attention` is `(batch * frames, heads, tokens + 1, tokens + 1)` with the
/// class token at index 0; the result is `(batch, frames, tokens)`.
pub fn cls_attention(attention: &Array4<f32>, batch: usize) -> Result<Array3<f32>> {
    let (rows, heads, q, k) = attention.dim();
    if batch == 0 || rows % batch != 0 || q == 0 || k < 2 || heads == 0 {
        return Err(Error::ShapeMismatch {
            expected: vec![batch.max(1), heads.max(1), k.max(2), k.max(2)],
            got: attention.shape().to_vec(),
        });
    }
    let frames = rows / batch;
    let cls = attention.slice(s![.., .., 0, 1..]);
    let mean = cls
        .mean_axis(Axis(1))
        .ok_or_else(|| Error::InvalidParameter("attention has no heads".to_string()))?;
    Ok(mean.into_shape((batch, frames, k - 1))?)
}

/// Per-sample token scores averaged over frames, `(batch, tokens)`
pub fn frame_mean(cls_attention: &Array3<f32>) -> Result<Array2<f32>> {
    cls_attention
        .mean_axis(Axis(1))
        .ok_or_else(|| Error::InvalidParameter("attention has no frames".to_string()))
}
