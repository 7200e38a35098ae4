//! Attention-guided masking
//!
//! Global views are masked from the teacher's class-token attention: the most
//! attended tokens form a candidate pool and a random subset of that pool
//! stays visible. Local views use the tube masks produced by the data
//! pipeline.
//!
//! ## Example
//!
//! ```
//! use destilar::masking::{AttentionGuidedMasker, MaskingConfig};
//! use ndarray::Array2;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let masker = AttentionGuidedMasker::new(MaskingConfig::default()).unwrap();
//! let scores = Array2::from_shape_fn((2, 196), |(_, n)| n as f32);
//! let mut rng = StdRng::seed_from_u64(0);
//! let out = masker.compute_global_mask(&scores, 8, (14, 14), &mut rng).unwrap();
//! assert_eq!(out.visible.ncols(), 20);
//! assert_eq!(out.mask.dim(), (16, 14, 14));
//! ```

mod attention;
mod guided;
mod local;

#[cfg(test)]
mod tests;

pub use attention::{cls_attention, frame_mean};
pub use guided::{AttentionGuidedMasker, GuidedMask, MaskingConfig, OverflowPolicy};
pub use local::local_masks;
