//! Attention-guided visibility masks for global views

use crate::error::{Error, Result};
use crate::nn::TokenMask;
use ndarray::{Array2, Array3};
use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// What to do when more tokens must stay visible than the top pool holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Keep the whole top pool visible
    #[default]
    Clamp,
    Error,
    /// Fill the missing slots with the best-ranked bottom tokens
    Widen,
}

/// Parameters of the attention-guided mask
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskingConfig {
    /// Fraction of tokens hidden, in `[0, 1)`
    pub ratio: f64,
    /// Fraction of tokens ranked "top", in `(0, 1]`
    pub threshold: f64,
    /// Extra visible tokens drawn from the bottom pool
    #[serde(default)]
    pub bottom_visible: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            ratio: 0.9,
            threshold: 0.6,
            bottom_visible: 0,
            overflow: OverflowPolicy::Clamp,
        }
    }
}

impl MaskingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.ratio) {
            return Err(Error::InvalidParameter(format!(
                "masking ratio must be in [0, 1), got {}",
                self.ratio
            )));
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::InvalidParameter(format!(
                "masking threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    /// `ceil(tokens * (1 - ratio))`
    pub fn visible_count(&self, tokens: usize) -> usize {
        ((tokens as f64 * (1.0 - self.ratio)).ceil() as usize).min(tokens)
    }

    /// `floor(tokens * threshold)`
    pub fn top_count(&self, tokens: usize) -> usize {
        ((tokens as f64 * self.threshold).floor() as usize).min(tokens)
    }
}

/// Visible token indices and the matching hidden-token mask
#[derive(Debug, Clone, PartialEq)]
pub struct GuidedMask {
    /// `(batch, visible)` token indices into the flattened grid
    pub visible: Array2<usize>,
    /// `(batch * frames, grid_h, grid_w)`, `true` = hidden
    pub mask: TokenMask,
}

/// Builds global-view masks from ranked teacher attention
#[derive(Debug, Default)]
pub struct AttentionGuidedMasker {
    config: MaskingConfig,
    overflow_reported: AtomicBool,
}

impl AttentionGuidedMasker {
    pub fn new(config: MaskingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            overflow_reported: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MaskingConfig {
        &self.config
    }

    /// Hide all but a random subset of the most attended tokens.
    ///
    /// `scores` holds one attention score per token, `(batch, grid_h * grid_w)`.
    /// Tokens are ranked per sample, the best `floor(N * threshold)` form the
    /// top pool, and one random draw of positions within the pool (shared by
    /// the batch) picks the `ceil(N * (1 - ratio))` visible tokens. The
    /// spatial mask is repeated for every frame.
    pub fn compute_global_mask<R: Rng + ?Sized>(
        &self,
        scores: &Array2<f32>,
        frames: usize,
        grid: (usize, usize),
        rng: &mut R,
    ) -> Result<GuidedMask> {
        let (batch, tokens) = scores.dim();
        let (gh, gw) = grid;
        if gh * gw != tokens {
            return Err(Error::ShapeMismatch {
                expected: vec![batch, gh * gw],
                got: scores.shape().to_vec(),
            });
        }
        if frames == 0 || tokens == 0 {
            return Err(Error::InvalidParameter(format!(
                "empty mask request: {frames} frames, {tokens} tokens"
            )));
        }

        let top_k = self.config.top_count(tokens);
        let mut n_vis = self.config.visible_count(tokens);
        let mut widen = 0;
        if n_vis > top_k {
            match self.config.overflow {
                OverflowPolicy::Error => {
                    return Err(Error::InvalidParameter(format!(
                        "{n_vis} visible tokens requested but only {top_k} are in the top pool"
                    )));
                }
                OverflowPolicy::Clamp => {
                    if !self.overflow_reported.swap(true, Ordering::Relaxed) {
                        warn!(n_vis, top_k, "visible token count exceeds top pool, clamping");
                    }
                    n_vis = top_k;
                }
                OverflowPolicy::Widen => {
                    widen = n_vis - top_k;
                    n_vis = top_k;
                }
            }
        }
        let bottom_start = top_k + widen;
        let n_bottom = self.config.bottom_visible.min(tokens - bottom_start);

        let top_pick = sample(rng, top_k, n_vis).into_vec();
        let bottom_pick = sample(rng, tokens - bottom_start, n_bottom).into_vec();

        let total = n_vis + widen + n_bottom;
        let mut visible = Array2::<usize>::zeros((batch, total));
        let mut mask = Array3::from_elem((batch * frames, gh, gw), true);
        for (b, row) in scores.outer_iter().enumerate() {
            let mut ranked: Vec<usize> = (0..tokens).collect();
            // descending by score, ties by index
            ranked.sort_by(|&i, &j| row[j].total_cmp(&row[i]).then(i.cmp(&j)));

            let chosen = top_pick
                .iter()
                .map(|&p| ranked[p])
                .chain(ranked[top_k..bottom_start].iter().copied())
                .chain(bottom_pick.iter().map(|&p| ranked[bottom_start + p]));
            for (slot, token) in chosen.enumerate() {
                visible[[b, slot]] = token;
                for t in 0..frames {
                    mask[[b * frames + t, token / gw, token % gw]] = false;
                }
            }
        }
        Ok(GuidedMask { visible, mask })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(batch: usize, tokens: usize) -> Array2<f32> {
        Array2::from_shape_fn((batch, tokens), |(_, n)| n as f32)
    }

    #[test]
    fn test_counts_and_broadcast_over_frames() {
        let masker = AttentionGuidedMasker::new(MaskingConfig {
            ratio: 0.75,
            threshold: 0.5,
            ..MaskingConfig::default()
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let out = masker.compute_global_mask(&ramp(2, 16), 3, (4, 4), &mut rng).unwrap();
        assert_eq!(out.visible.dim(), (2, 4));
        assert_eq!(out.mask.dim(), (6, 4, 4));
        for bt in 0..6 {
            let hidden = out.mask.index_axis(ndarray::Axis(0), bt).iter().filter(|h| **h).count();
            assert_eq!(hidden, 12);
        }
        // frames of one sample share a pattern
        assert_eq!(out.mask.index_axis(ndarray::Axis(0), 0), out.mask.index_axis(ndarray::Axis(0), 2));
    }

    #[test]
    fn test_visible_tokens_come_from_top_pool() {
        let masker = AttentionGuidedMasker::new(MaskingConfig {
            ratio: 0.5,
            threshold: 0.5,
            ..MaskingConfig::default()
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let out = masker.compute_global_mask(&ramp(1, 16), 1, (4, 4), &mut rng).unwrap();
        // the ramp ranks tokens 8..16 on top
        assert!(out.visible.iter().all(|&t| t >= 8));
    }

    #[test]
    fn test_overflow_policies() {
        let scores = ramp(1, 10);
        let cfg = MaskingConfig {
            ratio: 0.5,
            threshold: 0.3,
            ..MaskingConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);

        let clamp = AttentionGuidedMasker::new(cfg).unwrap();
        let out = clamp.compute_global_mask(&scores, 1, (2, 5), &mut rng).unwrap();
        assert_eq!(out.visible.ncols(), 3);

        let strict = AttentionGuidedMasker::new(MaskingConfig {
            overflow: OverflowPolicy::Error,
            ..cfg
        })
        .unwrap();
        assert!(strict.compute_global_mask(&scores, 1, (2, 5), &mut rng).is_err());

        let widen = AttentionGuidedMasker::new(MaskingConfig {
            overflow: OverflowPolicy::Widen,
            ..cfg
        })
        .unwrap();
        let out = widen.compute_global_mask(&scores, 1, (2, 5), &mut rng).unwrap();
        let mut vis = out.visible.row(0).to_vec();
        vis.sort_unstable();
        assert_eq!(vis, vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_bottom_visible_extends_pool() {
        let masker = AttentionGuidedMasker::new(MaskingConfig {
            ratio: 0.75,
            threshold: 0.5,
            bottom_visible: 2,
            ..MaskingConfig::default()
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let out = masker.compute_global_mask(&ramp(1, 16), 1, (4, 4), &mut rng).unwrap();
        assert_eq!(out.visible.ncols(), 6);
        assert_eq!(out.visible.row(0).iter().filter(|&&t| t < 8).count(), 2);
        assert_eq!(out.mask.iter().filter(|h| !**h).count(), 6);
    }

    #[test]
    fn test_invalid_ratio_and_threshold() {
        for (ratio, threshold) in [(1.0, 0.5), (-0.1, 0.5), (0.5, 0.0), (0.5, 1.5)] {
            let cfg = MaskingConfig {
                ratio,
                threshold,
                ..MaskingConfig::default()
            };
            assert!(AttentionGuidedMasker::new(cfg).is_err());
        }
    }

    #[test]
    fn test_grid_mismatch() {
        let masker = AttentionGuidedMasker::new(MaskingConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(masker.compute_global_mask(&ramp(1, 15), 1, (4, 4), &mut rng).is_err());
    }
}
