//! Dataset contract and a procedural video source

use super::augment::MultiCropAugmentation;
use super::mask::TubeMaskGenerator;
use super::{Clip, Sample};
use crate::error::{Error, Result};
use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::TAU;

/// Indexable source of augmented samples.
///
/// `get` must be deterministic in `(index, epoch)` so that every worker
/// thread and every resumed run sees the same sample.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize, epoch: usize) -> Result<Sample>;
}

/// Shape of the procedural clips
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub num_samples: usize,
    pub frames: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    /// Generate `flow_frames` optical-flow frames at the global crop size
    pub flow_frames: Option<usize>,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_samples: 256,
            frames: 8,
            height: 256,
            width: 256,
            channels: 3,
            flow_frames: None,
            seed: 0,
        }
    }
}

/// Drifting sinusoidal gratings standing in for decoded video.
///
/// Each index owns a fixed grating (frequency, direction, velocity, colour
/// phase); augmentation and tube masks are redrawn per epoch.
pub struct SyntheticVideoDataset {
    config: SyntheticConfig,
    augmentation: MultiCropAugmentation,
    tube: TubeMaskGenerator,
    patch_size: usize,
}

struct Grating {
    freq: (f32, f32),
    velocity: (f32, f32),
    phase: [f32; 3],
}

impl SyntheticVideoDataset {
    pub fn new(
        config: SyntheticConfig,
        augmentation: MultiCropAugmentation,
        tube: TubeMaskGenerator,
        patch_size: usize,
    ) -> Result<Self> {
        if config.frames == 0 || config.height == 0 || config.width == 0 || config.channels == 0 {
            return Err(Error::Data(format!("degenerate synthetic clip shape {config:?}")));
        }
        let sizes = augmentation
            .global
            .iter()
            .map(|t| t.size)
            .chain(std::iter::once(augmentation.local.size));
        for size in sizes {
            if patch_size == 0 || size % patch_size != 0 {
                return Err(Error::Data(format!(
                    "crop size {size} is not divisible by patch size {patch_size}"
                )));
            }
        }
        Ok(Self {
            config,
            augmentation,
            tube,
            patch_size,
        })
    }

    fn grating(&self, index: usize) -> Grating {
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let angle = rng.gen_range(0.0..TAU);
        let freq = rng.gen_range(1.0..4.0) * TAU;
        let speed = rng.gen_range(0.02..0.1);
        let drift = rng.gen_range(0.0..TAU);
        Grating {
            freq: (freq * angle.cos(), freq * angle.sin()),
            velocity: (speed * drift.cos(), speed * drift.sin()),
            phase: [rng.gen_range(0.0..TAU), rng.gen_range(0.0..TAU), rng.gen_range(0.0..TAU)],
        }
    }

    /// Raw clip in `[0, 1]`
    pub fn clip(&self, index: usize) -> Clip {
        let g = self.grating(index);
        let c = &self.config;
        let (h, w) = (c.height as f32, c.width as f32);
        Array4::from_shape_fn((c.channels, c.frames, c.height, c.width), |(ch, t, y, x)| {
            let u = x as f32 / w - g.velocity.0 * t as f32;
            let v = y as f32 / h - g.velocity.1 * t as f32;
            0.5 + 0.5 * (g.freq.0 * u + g.freq.1 * v + g.phase[ch % 3]).sin()
        })
    }

    /// Flow frames `(frames, 2, size, size)`: the grating velocity in pixels plus noise
    fn flow(&self, index: usize, frames: usize, size: usize, rng: &mut StdRng) -> Array4<f32> {
        let g = self.grating(index);
        let scale = size as f32;
        Array4::from_shape_fn((frames, 2, size, size), |(_, axis, _, _)| {
            let base = if axis == 0 { g.velocity.0 } else { g.velocity.1 };
            base * scale + rng.gen_range(-0.05..0.05)
        })
    }
}

impl Dataset for SyntheticVideoDataset {
    fn len(&self) -> usize {
        self.config.num_samples
    }

    fn get(&self, index: usize, epoch: usize) -> Result<Sample> {
        if index >= self.len() {
            return Err(Error::Data(format!(
                "index {index} out of range for dataset of {}",
                self.len()
            )));
        }
        let seed = self.config.seed
            ^ ((epoch as u64) << 40)
            ^ (index as u64).wrapping_mul(0xD6E8_FEB8_6659_FD93);
        let mut rng = StdRng::seed_from_u64(seed);

        let views = self.augmentation.apply(&self.clip(index), &mut rng)?;
        let masks: Vec<Array2<bool>> = views
            .iter()
            .map(|v| {
                let (_, frames, h, w) = v.dim();
                let tokens = (h / self.patch_size) * (w / self.patch_size);
                self.tube.generate(frames, tokens, &mut rng)
            })
            .collect();
        let flow = self
            .config
            .flow_frames
            .map(|n| self.flow(index, n, self.augmentation.global[0].size, &mut rng));
        Ok(Sample {
            views,
            masks,
            flow,
            index,
        })
    }
}
