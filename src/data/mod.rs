//! Video data pipeline
//!
//! Clips are augmented into global and local views, each view gets a random
//! tube mask, and samples are batched per rank by a prefetching loader.

mod augment;
mod clip;
mod dataset;
mod loader;
mod mask;
mod sampler;

pub use augment::{
    color_jitter, gaussian_blur, grayscale, normalize, random_resized_crop, solarize, ColorJitter,
    MultiCropAugmentation, ViewTransform, IMAGENET_MEAN, IMAGENET_STD,
};
pub use clip::{collate, Batch, Clip, Sample};
pub use dataset::{Dataset, SyntheticConfig, SyntheticVideoDataset};
pub use loader::{Batches, DataLoader};
pub use mask::TubeMaskGenerator;
pub use sampler::DistributedSampler;
