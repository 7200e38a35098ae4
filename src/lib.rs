//! # Destilar: Self-Distillation for Video Transformers
//!
//! Destilar pretrains video backbones without labels. A student network
//! learns to match the sharpened, centered output of an EMA teacher across
//! multi-crop views of a clip, and to reconstruct patches hidden by masks
//! that the teacher's class-token attention selects.
//!
//! ## Architecture
//!
//! - **nn**: Parameter tensors, the `Network` contract and a reference ViT
//! - **data**: Multi-crop augmentation, tube masks, sampler and loader
//! - **masking**: Attention-guided global masks and local tube masks
//! - **distill**: Centered multi-crop distillation loss
//! - **optim**: AdamW/SGD/LARS, clipping, cosine schedules, loss scaling
//! - **distributed**: Collectives and data-parallel helpers
//! - **train**: Training session, epoch loop, checkpoints, logs and plots
//! - **config**: Declarative YAML configuration and CLI
//! - **io**: Safetensors weight export and import

pub mod config;
pub mod data;
pub mod distill;
pub mod distributed;
pub mod io;
pub mod masking;
pub mod nn;
pub mod optim;
pub mod train;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use nn::{ArchRegistry, Network, Tensor};
pub use train::{TrainResult, Trainer, TrainingSession};
