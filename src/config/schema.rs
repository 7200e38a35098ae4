//! YAML schema definitions for declarative training configuration

use crate::masking::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete training specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrainSpec {
    /// Backbone, head and teacher settings
    #[serde(default)]
    pub model: ModelSpec,

    /// Temperatures and centering
    #[serde(default)]
    pub temperature: TemperatureSpec,

    /// Optimizer and schedule endpoints
    #[serde(default)]
    pub optimizer: OptimSpec,

    /// Multi-crop layout
    #[serde(default)]
    pub crops: CropSpec,

    /// Attention-guided and tube masking
    #[serde(default)]
    pub masking: MaskingSpec,

    /// Clip source and loading
    #[serde(default)]
    pub data: DataSpec,

    /// Run length, output and checkpoint cadence
    #[serde(default)]
    pub training: TrainingParams,
}

/// Which per-iteration computation the session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TrainingModeKind {
    /// Distillation plus masked modeling on attention-guided and tube masks
    #[default]
    AttentionGuided,
    /// Two output tokens with fixed crop pairing
    TwoToken,
    /// RGB and optical-flow networks with cross-stream distillation
    TwoStream,
}

/// Backbone and projection head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// Registered architecture name (`vit_tiny`, `vit_small`, `vit_base`, `timesformer`, `deit_*`)
    pub arch: String,

    pub patch_size: usize,

    /// Dimensionality of the projection head output
    pub out_dim: usize,

    /// Train only the direction of the last layer rows
    pub norm_last_layer: bool,

    pub head_hidden_dim: usize,

    pub bottleneck_dim: usize,

    /// Override the architecture's embedding width
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_dim: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_heads: Option<usize>,

    /// Base EMA momentum of the teacher, raised to 1 by a cosine schedule
    pub momentum_teacher: f64,

    pub mode: TrainingModeKind,

    /// Architecture of the optical-flow networks (defaults to `arch`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_arch: Option<String>,

    /// `.safetensors` weights or a checkpoint `.json`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretrained_weights: Option<PathBuf>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            arch: "vit_small".to_string(),
            patch_size: 16,
            out_dim: 65536,
            norm_last_layer: true,
            head_hidden_dim: 2048,
            bottleneck_dim: 256,
            embed_dim: None,
            num_heads: None,
            momentum_teacher: 0.996,
            mode: TrainingModeKind::AttentionGuided,
            motion_arch: None,
            pretrained_weights: None,
        }
    }
}

/// Teacher/student temperatures and the center EMA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureSpec {
    pub warmup_teacher_temp: f64,
    pub teacher_temp: f64,
    pub warmup_teacher_temp_epochs: usize,
    pub student_temp: f32,
    pub center_momentum: f32,
}

impl Default for TemperatureSpec {
    fn default() -> Self {
        Self {
            warmup_teacher_temp: 0.04,
            teacher_temp: 0.04,
            warmup_teacher_temp_epochs: 0,
            student_temp: 0.1,
            center_momentum: 0.9,
        }
    }
}

/// Optimizer specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimSpec {
    /// Optimizer name: "adamw" | "sgd" | "lars"
    pub name: String,

    /// Peak learning rate at a total batch size of 256
    pub lr: f64,

    pub min_lr: f64,

    /// Linear learning-rate warmup
    pub warmup_epochs: usize,

    pub weight_decay: f64,

    pub weight_decay_end: f64,

    /// Per-parameter gradient norm limit, 0 disables clipping
    pub clip_grad: f32,

    /// Epochs during which the last layer receives no update
    pub freeze_last_layer: usize,

    /// Dynamic loss scaling
    pub use_fp16: bool,
}

impl Default for OptimSpec {
    fn default() -> Self {
        Self {
            name: "adamw".to_string(),
            lr: 0.0005,
            min_lr: 1e-6,
            warmup_epochs: 10,
            weight_decay: 0.04,
            weight_decay_end: 0.4,
            clip_grad: 3.0,
            freeze_last_layer: 1,
            use_fp16: true,
        }
    }
}

/// Multi-crop layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropSpec {
    pub global_crops: usize,
    pub global_size: usize,
    pub global_scale: (f64, f64),
    pub local_crops: usize,
    pub local_size: usize,
    pub local_scale: (f64, f64),
}

impl Default for CropSpec {
    fn default() -> Self {
        Self {
            global_crops: 2,
            global_size: 224,
            global_scale: (0.4, 1.0),
            local_crops: 8,
            local_size: 96,
            local_scale: (0.05, 0.4),
        }
    }
}

/// Masking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingSpec {
    /// Fraction of global-view tokens hidden
    pub ratio: f64,

    /// Fraction of tokens forming the attention top pool
    pub threshold: f64,

    pub bottom_visible: usize,

    pub overflow: OverflowPolicy,

    /// Fraction of local-view tokens hidden by tube masks
    pub tube_ratio: f64,
}

impl Default for MaskingSpec {
    fn default() -> Self {
        Self {
            ratio: 0.9,
            threshold: 0.6,
            bottom_visible: 0,
            overflow: OverflowPolicy::Clamp,
            tube_ratio: 0.9,
        }
    }
}

/// Clip source and loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSpec {
    pub batch_size_per_gpu: usize,

    pub num_workers: usize,

    /// Batches buffered per loader worker
    pub prefetch_factor: usize,

    /// Clips per epoch
    pub num_samples: usize,

    pub frames: usize,

    pub height: usize,

    pub width: usize,

    /// Optical-flow frames per clip (required by two-stream training)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_frames: Option<usize>,
}

impl Default for DataSpec {
    fn default() -> Self {
        Self {
            batch_size_per_gpu: 64,
            num_workers: 10,
            prefetch_factor: 2,
            num_samples: 1024,
            frames: 8,
            height: 256,
            width: 256,
            flow_frames: None,
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub epochs: usize,

    /// Numbered snapshot and plot every N epochs
    pub saveckp_freq: usize,

    pub output_dir: PathBuf,

    pub seed: u64,

    /// Number of data-parallel workers
    pub world_size: usize,

    /// Log metrics every N iterations
    pub log_every: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 101,
            saveckp_freq: 10,
            output_dir: PathBuf::from("."),
            seed: 0,
            world_size: 1,
            log_every: 10,
        }
    }
}

impl TrainSpec {
    /// Views fed to the student in one iteration
    pub fn num_crops(&self) -> usize {
        self.crops.global_crops + self.crops.local_crops
    }

    /// Linear scaling rule: `lr * total_batch / 256`
    pub fn scaled_lr(&self) -> f64 {
        self.optimizer.lr * (self.data.batch_size_per_gpu * self.training.world_size) as f64 / 256.0
    }

    pub fn motion_arch(&self) -> &str {
        self.model.motion_arch.as_deref().unwrap_or(&self.model.arch)
    }
}
