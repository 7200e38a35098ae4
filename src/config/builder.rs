//! Build training components from configuration

use super::schema::TrainSpec;
use crate::data::{MultiCropAugmentation, SyntheticConfig, SyntheticVideoDataset, TubeMaskGenerator};
use crate::distill::{DinoLossConfig, LossVariant};
use crate::error::Result;
use crate::masking::MaskingConfig;
use crate::nn::BuildOptions;
use crate::optim::{cosine_scheduler, DynamicGradScaler, FullPrecision, GradScaling, Schedules};

/// Channels of an optical-flow frame
pub const FLOW_CHANNELS: usize = 2;

/// Network construction options
pub fn build_options(spec: &TrainSpec, num_streams: usize, in_chans: usize) -> BuildOptions {
    let m = &spec.model;
    BuildOptions {
        patch_size: m.patch_size,
        in_chans,
        num_streams,
        out_dim: m.out_dim,
        head_hidden_dim: m.head_hidden_dim,
        bottleneck_dim: m.bottleneck_dim,
        norm_last_layer: m.norm_last_layer,
        embed_dim: m.embed_dim,
        num_heads: m.num_heads,
        seed: spec.training.seed,
    }
}

/// Distillation loss over `n_crops` student crops
pub fn loss_config(spec: &TrainSpec, variant: LossVariant, n_crops: usize) -> DinoLossConfig {
    let t = &spec.temperature;
    DinoLossConfig {
        out_dim: spec.model.out_dim,
        n_crops,
        global_crops: spec.crops.global_crops,
        warmup_teacher_temp: t.warmup_teacher_temp,
        teacher_temp: t.teacher_temp,
        warmup_teacher_temp_epochs: t.warmup_teacher_temp_epochs,
        epochs: spec.training.epochs,
        student_temp: t.student_temp,
        center_momentum: t.center_momentum,
        variant,
    }
}

pub fn masking_config(spec: &TrainSpec) -> MaskingConfig {
    MaskingConfig {
        ratio: spec.masking.ratio,
        threshold: spec.masking.threshold,
        bottom_visible: spec.masking.bottom_visible,
        overflow: spec.masking.overflow,
    }
}

/// Synthetic clip source with the configured multi-crop augmentation
pub fn build_dataset(spec: &TrainSpec) -> Result<SyntheticVideoDataset> {
    let c = &spec.crops;
    let augmentation = MultiCropAugmentation::new(
        c.global_size,
        c.global_scale,
        c.local_size,
        c.local_scale,
        c.local_crops,
    )?;
    let d = &spec.data;
    SyntheticVideoDataset::new(
        SyntheticConfig {
            num_samples: d.num_samples,
            frames: d.frames,
            height: d.height,
            width: d.width,
            channels: 3,
            flow_frames: d.flow_frames,
            seed: spec.training.seed,
        },
        augmentation,
        TubeMaskGenerator::new(spec.masking.tube_ratio)?,
        spec.model.patch_size,
    )
}

/// Learning-rate, weight-decay and teacher-momentum schedules
pub fn build_schedules(spec: &TrainSpec, steps_per_epoch: usize) -> Schedules {
    let epochs = spec.training.epochs;
    let o = &spec.optimizer;
    Schedules {
        lr: cosine_scheduler(spec.scaled_lr(), o.min_lr, epochs, steps_per_epoch, o.warmup_epochs, 0.0),
        wd: cosine_scheduler(o.weight_decay, o.weight_decay_end, epochs, steps_per_epoch, 0, 0.0),
        momentum: cosine_scheduler(spec.model.momentum_teacher, 1.0, epochs, steps_per_epoch, 0, 0.0),
    }
}

pub fn build_scaler(spec: &TrainSpec) -> Box<dyn GradScaling> {
    if spec.optimizer.use_fp16 {
        Box::new(DynamicGradScaler::default())
    } else {
        Box::new(FullPrecision)
    }
}
