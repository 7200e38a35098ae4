//! Configuration validation

use super::schema::{TrainSpec, TrainingModeKind};

/// Validation error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown architecture: {name} (known: {known})")]
    UnknownArchitecture { name: String, known: String },

    #[error("Invalid optimizer: {0} (must be one of: adamw, sgd, lars)")]
    InvalidOptimizer(String),

    #[error("Invalid masking ratio: {0} (must be in [0, 1))")]
    InvalidMaskingRatio(f64),

    #[error("Invalid masking threshold: {0} (must be in (0, 1])")]
    InvalidThreshold(f64),

    #[error("Invalid tube mask ratio: {0} (must be in [0, 1))")]
    InvalidTubeRatio(f64),

    #[error("Invalid batch size: {0} (must be > 0)")]
    InvalidBatchSize(usize),

    #[error("Invalid epochs: {0} (must be > 0)")]
    InvalidEpochs(usize),

    #[error("Invalid world size: {0} (must be > 0)")]
    InvalidWorldSize(usize),

    #[error("{name} warmup of {warmup} epochs exceeds {epochs} training epochs")]
    WarmupTooLong {
        name: &'static str,
        warmup: usize,
        epochs: usize,
    },

    #[error("Invalid {name} temperature: {value} (must be > 0)")]
    InvalidTemperature { name: &'static str, value: f64 },

    #[error("Invalid teacher momentum: {0} (must be in [0, 1])")]
    InvalidMomentum(f64),

    #[error("Invalid center momentum: {0} (must be in [0, 1))")]
    InvalidCenterMomentum(f32),

    #[error("Invalid {name} crop scale: ({lo}, {hi}) (must be ordered within (0, 1])")]
    InvalidCropScale { name: &'static str, lo: f64, hi: f64 },

    #[error("Invalid number of global crops: {got} ({reason})")]
    InvalidGlobalCrops { got: usize, reason: &'static str },

    #[error("Crop size {size} is not divisible by patch size {patch}")]
    IndivisibleCrop { size: usize, patch: usize },

    #[error("Invalid gradient clip value: {0} (must be >= 0.0)")]
    InvalidGradClip(f32),

    #[error("Invalid learning rate: {0} (must be > 0.0)")]
    InvalidLearningRate(f64),

    #[error("Two-token training needs at least one local crop")]
    TwoTokenWithoutLocalCrops,

    #[error("Two-stream training needs at least 2 optical-flow frames per clip")]
    TwoStreamWithoutFlow,

    #[error("Invalid checkpoint frequency: {0} (must be > 0)")]
    InvalidSaveFrequency(usize),
}

fn check_scale(name: &'static str, (lo, hi): (f64, f64)) -> Result<(), ValidationError> {
    if lo > 0.0 && lo <= hi && hi <= 1.0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidCropScale { name, lo, hi })
    }
}

fn check_temp(name: &'static str, value: f64) -> Result<(), ValidationError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::InvalidTemperature { name, value })
    }
}

/// Validate a training specification against the registered architectures
///
/// Checks:
/// - Architecture and optimizer names resolve
/// - Numeric values are in valid ranges
/// - Mode-specific requirements (crop counts, optical flow) hold
pub fn validate_config(spec: &TrainSpec, known_archs: &[String]) -> Result<(), ValidationError> {
    let resolves = |name: &str| {
        let canonical = match name.strip_prefix("deit") {
            Some(rest) => format!("vit{rest}"),
            None => name.to_string(),
        };
        known_archs.iter().any(|k| *k == canonical)
    };
    for arch in [spec.model.arch.as_str(), spec.motion_arch()] {
        if !resolves(arch) {
            return Err(ValidationError::UnknownArchitecture {
                name: arch.to_string(),
                known: known_archs.join(", "),
            });
        }
    }

    let valid_optimizers = ["adamw", "sgd", "lars"];
    if !valid_optimizers.contains(&spec.optimizer.name.to_lowercase().as_str()) {
        return Err(ValidationError::InvalidOptimizer(spec.optimizer.name.clone()));
    }
    if !(spec.optimizer.lr > 0.0) {
        return Err(ValidationError::InvalidLearningRate(spec.optimizer.lr));
    }

    let m = &spec.masking;
    if !(0.0..1.0).contains(&m.ratio) {
        return Err(ValidationError::InvalidMaskingRatio(m.ratio));
    }
    if !(m.threshold > 0.0 && m.threshold <= 1.0) {
        return Err(ValidationError::InvalidThreshold(m.threshold));
    }
    if !(0.0..1.0).contains(&m.tube_ratio) {
        return Err(ValidationError::InvalidTubeRatio(m.tube_ratio));
    }

    if spec.data.batch_size_per_gpu == 0 {
        return Err(ValidationError::InvalidBatchSize(spec.data.batch_size_per_gpu));
    }
    let epochs = spec.training.epochs;
    if epochs == 0 {
        return Err(ValidationError::InvalidEpochs(epochs));
    }
    if spec.training.world_size == 0 {
        return Err(ValidationError::InvalidWorldSize(0));
    }
    if spec.training.saveckp_freq == 0 {
        return Err(ValidationError::InvalidSaveFrequency(0));
    }
    if spec.optimizer.warmup_epochs > epochs {
        return Err(ValidationError::WarmupTooLong {
            name: "learning-rate",
            warmup: spec.optimizer.warmup_epochs,
            epochs,
        });
    }

    let t = &spec.temperature;
    if t.warmup_teacher_temp_epochs > epochs {
        return Err(ValidationError::WarmupTooLong {
            name: "teacher-temperature",
            warmup: t.warmup_teacher_temp_epochs,
            epochs,
        });
    }
    check_temp("warmup teacher", t.warmup_teacher_temp)?;
    check_temp("teacher", t.teacher_temp)?;
    check_temp("student", f64::from(t.student_temp))?;
    if !(0.0..=1.0).contains(&spec.model.momentum_teacher) {
        return Err(ValidationError::InvalidMomentum(spec.model.momentum_teacher));
    }
    if !(0.0..1.0).contains(&t.center_momentum) {
        return Err(ValidationError::InvalidCenterMomentum(t.center_momentum));
    }

    let c = &spec.crops;
    check_scale("global", c.global_scale)?;
    check_scale("local", c.local_scale)?;
    if c.global_crops == 0 {
        return Err(ValidationError::InvalidGlobalCrops {
            got: 0,
            reason: "at least one is required",
        });
    }
    let patch = spec.model.patch_size;
    for size in [c.global_size, c.local_size] {
        if patch == 0 || size == 0 || size % patch != 0 {
            return Err(ValidationError::IndivisibleCrop { size, patch });
        }
    }
    if spec.optimizer.clip_grad < 0.0 || !spec.optimizer.clip_grad.is_finite() {
        return Err(ValidationError::InvalidGradClip(spec.optimizer.clip_grad));
    }

    match spec.model.mode {
        TrainingModeKind::AttentionGuided => {}
        TrainingModeKind::TwoToken => {
            if c.global_crops != 2 {
                return Err(ValidationError::InvalidGlobalCrops {
                    got: c.global_crops,
                    reason: "two-token training uses exactly 2",
                });
            }
            if c.local_crops == 0 {
                return Err(ValidationError::TwoTokenWithoutLocalCrops);
            }
        }
        TrainingModeKind::TwoStream => {
            if c.global_crops != 2 {
                return Err(ValidationError::InvalidGlobalCrops {
                    got: c.global_crops,
                    reason: "two-stream training uses exactly 2",
                });
            }
            if spec.data.flow_frames.map_or(true, |f| f < 2) {
                return Err(ValidationError::TwoStreamWithoutFlow);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<String> {
        ["timesformer", "vit_base", "vit_small", "vit_tiny"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(validate_config(&TrainSpec::default(), &known()), Ok(()));
    }

    #[test]
    fn test_deit_alias_accepted() {
        let mut spec = TrainSpec::default();
        spec.model.arch = "deit_small".to_string();
        assert!(validate_config(&spec, &known()).is_ok());
    }

    #[test]
    fn test_unknown_architecture() {
        let mut spec = TrainSpec::default();
        spec.model.arch = "resnet50".to_string();
        assert!(matches!(
            validate_config(&spec, &known()),
            Err(ValidationError::UnknownArchitecture { .. })
        ));
    }

    #[test]
    fn test_masking_bounds() {
        let mut spec = TrainSpec::default();
        spec.masking.ratio = 1.0;
        assert_eq!(
            validate_config(&spec, &known()),
            Err(ValidationError::InvalidMaskingRatio(1.0))
        );
        spec.masking.ratio = 0.5;
        spec.masking.threshold = 0.0;
        assert_eq!(
            validate_config(&spec, &known()),
            Err(ValidationError::InvalidThreshold(0.0))
        );
    }

    #[test]
    fn test_two_stream_needs_flow() {
        let mut spec = TrainSpec::default();
        spec.model.mode = TrainingModeKind::TwoStream;
        assert_eq!(
            validate_config(&spec, &known()),
            Err(ValidationError::TwoStreamWithoutFlow)
        );
        spec.data.flow_frames = Some(4);
        assert!(validate_config(&spec, &known()).is_ok());
    }

    #[test]
    fn test_crop_size_divisible_by_patch() {
        let mut spec = TrainSpec::default();
        spec.crops.local_size = 100;
        assert!(matches!(
            validate_config(&spec, &known()),
            Err(ValidationError::IndivisibleCrop { size: 100, patch: 16 })
        ));
    }

    #[test]
    fn test_warmup_longer_than_run() {
        let mut spec = TrainSpec::default();
        spec.training.epochs = 5;
        assert!(matches!(
            validate_config(&spec, &known()),
            Err(ValidationError::WarmupTooLong { .. })
        ));
    }
}
