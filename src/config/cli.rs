//! CLI argument parsing and overrides
//!
//! # Usage
//!
//! ```bash
//! destilar --cfg configs/vit_small.yaml
//! destilar --cfg configs/vit_small.yaml --output-dir ./runs/a --epochs 30
//! destilar --cfg configs/vit_small.yaml --opts optimizer.lr=0.0002 masking.ratio=0.8
//! destilar --cfg configs/vit_small.yaml --dry-run
//! ```

use super::schema::{TrainSpec, TrainingModeKind};
use crate::error::{Error, Result};
use clap::Parser;
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;

/// Destilar: self-supervised video distillation with attention-guided masking
#[derive(Parser, Debug, Clone, PartialEq, Default)]
#[command(name = "destilar")]
#[command(version)]
#[command(about = "Teacher-student video pretraining with attention-guided masked modeling")]
pub struct Cli {
    /// Path to YAML configuration file
    #[arg(long = "cfg", value_name = "FILE")]
    pub cfg: Option<PathBuf>,

    /// Backbone architecture
    #[arg(long)]
    pub arch: Option<String>,

    #[arg(long)]
    pub patch_size: Option<usize>,

    /// Projection head output dimension
    #[arg(long)]
    pub out_dim: Option<usize>,

    #[arg(long)]
    pub norm_last_layer: Option<bool>,

    /// Base teacher EMA momentum
    #[arg(long)]
    pub momentum_teacher: Option<f64>,

    /// Training mode
    #[arg(long, value_enum)]
    pub mode: Option<TrainingModeKind>,

    #[arg(long)]
    pub warmup_teacher_temp: Option<f64>,

    #[arg(long)]
    pub teacher_temp: Option<f64>,

    #[arg(long)]
    pub warmup_teacher_temp_epochs: Option<usize>,

    /// Optimizer: adamw, sgd or lars
    #[arg(long)]
    pub optimizer: Option<String>,

    /// Peak learning rate at total batch size 256
    #[arg(long)]
    pub lr: Option<f64>,

    #[arg(long)]
    pub min_lr: Option<f64>,

    #[arg(long)]
    pub warmup_epochs: Option<usize>,

    #[arg(long)]
    pub weight_decay: Option<f64>,

    #[arg(long)]
    pub weight_decay_end: Option<f64>,

    /// Per-parameter gradient norm limit, 0 disables clipping
    #[arg(long)]
    pub clip_grad: Option<f32>,

    #[arg(long)]
    pub freeze_last_layer: Option<usize>,

    #[arg(long)]
    pub use_fp16: Option<bool>,

    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"])]
    pub global_crops_scale: Option<Vec<f64>>,

    #[arg(long)]
    pub local_crops_number: Option<usize>,

    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"])]
    pub local_crops_scale: Option<Vec<f64>>,

    #[arg(long)]
    pub masking_ratio: Option<f64>,

    /// Fraction of attention-ranked tokens eligible to stay visible
    #[arg(long)]
    pub threshold: Option<f64>,

    #[arg(long)]
    pub batch_size_per_gpu: Option<usize>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Numbered snapshot every N epochs
    #[arg(long)]
    pub saveckp_freq: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub num_workers: Option<usize>,

    /// Number of data-parallel workers
    #[arg(long)]
    pub world_size: Option<usize>,

    #[arg(long)]
    pub pretrained_weights: Option<PathBuf>,

    /// Dotted-key overrides applied to the YAML tree, e.g. `optimizer.lr=1e-4`
    #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
    pub opts: Vec<String>,

    /// Validate and print the effective configuration without training
    #[arg(long)]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Parse command-line arguments
pub fn parse_args<I, T>(args: I) -> std::result::Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Set `path.to.key` in a YAML tree, creating intermediate mappings.
///
/// The value is parsed as a YAML scalar, so `1e-4` becomes a number and
/// `true` a boolean.
pub fn apply_dotted_override(root: &mut Value, assignment: &str) -> Result<()> {
    let (key, raw) = assignment.split_once('=').ok_or_else(|| {
        Error::ConfigError(format!("override '{assignment}' is not of the form key=value"))
    })?;
    let parts: Vec<&str> = key.trim().split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::ConfigError(format!("override key '{key}' has an empty segment")));
    }
    let value: Value = serde_yaml::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.trim().to_string()));

    let mut node = root;
    for (i, part) in parts.iter().enumerate() {
        if !node.is_mapping() {
            if node.is_null() {
                *node = Value::Mapping(Mapping::new());
            } else {
                return Err(Error::ConfigError(format!(
                    "override '{key}': '{}' is not a section",
                    parts[..i].join(".")
                )));
            }
        }
        let Value::Mapping(map) = node else {
            return Err(Error::ConfigError(format!("override '{key}' cannot be applied")));
        };
        let k = Value::String((*part).to_string());
        if i + 1 == parts.len() {
            map.insert(k, value);
            return Ok(());
        }
        node = map.entry(k).or_insert(Value::Null);
    }
    Ok(())
}

/// Apply named command-line overrides to a TrainSpec
pub fn apply_overrides(spec: &mut TrainSpec, cli: &Cli) {
    macro_rules! set {
        ($field:expr, $arg:expr) => {
            if let Some(v) = $arg.clone() {
                $field = v;
            }
        };
    }
    set!(spec.model.arch, cli.arch);
    set!(spec.model.patch_size, cli.patch_size);
    set!(spec.model.out_dim, cli.out_dim);
    set!(spec.model.norm_last_layer, cli.norm_last_layer);
    set!(spec.model.momentum_teacher, cli.momentum_teacher);
    set!(spec.model.mode, cli.mode);
    set!(spec.temperature.warmup_teacher_temp, cli.warmup_teacher_temp);
    set!(spec.temperature.teacher_temp, cli.teacher_temp);
    set!(spec.temperature.warmup_teacher_temp_epochs, cli.warmup_teacher_temp_epochs);
    set!(spec.optimizer.name, cli.optimizer);
    set!(spec.optimizer.lr, cli.lr);
    set!(spec.optimizer.min_lr, cli.min_lr);
    set!(spec.optimizer.warmup_epochs, cli.warmup_epochs);
    set!(spec.optimizer.weight_decay, cli.weight_decay);
    set!(spec.optimizer.weight_decay_end, cli.weight_decay_end);
    set!(spec.optimizer.clip_grad, cli.clip_grad);
    set!(spec.optimizer.freeze_last_layer, cli.freeze_last_layer);
    set!(spec.optimizer.use_fp16, cli.use_fp16);
    set!(spec.crops.local_crops, cli.local_crops_number);
    set!(spec.masking.ratio, cli.masking_ratio);
    set!(spec.masking.threshold, cli.threshold);
    set!(spec.data.batch_size_per_gpu, cli.batch_size_per_gpu);
    set!(spec.data.num_workers, cli.num_workers);
    set!(spec.training.epochs, cli.epochs);
    set!(spec.training.output_dir, cli.output_dir);
    set!(spec.training.saveckp_freq, cli.saveckp_freq);
    set!(spec.training.seed, cli.seed);
    set!(spec.training.world_size, cli.world_size);
    if let Some(path) = &cli.pretrained_weights {
        spec.model.pretrained_weights = Some(path.clone());
    }
    if let Some([lo, hi]) = cli.global_crops_scale.as_deref() {
        spec.crops.global_scale = (*lo, *hi);
    }
    if let Some([lo, hi]) = cli.local_crops_scale.as_deref() {
        spec.crops.local_scale = (*lo, *hi);
    }
}
