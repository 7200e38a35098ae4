//! Declarative YAML configuration
//!
//! A run is described by one YAML file whose sections mirror [`TrainSpec`].
//! Every field has a default, so a file only lists what it changes.
//!
//! # Example
//!
//! ```yaml
//! model:
//!   arch: vit_small
//!   out_dim: 65536
//!   mode: attention_guided
//!
//! optimizer:
//!   name: adamw
//!   lr: 0.0005
//!   clip_grad: 3.0
//!
//! masking:
//!   ratio: 0.9
//!   threshold: 0.6
//!
//! training:
//!   epochs: 101
//!   output_dir: runs/vit_small
//! ```
//!
//! Command-line flags and `--opts key.path=value` pairs override the file.

mod builder;
mod cli;
mod load;
mod schema;
mod validate;


#[cfg(test)]
mod property_tests;

pub use builder::{
    build_dataset, build_options, build_scaler, build_schedules, loss_config, masking_config,
    FLOW_CHANNELS,
};
pub use cli::{apply_dotted_override, apply_overrides, parse_args, Cli};
pub use load::{config_lines, load_config, load_spec};
pub use schema::{
    CropSpec, DataSpec, MaskingSpec, ModelSpec, OptimSpec, TemperatureSpec, TrainSpec,
    TrainingModeKind, TrainingParams,
};
pub use validate::{validate_config, ValidationError};
