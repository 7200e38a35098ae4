//! Self-distillation training loop
//!
//! A [`TrainingSession`] owns the student, the EMA teacher, the optimizer,
//! the loss-scaling policy, the distillation losses and the data loader of
//! one worker. [`Trainer`] runs it epoch by epoch:
//!
//! - schedules are looked up by global step (learning rate, weight decay,
//!   teacher momentum)
//! - the [`TrainingMode`] computes the losses of one batch
//! - gradients are all-reduced, unscaled, clipped and the last layer frozen
//! - the optimizer steps and the teacher follows by EMA
//! - at each epoch end the main worker checkpoints, logs and plots
//!
//! # Example
//!
//! ```no_run
//! use destilar::config::TrainSpec;
//! use destilar::distributed::SingleProcess;
//! use destilar::nn::ArchRegistry;
//! use destilar::train::{Trainer, TrainingSession};
//! use std::sync::Arc;
//!
//! let mut session = TrainingSession::new(
//!     TrainSpec::default(),
//!     &ArchRegistry::with_builtins(),
//!     Arc::new(SingleProcess),
//! )?;
//! session.resume()?;
//! let result = Trainer::new(session)?.train()?;
//! println!("final loss {:?}", result.final_loss);
//! # Ok::<(), destilar::Error>(())
//! ```

mod checkpoint;
mod ema;
mod log;
mod metrics;
mod mode;
mod plot;
mod session;
mod trainer;

pub use checkpoint::{
    checkpoint_path, load_checkpoint, save_checkpoint, save_snapshot, snapshot_path, Checkpoint,
    OptimizerStates,
};
pub use ema::{ema_update, ema_update_params};
pub use log::{append_epoch_stats, log_path, read_loss_history};
pub use metrics::{format_duration, MetricLogger, SmoothedValue, DEFAULT_WINDOW};
pub use mode::{scale_seeds, IterationContext, IterationOutput, MotionStreams, TrainingMode};
pub use plot::{plot_loss, plot_path};
pub use session::TrainingSession;
pub use trainer::{TrainResult, Trainer};

/// Smallest configuration that exercises every stage of a step
#[cfg(test)]
pub(crate) fn tiny_spec(output_dir: &std::path::Path) -> crate::config::TrainSpec {
    let mut spec = crate::config::TrainSpec::default();
    spec.model.arch = "vit_tiny".to_string();
    spec.model.patch_size = 4;
    spec.model.out_dim = 16;
    spec.model.head_hidden_dim = 16;
    spec.model.bottleneck_dim = 8;
    spec.model.embed_dim = Some(8);
    spec.model.num_heads = Some(2);
    spec.crops.global_size = 16;
    spec.crops.local_size = 8;
    spec.crops.local_crops = 2;
    spec.masking.ratio = 0.5;
    spec.masking.threshold = 0.75;
    spec.masking.tube_ratio = 0.5;
    spec.optimizer.lr = 0.05;
    spec.optimizer.warmup_epochs = 0;
    spec.optimizer.freeze_last_layer = 0;
    spec.optimizer.use_fp16 = false;
    spec.data.batch_size_per_gpu = 2;
    spec.data.num_workers = 0;
    spec.data.num_samples = 4;
    spec.data.frames = 2;
    spec.data.height = 20;
    spec.data.width = 20;
    spec.training.epochs = 2;
    spec.training.saveckp_freq = 1;
    spec.training.log_every = 1;
    spec.training.output_dir = output_dir.to_path_buf();
    spec
}
