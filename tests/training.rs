//! End-to-end training on a tiny synthetic configuration

mod common;

use common::tiny_spec;
use destilar::config::{build_dataset, validate_config, TrainingModeKind};
use destilar::data::{Dataset, Sample, SyntheticVideoDataset};
use destilar::distributed::SingleProcess;
use destilar::io::load_safetensors;
use destilar::nn::ArchRegistry;
use destilar::train::{
    checkpoint_path, load_checkpoint, log_path, plot_path, read_loss_history, save_checkpoint,
    snapshot_path, Trainer, TrainingSession,
};
use destilar::Error;
use std::sync::Arc;
use tempfile::TempDir;

fn session(spec: destilar::config::TrainSpec) -> TrainingSession {
    let registry = ArchRegistry::with_builtins();
    validate_config(&spec, &registry.names()).unwrap();
    TrainingSession::new(spec, &registry, Arc::new(SingleProcess)).unwrap()
}

#[test]
fn test_full_run_writes_every_artifact() {
    let dir = TempDir::new().unwrap();
    let mut trainer = Trainer::new(session(tiny_spec(dir.path()))).unwrap();
    let result = trainer.train().unwrap();

    assert_eq!(result.start_epoch, 0);
    assert_eq!(result.epochs_run, 3);
    assert!(result.final_loss.unwrap().is_finite());

    let checkpoint = load_checkpoint(&checkpoint_path(dir.path())).unwrap();
    assert_eq!(checkpoint.epoch, 3);
    assert_eq!(checkpoint.args, tiny_spec(dir.path()));
    assert!(checkpoint.fp16_scaler.is_none());

    // cadence 2: epochs 0 and 2
    assert!(snapshot_path(dir.path(), 0).exists());
    assert!(!snapshot_path(dir.path(), 1).exists());
    assert!(snapshot_path(dir.path(), 2).exists());
    assert!(plot_path(dir.path(), 0).exists());
    assert!(plot_path(dir.path(), 2).exists());

    let history = read_loss_history(&log_path(dir.path())).unwrap();
    assert_eq!(history.iter().map(|h| h.0).collect::<Vec<_>>(), vec![0, 1, 2]);
    let log = std::fs::read_to_string(log_path(dir.path())).unwrap();
    let first: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    for key in ["epoch", "train_loss", "train_loss_dino", "train_loss_MIM_global", "train_lr", "train_wd"] {
        assert!(first.get(key).is_some(), "log record lacks {key}");
    }

    let (teacher, meta) = load_safetensors(&dir.path().join("teacher.safetensors")).unwrap();
    assert_eq!(meta.architecture, "vit_tiny");
    assert_eq!(teacher, trainer.session().teacher().state_dict());
    assert!(dir.path().join("config.json").exists());
}

#[test]
fn test_resume_continues_schedules_and_state() {
    let dir = TempDir::new().unwrap();
    let spec = tiny_spec(dir.path());

    let mut first = Trainer::new(session(spec.clone())).unwrap();
    first.train_one_epoch(0).unwrap();
    let saved = first.session().checkpoint(1);
    save_checkpoint(&checkpoint_path(dir.path()), &saved).unwrap();

    let mut resumed = session(spec);
    assert!(resumed.resume().unwrap());
    assert_eq!(resumed.start_epoch(), 1);

    let steps = resumed.steps_per_epoch();
    let continuous = first.session().schedules();
    for step in [steps, steps + 1, 2 * steps] {
        assert_eq!(resumed.schedules().at(step), continuous.at(step));
    }
    assert_eq!(resumed.student().state_dict(), first.session().student().state_dict());
    assert_eq!(resumed.teacher().state_dict(), first.session().teacher().state_dict());
    assert_eq!(resumed.dino_loss().center(), first.session().dino_loss().center());

    let result = Trainer::new(resumed).unwrap().train().unwrap();
    assert_eq!(result.start_epoch, 1);
    assert_eq!(result.epochs_run, 2);
    // epoch 0 was never logged by this run
    let epochs: Vec<usize> = read_loss_history(&log_path(dir.path()))
        .unwrap()
        .into_iter()
        .map(|(e, _)| e)
        .collect();
    assert_eq!(epochs, vec![1, 2]);
}

#[test]
fn test_completed_run_does_not_rerun() {
    let dir = TempDir::new().unwrap();
    Trainer::new(session(tiny_spec(dir.path())))
        .unwrap()
        .train()
        .unwrap();

    let mut again = session(tiny_spec(dir.path()));
    again.resume().unwrap();
    let result = Trainer::new(again).unwrap().train().unwrap();
    assert_eq!(result.epochs_run, 0);
    assert!(result.final_loss.is_none());
    assert_eq!(read_loss_history(&log_path(dir.path())).unwrap().len(), 3);
}

/// Clips whose last local view is all NaN
struct Poisoned(SyntheticVideoDataset);

impl Dataset for Poisoned {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn get(&self, index: usize, epoch: usize) -> destilar::Result<Sample> {
        let mut sample = self.0.get(index, epoch)?;
        if let Some(view) = sample.views.last_mut() {
            view.fill(f32::NAN);
        }
        Ok(sample)
    }
}

#[test]
fn test_non_finite_loss_aborts_before_checkpoint() {
    let dir = TempDir::new().unwrap();
    let spec = tiny_spec(dir.path());
    let dataset = Arc::new(Poisoned(build_dataset(&spec).unwrap()));
    let session = TrainingSession::with_dataset(
        spec,
        &ArchRegistry::with_builtins(),
        Arc::new(SingleProcess),
        dataset,
    )
    .unwrap();
    let before = session.student().state_dict();
    let mut trainer = Trainer::new(session).unwrap();

    let err = trainer.train().unwrap_err();
    assert!(matches!(err, Error::NonFiniteLoss { epoch: 0, step: 0, .. }), "{err}");
    assert!(!checkpoint_path(dir.path()).exists());
    assert!(!log_path(dir.path()).exists());
    assert!(!dir.path().join("teacher.safetensors").exists());
    assert_eq!(trainer.session().student().state_dict(), before);
}

#[test]
fn test_two_token_mode_trains() {
    let dir = TempDir::new().unwrap();
    let mut spec = tiny_spec(dir.path());
    spec.model.mode = TrainingModeKind::TwoToken;
    spec.training.epochs = 1;
    spec.optimizer.warmup_epochs = 0;
    let result = Trainer::new(session(spec)).unwrap().train().unwrap();
    assert!(result.final_loss.unwrap().is_finite());
}

#[test]
fn test_two_stream_mode_checkpoints_motion_streams() {
    let dir = TempDir::new().unwrap();
    let mut spec = tiny_spec(dir.path());
    spec.model.mode = TrainingModeKind::TwoStream;
    spec.data.flow_frames = Some(3);
    spec.training.epochs = 1;
    spec.optimizer.warmup_epochs = 0;
    Trainer::new(session(spec)).unwrap().train().unwrap();

    let checkpoint = load_checkpoint(&checkpoint_path(dir.path())).unwrap();
    assert!(checkpoint.motion_student.is_some());
    assert!(checkpoint.motion_teacher.is_some());
    assert!(checkpoint.optimizer.motion.is_some());
    assert!(checkpoint.cross_loss.is_some());
    let log = std::fs::read_to_string(log_path(dir.path())).unwrap();
    assert!(log.contains("train_loss_motion"));
    assert!(log.contains("train_loss_cross"));
}

#[test]
fn test_fp16_scaler_state_is_checkpointed() {
    let dir = TempDir::new().unwrap();
    let mut spec = tiny_spec(dir.path());
    spec.optimizer.use_fp16 = true;
    spec.training.epochs = 1;
    spec.optimizer.warmup_epochs = 0;
    Trainer::new(session(spec)).unwrap().train().unwrap();
    let checkpoint = load_checkpoint(&checkpoint_path(dir.path())).unwrap();
    let scaler = checkpoint.fp16_scaler.unwrap();
    assert!(scaler.scale > 0.0 && scaler.scale <= 65536.0);
}

#[test]
fn test_fp16_steps_update_the_student() {
    let dir = TempDir::new().unwrap();
    let mut spec = tiny_spec(dir.path());
    spec.optimizer.use_fp16 = true;
    spec.optimizer.warmup_epochs = 0;
    let session = session(spec);
    let before = session.student().state_dict();
    let mut trainer = Trainer::new(session).unwrap();
    let result = trainer.train().unwrap();

    assert_eq!(result.skipped_steps, 0);
    assert_ne!(trainer.session().student().state_dict(), before);
    let checkpoint = load_checkpoint(&checkpoint_path(dir.path())).unwrap();
    assert_eq!(checkpoint.fp16_scaler.unwrap().scale, 65536.0);
}

#[test]
fn test_pretrained_checkpoint_initialises_student() {
    let dir = TempDir::new().unwrap();
    let source_dir = dir.path().join("source");
    let mut spec = tiny_spec(&source_dir);
    spec.training.epochs = 1;
    spec.optimizer.warmup_epochs = 0;
    let trained = {
        let mut trainer = Trainer::new(session(spec.clone())).unwrap();
        trainer.train().unwrap();
        trainer.into_session().teacher().state_dict()
    };

    let mut spec = tiny_spec(&dir.path().join("target"));
    spec.model.pretrained_weights = Some(checkpoint_path(&source_dir));
    spec.training.seed = 7;
    let target = session(spec);
    assert_eq!(target.student().state_dict(), trained);
    assert_eq!(target.teacher().state_dict(), trained);
}
