//! Training session: every piece of mutable training state in one place

use super::checkpoint::{checkpoint_path, load_checkpoint, Checkpoint, OptimizerStates};
use super::mode::{MotionStreams, TrainingMode};
use crate::config::{
    build_dataset, build_options, build_scaler, build_schedules, loss_config, masking_config,
    TrainSpec, TrainingModeKind, FLOW_CHANNELS,
};
use crate::data::{DataLoader, Dataset, DistributedSampler};
use crate::distill::{DinoLoss, LossVariant};
use crate::distributed::{broadcast_parameters, Collective};
use crate::error::{Error, Result};
use crate::io::load_pretrained;
use crate::masking::AttentionGuidedMasker;
use crate::nn::{ArchRegistry, Network};
use crate::optim::{build_optimizer, GradScaling, Optimizer, Schedules};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{info, warn};

/// Networks, optimizers, losses, schedules and data of one worker.
///
/// Built once at startup; the epoch counter is the only piece of progress
/// that lives outside the networks and is restored from checkpoints.
pub struct TrainingSession {
    pub(crate) spec: TrainSpec,
    pub(crate) student: Box<dyn Network>,
    pub(crate) teacher: Box<dyn Network>,
    pub(crate) student_names: Vec<String>,
    pub(crate) optimizer: Box<dyn Optimizer>,
    pub(crate) scaler: Box<dyn GradScaling>,
    pub(crate) dino_loss: DinoLoss,
    pub(crate) mode: TrainingMode,
    pub(crate) schedules: Schedules,
    pub(crate) loader: DataLoader,
    pub(crate) steps_per_epoch: usize,
    pub(crate) start_epoch: usize,
    pub(crate) collective: Arc<dyn Collective>,
    pub(crate) rng: StdRng,
}

/// Student/teacher pair with rank-0 weights on every worker
fn build_synced_pair(
    registry: &ArchRegistry,
    arch: &str,
    spec: &TrainSpec,
    num_streams: usize,
    in_chans: usize,
    collective: &dyn Collective,
) -> Result<(Box<dyn Network>, Box<dyn Network>)> {
    let (mut student, mut teacher) =
        registry.build_pair(arch, &build_options(spec, num_streams, in_chans))?;
    broadcast_parameters(collective, student.parameters_mut(), 0)?;
    teacher.load_state_dict(&student.state_dict(), true)?;
    Ok((student, teacher))
}

impl TrainingSession {
    /// Session over the configured synthetic clip source
    pub fn new(spec: TrainSpec, registry: &ArchRegistry, collective: Arc<dyn Collective>) -> Result<Self> {
        let dataset = Arc::new(build_dataset(&spec)?);
        Self::with_dataset(spec, registry, collective, dataset)
    }

    pub fn with_dataset(
        spec: TrainSpec,
        registry: &ArchRegistry,
        collective: Arc<dyn Collective>,
        dataset: Arc<dyn Dataset>,
    ) -> Result<Self> {
        let rank = collective.rank();
        let world_size = collective.world_size();
        if world_size != spec.training.world_size {
            warn!(
                configured = spec.training.world_size,
                actual = world_size,
                "world size differs from configuration"
            );
        }

        let num_streams = match spec.model.mode {
            TrainingModeKind::AttentionGuided => 1,
            TrainingModeKind::TwoToken | TrainingModeKind::TwoStream => 2,
        };
        let (mut student, mut teacher) = build_synced_pair(
            registry,
            &spec.model.arch,
            &spec,
            num_streams,
            3,
            collective.as_ref(),
        )?;
        if let Some(path) = &spec.model.pretrained_weights {
            let dict = load_pretrained(path)?;
            let report = student.load_state_dict(&dict, false)?;
            teacher.load_state_dict(&dict, false)?;
            info!(path = %path.display(), "pretrained weights: {report}");
        }
        info!(
            arch = student.arch(),
            parameters = student.num_parameters(),
            streams = num_streams,
            "student and teacher built"
        );
        if student.has_batch_norm() {
            warn!("batch statistics are not synchronized across workers");
        }

        let student_names = student.parameter_names().to_vec();
        let optimizer = build_optimizer(&spec.optimizer.name, &student_names, student.parameters())?;

        let num_crops = spec.num_crops();
        let (dino_loss, mode) = match spec.model.mode {
            TrainingModeKind::AttentionGuided => (
                DinoLoss::new(loss_config(&spec, LossVariant::Standard, num_crops))?,
                TrainingMode::AttentionGuided {
                    masker: AttentionGuidedMasker::new(masking_config(&spec))?,
                    global_crops: spec.crops.global_crops,
                },
            ),
            TrainingModeKind::TwoToken => (
                DinoLoss::new(loss_config(&spec, LossVariant::TwoToken, spec.crops.local_crops))?,
                TrainingMode::TwoToken {
                    global_crops: spec.crops.global_crops,
                },
            ),
            TrainingModeKind::TwoStream => {
                let (motion_student, motion_teacher) = build_synced_pair(
                    registry,
                    spec.motion_arch(),
                    &spec,
                    1,
                    FLOW_CHANNELS,
                    collective.as_ref(),
                )?;
                let motion_optimizer = build_optimizer(
                    &spec.optimizer.name,
                    motion_student.parameter_names(),
                    motion_student.parameters(),
                )?;
                let motion = MotionStreams {
                    student: motion_student,
                    teacher: motion_teacher,
                    optimizer: motion_optimizer,
                    motion_loss: DinoLoss::new(loss_config(&spec, LossVariant::Standard, 2))?,
                    cross_loss: DinoLoss::new(loss_config(&spec, LossVariant::Standard, num_crops))?,
                };
                (
                    DinoLoss::new(loss_config(&spec, LossVariant::Standard, num_crops))?,
                    TrainingMode::TwoStream(Box::new(motion)),
                )
            }
        };

        let sampler = DistributedSampler::new(dataset.len(), world_size, rank, true, spec.training.seed);
        let loader = DataLoader::new(
            dataset,
            sampler,
            spec.data.batch_size_per_gpu,
            true,
            spec.data.num_workers,
        )
        .with_prefetch_factor(spec.data.prefetch_factor);
        let steps_per_epoch = loader.len();
        if steps_per_epoch == 0 {
            return Err(Error::Data(format!(
                "no full batch of {} clips per worker in an epoch",
                spec.data.batch_size_per_gpu
            )));
        }
        info!(
            rank,
            steps_per_epoch,
            mode = mode.name(),
            "data loaded"
        );

        Ok(Self {
            schedules: build_schedules(&spec, steps_per_epoch),
            scaler: build_scaler(&spec),
            rng: StdRng::seed_from_u64(spec.training.seed.wrapping_add(rank as u64)),
            spec,
            student,
            teacher,
            student_names,
            optimizer,
            dino_loss,
            mode,
            loader,
            steps_per_epoch,
            start_epoch: 0,
            collective,
        })
    }

    pub fn spec(&self) -> &TrainSpec {
        &self.spec
    }

    pub fn student(&self) -> &dyn Network {
        self.student.as_ref()
    }

    pub fn teacher(&self) -> &dyn Network {
        self.teacher.as_ref()
    }

    pub fn dino_loss(&self) -> &DinoLoss {
        &self.dino_loss
    }

    pub fn mode(&self) -> &TrainingMode {
        &self.mode
    }

    pub fn schedules(&self) -> &Schedules {
        &self.schedules
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    /// First epoch the next call to `train` runs
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    /// Snapshot of the full training state; `next_epoch` is the epoch a
    /// resumed run starts at
    pub fn checkpoint(&self, next_epoch: usize) -> Checkpoint {
        let motion = self.mode.motion();
        Checkpoint {
            student: self.student.state_dict(),
            teacher: self.teacher.state_dict(),
            motion_student: motion.map(|m| m.student.state_dict()),
            motion_teacher: motion.map(|m| m.teacher.state_dict()),
            optimizer: OptimizerStates {
                student: self.optimizer.state(),
                motion: motion.map(|m| m.optimizer.state()),
            },
            epoch: next_epoch,
            args: self.spec.clone(),
            dino_loss: self.dino_loss.state(),
            motion_loss: motion.map(|m| m.motion_loss.state()),
            cross_loss: motion.map(|m| m.cross_loss.state()),
            fp16_scaler: self.scaler.state(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Load every saved component strictly and continue at the stored epoch
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.student.load_state_dict(&checkpoint.student, true)?;
        self.teacher.load_state_dict(&checkpoint.teacher, true)?;
        self.optimizer.load_state(&checkpoint.optimizer.student)?;
        self.dino_loss.load_state(&checkpoint.dino_loss)?;
        if let Some(motion) = self.mode.motion_mut() {
            let missing = |what: &str| Error::Checkpoint(format!("checkpoint has no {what}"));
            motion.student.load_state_dict(
                checkpoint.motion_student.as_ref().ok_or_else(|| missing("motion_student"))?,
                true,
            )?;
            motion.teacher.load_state_dict(
                checkpoint.motion_teacher.as_ref().ok_or_else(|| missing("motion_teacher"))?,
                true,
            )?;
            motion.optimizer.load_state(
                checkpoint.optimizer.motion.as_ref().ok_or_else(|| missing("motion optimizer"))?,
            )?;
            motion
                .motion_loss
                .load_state(checkpoint.motion_loss.as_ref().ok_or_else(|| missing("motion_loss"))?)?;
            motion
                .cross_loss
                .load_state(checkpoint.cross_loss.as_ref().ok_or_else(|| missing("cross_loss"))?)?;
        }
        match &checkpoint.fp16_scaler {
            Some(state) => self.scaler.load_state(state)?,
            None if self.scaler.state().is_some() => {
                warn!("checkpoint has no loss-scaler state, starting from the initial scale")
            }
            None => {}
        }
        if checkpoint.args != self.spec {
            warn!("checkpoint was written with a different configuration");
        }
        self.start_epoch = checkpoint.epoch;
        Ok(())
    }

    /// Restore from `<output_dir>/checkpoint.json` when it exists.
    ///
    /// Returns whether a checkpoint was found.
    pub fn resume(&mut self) -> Result<bool> {
        let path = checkpoint_path(&self.spec.training.output_dir);
        if !path.exists() {
            return Ok(false);
        }
        let checkpoint = load_checkpoint(&path)?;
        self.restore(&checkpoint)?;
        info!(
            path = %path.display(),
            epoch = self.start_epoch,
            "resumed from checkpoint"
        );
        Ok(true)
    }
}
