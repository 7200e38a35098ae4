//! Epoch loop over a [`TrainingSession`]

use super::checkpoint::{checkpoint_path, save_checkpoint, save_snapshot, snapshot_path};
use super::ema::ema_update;
use super::log::{append_epoch_stats, log_path, read_loss_history};
use super::metrics::{format_duration, MetricLogger};
use super::mode::{scale_seeds, IterationContext};
use super::plot::{plot_loss, plot_path};
use super::session::TrainingSession;
use crate::data::Batch;
use crate::error::{Error, Result};
use crate::io::export_network;
use crate::optim::{cancel_gradients_last_layer, clip_gradients};
use crate::distributed::sync_gradients;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of a training run
#[derive(Debug, Clone)]
pub struct TrainResult {
    /// First epoch run by this call
    pub start_epoch: usize,
    /// Epochs completed by this call
    pub epochs_run: usize,
    /// Averaged loss of the last epoch, `None` when nothing ran
    pub final_loss: Option<f64>,
    /// Optimizer steps skipped by the loss scaler
    pub skipped_steps: usize,
    pub elapsed: Duration,
}

/// Drives a session through its remaining epochs.
///
/// The main worker writes `config.json`, the rolling checkpoint, numbered
/// snapshots, `log.txt`, loss plots and the final teacher export.
pub struct Trainer {
    session: TrainingSession,
    /// `(epoch, averaged loss)` of every finished epoch
    history: Vec<(usize, f64)>,
    skipped_steps: usize,
}

impl Trainer {
    pub fn new(session: TrainingSession) -> Result<Self> {
        let history = if session.collective.is_main_process() {
            read_loss_history(&log_path(&session.spec.training.output_dir))?
                .into_iter()
                .filter(|(epoch, _)| *epoch < session.start_epoch)
                .collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            session,
            history,
            skipped_steps: 0,
        })
    }

    pub fn session(&self) -> &TrainingSession {
        &self.session
    }

    pub fn into_session(self) -> TrainingSession {
        self.session
    }

    pub fn history(&self) -> &[(usize, f64)] {
        &self.history
    }

    fn output_dir(&self) -> PathBuf {
        self.session.spec.training.output_dir.clone()
    }

    /// Run every epoch from the session's start epoch to the configured end
    pub fn train(&mut self) -> Result<TrainResult> {
        let start = Instant::now();
        let start_epoch = self.session.start_epoch;
        let epochs = self.session.spec.training.epochs;
        let main = self.session.collective.is_main_process();
        let out = self.output_dir();
        if main {
            std::fs::create_dir_all(&out)?;
            std::fs::write(out.join("config.json"), serde_json::to_vec_pretty(&self.session.spec)?)?;
        }

        info!(start_epoch, epochs, "starting training");
        let mut final_loss = None;
        for epoch in start_epoch..epochs {
            let stats = self.train_one_epoch(epoch)?;
            final_loss = stats.get("loss").copied();
            if main {
                self.save_epoch(epoch, &stats)?;
            }
        }

        if main && start_epoch < epochs {
            let path = out.join("teacher.safetensors");
            export_network(&path, self.session.teacher.as_ref(), "teacher")?;
            info!(path = %path.display(), "teacher exported");
        }
        let elapsed = start.elapsed();
        info!("Training time {}", format_duration(elapsed));
        Ok(TrainResult {
            start_epoch,
            epochs_run: epochs.saturating_sub(start_epoch),
            final_loss,
            skipped_steps: self.skipped_steps,
            elapsed,
        })
    }

    /// One pass over the loader; returns the worker-averaged metrics
    pub fn train_one_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        let s = &mut self.session;
        let header = format!("Epoch: [{}/{}]", epoch, s.spec.training.epochs);
        let total = s.steps_per_epoch;
        let log_every = s.spec.training.log_every.max(1);
        s.loader.set_epoch(epoch);
        let batches = s.loader.iter();

        let mut metrics = MetricLogger::default();
        let start = Instant::now();
        for (it, batch) in batches.enumerate().take(total) {
            self.train_step(&batch?, epoch, it, &mut metrics)?;
            metrics.log_every(&header, it, total, log_every, start);
        }

        let s = &mut self.session;
        metrics.synchronize_between_processes(s.collective.as_ref())?;
        info!("Averaged stats: {metrics}");
        Ok(metrics.global_averages())
    }

    /// Forward, backward, step and EMA for one batch
    pub fn train_step(
        &mut self,
        batch: &Batch,
        epoch: usize,
        it: usize,
        metrics: &mut MetricLogger,
    ) -> Result<()> {
        let s = &mut self.session;
        let step = epoch * s.steps_per_epoch + it;
        let values = s.schedules.at(step);
        s.optimizer.set_lr(values.lr as f32);
        s.optimizer.set_weight_decay(values.wd as f32);
        if let Some(motion) = s.mode.motion_mut() {
            motion.optimizer.set_lr(values.lr as f32);
            motion.optimizer.set_weight_decay(values.wd as f32);
        }

        let out = s.mode.compute_iteration(
            batch,
            IterationContext {
                student: s.student.as_mut(),
                teacher: s.teacher.as_mut(),
                dino_loss: &mut s.dino_loss,
                collective: s.collective.as_ref(),
                rng: &mut s.rng,
                epoch,
            },
        )?;
        if !out.loss.is_finite() {
            s.student.clear_tape();
            if let Some(motion) = s.mode.motion_mut() {
                motion.student.clear_tape();
            }
            return Err(Error::NonFiniteLoss {
                value: out.loss,
                epoch,
                step,
            });
        }

        let scale = s.scaler.scale();
        let clip = s.spec.optimizer.clip_grad;
        let freeze = s.spec.optimizer.freeze_last_layer;
        let coll = s.collective.as_ref();

        s.student.zero_grad();
        s.student.backward(&scale_seeds(out.student_seeds, scale))?;
        sync_gradients(coll, s.student.parameters_mut())?;
        s.scaler.unscale(s.student.parameters_mut());
        if clip > 0.0 {
            clip_gradients(s.student.parameters_mut(), clip);
        }
        cancel_gradients_last_layer(epoch, &s.student_names, s.student.parameters_mut(), freeze);

        if let Some(motion) = s.mode.motion_mut() {
            motion.student.zero_grad();
            motion.student.backward(&scale_seeds(out.motion_seeds, scale))?;
            sync_gradients(coll, motion.student.parameters_mut())?;
            s.scaler.unscale(motion.student.parameters_mut());
            if clip > 0.0 {
                clip_gradients(motion.student.parameters_mut(), clip);
            }
            let names = motion.student.parameter_names().to_vec();
            cancel_gradients_last_layer(epoch, &names, motion.student.parameters_mut(), freeze);
        }

        let mut stepped = s.scaler.step(s.optimizer.as_mut(), s.student.parameters_mut());
        if let Some(motion) = s.mode.motion_mut() {
            stepped &= s.scaler.step(motion.optimizer.as_mut(), motion.student.parameters_mut());
        }
        s.scaler.update();
        if !stepped {
            self.skipped_steps += 1;
            debug!(epoch, step, scale, "gradient overflow, optimizer step skipped");
        }

        let s = &mut self.session;
        ema_update(s.teacher.as_mut(), s.student.as_ref(), values.momentum)?;
        if let Some(motion) = s.mode.motion_mut() {
            ema_update(motion.teacher.as_mut(), motion.student.as_ref(), values.momentum)?;
        }

        metrics.update("loss", f64::from(out.loss));
        for (name, value) in &out.components {
            metrics.update(name, f64::from(*value));
        }
        metrics.update("lr", values.lr);
        metrics.update("wd", values.wd);
        Ok(())
    }

    fn save_epoch(&mut self, epoch: usize, stats: &BTreeMap<String, f64>) -> Result<()> {
        let out = self.output_dir();
        let checkpoint = self.session.checkpoint(epoch + 1);
        save_checkpoint(&checkpoint_path(&out), &checkpoint)?;
        let on_cadence = epoch % self.session.spec.training.saveckp_freq.max(1) == 0;
        if on_cadence {
            save_snapshot(&snapshot_path(&out, epoch), &checkpoint)?;
        }
        append_epoch_stats(&log_path(&out), epoch, stats)?;

        if let Some(&loss) = stats.get("loss") {
            self.history.push((epoch, loss));
        }
        if on_cadence {
            // a missing plot never stops training
            if let Err(e) = plot_loss(&plot_path(&out, epoch), &self.history) {
                warn!(epoch, "loss plot failed: {e}");
            }
        }
        Ok(())
    }
}
