//! Training checkpoints
//!
//! The rolling `checkpoint.json` is replaced at every epoch end through a
//! temporary file and a rename, so a crash never leaves a truncated file.
//! Numbered snapshots are written once and never replaced.

use crate::config::TrainSpec;
use crate::distill::DinoLossState;
use crate::error::{Error, Result};
use crate::nn::StateDict;
use crate::optim::{OptimizerState, ScalerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Optimizer states of the trained networks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStates {
    pub student: OptimizerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion: Option<OptimizerState>,
}

/// Full training state at an epoch boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub student: StateDict,
    pub teacher: StateDict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_student: Option<StateDict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_teacher: Option<StateDict>,
    pub optimizer: OptimizerStates,
    /// Next epoch to run
    pub epoch: usize,
    pub args: TrainSpec,
    pub dino_loss: DinoLossState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_loss: Option<DinoLossState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_loss: Option<DinoLossState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp16_scaler: Option<ScalerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

pub fn checkpoint_path(output_dir: &Path) -> PathBuf {
    output_dir.join("checkpoint.json")
}

pub fn snapshot_path(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir.join(format!("checkpoint{epoch:04}.json"))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Checkpoint(format!("{} has no file name", path.display())))?;
    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Replace `path` with `checkpoint`
pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let bytes = serde_json::to_vec(checkpoint)?;
    write_atomic(path, &bytes)
}

/// Write a numbered snapshot unless one already exists.
///
/// Returns whether a file was written.
pub fn save_snapshot(path: &Path, checkpoint: &Checkpoint) -> Result<bool> {
    if path.exists() {
        tracing::warn!(path = %path.display(), "snapshot already exists, keeping it");
        return Ok(false);
    }
    save_checkpoint(path, checkpoint)?;
    Ok(true)
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let bytes = fs::read(path)
        .map_err(|e| Error::Checkpoint(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Checkpoint(format!("cannot parse {}: {e}", path.display())))
}
