//! Destilar CLI
//!
//! Single training entry point: the YAML configuration is merged with the
//! command-line overrides, validated and run on `world_size` workers.
//!
//! # Usage
//!
//! ```bash
//! # Train from config
//! destilar --cfg configs/vit_small.yaml
//!
//! # Train with overrides
//! destilar --cfg configs/vit_small.yaml --epochs 30 --lr 0.0002 --world-size 4
//!
//! # Print the effective configuration
//! destilar --cfg configs/vit_small.yaml --opts masking.ratio=0.8 --dry-run
//! ```

use destilar::config::{config_lines, load_spec, parse_args, Cli, TrainSpec};
use destilar::distributed::{Collective, SingleProcess, ThreadGroup};
use destilar::nn::ArchRegistry;
use destilar::train::{format_duration, Trainer, TrainingSession};
use destilar::{Error, Result, TrainResult};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = match parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            // help and version also end up here
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = std::env::var("DESTILAR_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let registry = ArchRegistry::with_builtins();
    let spec = load_spec(cli, &registry.names())?;
    for line in config_lines(&spec)? {
        info!("{line}");
    }
    if cli.dry_run {
        info!("Dry run - config validated successfully");
        return Ok(());
    }

    let start = Instant::now();
    let results = if spec.training.world_size == 1 {
        vec![train_worker(spec, &registry, Arc::new(SingleProcess))?]
    } else {
        run_thread_group(&spec)?
    };
    if let Some(result) = results.first() {
        info!(
            epochs = result.epochs_run,
            skipped_steps = result.skipped_steps,
            final_loss = ?result.final_loss,
            "training complete"
        );
    }
    info!("Total time {}", format_duration(start.elapsed()));
    Ok(())
}

fn train_worker(spec: TrainSpec, registry: &ArchRegistry, collective: Arc<dyn Collective>) -> Result<TrainResult> {
    let mut session = TrainingSession::new(spec, registry, collective)?;
    session.resume()?;
    Trainer::new(session)?.train()
}

/// One thread per rank; a failing rank aborts the group
fn run_thread_group(spec: &TrainSpec) -> Result<Vec<TrainResult>> {
    let handles = ThreadGroup::create(spec.training.world_size)?;
    let workers: Vec<_> = handles
        .into_iter()
        .map(|group| {
            let spec = spec.clone();
            thread::Builder::new()
                .name(format!("rank-{}", group.rank()))
                .spawn(move || {
                    let registry = ArchRegistry::with_builtins();
                    let result = train_worker(spec, &registry, Arc::new(group.clone()));
                    if let Err(e) = &result {
                        group.abort(&e.to_string());
                    }
                    result
                })
        })
        .collect::<std::io::Result<_>>()?;

    let mut results = Vec::with_capacity(workers.len());
    let mut errors = Vec::new();
    for worker in workers {
        match worker.join() {
            Ok(Ok(result)) => results.push(result),
            Ok(Err(e)) => errors.push(e),
            Err(_) => errors.push(Error::Distributed("worker thread panicked".to_string())),
        }
    }
    // peers released by an abort report a collective error; the cause is elsewhere
    let cause = errors
        .iter()
        .position(|e| !matches!(e, Error::Distributed(_)))
        .unwrap_or(0);
    if errors.is_empty() {
        Ok(results)
    } else {
        Err(errors.swap_remove(cause))
    }
}
