//! Synchronous collectives

use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};

/// Collective communication between the workers of one run.
///
/// Every worker must call each collective in the same order; a worker that
/// never arrives blocks all others.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Elementwise sum over all workers, result written back to `buffer`
    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<()>;

    /// Double-precision sum, for run-wide statistics
    fn all_reduce_sum_f64(&self, buffer: &mut [f64]) -> Result<()>;

    /// Overwrite `buffer` with the contents held by `root`
    fn broadcast(&self, buffer: &mut [f32], root: usize) -> Result<()>;

    fn barrier(&self) -> Result<()> {
        let mut token = [0.0f32];
        self.all_reduce_sum(&mut token)
    }
}

/// World of one: every collective is the identity
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buffer: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn all_reduce_sum_f64(&self, _buffer: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _buffer: &mut [f32], root: usize) -> Result<()> {
        if root != 0 {
            return Err(Error::Distributed(format!("broadcast root {root} out of range for world 1")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Sum,
    Broadcast(usize),
}

#[derive(Debug, Default)]
struct GroupInner {
    arrived: usize,
    /// Result computed, workers still copying it out
    draining: bool,
    generation: u64,
    op: Option<Op>,
    /// Contributions of the current round, indexed by rank
    slots: Vec<Option<Vec<f64>>>,
    result: Vec<f64>,
    error: Option<String>,
}

#[derive(Debug)]
struct GroupState {
    world_size: usize,
    inner: Mutex<GroupInner>,
    condvar: Condvar,
}

/// In-process worker group for thread-per-rank training.
///
/// Contributions are widened to f64 and summed in rank order, so every
/// worker receives bit-identical results.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    group: Arc<GroupState>,
    rank: usize,
}

impl ThreadGroup {
    /// Create handles for all ranks of a new group
    pub fn create(world_size: usize) -> Result<Vec<ThreadGroup>> {
        if world_size == 0 {
            return Err(Error::Distributed("world size must be positive, got 0".to_string()));
        }
        let group = Arc::new(GroupState {
            world_size,
            inner: Mutex::new(GroupInner {
                slots: vec![None; world_size],
                ..GroupInner::default()
            }),
            condvar: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| ThreadGroup {
                group: Arc::clone(&group),
                rank,
            })
            .collect())
    }

    fn collective_f32(&self, buffer: &mut [f32], op: Op) -> Result<()> {
        let mut wide: Vec<f64> = buffer.iter().map(|&v| f64::from(v)).collect();
        self.collective(&mut wide, op)?;
        buffer
            .iter_mut()
            .zip(&wide)
            .for_each(|(b, w)| *b = *w as f32);
        Ok(())
    }

    fn collective(&self, buffer: &mut [f64], op: Op) -> Result<()> {
        let state = &self.group;
        let mut inner = state
            .inner
            .lock()
            .map_err(|_| Error::Distributed("collective lock poisoned".to_string()))?;

        if let Some(err) = inner.error.clone() {
            return Err(Error::Distributed(err));
        }
        while inner.draining {
            inner = state
                .condvar
                .wait(inner)
                .map_err(|_| Error::Distributed("collective lock poisoned".to_string()))?;
        }

        match inner.op {
            None => inner.op = Some(op),
            Some(current) if current != op => {
                let msg = format!("rank {} issued {op:?} while the group runs {current:?}", self.rank);
                inner.error = Some(msg.clone());
                state.condvar.notify_all();
                return Err(Error::Distributed(msg));
            }
            Some(_) => {}
        }
        if let Some(len) = inner.slots.iter().flatten().map(Vec::len).next() {
            if len != buffer.len() {
                let msg = format!("buffer length mismatch: expected {len}, got {}", buffer.len());
                inner.error = Some(msg.clone());
                state.condvar.notify_all();
                return Err(Error::Distributed(msg));
            }
        }

        inner.slots[self.rank] = Some(buffer.to_vec());
        inner.arrived += 1;
        let generation = inner.generation;

        if inner.arrived == state.world_size {
            let result = match op {
                Op::Sum => {
                    let mut acc = vec![0.0f64; buffer.len()];
                    for contribution in inner.slots.iter().flatten() {
                        for (a, v) in acc.iter_mut().zip(contribution) {
                            *a += *v;
                        }
                    }
                    acc
                }
                Op::Broadcast(root) => inner
                    .slots
                    .get(root)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| Error::Distributed(format!("broadcast root {root} out of range")))?,
            };
            inner.result = result;
            inner.draining = true;
            inner.generation = inner.generation.wrapping_add(1);
            state.condvar.notify_all();
        } else {
            while inner.generation == generation && inner.error.is_none() {
                inner = state
                    .condvar
                    .wait(inner)
                    .map_err(|_| Error::Distributed("collective lock poisoned".to_string()))?;
            }
            if let Some(err) = inner.error.clone() {
                return Err(Error::Distributed(err));
            }
        }

        buffer.copy_from_slice(&inner.result);
        inner.arrived -= 1;
        if inner.arrived == 0 {
            inner.draining = false;
            inner.op = None;
            inner.slots.iter_mut().for_each(|s| *s = None);
            state.condvar.notify_all();
        }
        Ok(())
    }
}

impl ThreadGroup {
    /// Fail every pending and future collective of the group.
    ///
    /// A worker that stops early calls this so its peers return an error
    /// instead of waiting for it forever.
    pub fn abort(&self, reason: &str) {
        if let Ok(mut inner) = self.group.inner.lock() {
            inner
                .error
                .get_or_insert_with(|| format!("rank {} aborted: {reason}", self.rank));
            self.group.condvar.notify_all();
        }
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<()> {
        self.collective_f32(buffer, Op::Sum)
    }

    fn all_reduce_sum_f64(&self, buffer: &mut [f64]) -> Result<()> {
        self.collective(buffer, Op::Sum)
    }

    fn broadcast(&self, buffer: &mut [f32], root: usize) -> Result<()> {
        if root >= self.group.world_size {
            return Err(Error::Distributed(format!(
                "broadcast root {root} out of range for world {}",
                self.group.world_size
            )));
        }
        self.collective_f32(buffer, Op::Broadcast(root))
    }
}
