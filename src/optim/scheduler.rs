//! Precomputed per-iteration and per-epoch schedules

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Immutable sequence of scheduled values, indexed by global iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule(Vec<f64>);

impl Schedule {
    pub fn from_values(values: Vec<f64>) -> Self {
        Self(values)
    }

    /// Value at `step`; past the end the last value holds
    pub fn at(&self, step: usize) -> f64 {
        match self.0.get(step) {
            Some(v) => *v,
            None => self.0.last().copied().unwrap_or(0.0),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive (`[start]` for n = 1)
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Linear warmup followed by cosine decay
///
/// ```text
/// warmup:  linspace(start_warmup_value, base_value, warmup_epochs * steps)
/// decay:   final + 0.5 (base - final) (1 + cos(π i / len(decay)))
/// ```
///
/// The result has exactly `epochs * steps_per_epoch` entries.
pub fn cosine_scheduler(
    base_value: f64,
    final_value: f64,
    epochs: usize,
    steps_per_epoch: usize,
    warmup_epochs: usize,
    start_warmup_value: f64,
) -> Schedule {
    let total = epochs * steps_per_epoch;
    let warmup_iters = (warmup_epochs * steps_per_epoch).min(total);
    let mut values = linspace(start_warmup_value, base_value, warmup_iters);

    let decay_iters = total - warmup_iters;
    values.extend((0..decay_iters).map(|i| {
        final_value
            + 0.5 * (base_value - final_value) * (1.0 + (PI * i as f64 / decay_iters as f64).cos())
    }));
    Schedule(values)
}

/// Per-epoch teacher temperature: linear warmup, then a constant plateau
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSchedule(Schedule);

impl TemperatureSchedule {
    pub fn new(warmup_value: f64, final_value: f64, warmup_epochs: usize, epochs: usize) -> Self {
        let warmup_epochs = warmup_epochs.min(epochs);
        let mut values = linspace(warmup_value, final_value, warmup_epochs);
        values.extend(std::iter::repeat(final_value).take(epochs - warmup_epochs));
        Self(Schedule(values))
    }

    /// Temperature at `epoch`, clamped to the plateau
    pub fn at(&self, epoch: usize) -> f64 {
        self.0.at(epoch)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Learning-rate, weight-decay and teacher-momentum schedules of one run
#[derive(Debug, Clone, PartialEq)]
pub struct Schedules {
    pub lr: Schedule,
    pub wd: Schedule,
    pub momentum: Schedule,
}

/// Scalars in effect at one iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepValues {
    pub lr: f64,
    pub wd: f64,
    pub momentum: f64,
}

impl Schedules {
    pub fn at(&self, step: usize) -> StepValues {
        StepValues {
            lr: self.lr.at(step),
            wd: self.wd.at(step),
            momentum: self.momentum.at(step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(0.04, 0.07, 4);
        assert_relative_eq!(v[0], 0.04);
        assert_relative_eq!(v[3], 0.07);
        assert_eq!(linspace(1.0, 2.0, 1), vec![1.0]);
        assert!(linspace(1.0, 2.0, 0).is_empty());
    }

    #[test]
    fn test_pure_cosine_without_warmup() {
        let s = cosine_scheduler(1.0, 0.0, 2, 5, 0, 0.0);
        assert_eq!(s.len(), 10);
        assert_relative_eq!(s.at(0), 1.0);
        assert_relative_eq!(s.at(5), 0.5, epsilon = 1e-12);
        assert!(s.at(9) > 0.0);
    }

    #[test]
    fn test_warmup_reaches_base_then_decays() {
        let s = cosine_scheduler(0.5, 1e-6, 10, 4, 2, 0.0);
        assert_eq!(s.len(), 40);
        assert_relative_eq!(s.at(0), 0.0);
        // the last warmup entry and the first decay entry both equal base
        assert_relative_eq!(s.at(7), 0.5);
        assert_relative_eq!(s.at(8), 0.5);
        assert!(s.at(39) < 0.01);
    }

    #[test]
    fn test_momentum_schedule_rises_to_one() {
        let s = cosine_scheduler(0.996, 1.0, 3, 3, 0, 0.0);
        assert_relative_eq!(s.at(0), 0.996);
        assert!(s.values().windows(2).all(|w| w[1] >= w[0]));
        assert_relative_eq!(s.at(100), s.at(8));
    }

    #[test]
    fn test_temperature_warmup_then_plateau() {
        let t = TemperatureSchedule::new(0.04, 0.07, 3, 5);
        assert_eq!(t.len(), 5);
        assert_relative_eq!(t.at(0), 0.04);
        assert_relative_eq!(t.at(2), 0.07);
        assert_relative_eq!(t.at(4), 0.07);
        assert_relative_eq!(t.at(50), 0.07);
    }
}
