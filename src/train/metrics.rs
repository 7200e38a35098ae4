//! Smoothed training meters and periodic progress logging

use crate::distributed::Collective;
use crate::error::Result;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

/// Window of the smoothed statistics
pub const DEFAULT_WINDOW: usize = 20;

/// Tracks a series of values, smoothed over a window and averaged over the run
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: u64,
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
        }
    }

    /// Record `value` observed `n` times
    pub fn update(&mut self, value: f64, n: u64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += n;
        self.total += value * n as f64;
    }

    /// Median over the window
    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        // lower median, as torch.median
        sorted[(sorted.len() - 1) / 2]
    }

    /// Mean over the window
    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Mean over every recorded value
    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Most recent value
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum count and total over workers; the window stays local
    pub fn synchronize(&mut self, collective: &dyn Collective) -> Result<()> {
        let mut buf = [self.count as f64, self.total];
        collective.all_reduce_sum_f64(&mut buf)?;
        self.count = buf[0].round() as u64;
        self.total = buf[1];
        Ok(())
    }
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6} ({:.6})", self.median(), self.global_avg())
    }
}

/// Named meters of one epoch
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    delimiter: String,
}

impl MetricLogger {
    pub fn new(delimiter: &str) -> Self {
        Self {
            meters: BTreeMap::new(),
            delimiter: delimiter.to_string(),
        }
    }

    pub fn update(&mut self, name: &str, value: f64) {
        self.meters.entry(name.to_string()).or_default().update(value, 1);
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// Sum every meter's count and total across workers.
    ///
    /// Meters are visited in name order, so every worker issues the same
    /// sequence of collectives.
    pub fn synchronize_between_processes(&mut self, collective: &dyn Collective) -> Result<()> {
        for meter in self.meters.values_mut() {
            meter.synchronize(collective)?;
        }
        Ok(())
    }

    /// Run-wide average of every meter
    pub fn global_averages(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .map(|(k, m)| (k.clone(), m.global_avg()))
            .collect()
    }

    /// Progress line for iteration `i` of `total`
    pub fn progress(&self, header: &str, i: usize, total: usize, elapsed: Duration) -> String {
        let done = i + 1;
        let per_iter = elapsed.as_secs_f64() / done as f64;
        let eta = Duration::from_secs_f64(per_iter * total.saturating_sub(done) as f64);
        let width = total.to_string().len();
        format!(
            "{header} [{i:>width$}/{total}]{d}eta: {eta}{d}{self}{d}time: {per_iter:.4}s",
            eta = format_duration(eta),
            d = self.delimiter,
        )
    }

    /// Log progress every `print_freq` iterations and at the last one
    pub fn log_every(&self, header: &str, i: usize, total: usize, print_freq: usize, start: Instant) {
        if i % print_freq.max(1) == 0 || i + 1 == total {
            info!("{}", self.progress(header, i, total, start.elapsed()));
        }
    }
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .meters
            .iter()
            .map(|(name, meter)| format!("{name}: {meter}"))
            .collect();
        write!(f, "{}", parts.join(&self.delimiter))
    }
}

/// `h:mm:ss`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{SingleProcess, ThreadGroup};
    use approx::assert_relative_eq;
    use std::thread;

    #[test]
    fn test_window_drops_oldest() {
        let mut v = SmoothedValue::new(3);
        for x in [1.0, 2.0, 3.0, 10.0] {
            v.update(x, 1);
        }
        assert_relative_eq!(v.avg(), 5.0);
        assert_relative_eq!(v.median(), 3.0);
        assert_relative_eq!(v.global_avg(), 4.0);
        assert_relative_eq!(v.max(), 10.0);
        assert_relative_eq!(v.value(), 10.0);
    }

    #[test]
    fn test_empty_meter_is_zero() {
        let v = SmoothedValue::default();
        assert_eq!(v.median(), 0.0);
        assert_eq!(v.global_avg(), 0.0);
    }

    #[test]
    fn test_logger_display_is_sorted() {
        let mut logger = MetricLogger::default();
        logger.update("wd", 0.04);
        logger.update("loss", 1.5);
        let line = logger.to_string();
        assert!(line.starts_with("loss: 1.500000 (1.500000)"));
        assert!(line.contains("  wd: "));
    }

    #[test]
    fn test_single_process_sync_is_identity() {
        let mut logger = MetricLogger::default();
        logger.update("loss", 2.0);
        logger.update("loss", 4.0);
        logger.synchronize_between_processes(&SingleProcess).unwrap();
        assert_relative_eq!(logger.global_averages()["loss"], 3.0);
    }

    #[test]
    fn test_sync_averages_over_workers() {
        let handles = ThreadGroup::create(2).unwrap();
        let averages: Vec<f64> = handles
            .into_iter()
            .enumerate()
            .map(|(rank, group)| {
                thread::spawn(move || {
                    let mut logger = MetricLogger::default();
                    // rank 0 sees 1.0 once, rank 1 sees 4.0 twice
                    for _ in 0..=rank {
                        logger.update("loss", if rank == 0 { 1.0 } else { 4.0 });
                    }
                    logger.synchronize_between_processes(&group).unwrap();
                    logger.global_averages()["loss"]
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        for avg in averages {
            assert_relative_eq!(avg, 3.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_sync_keeps_long_epoch_totals_exact() {
        let handles = ThreadGroup::create(2).unwrap();
        let totals: Vec<(u64, f64)> = handles
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let mut meter = SmoothedValue::default();
                    // f32 holds 16_777_216 exactly but not one more
                    meter.update(1.0, 16_777_217);
                    meter.update(0.1, 1);
                    meter.synchronize(&group).unwrap();
                    (meter.count(), meter.global_avg() * meter.count() as f64)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(totals[0].0, 2 * 16_777_218);
        assert_relative_eq!(totals[0].1, 2.0 * (16_777_217.0 + 0.1), max_relative = 1e-15);
        assert_eq!(totals[0], totals[1]);
    }

    #[test]
    fn test_progress_line() {
        let mut logger = MetricLogger::default();
        logger.update("lr", 0.001);
        let line = logger.progress("Epoch: [0/10]", 4, 10, Duration::from_secs(5));
        assert!(line.starts_with("Epoch: [0/10] [ 4/10]"));
        assert!(line.contains("eta: 0:00:05"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }
}
