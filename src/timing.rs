//! Per-step latency accounting.
//!
//! All durations come from the monotonic clock and are reported in
//! milliseconds as `f64`:
//!
//! - `total_capture_ms = end - start`
//! - `system_overhead_ms = total_capture_ms - integration_time_ms` (negative
//!   values are kept; the driver may buffer a frame exposed before the trigger)
//! - `temporal_resolution_ms = total_capture_ms + inter_step_delay_ms`
//!
//! Aggregates are computed once at the end of a run. A run with no recorded
//! steps has no means at all rather than a division by zero.

use crate::report::StepRecord;
use std::time::{Duration, Instant};

/// Milliseconds in a duration, keeping sub-millisecond precision.
pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Timing of one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepTiming {
    pub total_capture_ms: f64,
    pub system_overhead_ms: f64,
    pub temporal_resolution_ms: f64,
}

impl StepTiming {
    /// Derive the step columns from an already measured total.
    pub fn from_total(total_capture_ms: f64, integration_ms: u64, delay_ms: u64) -> Self {
        Self {
            total_capture_ms,
            system_overhead_ms: total_capture_ms - integration_ms as f64,
            temporal_resolution_ms: total_capture_ms + delay_ms as f64,
        }
    }

    /// Timing of a capture that ran from `start` to `end`.
    pub fn measure(start: Instant, end: Instant, integration_ms: u64, delay_ms: u64) -> Self {
        let total = duration_ms(end.saturating_duration_since(start));
        Self::from_total(total, integration_ms, delay_ms)
    }
}

/// Column means over the recorded steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMeans {
    pub system_overhead_ms: f64,
    pub total_capture_ms: f64,
    pub temporal_resolution_ms: f64,
    /// Mean over the steps that carry a frame statistic
    pub mean_intensity: Option<f64>,
}

/// Aggregate of a whole run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// `None` when no step was recorded
    pub means: Option<StepMeans>,
    pub steps: usize,
    /// Wall time of the whole run
    pub total_run_ms: f64,
}

impl RunSummary {
    pub fn has_data(&self) -> bool {
        self.means.is_some()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Summarize the recorded steps of a run that lasted `total_run`.
pub fn summarize(records: &[StepRecord], total_run: Duration) -> RunSummary {
    let means = mean(records.iter().map(|r| r.system_overhead_ms)).map(|system| StepMeans {
        system_overhead_ms: system,
        total_capture_ms: mean(records.iter().map(|r| r.total_capture_ms)).unwrap_or_default(),
        temporal_resolution_ms: mean(records.iter().map(|r| r.temporal_resolution_ms))
            .unwrap_or_default(),
        mean_intensity: mean(records.iter().filter_map(|r| r.mean_intensity)),
    });

    RunSummary {
        means,
        steps: records.len(),
        total_run_ms: duration_ms(total_run),
    }
}

/// Wall-clock stopwatch for the whole run.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    started: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
