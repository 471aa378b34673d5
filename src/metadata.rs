//! Run metadata sidecar.
//!
//! Every run writes `run_metadata.json` next to its images and timing report. It records
//! what the report alone cannot tell: whether the run finished, why it stopped, how many
//! grabs failed along the way, how many files the sink actually wrote, and the exact
//! configuration the run used.
//!
//! ## `RunMetadata` Struct
//!
//! - **`software_version`**: version of this crate, captured at build time.
//! - **`run_label`**: the run label shared by the directory and report names.
//! - **`status`**: `completed`, `interrupted` or `aborted` (with the reason).
//! - **`steps_completed`** / **`steps_configured`**: a row count below the configured
//!   total marks an incomplete run.
//! - **`config`** / **`timeouts`**: snapshot of the run parameters.
//!
//! A [`RunMetadataBuilder`] assembles the record once the run has been finalized.

use crate::acquisition::RunStatus;
use crate::config::{RunConfiguration, TimeoutSettings};
use crate::error::AppResult;
use crate::sink::SinkStats;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Everything recorded about one run besides the per-step table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub software_version: String,
    pub run_label: String,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    pub status: RunStatus,
    pub steps_completed: u32,
    pub steps_configured: u32,
    pub failed_grabs: u32,
    pub images_written: usize,
    pub writes_failed: usize,
    pub sensor: String,
    /// Integration time the sensor reported after configuration
    pub applied_integration_ms: Option<f64>,
    pub spectrometer: bool,
    pub total_run_ms: f64,
    pub config: RunConfiguration,
    pub timeouts: TimeoutSettings,
    /// Errors raised while releasing resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            run_label: String::new(),
            started_at: None,
            finished_at: None,
            status: RunStatus::Completed,
            steps_completed: 0,
            steps_configured: 0,
            failed_grabs: 0,
            images_written: 0,
            writes_failed: 0,
            sensor: String::new(),
            applied_integration_ms: None,
            spectrometer: false,
            total_run_ms: 0.0,
            config: RunConfiguration::default(),
            timeouts: TimeoutSettings::default(),
            cleanup_errors: Vec::new(),
        }
    }
}

impl RunMetadata {
    /// True when every configured step was recorded and the run ended normally.
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed && self.steps_completed == self.steps_configured
    }

    /// Write the sidecar as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> AppResult<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        debug!(path = %path.display(), "Run metadata written");
        Ok(())
    }

    pub fn read_json(path: &Path) -> AppResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// A builder for constructing `RunMetadata` instances.
#[derive(Default)]
pub struct RunMetadataBuilder {
    inner: RunMetadata,
}

impl RunMetadataBuilder {
    pub fn new(config: &RunConfiguration, timeouts: &TimeoutSettings) -> Self {
        Self {
            inner: RunMetadata {
                steps_configured: config.total_steps,
                config: config.clone(),
                timeouts: timeouts.clone(),
                ..RunMetadata::default()
            },
        }
    }

    pub fn run_label(mut self, label: &str) -> Self {
        self.inner.run_label = label.to_string();
        self
    }

    pub fn window(mut self, started_at: DateTime<Local>, finished_at: DateTime<Local>) -> Self {
        self.inner.started_at = Some(started_at);
        self.inner.finished_at = Some(finished_at);
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.inner.status = status;
        self
    }

    pub fn steps_completed(mut self, steps: u32) -> Self {
        self.inner.steps_completed = steps;
        self
    }

    pub fn failed_grabs(mut self, failed: u32) -> Self {
        self.inner.failed_grabs = failed;
        self
    }

    pub fn sink(mut self, stats: SinkStats) -> Self {
        self.inner.images_written = stats.written;
        self.inner.writes_failed = stats.failed;
        self
    }

    pub fn sensor(mut self, name: &str, applied_integration_ms: Option<f64>) -> Self {
        self.inner.sensor = name.to_string();
        self.inner.applied_integration_ms = applied_integration_ms;
        self
    }

    pub fn spectrometer(mut self, present: bool) -> Self {
        self.inner.spectrometer = present;
        self
    }

    pub fn total_run_ms(mut self, total_run_ms: f64) -> Self {
        self.inner.total_run_ms = total_run_ms;
        self
    }

    pub fn cleanup_error(mut self, error: &str) -> Self {
        self.inner.cleanup_errors.push(error.to_string());
        self
    }

    pub fn build(self) -> RunMetadata {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_completion() {
        let config = RunConfiguration {
            total_steps: 3,
            ..RunConfiguration::default()
        };
        let metadata = RunMetadataBuilder::new(&config, &TimeoutSettings::default())
            .run_label("20250528_delay5ms_int32ms")
            .status(RunStatus::Completed)
            .steps_completed(3)
            .sink(SinkStats {
                written: 3,
                failed: 0,
            })
            .build();
        assert!(metadata.is_complete());
        assert_eq!(metadata.software_version, env!("CARGO_PKG_VERSION"));

        let short = RunMetadataBuilder::new(&config, &TimeoutSettings::default())
            .status(RunStatus::Interrupted)
            .steps_completed(2)
            .build();
        assert!(!short.is_complete());
    }

    #[test]
    fn test_json_round_trip_keeps_abort_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_metadata.json");
        let metadata = RunMetadataBuilder::new(
            &RunConfiguration::default(),
            &TimeoutSettings::default(),
        )
        .status(RunStatus::Aborted("grab timed out".to_string()))
        .steps_completed(2)
        .failed_grabs(2)
        .cleanup_error("stop stream failed")
        .build();

        metadata.write_json(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"aborted\""));
        assert!(text.contains("grab timed out"));

        let loaded = RunMetadata::read_json(&path).unwrap();
        assert_eq!(loaded, metadata);
    }
}
