//! Configuration for an acquisition run, loaded with Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults ([`Settings::default`])
//! 2. a TOML file (`sync_capture.toml` unless a path is given)
//! 3. environment variables prefixed with `SYNC_CAPTURE_`, using `__` as the
//!    section separator
//! 4. command-line overrides applied by the binary
//!
//! ```text
//! SYNC_CAPTURE_RUN__TOTAL_STEPS=36
//! SYNC_CAPTURE_RUN__INTEGRATION_TIME_MS=64
//! SYNC_CAPTURE_CONTROLLER__PORT=/dev/ttyACM0
//! SYNC_CAPTURE_APPLICATION__LOG_LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```toml
//! [run]
//! integration_time_ms = 32
//! inter_step_delay_ms = 5
//! post_final_wait_ms = 500
//! total_steps = 20
//! stacking_count = 1
//! output_directory = "."
//!
//! [controller]
//! port = "/dev/ttyACM0"
//! baud_rate = 9600
//!
//! [timeouts]
//! link_read = "1s"
//! home = "60s"
//! grab = "5s"
//! ```

use crate::error::{AppResult, CaptureError};
use crate::hardware::StreamMode;
use crate::sink::ImageFormat;
use chrono::NaiveDate;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "sync_capture.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SYNC_CAPTURE_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub run: RunConfiguration,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub sensor: SensorSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// trace, debug, info, warn or error
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Parameters of one acquisition run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Sensor exposure per frame
    pub integration_time_ms: u64,
    /// Pause after each acknowledgment before the next trigger is served
    pub inter_step_delay_ms: u64,
    /// Wait after the last step so the stage can return home
    pub post_final_wait_ms: u64,
    /// Number of stage positions to capture
    pub total_steps: u32,
    /// Frames averaged per step (1 = no stacking)
    pub stacking_count: u32,
    /// Pause between stacked frames
    #[serde(default = "default_stack_pause_ms")]
    pub stack_pause_ms: u64,
    /// Extra grab attempts for the same trigger before the run aborts
    #[serde(default = "default_max_grab_retries")]
    pub max_grab_retries: u32,
    #[serde(default)]
    pub stream_mode: StreamMode,
    /// Directory in which the per-run directory is created
    pub output_directory: PathBuf,
    /// Appended to the run directory name (e.g. "espectrometro")
    #[serde(default)]
    pub label_suffix: Option<String>,
}

fn default_stack_pause_ms() -> u64 {
    10
}

fn default_max_grab_retries() -> u32 {
    1
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            integration_time_ms: 32,
            inter_step_delay_ms: 5,
            post_final_wait_ms: 500,
            total_steps: 20,
            stacking_count: 1,
            stack_pause_ms: default_stack_pause_ms(),
            max_grab_retries: default_max_grab_retries(),
            stream_mode: StreamMode::default(),
            output_directory: PathBuf::from("."),
            label_suffix: None,
        }
    }
}

impl RunConfiguration {
    /// Run label, e.g. `20250528_delay5ms_int32ms`.
    pub fn run_label(&self, date: NaiveDate) -> String {
        let mut label = format!(
            "{}_delay{}ms_int{}ms",
            date.format("%Y%m%d"),
            self.inter_step_delay_ms,
            self.integration_time_ms
        );
        if let Some(suffix) = self.label_suffix.as_deref().filter(|s| !s.is_empty()) {
            label.push('_');
            label.push_str(suffix);
        }
        label
    }

    /// Name of the per-run output directory, e.g. `imagenes_20250528_delay5ms_int32ms`.
    pub fn run_directory_name(&self, date: NaiveDate) -> String {
        format!("imagenes_{}", self.run_label(date))
    }

    pub fn integration_time(&self) -> Duration {
        Duration::from_millis(self.integration_time_ms)
    }

    pub fn inter_step_delay(&self) -> Duration {
        Duration::from_millis(self.inter_step_delay_ms)
    }

    pub fn post_final_wait(&self) -> Duration {
        Duration::from_millis(self.post_final_wait_ms)
    }

    pub fn stack_pause(&self) -> Duration {
        Duration::from_millis(self.stack_pause_ms)
    }

    /// Check semantic constraints that parsing cannot express.
    pub fn validate(&self) -> AppResult<()> {
        if self.total_steps == 0 {
            return Err(CaptureError::Configuration(
                "run.total_steps must be at least 1".to_string(),
            ));
        }
        if self.stacking_count == 0 {
            return Err(CaptureError::Configuration(
                "run.stacking_count must be at least 1".to_string(),
            ));
        }
        if self.integration_time_ms == 0 {
            return Err(CaptureError::Configuration(
                "run.integration_time_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Explicit bounds on every blocking wait of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Bound on a single line read from the controller
    #[serde(with = "humantime_serde")]
    pub link_read: Duration,
    /// Bound on waiting for `ready`; unbounded when absent
    #[serde(default, with = "humantime_serde")]
    pub home: Option<Duration>,
    /// Bound on waiting for the next `capturar` line
    #[serde(with = "humantime_serde")]
    pub trigger: Duration,
    /// Bound on one sensor grab
    #[serde(with = "humantime_serde")]
    pub grab: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            link_read: Duration::from_secs(1),
            home: Some(Duration::from_secs(60)),
            trigger: Duration::from_secs(30),
            grab: Duration::from_millis(5000),
        }
    }
}

/// Serial link to the motion controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Serial port path (e.g. "/dev/ttyACM0", "COM5")
    pub port: String,
    pub baud_rate: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
        }
    }
}

/// Which sensor backend the binary opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SensorBackend {
    /// Synthetic frames, no hardware
    #[default]
    Simulated,
    /// Video4Linux2 device (requires feature `sensor_v4l2`)
    V4l2,
}

/// Imaging sensor selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    pub backend: SensorBackend,
    /// V4L2 device index (0 = /dev/video0)
    #[serde(default)]
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            backend: SensorBackend::default(),
            device_index: 0,
            width: 640,
            height: 480,
        }
    }
}

/// Image persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub image_format: ImageFormat,
    /// Maximum concurrent encode+write jobs
    pub sink_workers: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            image_format: ImageFormat::default(),
            sink_workers: 4,
        }
    }
}

impl Settings {
    /// Load defaults, then `path` (or [`DEFAULT_CONFIG_FILE`]), then the environment.
    ///
    /// Not validated: callers apply their own overrides first, then call [`Self::validate`].
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> AppResult<()> {
        self.run.validate()?;
        if self.controller.port.trim().is_empty() {
            return Err(CaptureError::Configuration(
                "controller.port must not be empty".to_string(),
            ));
        }
        if self.storage.sink_workers == 0 {
            return Err(CaptureError::Configuration(
                "storage.sink_workers must be at least 1".to_string(),
            ));
        }
        if self.timeouts.link_read.is_zero() || self.timeouts.grab.is_zero() {
            return Err(CaptureError::Configuration(
                "timeouts.link_read and timeouts.grab must be positive".to_string(),
            ));
        }
        if self.timeouts.grab < self.run.integration_time() {
            tracing::warn!(
                grab_timeout = ?self.timeouts.grab,
                integration_ms = self.run.integration_time_ms,
                "Grab timeout is shorter than the integration time; every grab will time out"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.run.total_steps, 20);
        assert_eq!(settings.run.stream_mode, StreamMode::StepGated);
    }

    #[test]
    fn test_run_directory_name() {
        let date = NaiveDate::from_ymd_opt(2025, 5, 28).unwrap();
        let mut run = RunConfiguration::default();
        assert_eq!(
            run.run_directory_name(date),
            "imagenes_20250528_delay5ms_int32ms"
        );
        run.label_suffix = Some("espectrometro".to_string());
        run.integration_time_ms = 640;
        assert_eq!(
            run.run_directory_name(date),
            "imagenes_20250528_delay5ms_int640ms_espectrometro"
        );
    }

    #[test]
    fn test_validation_rejects_zero_steps_and_stacking() {
        let mut run = RunConfiguration {
            total_steps: 0,
            ..RunConfiguration::default()
        };
        assert!(matches!(run.validate(), Err(CaptureError::Configuration(_))));
        run.total_steps = 3;
        run.stacking_count = 0;
        assert!(matches!(run.validate(), Err(CaptureError::Configuration(_))));
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut settings = Settings::default();
        settings.storage.sink_workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [run]
                integration_time_ms = 64
                inter_step_delay_ms = 5
                post_final_wait_ms = 100
                total_steps = 12
                stacking_count = 3
                output_directory = "data"
                stream_mode = "continuous"

                [timeouts]
                link_read = "250ms"
                trigger = "10s"
                grab = "2s"

                [storage]
                image_format = "tiff"
                sink_workers = 2
                "#,
            )?;
            jail.set_env("SYNC_CAPTURE_RUN__TOTAL_STEPS", "36");
            jail.set_env("SYNC_CAPTURE_CONTROLLER__PORT", "COM5");

            let settings = Settings::load(None).map_err(|e| e.to_string())?;
            assert_eq!(settings.run.integration_time_ms, 64);
            assert_eq!(settings.run.total_steps, 36);
            assert_eq!(settings.run.stacking_count, 3);
            assert_eq!(settings.run.stream_mode, StreamMode::Continuous);
            assert_eq!(settings.timeouts.link_read, Duration::from_millis(250));
            assert_eq!(settings.timeouts.home, Some(Duration::from_secs(60)));
            assert_eq!(settings.controller.port, "COM5");
            assert_eq!(settings.controller.baud_rate, 9600);
            assert_eq!(settings.storage.image_format, ImageFormat::Tiff);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_file_values_can_be_overridden_before_validation() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.toml", "[run]\ntotal_steps = 0\n")?;
            let mut settings =
                Settings::load(Some(Path::new("bad.toml"))).map_err(|e| e.to_string())?;
            assert!(matches!(
                settings.validate(),
                Err(CaptureError::Configuration(_))
            ));

            settings.run.total_steps = 5;
            assert!(settings.validate().is_ok());
            Ok(())
        });
    }
}
