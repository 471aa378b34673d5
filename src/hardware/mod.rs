//! Device sessions driven by the acquisition controller.
//!
//! Every session is a finite resource with an explicit lifecycle
//! (open → configured → streaming → closed). The control loop opens the sensor through
//! a [`SensorOpener`] once the controller reports home, owns the session exclusively
//! for the rest of the run and releases it on every exit path.
//!
//! # Available Backends
//!
//! - [`mock::SimulatedSensor`] - synthetic frames with scriptable failures
//! - [`mock::SimulatedSpectrometer`] - synthetic emission line
//! - [`v4l2::V4l2Sensor`] - Video4Linux2 camera (feature `sensor_v4l2`)

use crate::error::{AppResult, GrabError};
use crate::frame::Frame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod mock;
#[cfg(feature = "sensor_v4l2")]
pub mod v4l2;

/// How the sensor stream is armed around a triggered grab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Stream stays up for the whole run; a grab returns the newest frame.
    Continuous,
    /// Stream is stopped and restarted right before each grab so the returned
    /// frame was exposed after the trigger. Costs one restart per step.
    #[default]
    StepGated,
}

/// Imaging sensor session.
#[async_trait]
pub trait SensorSession: Send {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Apply the integration (exposure) time. Returns the value the device actually applied.
    async fn configure(&mut self, integration: Duration) -> AppResult<Duration>;

    async fn start_stream(&mut self) -> AppResult<()>;

    /// Stop streaming. Stopping a stopped stream is not an error.
    async fn stop_stream(&mut self) -> AppResult<()>;

    /// Block up to `timeout` for the next frame.
    async fn grab(&mut self, timeout: Duration) -> Result<Frame, GrabError>;

    /// Release the device. Idempotent.
    async fn close(&mut self) -> AppResult<()>;
}

/// Opens the sensor session when the run needs it.
#[async_trait]
pub trait SensorOpener: Send {
    type Session: SensorSession;

    async fn open(&mut self) -> AppResult<Self::Session>;
}

/// One spectrum: intensities sampled at the given wavelengths.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub wavelengths_nm: Vec<f64>,
    pub intensities: Vec<f64>,
}

impl Spectrum {
    /// Wavelength of the strongest sample.
    pub fn peak_wavelength(&self) -> Option<f64> {
        self.intensities
            .iter()
            .zip(&self.wavelengths_nm)
            .max_by(|a, b| a.0.total_cmp(b.0))
            .map(|(_, &wl)| wl)
    }
}

/// Optional spectrometer sampled once per step alongside the image.
#[async_trait]
pub trait Spectrometer: Send {
    async fn configure(&mut self, integration: Duration) -> AppResult<()>;

    async fn acquire(&mut self) -> AppResult<Spectrum>;

    async fn close(&mut self) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_wavelength() {
        let spectrum = Spectrum {
            wavelengths_nm: vec![500.0, 510.0, 520.0],
            intensities: vec![1.0, 9.0, 3.0],
        };
        assert_eq!(spectrum.peak_wavelength(), Some(510.0));

        let empty = Spectrum {
            wavelengths_nm: vec![],
            intensities: vec![],
        };
        assert_eq!(empty.peak_wavelength(), None);
    }

    #[test]
    fn test_stream_mode_serde_names() {
        let json = serde_json::to_string(&StreamMode::StepGated).unwrap();
        assert_eq!(json, "\"step_gated\"");
    }
}
