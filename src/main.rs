//! CLI entry point for sync_capture.
//!
//! Runs one acquisition: waits for the rotating stage to report home, captures one
//! image per stage position and writes the images, the timing report and the run
//! metadata into a new run directory.
//!
//! # Usage
//!
//! Against real hardware:
//! ```bash
//! sync_capture --port /dev/ttyACM0 --steps 36 --integration-ms 32 --delay-ms 5
//! ```
//!
//! Without hardware (simulated controller and sensor):
//! ```bash
//! sync_capture --simulate --steps 10 --stacking 3
//! ```
//!
//! Press Ctrl+C to stop early; the steps captured so far are still reported.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use sync_capture::acquisition::{AcquisitionController, RunOutcome, RunStatus};
use sync_capture::adapters::{open_serial, ControllerLink};
use sync_capture::config::{SensorBackend, Settings};
use sync_capture::hardware::mock::{MockController, SimulatedSensor, SimulatedSpectrometer};
use sync_capture::hardware::{SensorOpener, Spectrometer, StreamMode};
use sync_capture::layout::RunLayout;
use sync_capture::logging;
use sync_capture::sink::{ImageFormat, ImageSink};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Directory-name suffix of runs that also record spectra.
const SPECTROMETER_SUFFIX: &str = "espectrometro";

#[derive(Parser, Debug)]
#[command(name = "sync_capture")]
#[command(about = "Synchronized rotating-stage image acquisition", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults to ./sync_capture.toml when present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Controller serial port
    #[arg(long)]
    port: Option<String>,

    /// Controller baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Number of stage positions to capture
    #[arg(long)]
    steps: Option<u32>,

    /// Sensor integration time in milliseconds
    #[arg(long)]
    integration_ms: Option<u64>,

    /// Delay after each acknowledgment in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Frames averaged per step
    #[arg(long)]
    stacking: Option<u32>,

    /// Root directory for the run directory
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum)]
    stream_mode: Option<StreamMode>,

    #[arg(long, value_enum)]
    image_format: Option<ImageFormat>,

    #[arg(long, value_enum)]
    sensor: Option<SensorBackend>,

    /// Use a simulated controller and sensor instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Also record one spectrum per step
    #[arg(long)]
    spectrometer: bool,
}

impl Cli {
    /// Apply command-line overrides on top of file and environment settings.
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = &self.port {
            settings.controller.port = port.clone();
        }
        if let Some(baud) = self.baud {
            settings.controller.baud_rate = baud;
        }
        if let Some(steps) = self.steps {
            settings.run.total_steps = steps;
        }
        if let Some(integration) = self.integration_ms {
            settings.run.integration_time_ms = integration;
        }
        if let Some(delay) = self.delay_ms {
            settings.run.inter_step_delay_ms = delay;
        }
        if let Some(stacking) = self.stacking {
            settings.run.stacking_count = stacking;
        }
        if let Some(output) = &self.output {
            settings.run.output_directory = output.clone();
        }
        if let Some(mode) = self.stream_mode {
            settings.run.stream_mode = mode;
        }
        if let Some(format) = self.image_format {
            settings.storage.image_format = format;
        }
        if let Some(sensor) = self.sensor {
            settings.sensor.backend = sensor;
        }
        if self.spectrometer {
            settings.run.label_suffix = Some(SPECTROMETER_SUFFIX.to_string());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut settings);
    logging::init(&settings.application).context("Failed to initialize logging")?;
    settings.validate().context("Invalid configuration")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, stopping after the current wait");
            ctrl_c.cancel();
        }
    });

    let spectrometer: Option<Box<dyn Spectrometer>> = match (cli.spectrometer, cli.simulate) {
        (false, _) => None,
        (true, true) => Some(Box::new(SimulatedSpectrometer::default())),
        (true, false) => bail!("No spectrometer backend is available for hardware runs; use --simulate"),
    };

    let outcome = if cli.simulate {
        let step_deg = 360.0 / f64::from(settings.run.total_steps);
        let (link, _controller) = MockController::evenly_spaced(settings.run.total_steps, step_deg).spawn();
        info!(steps = settings.run.total_steps, step_deg, "Using simulated controller");
        with_sensor(&settings, link, spectrometer, cancel).await?
    } else {
        let link = open_serial(&settings.controller.port, settings.controller.baud_rate)
            .with_context(|| format!("Failed to open controller port {}", settings.controller.port))?;
        with_sensor(&settings, link, spectrometer, cancel).await?
    };

    report(&outcome);
    if matches!(outcome.status, RunStatus::Aborted(_)) {
        let err = outcome
            .into_result()
            .err()
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("run aborted"));
        return Err(err.context("Acquisition aborted"));
    }
    Ok(())
}

/// Pick the configured sensor backend and run. The device is opened by the run itself.
async fn with_sensor<L: ControllerLink>(
    settings: &Settings,
    link: L,
    spectrometer: Option<Box<dyn Spectrometer>>,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    match settings.sensor.backend {
        SensorBackend::Simulated => {
            let sensor = SimulatedSensor::new(settings.sensor.width, settings.sensor.height);
            run(settings, link, sensor, spectrometer, cancel).await
        }
        #[cfg(feature = "sensor_v4l2")]
        SensorBackend::V4l2 => {
            let opener = sync_capture::hardware::v4l2::V4l2Opener {
                index: settings.sensor.device_index,
                width: settings.sensor.width,
                height: settings.sensor.height,
            };
            run(settings, link, opener, spectrometer, cancel).await
        }
        #[cfg(not(feature = "sensor_v4l2"))]
        SensorBackend::V4l2 => {
            Err(sync_capture::error::CaptureError::FeatureNotEnabled("sensor_v4l2".into()).into())
        }
    }
}

async fn run<L: ControllerLink, O: SensorOpener>(
    settings: &Settings,
    link: L,
    sensor: O,
    spectrometer: Option<Box<dyn Spectrometer>>,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let date = chrono::Local::now().date_naive();
    let layout = RunLayout::new(&settings.run, date);
    let sink = ImageSink::new(settings.storage.sink_workers, settings.storage.image_format);

    let mut controller = AcquisitionController::new(
        settings.run.clone(),
        settings.timeouts.clone(),
        link,
        sensor,
        sink,
        layout,
    )
    .with_cancellation(cancel);
    if let Some(spectrometer) = spectrometer {
        controller = controller.with_spectrometer(spectrometer);
    }
    Ok(controller.run().await)
}

fn report(outcome: &RunOutcome) {
    println!("Status: {:?}", outcome.status);
    println!("Steps captured: {}", outcome.records.len());
    if let Some(means) = outcome.summary.means {
        println!("Mean total capture: {:.2} ms", means.total_capture_ms);
        println!("Mean system overhead: {:.2} ms", means.system_overhead_ms);
        println!("Mean temporal resolution: {:.2} ms", means.temporal_resolution_ms);
    } else {
        println!("No steps recorded");
    }
    println!("Total run time: {:.2} ms", outcome.summary.total_run_ms);
    println!(
        "Files written: {} ({} failed)",
        outcome.sink.written, outcome.sink.failed
    );
    if let Some(path) = &outcome.report_path {
        println!("Report: {}", path.display());
    }
}
