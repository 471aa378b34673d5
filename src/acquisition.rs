//! Step state machine driving one acquisition run.
//!
//! The [`AcquisitionController`] owns every resource of a run: the controller link, the
//! sensor session, the optional spectrometer, the image sink and the report. It runs the
//! handshake with the motion controller and captures one image per stage position.
//! Until the controller reports home only the link is in use: the sensor is opened and
//! the run directory created afterwards.
//!
//!
//! ```text
//! AwaitingHome ──ready──▶ AwaitingTrigger ──capturar──▶ Capturing ──▶ Stacking
//!                              ▲                                          │
//!                              └──────────── ok ◀──── Persisting ◀────────┘
//!                                     (after the last step) ──▶ Draining ──▶ Done
//! ```
//!
//! Every blocking wait is bounded by a configured timeout and raced against the run's
//! [`CancellationToken`]. Whatever ends the run (completion, cancellation or a fatal
//! error) goes through one finalization path that releases the devices, joins the sink
//! and writes the report and metadata sidecar.

use crate::adapters::ControllerLink;
use crate::config::{RunConfiguration, TimeoutSettings};
use crate::error::{AppResult, CaptureError, GrabError};
use crate::error_recovery::RetryPolicy;
use crate::frame::{stack_frames, Frame};
use crate::hardware::{SensorOpener, SensorSession, Spectrometer, Spectrum, StreamMode};
use crate::layout::RunLayout;
use crate::metadata::RunMetadataBuilder;
use crate::protocol::{parse_line, HandshakeEvent};
use crate::report::{ReportBuilder, StepRecord};
use crate::sink::{ImageSink, SinkJob, SinkStats};
use crate::timing::{duration_ms, summarize, RunClock, RunSummary, StepTiming};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the step state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquisitionState {
    AwaitingHome,
    AwaitingTrigger,
    Capturing,
    Stacking,
    Persisting,
    Draining,
    Done,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every configured step was captured.
    Completed,
    /// The run was cancelled by the user.
    Interrupted,
    /// A fatal error stopped the run.
    Aborted(String),
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Result of a finalized run.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub records: Vec<StepRecord>,
    pub summary: RunSummary,
    /// `None` when the report could not be written
    pub report_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub sink: SinkStats,
    /// Grab attempts that failed, including retried ones
    pub failed_grabs: u32,
    /// The error that aborted the run
    pub error: Option<CaptureError>,
    /// Errors raised while releasing resources
    pub cleanup_errors: Vec<CaptureError>,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        self.status.is_completed()
    }

    /// Convert to a `Result`, surfacing the aborting error.
    pub fn into_result(mut self) -> AppResult<Self> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Result of a wait that may be cut short by cancellation.
enum Waited<T> {
    Done(T),
    Cancelled,
}

/// How the acquisition loop ended without error.
enum Flow {
    Completed,
    Interrupted,
}

/// One grabbed (possibly stacked) frame plus its capture window.
struct Captured {
    frame: Frame,
    timestamp: DateTime<Local>,
    start: Instant,
    end: Instant,
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Waited<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Waited::Cancelled,
        out = fut => Waited::Done(out),
    }
}

/// Restart the stream so the next frame is exposed after the trigger.
async fn rearm<S: SensorSession>(sensor: &mut S) -> AppResult<()> {
    sensor.stop_stream().await?;
    sensor.start_stream().await
}

fn sensor_not_open() -> CaptureError {
    CaptureError::Sensor("sensor session is not open".into())
}

/// Drives one run from the home handshake to the written report.
pub struct AcquisitionController<L, O: SensorOpener> {
    config: RunConfiguration,
    timeouts: TimeoutSettings,
    link: L,
    opener: O,
    sensor: Option<O::Session>,
    spectrometer: Option<Box<dyn Spectrometer>>,
    sink: ImageSink,
    layout: RunLayout,
    /// Set once the run directory exists
    output_ready: bool,
    cancel: CancellationToken,
    retry: RetryPolicy,
    state: AcquisitionState,
    report: ReportBuilder,
    clock: Option<RunClock>,
    applied_integration: Option<Duration>,
    failed_grabs: u32,
}

impl<L, O> AcquisitionController<L, O>
where
    L: ControllerLink,
    O: SensorOpener,
{
    /// `opener` is used once, after the controller reports home.
    pub fn new(
        config: RunConfiguration,
        timeouts: TimeoutSettings,
        link: L,
        opener: O,
        sink: ImageSink,
        layout: RunLayout,
    ) -> Self {
        let report = ReportBuilder::new(config.integration_time_ms, config.inter_step_delay_ms);
        let retry = RetryPolicy::with_max_retries(config.max_grab_retries);
        Self {
            config,
            timeouts,
            link,
            opener,
            sensor: None,
            spectrometer: None,
            sink,
            layout,
            output_ready: false,
            cancel: CancellationToken::new(),
            retry,
            state: AcquisitionState::AwaitingHome,
            report,
            clock: None,
            applied_integration: None,
            failed_grabs: 0,
        }
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sample a spectrum at every step alongside the image.
    pub fn with_spectrometer(mut self, spectrometer: Box<dyn Spectrometer>) -> Self {
        self.spectrometer = Some(spectrometer);
        self
    }

    /// Run to completion, cancellation or the first fatal error, then finalize.
    pub async fn run(mut self) -> RunOutcome {
        let started_at = Local::now();
        info!(
            label = self.layout.label(),
            steps = self.config.total_steps,
            integration_ms = self.config.integration_time_ms,
            delay_ms = self.config.inter_step_delay_ms,
            stacking = self.config.stacking_count,
            stream_mode = ?self.config.stream_mode,
            "Starting acquisition run"
        );

        let (status, error) = match self.acquire().await {
            Ok(Flow::Completed) => (RunStatus::Completed, None),
            Ok(Flow::Interrupted) => {
                warn!("Run interrupted by user");
                (RunStatus::Interrupted, None)
            }
            Err(err) => {
                error!(state = ?self.state, error = %err, "Run aborted");
                (RunStatus::Aborted(err.to_string()), Some(err))
            }
        };
        self.finalize(status, error, started_at).await
    }

    fn transition(&mut self, next: AcquisitionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "State transition");
            self.state = next;
        }
    }

    async fn acquire(&mut self) -> AppResult<Flow> {
        let cancel = self.cancel.clone();

        if let Waited::Cancelled = self.await_home(&cancel).await? {
            return Ok(Flow::Interrupted);
        }
        self.clock = Some(RunClock::start());

        self.layout.create_dir()?;
        self.output_ready = true;
        if let Waited::Cancelled = self.prepare_devices(&cancel).await? {
            return Ok(Flow::Interrupted);
        }

        let total = self.config.total_steps;
        for step in 1..=total {
            let angle = match self.await_trigger(&cancel, step).await? {
                Waited::Done(angle) => angle,
                Waited::Cancelled => return Ok(Flow::Interrupted),
            };

            let captured = match self.capture(&cancel, step).await? {
                Waited::Done(captured) => captured,
                Waited::Cancelled => return Ok(Flow::Interrupted),
            };

            self.transition(AcquisitionState::Persisting);
            let spectrum = match self.acquire_spectrum(&cancel, step).await {
                Waited::Done(spectrum) => spectrum,
                Waited::Cancelled => return Ok(Flow::Interrupted),
            };
            let record = self.persist(step, angle, captured, spectrum)?;
            self.link.write_ack().await?;
            info!(
                step,
                total,
                angle = ?record.angle,
                total_ms = record.total_capture_ms,
                system_ms = record.system_overhead_ms,
                "Step captured"
            );

            if step < total && !self.config.inter_step_delay().is_zero() {
                if let Waited::Cancelled =
                    cancellable(&cancel, sleep(self.config.inter_step_delay())).await
                {
                    return Ok(Flow::Interrupted);
                }
            }
        }

        self.transition(AcquisitionState::Draining);
        debug!(wait_ms = self.config.post_final_wait_ms, "Waiting for stage to return home");
        if let Waited::Cancelled = cancellable(&cancel, sleep(self.config.post_final_wait())).await
        {
            return Ok(Flow::Interrupted);
        }
        Ok(Flow::Completed)
    }

    /// Open and configure the sensor (and spectrometer), then start streaming.
    async fn prepare_devices(&mut self, cancel: &CancellationToken) -> AppResult<Waited<()>> {
        let opened = match cancellable(cancel, self.opener.open()).await {
            Waited::Done(opened) => opened?,
            Waited::Cancelled => return Ok(Waited::Cancelled),
        };
        let sensor = self.sensor.insert(opened);

        let integration = self.config.integration_time();
        let applied = match cancellable(cancel, sensor.configure(integration)).await {
            Waited::Done(applied) => applied?,
            Waited::Cancelled => return Ok(Waited::Cancelled),
        };
        info!(
            sensor = sensor.name(),
            requested_ms = self.config.integration_time_ms,
            applied_ms = duration_ms(applied),
            "Sensor configured"
        );
        self.applied_integration = Some(applied);

        if let Some(spectrometer) = self.spectrometer.as_mut() {
            match cancellable(cancel, spectrometer.configure(integration)).await {
                Waited::Done(configured) => configured?,
                Waited::Cancelled => return Ok(Waited::Cancelled),
            }
        }

        let sensor = self.sensor.as_mut().ok_or_else(sensor_not_open)?;
        match cancellable(cancel, sensor.start_stream()).await {
            Waited::Done(started) => started?,
            Waited::Cancelled => return Ok(Waited::Cancelled),
        }
        Ok(Waited::Done(()))
    }

    /// Read the next event, giving up at `deadline`.
    ///
    /// Each individual read is bounded by the link read timeout so that a deadline and
    /// cancellation are both noticed promptly. `Done(None)` means the deadline passed.
    async fn next_event(
        &mut self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> AppResult<Waited<Option<HandshakeEvent>>> {
        loop {
            let mut wait = self.timeouts.link_read;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(Waited::Done(None));
                }
                wait = wait.min(remaining);
            }

            let read = match cancellable(cancel, self.link.read_line(wait)).await {
                Waited::Done(read) => read,
                Waited::Cancelled => return Ok(Waited::Cancelled),
            };
            match read {
                Ok(line) => return Ok(Waited::Done(Some(parse_line(&line)))),
                Err(CaptureError::LinkTimeout(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn await_home(&mut self, cancel: &CancellationToken) -> AppResult<Waited<()>> {
        self.transition(AcquisitionState::AwaitingHome);
        info!("Waiting for controller to reach home position");
        let home_timeout = self.timeouts.home;
        let deadline = home_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            match self.next_event(cancel, deadline).await? {
                Waited::Cancelled => return Ok(Waited::Cancelled),
                Waited::Done(None) => {
                    return Err(CaptureError::HandshakeTimeout(home_timeout.unwrap_or_default()))
                }
                Waited::Done(Some(HandshakeEvent::Ready)) => {
                    self.link.write_ack().await?;
                    info!("Controller at home position");
                    return Ok(Waited::Done(()));
                }
                Waited::Done(Some(HandshakeEvent::Unknown { raw })) => {
                    warn!(line = %raw, "Ignoring unrecognized controller line");
                }
                Waited::Done(Some(event)) => {
                    debug!(%event, "Ignoring event before home position");
                }
            }
        }
    }

    /// Wait for the capture request of `step` and return its angle.
    async fn await_trigger(
        &mut self,
        cancel: &CancellationToken,
        step: u32,
    ) -> AppResult<Waited<Option<f64>>> {
        self.transition(AcquisitionState::AwaitingTrigger);
        let deadline = Instant::now() + self.timeouts.trigger;

        loop {
            match self.next_event(cancel, Some(deadline)).await? {
                Waited::Cancelled => return Ok(Waited::Cancelled),
                Waited::Done(None) => return Err(CaptureError::TriggerTimeout(self.timeouts.trigger)),
                Waited::Done(Some(HandshakeEvent::CaptureRequest { angle })) => {
                    if angle.is_none() {
                        warn!(step, "Capture request without a readable angle; recording it as unknown");
                    }
                    return Ok(Waited::Done(angle));
                }
                Waited::Done(Some(HandshakeEvent::Unknown { raw })) => {
                    warn!(step, line = %raw, "Ignoring unrecognized controller line");
                }
                Waited::Done(Some(HandshakeEvent::Ready)) => {
                    debug!(step, "Ignoring repeated ready while awaiting trigger");
                }
            }
        }
    }

    /// Capture the frame for `step`, retrying failed grabs against the same trigger.
    async fn capture(
        &mut self,
        cancel: &CancellationToken,
        step: u32,
    ) -> AppResult<Waited<Captured>> {
        let mut attempts = self.retry.begin(step);
        loop {
            self.transition(AcquisitionState::Capturing);
            let timestamp = Local::now();
            let start = Instant::now();

            let grabbed = match self.grab_stack(cancel).await? {
                Waited::Done(grabbed) => grabbed,
                Waited::Cancelled => return Ok(Waited::Cancelled),
            };
            match grabbed {
                Ok(frame) => {
                    let end = Instant::now();
                    return Ok(Waited::Done(Captured {
                        frame,
                        timestamp,
                        start,
                        end,
                    }));
                }
                Err(err) => {
                    self.failed_grabs += 1;
                    warn!(step, attempt = attempts.failures() + 1, error = %err, "Grab failed");
                    let backoff = attempts.record_failure(err)?;
                    if let Waited::Cancelled = cancellable(cancel, sleep(backoff)).await {
                        return Ok(Waited::Cancelled);
                    }
                }
            }
        }
    }

    /// Grab `stacking_count` frames and average them.
    ///
    /// A failed stream re-arm counts as a failed grab of this attempt.
    async fn grab_stack(
        &mut self,
        cancel: &CancellationToken,
    ) -> AppResult<Waited<Result<Frame, GrabError>>> {
        let sensor = self.sensor.as_mut().ok_or_else(sensor_not_open)?;
        if self.config.stream_mode == StreamMode::StepGated {
            match cancellable(cancel, rearm(sensor)).await {
                Waited::Cancelled => return Ok(Waited::Cancelled),
                Waited::Done(Err(err)) => {
                    return Ok(Waited::Done(Err(GrabError::Failed(format!(
                        "stream re-arm failed: {err}"
                    )))))
                }
                Waited::Done(Ok(())) => {}
            }
        }

        let count = self.config.stacking_count.max(1) as usize;
        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 && !self.config.stack_pause().is_zero() {
                if let Waited::Cancelled = cancellable(cancel, sleep(self.config.stack_pause())).await {
                    return Ok(Waited::Cancelled);
                }
            }
            match cancellable(cancel, sensor.grab(self.timeouts.grab)).await {
                Waited::Cancelled => return Ok(Waited::Cancelled),
                Waited::Done(Err(err)) => return Ok(Waited::Done(Err(err))),
                Waited::Done(Ok(frame)) => frames.push(frame),
            }
        }

        if count > 1 {
            self.transition(AcquisitionState::Stacking);
        }
        Ok(Waited::Done(Ok(stack_frames(frames)?)))
    }

    /// A spectrometer failure loses the spectrum of this step, not the step.
    async fn acquire_spectrum(
        &mut self,
        cancel: &CancellationToken,
        step: u32,
    ) -> Waited<Option<Spectrum>> {
        let Some(spectrometer) = self.spectrometer.as_mut() else {
            return Waited::Done(None);
        };
        match cancellable(cancel, spectrometer.acquire()).await {
            Waited::Cancelled => Waited::Cancelled,
            Waited::Done(Ok(spectrum)) => {
                debug!(step, peak_nm = ?spectrum.peak_wavelength(), "Spectrum acquired");
                Waited::Done(Some(spectrum))
            }
            Waited::Done(Err(err)) => {
                warn!(step, error = %err, "Spectrum acquisition failed");
                Waited::Done(None)
            }
        }
    }

    fn persist(
        &mut self,
        step: u32,
        angle: Option<f64>,
        captured: Captured,
        spectrum: Option<Spectrum>,
    ) -> AppResult<StepRecord> {
        let timing = StepTiming::measure(
            captured.start.into_std(),
            captured.end.into_std(),
            self.config.integration_time_ms,
            self.config.inter_step_delay_ms,
        );
        let record = StepRecord::new(
            step,
            captured.timestamp,
            angle,
            self.config.integration_time_ms,
            self.config.inter_step_delay_ms,
            timing,
            captured.frame.mean_intensity(),
        );

        self.sink.submit(SinkJob::Image {
            frame: captured.frame,
            path: self.layout.image_path(step, self.sink.format()),
        });
        if let Some(spectrum) = spectrum {
            self.sink.submit(SinkJob::Spectrum {
                spectrum,
                path: self.layout.spectrum_path(step),
            });
        }
        self.report.push(record.clone())?;
        Ok(record)
    }

    /// Release every resource and write the report and sidecar.
    async fn finalize(
        mut self,
        status: RunStatus,
        error: Option<CaptureError>,
        started_at: DateTime<Local>,
    ) -> RunOutcome {
        let total_run = self.clock.map(|clock| clock.elapsed()).unwrap_or_default();
        let mut cleanup_errors = Vec::new();

        if let Some(sensor) = self.sensor.as_mut() {
            if let Err(err) = sensor.stop_stream().await {
                cleanup_errors.push(err);
            }
            if let Err(err) = sensor.close().await {
                cleanup_errors.push(err);
            }
        }
        let had_spectrometer = self.spectrometer.is_some();
        if let Some(mut spectrometer) = self.spectrometer.take() {
            if let Err(err) = spectrometer.close().await {
                cleanup_errors.push(err);
            }
        }
        if let Err(err) = self.link.close().await {
            cleanup_errors.push(err);
        }

        let pending = self.sink.pending();
        debug!(pending, "Joining outstanding writes");
        let sink = self.sink.flush().await;
        if sink.failed > 0 {
            warn!(failed = sink.failed, written = sink.written, "Some files could not be written");
        }

        let summary = summarize(self.report.records(), total_run);
        let report_path = if self.output_ready {
            let report_path = self.layout.report_path();
            match self.report.write_csv(&report_path, &summary) {
                Ok(()) => Some(report_path),
                Err(err) => {
                    error!(error = %err, "Failed to write timing report");
                    cleanup_errors.push(err);
                    None
                }
            }
        } else {
            info!("Controller never reached home; no run directory was created");
            None
        };

        let steps_completed = self.report.len() as u32;
        if !status.is_completed() || steps_completed < self.config.total_steps {
            warn!(
                steps_completed,
                steps_configured = self.config.total_steps,
                "Run incomplete"
            );
        }

        let mut metadata = RunMetadataBuilder::new(&self.config, &self.timeouts)
            .run_label(self.layout.label())
            .window(started_at, Local::now())
            .status(status.clone())
            .steps_completed(steps_completed)
            .failed_grabs(self.failed_grabs)
            .sink(sink)
            .sensor(
                self.sensor.as_ref().map_or("", |sensor| sensor.name()),
                self.applied_integration.map(duration_ms),
            )
            .spectrometer(had_spectrometer)
            .total_run_ms(summary.total_run_ms);
        for err in &cleanup_errors {
            metadata = metadata.cleanup_error(&err.to_string());
        }
        let metadata_path = if self.output_ready {
            let metadata_path = self.layout.metadata_path();
            match metadata.build().write_json(&metadata_path) {
                Ok(()) => Some(metadata_path),
                Err(err) => {
                    error!(error = %err, "Failed to write run metadata");
                    cleanup_errors.push(err);
                    None
                }
            }
        } else {
            None
        };

        for err in &cleanup_errors {
            warn!(error = %err, "Error while finalizing run");
        }
        self.transition(AcquisitionState::Done);
        info!(
            status = ?status,
            steps = steps_completed,
            total_run_ms = summary.total_run_ms,
            written = sink.written,
            "Run finalized"
        );

        RunOutcome {
            status,
            records: self.report.into_records(),
            summary,
            report_path,
            metadata_path,
            sink,
            failed_grabs: self.failed_grabs,
            error,
            cleanup_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{ControllerAction, MockController, PixelPattern, SimulatedSensor};
    use crate::sink::ImageFormat;
    use chrono::NaiveDate;
    use tracing_test::traced_test;

    fn config(dir: &std::path::Path, steps: u32) -> RunConfiguration {
        RunConfiguration {
            total_steps: steps,
            inter_step_delay_ms: 0,
            post_final_wait_ms: 0,
            output_directory: dir.to_path_buf(),
            ..RunConfiguration::default()
        }
    }

    fn timeouts() -> TimeoutSettings {
        TimeoutSettings {
            link_read: Duration::from_millis(50),
            home: Some(Duration::from_secs(2)),
            trigger: Duration::from_secs(2),
            grab: Duration::from_secs(1),
        }
    }

    fn layout(config: &RunConfiguration) -> RunLayout {
        let date = NaiveDate::from_ymd_opt(2025, 5, 28).unwrap();
        RunLayout::new(config, date)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_lines_are_logged_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1);
        let (link, handle) = MockController::from_script(vec![
            ControllerAction::Send("firmware v1.2".to_string()),
            ControllerAction::Send("ready|0".to_string()),
            ControllerAction::AwaitAck,
            ControllerAction::Send("moviendo motor".to_string()),
            ControllerAction::Send("capturar|45".to_string()),
            ControllerAction::AwaitAck,
        ])
        .spawn();
        let sensor = SimulatedSensor::new(8, 8).with_readout(Duration::ZERO);

        let layout = layout(&config);
        let outcome = AcquisitionController::new(
            config,
            timeouts(),
            link,
            sensor,
            ImageSink::new(1, ImageFormat::Bmp),
            layout,
        )
        .run()
        .await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].angle, Some(45.0));
        assert!(logs_contain("firmware v1.2"));
        assert!(logs_contain("moviendo motor"));
        assert!(handle.join().await);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_trigger_records_unknown_angle() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let (link, _handle) = MockController::from_script(vec![
            ControllerAction::Send("ready|0".to_string()),
            ControllerAction::AwaitAck,
            ControllerAction::Send("capturar|abc".to_string()),
            ControllerAction::AwaitAck,
            ControllerAction::Send("capturar|18".to_string()),
            ControllerAction::AwaitAck,
        ])
        .spawn();
        let sensor = SimulatedSensor::new(4, 4)
            .with_readout(Duration::ZERO)
            .with_pattern(PixelPattern::Constant(9));

        let layout = layout(&config);
        let outcome = AcquisitionController::new(
            config,
            timeouts(),
            link,
            sensor,
            ImageSink::new(1, ImageFormat::Bmp),
            layout,
        )
        .run()
        .await;

        assert!(outcome.is_complete());
        let indices: Vec<u32> = outcome.records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(outcome.records[0].angle, None);
        assert_eq!(outcome.records[1].angle, Some(18.0));
        assert!(logs_contain("without a readable angle"));
    }

    #[tokio::test]
    async fn test_trigger_timeout_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 3);
        let (link, handle) = MockController::from_script(vec![
            ControllerAction::Send("ready|0".to_string()),
            ControllerAction::AwaitAck,
            ControllerAction::Send("capturar|0".to_string()),
            ControllerAction::AwaitAck,
        ])
        .spawn();
        let sensor = SimulatedSensor::new(4, 4).with_readout(Duration::ZERO);
        let probe = sensor.probe();

        let timeouts = TimeoutSettings {
            trigger: Duration::from_millis(300),
            ..timeouts()
        };
        let layout = layout(&config);
        let outcome = AcquisitionController::new(
            config,
            timeouts,
            link,
            sensor,
            ImageSink::new(1, ImageFormat::Bmp),
            layout,
        )
        .run()
        .await;

        assert!(matches!(outcome.status, RunStatus::Aborted(_)));
        assert!(matches!(outcome.error, Some(CaptureError::TriggerTimeout(_))));
        assert_eq!(outcome.records.len(), 1);
        assert!(probe.is_closed().await);
        assert!(handle.join().await);
    }

    #[tokio::test]
    async fn test_step_gated_rearms_before_every_grab() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 3);
        config.stream_mode = StreamMode::StepGated;
        let (link, _handle) = MockController::evenly_spaced(3, 10.0).spawn();
        let sensor = SimulatedSensor::new(4, 4).with_readout(Duration::ZERO);
        let probe = sensor.probe();

        let layout = layout(&config);
        let outcome = AcquisitionController::new(
            config,
            timeouts(),
            link,
            sensor,
            ImageSink::new(1, ImageFormat::Bmp),
            layout,
        )
        .run()
        .await;

        assert!(outcome.is_complete());
        // one start after configure, one re-arm per step
        assert_eq!(probe.stream_starts().await, 4);
    }

    #[tokio::test]
    async fn test_continuous_stream_starts_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 3);
        config.stream_mode = StreamMode::Continuous;
        let (link, _handle) = MockController::evenly_spaced(3, 10.0).spawn();
        let sensor = SimulatedSensor::new(4, 4).with_readout(Duration::ZERO);
        let probe = sensor.probe();

        let layout = layout(&config);
        let outcome = AcquisitionController::new(
            config,
            timeouts(),
            link,
            sensor,
            ImageSink::new(1, ImageFormat::Bmp),
            layout,
        )
        .run()
        .await;

        assert!(outcome.is_complete());
        assert_eq!(probe.stream_starts().await, 1);
        assert_eq!(probe.grabs().await, 3);
        assert!(!probe.is_streaming().await);
    }

    #[test]
    fn test_run_status_serialization() {
        let json = serde_json::to_string(&RunStatus::Aborted("boom".into())).unwrap();
        assert_eq!(json, r#"{"state":"aborted","reason":"boom"}"#);
        let json = serde_json::to_string(&RunStatus::Completed).unwrap();
        assert_eq!(json, r#"{"state":"completed"}"#);
    }
}
