//! Simulated Hardware Implementations
//!
//! Provides simulated devices for running the acquisition loop without physical
//! hardware. All simulated devices use async-safe waits (tokio::time::sleep, not
//! std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `SimulatedSensor` - synthetic frames, scriptable grab and stream-start faults,
//!   observable via `SensorProbe`; it is also its own `SensorOpener`
//! - `SimulatedSpectrometer` - single emission line drifting with every acquisition
//! - `MockController` - scripted motion controller speaking the line protocol over an
//!   in-memory duplex pipe
//!
//! # Timing Characteristics
//!
//! - SimulatedSensor: integration time + 8ms readout per frame (configurable)
//! - MockController: answers immediately; insert `ControllerAction::Pause` for latency

use crate::adapters::StreamLink;
use crate::error::{AppResult, CaptureError, GrabError};
use crate::frame::Frame;
use crate::hardware::{SensorOpener, SensorSession, Spectrometer, Spectrum};
use crate::protocol::HandshakeEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::debug;

// =============================================================================
// SimulatedSensor - Synthetic Imaging Sensor
// =============================================================================

/// What a scripted grab does instead of delivering a normal frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GrabFault {
    /// Never deliver; the grab times out after its full timeout.
    Timeout,
    /// Report a device error immediately.
    Fail(String),
    /// Deliver only after this extra delay (times out if that exceeds the timeout).
    Stall(Duration),
}

/// What a scripted stream start does instead of starting at once.
#[derive(Debug, Clone, PartialEq)]
pub enum StartFault {
    /// Report a device error.
    Fail(String),
    /// Start only after this delay.
    Slow(Duration),
}

/// Pixel content of synthetic frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelPattern {
    /// Every sample has this value.
    Constant(u8),
    /// Diagonal gradient shifted by the grab number.
    Ramp,
}

#[derive(Debug, Default)]
struct SensorState {
    opens: u32,
    integration: Option<Duration>,
    streaming: bool,
    closed: bool,
    grabs: u32,
    start_attempts: u32,
    stream_starts: u32,
}

/// Read-only view of a [`SimulatedSensor`] that outlives the session.
#[derive(Clone)]
pub struct SensorProbe {
    state: Arc<RwLock<SensorState>>,
}

impl SensorProbe {
    /// Number of sessions opened from the sensor
    pub async fn opens(&self) -> u32 {
        self.state.read().await.opens
    }

    /// Number of grab calls so far (including failed ones)
    pub async fn grabs(&self) -> u32 {
        self.state.read().await.grabs
    }

    /// Number of times the stream was started successfully
    pub async fn stream_starts(&self) -> u32 {
        self.state.read().await.stream_starts
    }

    pub async fn is_streaming(&self) -> bool {
        self.state.read().await.streaming
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    pub async fn integration(&self) -> Option<Duration> {
        self.state.read().await.integration
    }
}

/// Simulated imaging sensor.
///
/// # Example
///
/// ```rust,ignore
/// let mut sensor = SimulatedSensor::new(64, 48).with_fault_at(3, GrabFault::Timeout);
/// let probe = sensor.probe();
/// sensor.configure(Duration::from_millis(32)).await?;
/// sensor.start_stream().await?;
/// let frame = sensor.grab(Duration::from_secs(5)).await?;
/// assert_eq!(probe.grabs().await, 1);
/// ```
#[derive(Clone)]
pub struct SimulatedSensor {
    name: String,
    width: u32,
    height: u32,
    channels: u8,
    readout: Duration,
    pattern: PixelPattern,
    faults: HashMap<u32, GrabFault>,
    faults_from: Option<(u32, GrabFault)>,
    start_faults: HashMap<u32, StartFault>,
    state: Arc<RwLock<SensorState>>,
}

impl SimulatedSensor {
    /// Create a mono sensor with the given resolution.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            name: format!("simulated-{width}x{height}"),
            width,
            height,
            channels: 1,
            readout: Duration::from_millis(8),
            pattern: PixelPattern::Ramp,
            faults: HashMap::new(),
            faults_from: None,
            start_faults: HashMap::new(),
            state: Arc::new(RwLock::new(SensorState::default())),
        }
    }

    /// Interleaved samples per pixel (3 for BGR).
    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels.max(1);
        self
    }

    /// Fixed delay added after the integration time of each frame.
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    pub fn with_pattern(mut self, pattern: PixelPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Apply `fault` to grab number `grab` (1-based, counting every grab call).
    pub fn with_fault_at(mut self, grab: u32, fault: GrabFault) -> Self {
        self.faults.insert(grab, fault);
        self
    }

    /// Apply `fault` to every grab from number `grab` onward.
    pub fn with_faults_from(mut self, grab: u32, fault: GrabFault) -> Self {
        self.faults_from = Some((grab, fault));
        self
    }

    /// Apply `fault` to stream start number `start` (1-based, counting every call).
    pub fn with_start_fault_at(mut self, start: u32, fault: StartFault) -> Self {
        self.start_faults.insert(start, fault);
        self
    }

    pub fn probe(&self) -> SensorProbe {
        SensorProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn fault_for(&self, grab: u32) -> Option<&GrabFault> {
        self.faults.get(&grab).or_else(|| {
            self.faults_from
                .as_ref()
                .filter(|(from, _)| grab >= *from)
                .map(|(_, fault)| fault)
        })
    }

    fn render(&self, grab: u32) -> Vec<u8> {
        let len = self.width as usize * self.height as usize * usize::from(self.channels);
        match self.pattern {
            PixelPattern::Constant(value) => vec![value; len],
            PixelPattern::Ramp => {
                let row = self.width as usize * usize::from(self.channels);
                (0..len)
                    .map(|i| {
                        let (y, x) = (i / row.max(1), i % row.max(1));
                        ((x + y + grab as usize) % 256) as u8
                    })
                    .collect()
            }
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

#[async_trait]
impl SensorSession for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, integration: Duration) -> AppResult<Duration> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(CaptureError::Sensor(format!("{} is closed", self.name)));
        }
        state.integration = Some(integration);
        debug!(sensor = %self.name, ?integration, "Integration time applied");
        Ok(integration)
    }

    async fn start_stream(&mut self) -> AppResult<()> {
        let attempt = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(CaptureError::Sensor(format!("{} is closed", self.name)));
            }
            if state.integration.is_none() {
                return Err(CaptureError::Sensor(format!(
                    "{}: stream started before configure",
                    self.name
                )));
            }
            state.start_attempts += 1;
            state.start_attempts
        };

        match self.start_faults.get(&attempt) {
            Some(StartFault::Fail(msg)) => {
                return Err(CaptureError::Sensor(format!("{}: {msg}", self.name)))
            }
            Some(StartFault::Slow(delay)) => sleep(*delay).await,
            None => {}
        }

        let mut state = self.state.write().await;
        state.streaming = true;
        state.stream_starts += 1;
        Ok(())
    }

    async fn stop_stream(&mut self) -> AppResult<()> {
        self.state.write().await.streaming = false;
        Ok(())
    }

    async fn grab(&mut self, timeout: Duration) -> Result<Frame, GrabError> {
        let started = Instant::now();
        let (grab, integration) = {
            let mut state = self.state.write().await;
            if !state.streaming || state.closed {
                return Err(GrabError::Failed(format!("{} is not streaming", self.name)));
            }
            state.grabs += 1;
            (state.grabs, state.integration.unwrap_or_default())
        };

        let mut delay = integration + self.readout;
        match self.fault_for(grab) {
            Some(GrabFault::Fail(msg)) => return Err(GrabError::Failed(msg.clone())),
            Some(GrabFault::Timeout) => {
                sleep(timeout).await;
                return Err(GrabError::Timeout(timeout));
            }
            Some(GrabFault::Stall(extra)) => delay += *extra,
            None => {}
        }

        if delay > timeout {
            sleep(timeout).await;
            return Err(GrabError::Timeout(timeout));
        }
        sleep(delay).await;

        Frame::new(
            self.width,
            self.height,
            self.channels,
            self.render(grab),
            started,
        )
        .map_err(|e| GrabError::Failed(e.to_string()))
    }

    async fn close(&mut self) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.streaming = false;
        state.closed = true;
        Ok(())
    }
}

#[async_trait]
impl SensorOpener for SimulatedSensor {
    type Session = SimulatedSensor;

    /// Sessions share the probe state of the sensor they were opened from.
    async fn open(&mut self) -> AppResult<SimulatedSensor> {
        self.state.write().await.opens += 1;
        debug!(sensor = %self.name, "Simulated sensor opened");
        Ok(self.clone())
    }
}

// =============================================================================
// SimulatedSpectrometer
// =============================================================================

/// Simulated spectrometer with one Gaussian emission line.
pub struct SimulatedSpectrometer {
    center_nm: f64,
    drift_nm: f64,
    acquisitions: u32,
    closed: Arc<AtomicBool>,
}

impl SimulatedSpectrometer {
    /// Emission line at `center_nm`, moving by `drift_nm` per acquisition.
    pub fn new(center_nm: f64, drift_nm: f64) -> Self {
        Self {
            center_nm,
            drift_nm,
            acquisitions: 0,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that turns true once the spectrometer is closed.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl Default for SimulatedSpectrometer {
    fn default() -> Self {
        Self::new(532.0, 0.1)
    }
}

#[async_trait]
impl Spectrometer for SimulatedSpectrometer {
    async fn configure(&mut self, _integration: Duration) -> AppResult<()> {
        Ok(())
    }

    async fn acquire(&mut self) -> AppResult<Spectrum> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::Spectrometer("spectrometer is closed".into()));
        }
        let center = self.center_nm + self.drift_nm * f64::from(self.acquisitions);
        self.acquisitions += 1;

        let wavelengths_nm: Vec<f64> = (0..512).map(|i| 400.0 + f64::from(i) * 0.5).collect();
        let intensities = wavelengths_nm
            .iter()
            .map(|wl| 100.0 + 4000.0 * (-((wl - center) / 2.0).powi(2)).exp())
            .collect();
        Ok(Spectrum {
            wavelengths_nm,
            intensities,
        })
    }

    async fn close(&mut self) -> AppResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockController - Scripted Motion Controller
// =============================================================================

/// One step of a controller script.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    /// Write this line (newline appended).
    Send(String),
    /// Block until the host writes `ok`.
    AwaitAck,
    /// Sleep before the next action.
    Pause(Duration),
}

/// Scripted motion controller on the far end of an in-memory pipe.
///
/// # Example
///
/// ```rust,ignore
/// let (link, handle) = MockController::rotation(&[0.0, 12.5]).spawn();
/// // drive `link` with the acquisition controller...
/// assert_eq!(handle.acks(), 3);
/// ```
pub struct MockController {
    script: Vec<ControllerAction>,
}

/// Observes a running [`MockController`].
pub struct MockControllerHandle {
    acks: Arc<AtomicU32>,
    disconnected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MockControllerHandle {
    /// Acknowledgments received so far
    pub fn acks(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    /// Wait for the script task to end (it ends when the host disconnects).
    pub async fn join(self) -> bool {
        let _ = self.task.await;
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl MockController {
    pub fn from_script(script: Vec<ControllerAction>) -> Self {
        Self { script }
    }

    /// Home, then one acknowledged capture request per angle.
    pub fn rotation(angles: &[f64]) -> Self {
        let mut script = vec![
            ControllerAction::Send(HandshakeEvent::Ready.to_string() + "0"),
            ControllerAction::AwaitAck,
        ];
        for &angle in angles {
            script.push(ControllerAction::Send(
                HandshakeEvent::CaptureRequest { angle: Some(angle) }.to_string(),
            ));
            script.push(ControllerAction::AwaitAck);
        }
        Self { script }
    }

    /// `steps` positions evenly spaced by `step_deg`, starting at 0°.
    pub fn evenly_spaced(steps: u32, step_deg: f64) -> Self {
        let angles: Vec<f64> = (0..steps).map(|i| f64::from(i) * step_deg).collect();
        Self::rotation(&angles)
    }

    /// Start the script; returns the host end of the link.
    pub fn spawn(self) -> (StreamLink<DuplexStream>, MockControllerHandle) {
        let (host, device) = duplex(4096);
        let acks = Arc::new(AtomicU32::new(0));
        let disconnected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_script(
            self.script,
            device,
            Arc::clone(&acks),
            Arc::clone(&disconnected),
        ));

        (
            StreamLink::new("mock-controller", host),
            MockControllerHandle {
                acks,
                disconnected,
                task,
            },
        )
    }
}

async fn run_script(
    script: Vec<ControllerAction>,
    device: DuplexStream,
    acks: Arc<AtomicU32>,
    disconnected: Arc<AtomicBool>,
) {
    let (read_half, mut write_half) = tokio::io::split(device);
    let mut lines = BufReader::new(read_half).lines();

    for action in script {
        match action {
            ControllerAction::Send(line) => {
                if write_half
                    .write_all(format!("{line}\n").as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ControllerAction::AwaitAck => loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim() == "ok" => {
                        acks.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => {
                        disconnected.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            },
            ControllerAction::Pause(duration) => sleep(duration).await,
        }
    }

    // Script done: keep draining until the host hangs up
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == "ok" => {
                acks.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    disconnected.store(true, Ordering::SeqCst);
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ControllerLink;
    use crate::protocol::{parse_line, HandshakeEvent};

    #[tokio::test]
    async fn test_sensor_lifecycle() {
        let mut sensor = SimulatedSensor::new(8, 4).with_readout(Duration::ZERO);
        let probe = sensor.probe();

        // Cannot grab before streaming
        assert!(sensor.grab(Duration::from_millis(50)).await.is_err());

        let applied = sensor.configure(Duration::from_millis(2)).await.unwrap();
        assert_eq!(applied, Duration::from_millis(2));
        sensor.start_stream().await.unwrap();
        assert!(probe.is_streaming().await);

        let frame = sensor.grab(Duration::from_millis(500)).await.unwrap();
        assert_eq!(frame.pixels.len(), 32);
        assert!(frame.finished >= frame.started);

        sensor.close().await.unwrap();
        assert!(probe.is_closed().await);
        assert!(!probe.is_streaming().await);
        // Can close multiple times (idempotent)
        sensor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_opened_sessions_share_probe_state() {
        let mut sensor = SimulatedSensor::new(2, 2)
            .with_readout(Duration::ZERO)
            .with_start_fault_at(1, StartFault::Fail("no buffers".into()));
        let probe = sensor.probe();
        assert_eq!(probe.opens().await, 0);

        let mut session = sensor.open().await.unwrap();
        assert_eq!(probe.opens().await, 1);
        session.configure(Duration::from_millis(1)).await.unwrap();
        assert!(session.start_stream().await.is_err());
        assert!(!probe.is_streaming().await);
        session.start_stream().await.unwrap();
        assert_eq!(probe.stream_starts().await, 1);
        session.close().await.unwrap();
        assert!(probe.is_closed().await);
    }

    #[tokio::test]
    async fn test_sensor_scripted_faults() {
        let mut sensor = SimulatedSensor::new(2, 2)
            .with_readout(Duration::ZERO)
            .with_fault_at(2, GrabFault::Fail("bus error".into()))
            .with_faults_from(4, GrabFault::Timeout);
        sensor.configure(Duration::from_millis(1)).await.unwrap();
        sensor.start_stream().await.unwrap();

        let timeout = Duration::from_millis(20);
        assert!(sensor.grab(timeout).await.is_ok());
        assert_eq!(
            sensor.grab(timeout).await.unwrap_err(),
            GrabError::Failed("bus error".into())
        );
        assert!(sensor.grab(timeout).await.is_ok());
        assert_eq!(
            sensor.grab(timeout).await.unwrap_err(),
            GrabError::Timeout(timeout)
        );
        assert_eq!(
            sensor.grab(timeout).await.unwrap_err(),
            GrabError::Timeout(timeout)
        );
    }

    #[tokio::test]
    async fn test_sensor_stall_beyond_timeout_times_out() {
        let mut sensor = SimulatedSensor::new(2, 2)
            .with_fault_at(1, GrabFault::Stall(Duration::from_millis(200)));
        sensor.configure(Duration::from_millis(1)).await.unwrap();
        sensor.start_stream().await.unwrap();

        let result = sensor.grab(Duration::from_millis(30)).await;
        assert_eq!(result.unwrap_err(), GrabError::Timeout(Duration::from_millis(30)));
    }

    #[tokio::test]
    async fn test_constant_pattern() {
        let mut sensor = SimulatedSensor::new(3, 3)
            .with_channels(3)
            .with_readout(Duration::ZERO)
            .with_pattern(PixelPattern::Constant(42));
        sensor.configure(Duration::from_millis(1)).await.unwrap();
        sensor.start_stream().await.unwrap();
        let frame = sensor.grab(Duration::from_millis(100)).await.unwrap();
        assert_eq!(frame.pixels.len(), 27);
        assert_eq!(frame.mean_intensity(), Some(42.0));
    }

    #[tokio::test]
    async fn test_spectrometer_peak_drifts() {
        let mut spectrometer = SimulatedSpectrometer::new(532.0, 1.0);
        let first = spectrometer.acquire().await.unwrap();
        let second = spectrometer.acquire().await.unwrap();
        assert_eq!(first.peak_wavelength(), Some(532.0));
        assert_eq!(second.peak_wavelength(), Some(533.0));

        spectrometer.close().await.unwrap();
        assert!(spectrometer.acquire().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_controller_script() {
        let (mut link, handle) = MockController::rotation(&[12.5]).spawn();
        let timeout = Duration::from_millis(500);

        assert_eq!(parse_line(&link.read_line(timeout).await.unwrap()), HandshakeEvent::Ready);
        link.write_ack().await.unwrap();
        assert_eq!(
            parse_line(&link.read_line(timeout).await.unwrap()),
            HandshakeEvent::CaptureRequest { angle: Some(12.5) }
        );
        link.write_ack().await.unwrap();
        link.close().await.unwrap();

        assert!(handle_joined(handle, 2).await);
    }

    async fn handle_joined(handle: MockControllerHandle, expected_acks: u32) -> bool {
        let acks = handle.acks.clone();
        let disconnected = tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .unwrap_or(false);
        disconnected && acks.load(Ordering::SeqCst) == expected_acks
    }
}
