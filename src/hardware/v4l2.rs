//! Video4Linux2 imaging sensor.
//!
//! The `v4l` crate is blocking and its capture stream borrows the device, so the
//! device lives on a dedicated thread that owns both. The async session talks to it
//! over a command channel and receives each reply on a oneshot channel. Every reply is
//! awaited with a timeout.
//!
//! Each grab arms the capture stream's poll timeout, so the device thread never blocks
//! past the grab timeout on a camera that stopped delivering frames.
//!
//! Frames are negotiated as YUYV; the luma plane is delivered as a mono frame.
//! Exposure is set through `V4L2_CID_EXPOSURE_ABSOLUTE` (units of 100 µs) after
//! switching the device to manual exposure.

use crate::error::{AppResult, CaptureError, GrabError};
use crate::frame::Frame;
use crate::hardware::{SensorOpener, SensorSession};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const V4L2_EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_UNIT: Duration = Duration::from_micros(100);
const STREAM_BUFFERS: u32 = 4;
/// Bound on commands other than grab, and on joining the device thread.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_POLL: Duration = Duration::from_millis(10);
/// Slack for the device thread to report its own grab timeout.
const GRAB_REPLY_MARGIN: Duration = Duration::from_millis(500);
/// Longest poll timeout the v4l stream accepts (milliseconds in an `i32`).
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

type Reply<T> = oneshot::Sender<Result<T, String>>;

enum Command {
    Configure(Duration, Reply<Duration>),
    Start(Reply<()>),
    Stop(Reply<()>),
    Grab(Duration, oneshot::Sender<Result<Vec<u8>, GrabError>>),
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    width: u32,
    height: u32,
    stride: u32,
}

/// Opens `/dev/video<index>` once the run needs the sensor.
#[derive(Debug, Clone, Copy)]
pub struct V4l2Opener {
    pub index: u32,
    pub width: u32,
    pub height: u32,
}

#[async_trait]
impl SensorOpener for V4l2Opener {
    type Session = V4l2Sensor;

    async fn open(&mut self) -> AppResult<V4l2Sensor> {
        V4l2Sensor::open(self.index, self.width, self.height).await
    }
}

/// V4L2 camera session.
pub struct V4l2Sensor {
    name: String,
    geometry: Geometry,
    commands: Option<mpsc::Sender<Command>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl V4l2Sensor {
    /// Open `/dev/video<index>` and negotiate a YUYV format close to `width`x`height`.
    pub async fn open(index: u32, width: u32, height: u32) -> AppResult<Self> {
        let (tx, rx) = mpsc::channel(8);
        let (opened_tx, opened_rx) = oneshot::channel();

        let worker = std::thread::Builder::new()
            .name(format!("v4l2-video{index}"))
            .spawn(move || device_thread(index, width, height, rx, opened_tx))?;

        let (card, geometry) = opened_rx
            .await
            .map_err(|_| CaptureError::Sensor("device thread exited during open".into()))?
            .map_err(CaptureError::Sensor)?;
        info!(
            device = %format!("/dev/video{index}"),
            card = %card,
            width = geometry.width,
            height = geometry.height,
            "V4L2 sensor opened"
        );

        Ok(Self {
            name: format!("{card} (/dev/video{index})"),
            geometry,
            commands: Some(tx),
            worker: Some(worker),
        })
    }

    async fn request<T: Send>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command + Send,
        wait: Duration,
    ) -> Result<T, RequestError> {
        let commands = self.commands.as_ref().ok_or(RequestError::Closed)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(build(reply_tx))
            .await
            .map_err(|_| RequestError::Closed)?;
        match timeout(wait, reply_rx).await {
            Err(_) => Err(RequestError::Timeout),
            Ok(Err(_)) => Err(RequestError::Closed),
            Ok(Ok(reply)) => reply.map_err(RequestError::Device),
        }
    }

    fn sensor_error(&self, op: &str, err: RequestError) -> CaptureError {
        CaptureError::Sensor(format!("{}: {op} failed: {err}", self.name))
    }
}

#[derive(Debug)]
enum RequestError {
    Closed,
    Timeout,
    Device(String),
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "device thread is gone"),
            Self::Timeout => write!(f, "no reply from device"),
            Self::Device(msg) => write!(f, "{msg}"),
        }
    }
}

#[async_trait]
impl SensorSession for V4l2Sensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, integration: Duration) -> AppResult<Duration> {
        self.request(|reply| Command::Configure(integration, reply), COMMAND_TIMEOUT)
            .await
            .map_err(|e| self.sensor_error("configure", e))
    }

    async fn start_stream(&mut self) -> AppResult<()> {
        self.request(Command::Start, COMMAND_TIMEOUT)
            .await
            .map_err(|e| self.sensor_error("start stream", e))
    }

    async fn stop_stream(&mut self) -> AppResult<()> {
        if self.commands.is_none() {
            return Ok(());
        }
        self.request(Command::Stop, COMMAND_TIMEOUT)
            .await
            .map_err(|e| self.sensor_error("stop stream", e))
    }

    async fn grab(&mut self, grab_timeout: Duration) -> Result<Frame, GrabError> {
        let started = Instant::now();
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| GrabError::Failed(RequestError::Closed.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Grab(grab_timeout, reply_tx))
            .await
            .map_err(|_| GrabError::Failed(RequestError::Closed.to_string()))?;
        let raw = match timeout(grab_timeout.saturating_add(GRAB_REPLY_MARGIN), reply_rx).await {
            Err(_) => return Err(GrabError::Timeout(grab_timeout)),
            Ok(Err(_)) => return Err(GrabError::Failed(RequestError::Closed.to_string())),
            Ok(Ok(reply)) => reply?,
        };
        let luma = luma_plane(&raw, self.geometry).map_err(GrabError::Failed)?;
        Frame::new(self.geometry.width, self.geometry.height, 1, luma, started)
            .map_err(|e| GrabError::Failed(e.to_string()))
    }

    async fn close(&mut self) -> AppResult<()> {
        // Dropping the sender ends the device thread, which drops stream and device.
        if self.commands.take().is_none() {
            return Ok(());
        }
        if let Some(worker) = self.worker.take() {
            let deadline = Instant::now() + COMMAND_TIMEOUT;
            while !worker.is_finished() {
                if Instant::now() >= deadline {
                    // Dropping the handle detaches the thread; the device is released when it exits.
                    warn!(sensor = %self.name, "Device thread did not exit; detaching it");
                    return Err(CaptureError::Sensor(format!(
                        "{}: device thread did not exit within {COMMAND_TIMEOUT:?}",
                        self.name
                    )));
                }
                tokio::time::sleep(JOIN_POLL).await;
            }
            worker
                .join()
                .map_err(|_| CaptureError::Sensor("device thread panicked".into()))?;
        }
        debug!(sensor = %self.name, "V4L2 sensor closed");
        Ok(())
    }
}

/// Extract the Y samples of a YUYV buffer, honoring the line stride.
fn luma_plane(raw: &[u8], geometry: Geometry) -> Result<Vec<u8>, String> {
    let (width, height) = (geometry.width as usize, geometry.height as usize);
    let stride = (geometry.stride as usize).max(width * 2);
    if raw.len() < stride * (height.saturating_sub(1)) + width * 2 {
        return Err(format!(
            "short buffer: {} bytes for {}x{} YUYV",
            raw.len(),
            width,
            height
        ));
    }
    let mut luma = Vec::with_capacity(width * height);
    for row in raw.chunks(stride).take(height) {
        luma.extend(row.iter().step_by(2).take(width));
    }
    Ok(luma)
}

fn device_thread(
    index: u32,
    width: u32,
    height: u32,
    mut commands: mpsc::Receiver<Command>,
    opened: oneshot::Sender<Result<(String, Geometry), String>>,
) {
    let device = match open_device(index, width, height) {
        Ok((device, card, geometry)) => {
            let _ = opened.send(Ok((card, geometry)));
            device
        }
        Err(err) => {
            let _ = opened.send(Err(err));
            return;
        }
    };

    let mut stream: Option<Stream<'_>> = None;
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Configure(integration, reply) => {
                let _ = reply.send(set_exposure(&device, integration));
            }
            Command::Start(reply) => {
                let result = if stream.is_some() {
                    Ok(())
                } else {
                    Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)
                        .map(|s| stream = Some(s))
                        .map_err(|e| e.to_string())
                };
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                stream = None;
                let _ = reply.send(Ok(()));
            }
            Command::Grab(wait, reply) => {
                let result = match stream.as_mut() {
                    Some(stream) => next_frame(stream, wait),
                    None => Err(GrabError::Failed("stream not started".to_string())),
                };
                if reply.send(result).is_err() {
                    warn!(index, "Grab reply dropped; requester timed out");
                }
            }
        }
    }
}

/// A zero poll timeout would return at once, so at least 1 ms is used.
fn poll_timeout(wait: Duration) -> Duration {
    wait.clamp(Duration::from_millis(1), MAX_POLL_TIMEOUT)
}

/// Dequeue one buffer, giving up after `wait`.
fn next_frame(stream: &mut Stream<'_>, wait: Duration) -> Result<Vec<u8>, GrabError> {
    stream.set_timeout(poll_timeout(wait));
    match stream.next() {
        Ok((buf, _meta)) => Ok(buf.to_vec()),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(GrabError::Timeout(wait)),
        Err(e) => Err(GrabError::Failed(e.to_string())),
    }
}

fn open_device(index: u32, width: u32, height: u32) -> Result<(Device, String, Geometry), String> {
    let device = Device::new(index as usize).map_err(|e| format!("open: {e}"))?;
    let caps = device.query_caps().map_err(|e| format!("query caps: {e}"))?;

    let mut fmt = device.format().map_err(|e| format!("get format: {e}"))?;
    fmt.width = width;
    fmt.height = height;
    fmt.fourcc = FourCC::new(b"YUYV");
    let fmt = device.set_format(&fmt).map_err(|e| format!("set format: {e}"))?;
    if fmt.fourcc != FourCC::new(b"YUYV") {
        return Err(format!("device does not support YUYV (got {})", fmt.fourcc));
    }

    Ok((
        device,
        caps.card,
        Geometry {
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
        },
    ))
}

fn set_exposure(device: &Device, integration: Duration) -> Result<Duration, String> {
    let units = (integration.as_micros() / EXPOSURE_UNIT.as_micros()).max(1) as i64;
    device
        .set_control(Control {
            id: V4L2_CID_EXPOSURE_AUTO,
            value: Value::Integer(V4L2_EXPOSURE_MANUAL),
        })
        .map_err(|e| format!("manual exposure: {e}"))?;
    device
        .set_control(Control {
            id: V4L2_CID_EXPOSURE_ABSOLUTE,
            value: Value::Integer(units),
        })
        .map_err(|e| format!("exposure: {e}"))?;

    let applied = match device.control(V4L2_CID_EXPOSURE_ABSOLUTE) {
        Ok(Control {
            value: Value::Integer(v),
            ..
        }) => v.max(0) as u32,
        _ => units as u32,
    };
    Ok(EXPOSURE_UNIT * applied)
}
