//! Serial port opening for the motion controller link.
//!
//! The controller is an Arduino-class board on a USB serial port (8N1, no flow
//! control). The opened port is wrapped in a [`StreamLink`] so the control loop
//! only ever sees the [`super::ControllerLink`] trait.

use super::StreamLink;
use crate::error::AppResult;

#[cfg(feature = "instrument_serial")]
use crate::error::CaptureError;
#[cfg(feature = "instrument_serial")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};
#[cfg(feature = "instrument_serial")]
use tracing::info;

/// Link type produced by [`open_serial`].
#[cfg(feature = "instrument_serial")]
pub type SerialLink = StreamLink<SerialStream>;

/// Open the controller serial port.
///
/// # Arguments
/// * `port_name` - Serial port path (e.g., "/dev/ttyACM0" on Linux, "COM5" on Windows)
/// * `baud_rate` - Communication speed (the controller firmware uses 9600)
#[cfg(feature = "instrument_serial")]
pub fn open_serial(port_name: &str, baud_rate: u32) -> AppResult<SerialLink> {
    let port = tokio_serial::new(port_name, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| {
            CaptureError::Io(std::io::Error::other(format!(
                "Failed to open serial port '{port_name}' at {baud_rate} baud: {e}"
            )))
        })?;

    info!(port = port_name, baud_rate, "Connected to motion controller");
    Ok(StreamLink::new(port_name, port))
}

#[cfg(not(feature = "instrument_serial"))]
pub fn open_serial(
    _port_name: &str,
    _baud_rate: u32,
) -> AppResult<StreamLink<tokio::io::DuplexStream>> {
    Err(crate::error::CaptureError::SerialFeatureDisabled)
}
