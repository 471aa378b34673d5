//! Controller link implementations
//!
//! This module contains the [`ControllerLink`] trait and its byte-stream
//! implementation, providing line-level I/O with the motion controller.

pub mod serial_adapter;
pub mod stream_link;

pub use serial_adapter::open_serial;
pub use stream_link::StreamLink;

use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;

/// Line-oriented session with the motion controller.
#[async_trait]
pub trait ControllerLink: Send {
    /// Read one line (without its terminator), waiting at most `timeout`.
    ///
    /// Fails with `CaptureError::LinkTimeout` when no complete line arrived in time.
    /// Bytes of a partial line are kept for the next call.
    async fn read_line(&mut self, timeout: Duration) -> AppResult<String>;

    /// Send the acknowledgment token the controller waits for before advancing.
    async fn write_ack(&mut self) -> AppResult<()>;

    /// Close the link. Idempotent.
    async fn close(&mut self) -> AppResult<()>;
}
