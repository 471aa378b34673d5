//! [`ControllerLink`] over any async byte stream.
//!
//! Used with a `tokio_serial::SerialStream` for real hardware and with an
//! in-memory `tokio::io::DuplexStream` for the simulated controller.

use super::ControllerLink;
use crate::error::{AppResult, CaptureError};
use crate::protocol::ACK_TOKEN;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

/// Controller link backed by a buffered byte stream.
pub struct StreamLink<S> {
    /// Link label for logs (port name)
    label: String,
    /// `None` once closed
    stream: Option<BufReader<S>>,
    /// Bytes of a line whose terminator has not arrived yet
    pending: Vec<u8>,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(label: impl Into<String>, stream: S) -> Self {
        Self {
            label: label.into(),
            stream: Some(BufReader::new(stream)),
            pending: Vec::with_capacity(64),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.pending.clear();
        line
    }
}

#[async_trait]
impl<S> ControllerLink for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_line(&mut self, timeout: Duration) -> AppResult<String> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(CaptureError::SerialPortNotConnected)?;

        // read_until appends partial data to `pending` even when the timeout wins
        match tokio::time::timeout(timeout, stream.read_until(b'\n', &mut self.pending)).await {
            Err(_) => Err(CaptureError::LinkTimeout(timeout)),
            Ok(Err(e)) => Err(CaptureError::Io(e)),
            Ok(Ok(0)) if self.pending.is_empty() => Err(CaptureError::SerialUnexpectedEof),
            Ok(Ok(_)) => {
                let line = self.take_line();
                trace!(link = %self.label, line = %line, "Received controller line");
                Ok(line)
            }
        }
    }

    async fn write_ack(&mut self) -> AppResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(CaptureError::SerialPortNotConnected)?;

        let port = stream.get_mut();
        port.write_all(ACK_TOKEN.as_bytes()).await?;
        port.flush().await?;
        trace!(link = %self.label, "Sent acknowledgment");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let result = stream.get_mut().shutdown().await;
            debug!(link = %self.label, "Controller link closed");
            result?;
        }
        Ok(())
    }
}
