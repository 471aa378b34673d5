//! Captured frames and the stacking policy.
//!
//! A [`Frame`] owns its pixel buffer. The step that captured it is the only owner
//! until it is moved into the image sink for write-out.

use crate::error::{AppResult, CaptureError};
use chrono::{DateTime, Local};
use std::time::Instant;

/// Owned 8-bit pixel buffer plus acquisition metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Interleaved samples per pixel (1 = mono, 3 = BGR)
    pub channels: u8,
    /// Row-major interleaved samples, `width * height * channels` long
    pub pixels: Vec<u8>,
    /// Wall-clock time the frame was delivered
    pub captured_at: DateTime<Local>,
    /// Monotonic instant the acquisition of this frame started
    pub started: Instant,
    /// Monotonic instant the frame was delivered
    pub finished: Instant,
}

impl Frame {
    /// Build a frame, checking that the buffer matches the declared geometry.
    pub fn new(
        width: u32,
        height: u32,
        channels: u8,
        pixels: Vec<u8>,
        started: Instant,
    ) -> AppResult<Self> {
        let expected = expected_len(width, height, channels)?;
        if pixels.len() != expected {
            return Err(CaptureError::Frame(format!(
                "buffer holds {} bytes, {}x{}x{} needs {}",
                pixels.len(),
                width,
                height,
                channels,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            pixels,
            captured_at: Local::now(),
            started,
            finished: Instant::now(),
        })
    }

    /// Mean over every sample of the frame, `None` for an empty buffer.
    pub fn mean_intensity(&self) -> Option<f64> {
        if self.pixels.is_empty() {
            return None;
        }
        let sum: u64 = self.pixels.iter().map(|&v| u64::from(v)).sum();
        Some(sum as f64 / self.pixels.len() as f64)
    }

    fn same_geometry(&self, other: &Self) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }
}

fn expected_len(width: u32, height: u32, channels: u8) -> AppResult<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(usize::from(channels)))
        .ok_or_else(|| CaptureError::Frame(format!("{width}x{height}x{channels} overflows")))
}

/// Reduce a stack of frames taken at the same step to one frame by per-pixel
/// averaging (rounded to nearest).
///
/// A single frame passes through untouched. The result keeps the wall-clock
/// timestamp of the last frame and spans from the first frame's start to the
/// last frame's delivery.
pub fn stack_frames(frames: Vec<Frame>) -> AppResult<Frame> {
    let count = frames.len();
    let mut iter = frames.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| CaptureError::Frame("cannot stack an empty frame list".to_string()))?;
    if count == 1 {
        return Ok(first);
    }

    let mut sums: Vec<u32> = first.pixels.iter().map(|&v| u32::from(v)).collect();
    let mut last_captured = first.captured_at;
    let mut last_finished = first.finished;

    for (i, frame) in iter.enumerate() {
        if !frame.same_geometry(&first) {
            return Err(CaptureError::Frame(format!(
                "stacked frame {} is {}x{}x{}, expected {}x{}x{}",
                i + 1,
                frame.width,
                frame.height,
                frame.channels,
                first.width,
                first.height,
                first.channels
            )));
        }
        for (acc, &v) in sums.iter_mut().zip(&frame.pixels) {
            *acc += u32::from(v);
        }
        last_captured = frame.captured_at;
        last_finished = frame.finished;
    }

    let n = count as u32;
    let pixels = sums
        .into_iter()
        .map(|sum| ((sum + n / 2) / n).min(u32::from(u8::MAX)) as u8)
        .collect();

    Ok(Frame {
        width: first.width,
        height: first.height,
        channels: first.channels,
        pixels,
        captured_at: last_captured,
        started: first.started,
        finished: last_finished,
    })
}
