//! Asynchronous persistence of captured frames and spectra.
//!
//! The control loop hands a job to [`ImageSink::submit`] and moves on; the sink
//! owns the data from then on. Encoding and writing run on Tokio's blocking pool,
//! at most `workers` at a time. [`ImageSink::flush`] joins every outstanding job
//! and must be called before the process exits.
//!
//! A failed write is logged and counted. It never stops the run: the capture
//! itself succeeded and its step record stands.

use crate::frame::Frame;
use crate::hardware::Spectrum;
use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Raster encoding of persisted frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Bmp,
    Tiff,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
            Self::Png => "png",
        }
    }

    fn codec(self) -> image::ImageFormat {
        match self {
            Self::Bmp => image::ImageFormat::Bmp,
            Self::Tiff => image::ImageFormat::Tiff,
            Self::Png => image::ImageFormat::Png,
        }
    }
}

/// Work item owned by the sink.
#[derive(Debug)]
pub enum SinkJob {
    Image { frame: Frame, path: PathBuf },
    Spectrum { spectrum: Spectrum, path: PathBuf },
}

impl SinkJob {
    pub fn path(&self) -> &Path {
        match self {
            Self::Image { path, .. } | Self::Spectrum { path, .. } => path,
        }
    }

    fn write(self, format: ImageFormat) -> Result<()> {
        match self {
            Self::Image { frame, path } => write_frame(frame, &path, format),
            Self::Spectrum { spectrum, path } => write_spectrum(&spectrum, &path),
        }
    }
}

/// Outcome counts after [`ImageSink::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub written: usize,
    pub failed: usize,
}

/// Bounded, tracked pool of persistence jobs.
pub struct ImageSink {
    format: ImageFormat,
    permits: Arc<Semaphore>,
    jobs: JoinSet<bool>,
    stats: SinkStats,
}

impl ImageSink {
    pub fn new(workers: usize, format: ImageFormat) -> Self {
        Self {
            format,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            jobs: JoinSet::new(),
            stats: SinkStats::default(),
        }
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Jobs submitted but not yet joined.
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Schedule a job. Never waits for a worker.
    pub fn submit(&mut self, job: SinkJob) {
        let permits = Arc::clone(&self.permits);
        let format = self.format;
        self.jobs.spawn(async move {
            let path = job.path().to_path_buf();
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(path = %path.display(), "Sink closed before job could run");
                return false;
            };
            match tokio::task::spawn_blocking(move || job.write(format)).await {
                Ok(Ok(())) => {
                    debug!(path = %path.display(), "Persisted");
                    true
                }
                Ok(Err(e)) => {
                    warn!(path = %path.display(), error = %format!("{e:#}"), "Persistence failed");
                    false
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Persistence task panicked");
                    false
                }
            }
        });
    }

    /// Wait for every outstanding job and return the running totals.
    pub async fn flush(&mut self) -> SinkStats {
        while let Some(joined) = self.jobs.join_next().await {
            match joined {
                Ok(true) => self.stats.written += 1,
                Ok(false) => self.stats.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Sink job aborted");
                    self.stats.failed += 1;
                }
            }
        }
        self.stats
    }
}

/// Take over a frame's pixel buffer as an image. Mono frames become 8-bit
/// grayscale; 3-channel frames carry BGR samples and are swapped to RGB in place.
fn frame_image(frame: Frame) -> Result<DynamicImage> {
    let (width, height) = (frame.width, frame.height);
    let image = match frame.channels {
        1 => GrayImage::from_raw(width, height, frame.pixels).map(DynamicImage::ImageLuma8),
        3 => {
            let mut pixels = frame.pixels;
            for bgr in pixels.chunks_exact_mut(3) {
                bgr.swap(0, 2);
            }
            RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8)
        }
        other => return Err(anyhow!("Unsupported channel count {other}")),
    };
    image.ok_or_else(|| anyhow!("Failed to create image buffer from frame data"))
}

fn write_frame(frame: Frame, path: &Path, format: ImageFormat) -> Result<()> {
    frame_image(frame)?
        .save_with_format(path, format.codec())
        .with_context(|| format!("Failed to encode {} to {:?}", format.extension(), path))
}

fn write_spectrum(spectrum: &Spectrum, path: &Path) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
    writer.write_record(["Longitud de onda (nm)", "Intensidad"])?;
    for (wl, intensity) in spectrum.wavelengths_nm.iter().zip(&spectrum.intensities) {
        writer.write_record([wl.to_string(), intensity.to_string()])?;
    }
    writer.flush().context("Failed to flush spectrum CSV")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame(channels: u8, value: u8) -> Frame {
        Frame::new(4, 2, channels, vec![value; 8 * channels as usize], Instant::now()).unwrap()
    }

    #[test]
    fn test_frame_image_takes_over_pixel_buffer() {
        let mono = frame(1, 5);
        let buffer = mono.pixels.as_ptr();
        let DynamicImage::ImageLuma8(img) = frame_image(mono).unwrap() else {
            panic!("mono frame should become a luma image");
        };
        assert_eq!(img.as_raw().as_ptr(), buffer);

        let bgr = Frame::new(1, 1, 3, vec![1, 2, 3], Instant::now()).unwrap();
        let DynamicImage::ImageRgb8(img) = frame_image(bgr).unwrap() else {
            panic!("3-channel frame should become an RGB image");
        };
        assert_eq!(img.as_raw(), &vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_flush_joins_all_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ImageSink::new(2, ImageFormat::Bmp);

        for i in 0..6 {
            sink.submit(SinkJob::Image {
                frame: frame(1, 10 * i as u8),
                path: dir.path().join(format!("foto_{i}.bmp")),
            });
        }
        let stats = sink.flush().await;
        assert_eq!(stats, SinkStats { written: 6, failed: 0 });
        assert_eq!(sink.pending(), 0);

        for i in 0..6 {
            let img = image::open(dir.path().join(format!("foto_{i}.bmp")))
                .unwrap()
                .to_luma8();
            assert_eq!(img.dimensions(), (4, 2));
            assert!(img.pixels().all(|p| p.0[0] == 10 * i as u8));
        }
    }

    #[tokio::test]
    async fn test_bgr_frames_are_written_as_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("color.png");
        let mut pixels = Vec::new();
        for _ in 0..8 {
            pixels.extend_from_slice(&[1, 2, 3]); // B, G, R
        }
        let frame = Frame::new(4, 2, 3, pixels, Instant::now()).unwrap();

        let mut sink = ImageSink::new(1, ImageFormat::Png);
        sink.submit(SinkJob::Image {
            frame,
            path: path.clone(),
        });
        assert_eq!(sink.flush().await.written, 1);

        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [3, 2, 1]);
    }

    #[tokio::test]
    async fn test_failed_write_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ImageSink::new(1, ImageFormat::Bmp);
        sink.submit(SinkJob::Image {
            frame: frame(1, 0),
            path: dir.path().join("missing-dir").join("foto_1.bmp"),
        });
        sink.submit(SinkJob::Image {
            frame: frame(1, 0),
            path: dir.path().join("foto_2.bmp"),
        });
        let stats = sink.flush().await;
        assert_eq!(stats, SinkStats { written: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_spectrum_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("espectro_1.csv");
        let mut sink = ImageSink::new(1, ImageFormat::Bmp);
        sink.submit(SinkJob::Spectrum {
            spectrum: Spectrum {
                wavelengths_nm: vec![500.0, 500.5],
                intensities: vec![10.0, 20.0],
            },
            path: path.clone(),
        });
        assert_eq!(sink.flush().await.written, 1);

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("Longitud de onda (nm),Intensidad"));
        assert_eq!(lines.next(), Some("500,10"));
        assert_eq!(lines.next(), Some("500.5,20"));
    }
}
