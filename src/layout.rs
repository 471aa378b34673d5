//! File layout of one run's output directory.
//!
//! ```text
//! imagenes_20250528_delay5ms_int32ms/
//! ├── foto_1_20250528.bmp
//! ├── espectro_1_20250528.csv          (with a spectrometer)
//! ├── ...
//! ├── tiempos_adquisicion_20250528_delay5ms_int32ms.csv
//! └── run_metadata.json
//! ```

use crate::config::RunConfiguration;
use crate::error::AppResult;
use crate::sink::ImageFormat;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::info;

/// Metadata sidecar file name.
pub const METADATA_FILE: &str = "run_metadata.json";

/// Paths of everything a run writes.
#[derive(Debug, Clone)]
pub struct RunLayout {
    dir: PathBuf,
    label: String,
    date_tag: String,
}

impl RunLayout {
    /// Compute the layout under `config.output_directory` without touching the disk.
    pub fn new(config: &RunConfiguration, date: NaiveDate) -> Self {
        Self {
            dir: config
                .output_directory
                .join(config.run_directory_name(date)),
            label: config.run_label(date),
            date_tag: date.format("%Y%m%d").to_string(),
        }
    }

    /// Create the run directory. An existing directory is reused.
    pub fn create_dir(&self) -> AppResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        info!(dir = %self.dir.display(), "Run output directory ready");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn image_path(&self, step: u32, format: ImageFormat) -> PathBuf {
        self.dir.join(format!(
            "foto_{step}_{}.{}",
            self.date_tag,
            format.extension()
        ))
    }

    pub fn spectrum_path(&self, step: u32) -> PathBuf {
        self.dir
            .join(format!("espectro_{step}_{}.csv", self.date_tag))
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir
            .join(format!("tiempos_adquisicion_{}.csv", self.label))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let config = RunConfiguration {
            output_directory: PathBuf::from("/data"),
            ..RunConfiguration::default()
        };
        let date = NaiveDate::from_ymd_opt(2025, 5, 28).unwrap();
        let layout = RunLayout::new(&config, date);

        assert_eq!(
            layout.dir(),
            Path::new("/data/imagenes_20250528_delay5ms_int32ms")
        );
        assert_eq!(
            layout.image_path(7, ImageFormat::Bmp),
            Path::new("/data/imagenes_20250528_delay5ms_int32ms/foto_7_20250528.bmp")
        );
        assert_eq!(
            layout.spectrum_path(7).file_name().unwrap(),
            "espectro_7_20250528.csv"
        );
        assert_eq!(
            layout.report_path().file_name().unwrap(),
            "tiempos_adquisicion_20250528_delay5ms_int32ms.csv"
        );
    }

    #[test]
    fn test_create_dir_only_on_request() {
        let root = tempfile::tempdir().unwrap();
        let config = RunConfiguration {
            output_directory: root.path().to_path_buf(),
            ..RunConfiguration::default()
        };
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let layout = RunLayout::new(&config, date);
        assert!(!layout.dir().exists());

        layout.create_dir().unwrap();
        assert!(layout.dir().is_dir());
        // existing directory is fine
        assert!(layout.create_dir().is_ok());
    }
}
