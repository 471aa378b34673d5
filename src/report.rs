//! Per-run timing table.
//!
//! The table has one row per recorded step, then a `RESUMEN` row with column
//! means and a `TOTAL` row with the wall time of the whole run. Cells that do
//! not apply to a row hold [`NOT_APPLICABLE`]. Downstream analysis depends on
//! the column names and their order, so both are fixed here.

use crate::error::{AppResult, CaptureError};
use crate::timing::{RunSummary, StepTiming};
use chrono::{DateTime, Local};
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Number of columns in every row.
pub const COLUMN_COUNT: usize = 9;

/// Column headers, in output order.
pub const COLUMNS: [&str; COLUMN_COUNT] = [
    "Foto",
    "Timestamp",
    "Ángulo (°)",
    "Tiempo integración (ms)",
    "Tiempo sistema sin integración (ms)",
    "Delay entre fotos (ms)",
    "Tiempo total captura (ms)",
    "Resolución temporal real (ms)",
    "Media intensidad",
];

/// Marker for cells that do not apply to a row (or a value that is unknown).
pub const NOT_APPLICABLE: &str = "-";
/// Label of the means row.
pub const SUMMARY_LABEL: &str = "RESUMEN";
/// Label of the whole-run duration row.
pub const TOTAL_LABEL: &str = "TOTAL";
/// Timestamp layout of step rows (microsecond resolution).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

type Row = [String; COLUMN_COUNT];

/// One successfully captured step. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// 1-based, contiguous
    pub index: u32,
    pub timestamp: DateTime<Local>,
    /// `None` when the controller did not supply a readable angle
    pub angle: Option<f64>,
    pub integration_ms: u64,
    pub system_overhead_ms: f64,
    pub delay_ms: u64,
    pub total_capture_ms: f64,
    pub temporal_resolution_ms: f64,
    pub mean_intensity: Option<f64>,
}

impl StepRecord {
    pub fn new(
        index: u32,
        timestamp: DateTime<Local>,
        angle: Option<f64>,
        integration_ms: u64,
        delay_ms: u64,
        timing: StepTiming,
        mean_intensity: Option<f64>,
    ) -> Self {
        Self {
            index,
            timestamp,
            angle,
            integration_ms,
            system_overhead_ms: timing.system_overhead_ms,
            delay_ms,
            total_capture_ms: timing.total_capture_ms,
            temporal_resolution_ms: timing.temporal_resolution_ms,
            mean_intensity,
        }
    }

    fn to_row(&self) -> Row {
        [
            self.index.to_string(),
            self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            opt_fixed(self.angle),
            self.integration_ms.to_string(),
            fixed(self.system_overhead_ms),
            self.delay_ms.to_string(),
            fixed(self.total_capture_ms),
            fixed(self.temporal_resolution_ms),
            opt_fixed(self.mean_intensity),
        ]
    }
}

fn fixed(value: f64) -> String {
    format!("{value:.2}")
}

fn opt_fixed(value: Option<f64>) -> String {
    value.map_or_else(|| NOT_APPLICABLE.to_string(), fixed)
}

fn na() -> String {
    NOT_APPLICABLE.to_string()
}

/// Accumulates step records and renders the final table.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    integration_ms: u64,
    delay_ms: u64,
    records: Vec<StepRecord>,
}

impl ReportBuilder {
    pub fn new(integration_ms: u64, delay_ms: u64) -> Self {
        Self {
            integration_ms,
            delay_ms,
            records: Vec::new(),
        }
    }

    /// Append a record. Indices must continue the sequence `1, 2, 3, ...`.
    pub fn push(&mut self, record: StepRecord) -> AppResult<()> {
        let expected = self.records.len() as u32 + 1;
        if record.index != expected {
            return Err(CaptureError::Report(format!(
                "step record {} out of sequence, expected {}",
                record.index, expected
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }

    fn summary_row(&self, summary: &RunSummary) -> Row {
        match summary.means {
            Some(means) => [
                SUMMARY_LABEL.to_string(),
                na(),
                na(),
                self.integration_ms.to_string(),
                fixed(means.system_overhead_ms),
                self.delay_ms.to_string(),
                fixed(means.total_capture_ms),
                fixed(means.temporal_resolution_ms),
                opt_fixed(means.mean_intensity),
            ],
            None => [
                SUMMARY_LABEL.to_string(),
                na(),
                na(),
                self.integration_ms.to_string(),
                na(),
                self.delay_ms.to_string(),
                na(),
                na(),
                na(),
            ],
        }
    }

    fn total_row(summary: &RunSummary) -> Row {
        [
            TOTAL_LABEL.to_string(),
            na(),
            na(),
            na(),
            na(),
            na(),
            fixed(summary.total_run_ms),
            na(),
            na(),
        ]
    }

    /// Every row of the table (without the header).
    pub fn rows(&self, summary: &RunSummary) -> Vec<Row> {
        let mut rows: Vec<Row> = self.records.iter().map(StepRecord::to_row).collect();
        rows.push(self.summary_row(summary));
        rows.push(Self::total_row(summary));
        rows
    }

    /// Write header and rows as CSV.
    pub fn write_to<W: Write>(&self, writer: W, summary: &RunSummary) -> AppResult<()> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(COLUMNS)?;
        for row in self.rows(summary) {
            csv.write_record(&row)?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Write the table to `path`, replacing any previous file.
    pub fn write_csv(&self, path: &Path, summary: &RunSummary) -> AppResult<()> {
        let file = std::fs::File::create(path)?;
        self.write_to(file, summary)?;
        info!(
            path = %path.display(),
            steps = self.records.len(),
            "Timing report written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::summarize;
    use chrono::TimeZone;
    use std::time::Duration;

    fn record(index: u32, angle: Option<f64>, total: f64, mean: Option<f64>) -> StepRecord {
        let ts = Local.with_ymd_and_hms(2025, 5, 28, 10, 30, 0).unwrap();
        StepRecord::new(
            index,
            ts,
            angle,
            32,
            5,
            StepTiming::from_total(total, 32, 5),
            mean,
        )
    }

    fn render(builder: &ReportBuilder, summary: &RunSummary) -> String {
        let mut out = Vec::new();
        builder.write_to(&mut out, summary).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_header_order() {
        let builder = ReportBuilder::new(32, 5);
        let csv = render(&builder, &summarize(&[], Duration::ZERO));
        let header = csv.lines().next().unwrap();
        assert_eq!(header, COLUMNS.join(","));
    }

    #[test]
    fn test_step_summary_and_total_rows() {
        let mut builder = ReportBuilder::new(32, 5);
        builder.push(record(1, Some(12.5), 40.0, Some(100.0))).unwrap();
        builder.push(record(2, Some(25.0), 44.0, Some(50.0))).unwrap();

        let summary = summarize(builder.records(), Duration::from_millis(2500));
        let rows = builder.rows(&summary);
        assert_eq!(rows.len(), 4);

        assert_eq!(
            rows[0],
            [
                "1",
                "20250528_103000_000000",
                "12.50",
                "32",
                "8.00",
                "5",
                "40.00",
                "45.00",
                "100.00"
            ]
            .map(String::from)
        );
        assert_eq!(
            rows[2],
            ["RESUMEN", "-", "-", "32", "10.00", "5", "42.00", "47.00", "75.00"].map(String::from)
        );
        assert_eq!(
            rows[3],
            ["TOTAL", "-", "-", "-", "-", "-", "2500.00", "-", "-"].map(String::from)
        );
    }

    #[test]
    fn test_unknown_angle_and_missing_statistic_use_marker() {
        let mut builder = ReportBuilder::new(32, 5);
        builder.push(record(1, None, 30.0, None)).unwrap();
        let summary = summarize(builder.records(), Duration::from_millis(31));
        let rows = builder.rows(&summary);
        assert_eq!(rows[0][2], NOT_APPLICABLE);
        assert_eq!(rows[0][4], "-2.00");
        assert_eq!(rows[0][8], NOT_APPLICABLE);
        assert_eq!(rows[1][8], NOT_APPLICABLE);
    }

    #[test]
    fn test_empty_run_has_no_data_summary() {
        let builder = ReportBuilder::new(32, 5);
        let summary = summarize(builder.records(), Duration::from_millis(750));
        let rows = builder.rows(&summary);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            ["RESUMEN", "-", "-", "32", "-", "5", "-", "-", "-"].map(String::from)
        );
        assert_eq!(rows[1][6], "750.00");
    }

    #[test]
    fn test_push_rejects_gaps_and_repeats() {
        let mut builder = ReportBuilder::new(32, 5);
        builder.push(record(1, None, 30.0, None)).unwrap();
        assert!(builder.push(record(1, None, 30.0, None)).is_err());
        assert!(builder.push(record(3, None, 30.0, None)).is_err());
        builder.push(record(2, None, 30.0, None)).unwrap();
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn test_write_csv_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiempos.csv");
        let mut builder = ReportBuilder::new(32, 5);
        builder.push(record(1, Some(0.0), 40.0, Some(1.0))).unwrap();
        builder
            .write_csv(&path, &summarize(builder.records(), Duration::from_secs(1)))
            .unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), COLUMNS.to_vec());
        let labels: Vec<String> = reader
            .records()
            .map(|r| r.unwrap()[0].to_string())
            .collect();
        assert_eq!(labels, vec!["1", "RESUMEN", "TOTAL"]);
    }
}
