//! ==============================================================================
//! report.rs - progress and end-of-night summaries
//! ==============================================================================
//!
//! purpose:
//!     the scheduler calls `periodic` every few readings and `end_of_night`
//!     once the night's data has been flushed. the nightly summary reads the
//!     data files back (datafile.rs) and keeps one line per night in
//!     `Statistics_<short>_<obs>.dat`.
//!
//! ==============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::datafile::{self, DataRecord};
use crate::reading::LocalTime;
use crate::store::FileSet;

pub struct ReportContext<'a> {
    pub files: &'a FileSet,
    pub iteration: u64,
}

pub trait ReportHook {
    fn periodic(&mut self, ctx: &ReportContext) -> Result<()>;
    fn end_of_night(&mut self, ctx: &ReportContext) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NightStatistics {
    /// `YYYYMMDD` of the evening the night started.
    pub night: String,
    pub count: usize,
    pub median_brightness: f64,
    pub min_brightness: f64,
    pub max_brightness: f64,
    pub min_temperature: f64,
    pub max_temperature: f64,
}

impl NightStatistics {
    pub fn from_records(records: &[DataRecord]) -> Option<Self> {
        let first = records.first()?;
        let mut brightness: Vec<f64> = records.iter().map(|r| r.sky_brightness).collect();
        brightness.sort_by(f64::total_cmp);
        let mid = brightness.len() / 2;
        let median = if brightness.len() % 2 == 0 {
            (brightness[mid - 1] + brightness[mid]) / 2.0
        } else {
            brightness[mid]
        };

        let temperatures = records.iter().map(|r| r.temperature);
        Some(Self {
            night: (first.local - ChronoDuration::hours(12))
                .date()
                .format("%Y%m%d")
                .to_string(),
            count: records.len(),
            median_brightness: median,
            min_brightness: brightness[0],
            max_brightness: brightness[brightness.len() - 1],
            min_temperature: temperatures.clone().fold(f64::INFINITY, f64::min),
            max_temperature: temperatures.fold(f64::NEG_INFINITY, f64::max),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{};{};{:.4};{:.4};{:.4};{:.1};{:.1}\n",
            self.night,
            self.count,
            self.median_brightness,
            self.min_brightness,
            self.max_brightness,
            self.min_temperature,
            self.max_temperature
        )
    }
}

/// Logs progress during the night and appends the nightly statistics line.
pub struct NightlySummary {
    statistics_path: PathBuf,
    stem: String,
    local_time: LocalTime,
}

impl NightlySummary {
    pub fn new(config: &DaemonConfig, local_time: LocalTime) -> Self {
        let stem = config.file_stem();
        Self {
            statistics_path: config
                .paths
                .summary_data_directory
                .join(format!("Statistics_{stem}.dat")),
            stem,
            local_time,
        }
    }

    #[cfg(test)]
    pub fn statistics_path(&self) -> &Path {
        &self.statistics_path
    }

    fn header(&self) -> String {
        format!(
            "# Summary statistics for {}\n\
             # Description of columns (CSV file):\n\
             # Col 1: Date\n\
             # Col 2: Total measures\n\
             # Col 3: Median NSB (mag/arcsec2)\n\
             # Col 4: Min NSB (mag/arcsec2)\n\
             # Col 5: Max NSB (mag/arcsec2)\n\
             # Col 6: Min Temp (C)\n\
             # Col 7: Max Temp (C)\n\n",
            self.stem
        )
    }

    fn statistics(&self, path: &Path) -> Result<Option<NightStatistics>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = datafile::load(path, &self.local_time)
            .with_context(|| format!("failed to read {}", path.display()))?;
        debug!(
            "[REPORT] {}: {} records from serial {}",
            path.display(),
            file.records.len(),
            file.serial_number.as_deref().unwrap_or("unknown")
        );
        Ok(NightStatistics::from_records(&file.records))
    }

    /// Rewrite the statistics file with `stats`, replacing an earlier line
    /// for the same night.
    fn write_statistics(&self, stats: &NightStatistics) -> Result<()> {
        let path = &self.statistics_path;
        let existing = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };

        let prefix = format!("{};", stats.night);
        let mut content = self.header();
        for line in existing.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(&prefix) {
                continue;
            }
            content.push_str(line);
            content.push('\n');
        }
        content.push_str(&stats.to_line());

        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(content.as_bytes())
            .context("failed to write statistics")?;
        tmp.persist(path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl ReportHook for NightlySummary {
    fn periodic(&mut self, ctx: &ReportContext) -> Result<()> {
        if let Some(stats) = self.statistics(&ctx.files.current)? {
            info!(
                "[REPORT] #{} {} readings tonight, median {:.2}, darkest {:.2} mag/arcsec2",
                ctx.iteration, stats.count, stats.median_brightness, stats.max_brightness
            );
        }
        Ok(())
    }

    fn end_of_night(&mut self, ctx: &ReportContext) -> Result<()> {
        let Some(stats) = self.statistics(&ctx.files.daily)? else {
            info!("[REPORT] No data recorded last night");
            return Ok(());
        };
        self.write_statistics(&stats)?;
        info!(
            "[REPORT] Night {}: {} readings, median {:.2} mag/arcsec2 -> {}",
            stats.night,
            stats.count,
            stats.median_brightness,
            self.statistics_path.display()
        );
        Ok(())
    }
}
