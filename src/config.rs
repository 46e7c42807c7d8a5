//! ==============================================================================
//! config.rs - Daemon Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `sqm.toml`.
//!     loads configuration from file or falls back to defaults.
//!     the loaded struct is immutable and handed by reference to the
//!     scheduler, sampler and store.
//!
//! structure:
//!     - SiteConfig: observatory name, coordinates and the sun altitude gate.
//!     - DeviceConfig: which photometer, where to find it, how hard to retry.
//!     - SamplingConfig: averaging, cadence and cache size.
//!     - TimeConfig: fixed UTC offset or named zone for local timestamps.
//!     - PathsConfig: where the monthly/daily/current/summary files live.
//!     - DatabaseConfig: optional SQLite sink.
//!     - LoggingConfig / RecoveryConfig: log level, restart and reboot policy.
//!
//! ==============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub site: SiteConfig,
    pub device: DeviceConfig,
    pub sampling: SamplingConfig,
    pub time: TimeConfig,
    pub paths: PathsConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SiteConfig {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Data is taken while the sun is below this altitude (degrees).
    pub horizon: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    #[serde(alias = "SQM-LE", alias = "SQM_LE")]
    Network,
    #[serde(alias = "SQM-LU", alias = "SQM_LU")]
    Serial,
}

impl DeviceKind {
    pub fn model_name(self) -> &'static str {
        match self {
            DeviceKind::Network => "SQM-LE",
            DeviceKind::Serial => "SQM-LU",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    /// Short name used in filenames ("SQM").
    pub short_type: String,
    /// Instrument ID for the header; defaults to `<model>-<site name>`.
    pub id: Option<String>,
    pub location_name: String,
    pub data_supplier: String,
    /// Fixed address (IP or serial port). Discovery is used when it fails or is absent.
    pub address: Option<String>,
    pub tcp_port: u16,
    pub baud_rate: u32,
    pub read_tries: u32,
    pub retry_backoff_seconds: f64,
    /// Wait between sending a command and reading the reply.
    pub settle_seconds: f64,
    pub receive_timeout_seconds: f64,
    /// Expected reply lengths; unset means "don't check".
    pub identify_length: Option<usize>,
    pub calibration_length: Option<usize>,
    pub data_length: Option<usize>,
    /// Cover offset, only reported in the file header.
    pub offset_calibration: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SamplingConfig {
    /// Number of reads averaged into one reading.
    pub measures_to_average: usize,
    pub pause_between_reads_seconds: f64,
    pub delay_between_measures_seconds: f64,
    /// Readings buffered before writing to disk.
    pub cache_measures: usize,
    /// Run the periodic report hook every N readings (0 disables it).
    pub report_each: u64,
    pub sigma: f64,
    pub day_idle_seconds: u64,
    /// Consecutive failed cycles before the session is rebuilt from scratch.
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimeConfig {
    /// Site time zone without daylight saving, hours east of UTC.
    pub utc_offset_hours: f64,
    /// IANA zone name; takes precedence over the fixed offset.
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PathsConfig {
    pub monthly_data_directory: PathBuf,
    pub daily_data_directory: PathBuf,
    pub current_data_directory: PathBuf,
    pub summary_data_directory: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub table: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_readings: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecoveryConfig {
    pub restart_delay_seconds: u64,
    pub reboot_on_connection_lost: bool,
    pub reboot_command: String,
    pub reboot_delay_seconds: u64,
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("sqm.toml"),
            PathBuf::from("..").join("config").join("sqm.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Instrument ID written in file headers.
    pub fn instrument_id(&self) -> String {
        self.device
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.device.kind.model_name(), self.site.name))
    }

    /// `<short>_<obs>`, the stem shared by the monthly, current and summary files.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.device.short_type, self.site.name)
    }

    pub fn create_directories(&self) -> Result<()> {
        for dir in [
            &self.paths.monthly_data_directory,
            &self.paths.daily_data_directory,
            &self.paths.current_data_directory,
            &self.paths.summary_data_directory,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│           DAEMON CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Site: {} ({:.4}, {:.4})", self.site.name, self.site.latitude, self.site.longitude);
        println!("│ Sun horizon: {}°", self.site.horizon);
        println!("│ Device: {} @ {}", self.device.kind.model_name(),
            self.device.address.as_deref().unwrap_or("auto"));
        println!("│ Averaging: {} reads, every {}s", self.sampling.measures_to_average,
            self.sampling.delay_between_measures_seconds);
        println!("│ Cache: {} readings", self.sampling.cache_measures);
        println!("│ Data: {}", self.paths.monthly_data_directory.display());
        println!("│ Database: {}", if self.database.enabled { "enabled" } else { "disabled" });
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

impl DeviceConfig {
    pub fn retry_backoff(&self) -> Duration {
        seconds(self.retry_backoff_seconds)
    }

    pub fn settle(&self) -> Duration {
        seconds(self.settle_seconds)
    }

    pub fn receive_timeout(&self) -> Duration {
        seconds(self.receive_timeout_seconds)
    }
}

impl SamplingConfig {
    pub fn pause_between_reads(&self) -> Duration {
        seconds(self.pause_between_reads_seconds)
    }

    pub fn delay_between_measures(&self) -> Duration {
        seconds(self.delay_between_measures_seconds)
    }

    pub fn day_idle(&self) -> Duration {
        Duration::from_secs(self.day_idle_seconds)
    }
}

impl RecoveryConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_seconds)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_secs(self.reboot_delay_seconds)
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: "OBS_NAME".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            horizon: 10.0,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Network,
            short_type: "SQM".to_string(),
            id: None,
            location_name: "Locality/State/Country - Observatory Name".to_string(),
            data_supplier: "Supplier Name / Institution".to_string(),
            address: Some("169.254.1.13".to_string()),
            tcp_port: crate::network::DEFAULT_PORT,
            baud_rate: crate::serial::DEFAULT_BAUD_RATE,
            read_tries: 10,
            retry_backoff_seconds: 1.0,
            settle_seconds: 1.0,
            receive_timeout_seconds: 5.0,
            identify_length: None,
            calibration_length: None,
            data_length: None,
            offset_calibration: -0.11,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            measures_to_average: 5,
            pause_between_reads_seconds: 10.0,
            delay_between_measures_seconds: 5.0,
            cache_measures: 5,
            report_each: 60,
            sigma: 3.0,
            day_idle_seconds: 300,
            max_consecutive_failures: 20,
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: 1.0,
            timezone: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = PathBuf::from("data");
        Self {
            daily_data_directory: base.join("daily_data"),
            current_data_directory: base.clone(),
            summary_data_directory: base.clone(),
            monthly_data_directory: base,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("data").join("sqm.sqlite"),
            table: "sqm_readings".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_readings: true,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            restart_delay_seconds: 30,
            reboot_on_connection_lost: false,
            reboot_command: "sudo reboot".to_string(),
            reboot_delay_seconds: 600,
        }
    }
}
