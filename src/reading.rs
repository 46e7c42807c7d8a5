//! One averaged photometer reading and the site's local time rule.

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::config::TimeConfig;

/// Timestamp layout shared by both time columns of a data line.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Immutable result of one sampling cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub utc: DateTime<Utc>,
    pub local: NaiveDateTime,
    pub temperature: f64,
    pub frequency: f64,
    pub ticks: f64,
    /// mag/arcsec²
    pub sky_brightness: f64,
}

impl Reading {
    /// `UTC;LOCAL;temp;ticks;freq;mag` with a trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{};{};{:.2};{:.3};{:.3};{:.3}\n",
            self.utc.format(TIMESTAMP_FORMAT),
            self.local.format(TIMESTAMP_FORMAT),
            self.temperature,
            self.ticks,
            self.frequency,
            self.sky_brightness
        )
    }
}

/// How UTC instants become local wall-clock time.
#[derive(Debug, Clone, Copy)]
pub enum LocalTime {
    /// Fixed offset, no daylight saving.
    Fixed { offset: FixedOffset, hours: f64 },
    Zone(Tz),
}

impl LocalTime {
    pub fn from_config(time: &TimeConfig) -> Result<Self> {
        if let Some(name) = &time.timezone {
            let zone: Tz = name
                .parse()
                .map_err(|e| anyhow!("unknown time zone {name:?}: {e}"))?;
            return Ok(LocalTime::Zone(zone));
        }
        let seconds = (time.utc_offset_hours * 3600.0).round() as i32;
        let offset = FixedOffset::east_opt(seconds)
            .ok_or_else(|| anyhow!("utc offset {} h is out of range", time.utc_offset_hours))?;
        Ok(LocalTime::Fixed {
            offset,
            hours: time.utc_offset_hours,
        })
    }

    pub fn to_local(&self, utc: DateTime<Utc>) -> NaiveDateTime {
        match self {
            LocalTime::Fixed { offset, .. } => utc.with_timezone(offset).naive_local(),
            LocalTime::Zone(zone) => zone.from_utc_datetime(&utc.naive_utc()).naive_local(),
        }
    }

    /// Label for the header: `UTC`, `UTC+1`, `UTC-3.5` or the zone name.
    pub fn label(&self) -> String {
        match self {
            LocalTime::Fixed { hours, .. } if *hours == 0.0 => "UTC".to_string(),
            LocalTime::Fixed { hours, .. } if *hours > 0.0 => format!("UTC+{hours}"),
            LocalTime::Fixed { hours, .. } => format!("UTC{hours}"),
            LocalTime::Zone(zone) => zone.name().to_string(),
        }
    }
}
