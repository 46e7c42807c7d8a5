//! Reader for the data files written by the store.
//!
//! Records whose local column disagrees with the configured time rule abort
//! the whole file with `ConfigMismatch`: mis-tagged times are worse than none.

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, Timelike};

use crate::error::DataFileError;
use crate::reading::LocalTime;

#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub utc: NaiveDateTime,
    pub local: NaiveDateTime,
    pub temperature: f64,
    pub ticks: f64,
    pub frequency: f64,
    pub sky_brightness: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DataFile {
    pub serial_number: Option<String>,
    pub records: Vec<DataRecord>,
}

/// `YYYY-MM-DDTHH[:MM[:SS[.fff]]]`; missing parts are zero, fractions dropped.
fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let (date, time) = raw.trim().split_once('T')?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;

    let mut parts = time.split(':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = match parts.next() {
        Some(m) => m.parse().ok()?,
        None => 0,
    };
    let second: u32 = match parts.next() {
        Some(s) => s.split('.').next()?.parse().ok()?,
        None => 0,
    };
    date.and_hms_opt(hour, minute, second)
}

fn parse_record(line: &str, number: usize) -> Result<DataRecord, DataFileError> {
    let fields: Vec<&str> = line.split(';').map(str::trim).collect();
    if fields.len() < 6 {
        return Err(DataFileError::Parse {
            line: number,
            reason: format!("expected 6 fields, got {}", fields.len()),
        });
    }

    let timestamp = |i: usize| {
        parse_timestamp(fields[i]).ok_or_else(|| DataFileError::Parse {
            line: number,
            reason: format!("bad timestamp {:?}", fields[i]),
        })
    };
    let value = |i: usize| {
        fields[i].parse::<f64>().map_err(|_| DataFileError::Parse {
            line: number,
            reason: format!("bad value {:?}", fields[i]),
        })
    };

    Ok(DataRecord {
        utc: timestamp(0)?,
        local: timestamp(1)?,
        temperature: value(2)?,
        ticks: value(3)?,
        frequency: value(4)?,
        sky_brightness: value(5)?,
    })
}

pub fn parse(content: &str, local_time: &LocalTime) -> Result<DataFile, DataFileError> {
    let mut file = DataFile::default();

    for (index, line) in content.lines().enumerate() {
        let number = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(meta) = trimmed.strip_prefix('#') {
            if let Some((_, serial)) = meta.split_once("SQM serial number:") {
                file.serial_number = Some(serial.trim().to_string());
            }
            continue;
        }

        let record = parse_record(trimmed, number)?;
        let expected = local_time.to_local(record.utc.and_utc());
        if expected.with_nanosecond(0) != record.local.with_nanosecond(0) {
            return Err(DataFileError::ConfigMismatch {
                line: number,
                utc: record.utc,
                local: record.local,
            });
        }
        file.records.push(record);
    }
    Ok(file)
}

pub fn load(path: &Path, local_time: &LocalTime) -> Result<DataFile, DataFileError> {
    let content = std::fs::read_to_string(path).map_err(|source| DataFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content, local_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeConfig;

    fn plus_one() -> LocalTime {
        LocalTime::from_config(&TimeConfig {
            utc_offset_hours: 1.0,
            timezone: None,
        })
        .unwrap()
    }

    const FILE: &str = "\
# Device type: SQM-LE
# SQM serial number: 2142
# END OF HEADER
2024-03-10T22:15:30.250;2024-03-10T23:15:30.250;7.46;0.000;5915.000;19.288

2024-03-10T22:20;2024-03-10T23:20;7.40;0.000;5900.000;19.301
";

    #[test]
    fn reads_header_and_records() {
        let file = parse(FILE, &plus_one()).unwrap();
        assert_eq!(file.serial_number.as_deref(), Some("2142"));
        assert_eq!(file.records.len(), 2);
        assert_eq!(file.records[0].sky_brightness, 19.288);
        assert_eq!(
            file.records[1].utc,
            NaiveDate::from_ymd_opt(2024, 3, 10)
                .unwrap()
                .and_hms_opt(22, 20, 0)
                .unwrap()
        );
    }

    #[test]
    fn offset_mismatch_aborts_the_file() {
        let utc_only = LocalTime::from_config(&TimeConfig {
            utc_offset_hours: 0.0,
            timezone: None,
        })
        .unwrap();
        let err = parse(FILE, &utc_only).unwrap_err();
        assert!(matches!(err, DataFileError::ConfigMismatch { line: 4, .. }));
    }

    #[test]
    fn broken_record_names_its_line() {
        let err = parse("# h\n2024-03-10T22:15;2024-03-10T23:15;x;0;0;19\n", &plus_one()).unwrap_err();
        assert!(matches!(err, DataFileError::Parse { line: 2, .. }));
    }

    #[test]
    fn tolerant_timestamps() {
        let hour_only = parse_timestamp("2024-03-10T22").unwrap();
        assert_eq!(hour_only.minute(), 0);
        assert!(parse_timestamp("2024-03-10 22:00:00").is_none());
    }
}
