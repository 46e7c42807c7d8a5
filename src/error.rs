//! ==============================================================================
//! error.rs - typed failures of the acquisition path
//! ==============================================================================
//!
//! purpose:
//!     the scheduler has to tell expected operating conditions (a flaky
//!     photometer, a full disk) apart from real faults. device and store
//!     failures are therefore explicit values instead of strings.
//!
//! relationships:
//!     - DeviceError: produced by transport.rs, network.rs, serial.rs, protocol.rs
//!     - StoreError: produced by store.rs
//!     - DataFileError: produced by datafile.rs
//!
//! ==============================================================================

use std::path::PathBuf;

use chrono::NaiveDateTime;
use thiserror::Error;

/// Failures talking to the photometer.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("transport timed out during {0}")]
    TransportTimeout(&'static str),

    #[error("transport closed by the device")]
    TransportClosed,

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("malformed reply to {command}: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },

    #[error("device unresponsive: {command} failed {tries} times")]
    DeviceUnresponsive { command: &'static str, tries: u32 },
}

impl DeviceError {
    /// Map an i/o error from a blocking read into the transport taxonomy.
    pub fn from_read(err: std::io::Error, during: &'static str) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                DeviceError::TransportTimeout(during)
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => DeviceError::TransportClosed,
            _ => DeviceError::Io(err),
        }
    }
}

/// Failures persisting the cache to disk.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no output files selected yet")]
    NoDestination,

    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Failures reading back a data file written by the store.
#[derive(Debug, Error)]
pub enum DataFileError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error(
        "line {line}: local time {local} does not match utc {utc} under the configured time zone"
    )]
    ConfigMismatch {
        line: usize,
        utc: NaiveDateTime,
        local: NaiveDateTime,
    },
}
