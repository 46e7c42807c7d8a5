//! ==============================================================================
//! sinks.rs - best-effort side outputs for each reading
//! ==============================================================================
//!
//! purpose:
//!     readings are optionally mirrored into a SQLite table. a sink error
//!     is logged by the scheduler and never stops a cycle; the data files
//!     remain the record of truth.
//!
//! ==============================================================================

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::reading::{Reading, TIMESTAMP_FORMAT};

pub trait ReadingSink {
    fn name(&self) -> &str;
    fn record(&mut self, reading: &Reading) -> Result<()>;
}

fn valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One row per reading in `table`, the connection opened on first use and
/// reopened after any failure.
pub struct SqliteSink {
    path: PathBuf,
    table: String,
    conn: Option<Connection>,
}

impl SqliteSink {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        if !valid_table_name(&config.table) {
            bail!("invalid table name {:?}", config.table);
        }
        Ok(Self {
            path: config.path.clone(),
            table: config.table.clone(),
            conn: None,
        })
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open database {}", self.path.display()))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                utc_datetime TEXT NOT NULL,
                local_datetime TEXT NOT NULL,
                temperature REAL NOT NULL,
                counts REAL NOT NULL,
                frequency REAL NOT NULL,
                msas REAL NOT NULL
            );",
            self.table
        ))
        .with_context(|| format!("failed to create table {}", self.table))?;
        info!("[DB] Writing readings to {} ({})", self.path.display(), self.table);
        Ok(conn)
    }

    fn insert(&mut self, reading: &Reading) -> Result<()> {
        if self.conn.is_none() {
            self.conn = Some(self.open()?);
        }
        let Some(conn) = self.conn.as_ref() else {
            bail!("database connection unavailable");
        };
        conn.execute(
            &format!(
                "INSERT INTO {} (
                    utc_datetime,
                    local_datetime,
                    temperature,
                    counts,
                    frequency,
                    msas
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                self.table
            ),
            params![
                reading.utc.format(TIMESTAMP_FORMAT).to_string(),
                reading.local.format(TIMESTAMP_FORMAT).to_string(),
                reading.temperature,
                reading.ticks,
                reading.frequency,
                reading.sky_brightness,
            ],
        )
        .context("failed to insert reading")?;
        Ok(())
    }
}

impl ReadingSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn record(&mut self, reading: &Reading) -> Result<()> {
        let result = self.insert(reading);
        if result.is_err() && self.conn.take().is_some() {
            warn!("[DB] Dropping connection, will reopen on the next reading");
        }
        result
    }
}
