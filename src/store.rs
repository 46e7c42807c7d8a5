//! ==============================================================================
//! store.rs - reading cache and the three rolling data files
//! ==============================================================================
//!
//! purpose:
//!     buffers formatted reading lines and writes them out in batches to
//!     the monthly archive, the daily archive and the "current" mirror.
//!
//! guarantees:
//!     - a file is born with its header: header and first lines are written
//!       to a temp file and renamed into place, so no reader ever sees a
//!       data line without a header.
//!     - a failed flush keeps the buffer. progress is tracked per file, so
//!       the retry only writes what each file is still missing. an append
//!       that fails half-way is cut back to where the file ended.
//!     - the mirror is replaced whole (temp file + rename), never appended.
//!
//! ==============================================================================

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::error::StoreError;

/// Output files for one observing night.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSet {
    pub monthly: PathBuf,
    pub daily: PathBuf,
    pub current: PathBuf,
}

impl FileSet {
    /// Files for the night containing `local`. The date is taken 12 h
    /// earlier so one night never spans two daily files.
    pub fn for_night(config: &DaemonConfig, local: NaiveDateTime) -> Self {
        let night = (local - ChronoDuration::hours(12)).date();
        let short = &config.device.short_type;
        let obs = &config.site.name;
        let paths = &config.paths;

        Self {
            monthly: paths
                .monthly_data_directory
                .join(format!("{}_{}_{}.dat", short, obs, night.format("%Y-%m"))),
            daily: paths
                .daily_data_directory
                .join(format!("{}_120000_{}-{}.dat", night.format("%Y%m%d"), short, obs)),
            current: paths
                .current_data_directory
                .join(format!("{}_{}.dat", short, obs)),
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Append `lines` to `path`, creating it with `header` first if missing.
fn append_with_header(path: &Path, header: &str, lines: &[String]) -> Result<(), StoreError> {
    let body = lines.concat();

    if !path.exists() {
        let mut tmp = NamedTempFile::new_in(parent_dir(path))
            .map_err(|e| StoreError::filesystem(path, e))?;
        tmp.write_all(header.as_bytes())
            .and_then(|_| tmp.write_all(body.as_bytes()))
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StoreError::filesystem(path, e))?;

        match tmp.persist_noclobber(path) {
            Ok(_) => {
                debug!("[STORE] Created {}", path.display());
                return Ok(());
            }
            // appeared since the check; append below instead
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(StoreError::filesystem(path, e.error)),
        }
    }

    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| StoreError::filesystem(path, e))?;
    append_all(&mut file, body.as_bytes()).map_err(|e| StoreError::filesystem(path, e))
}

/// A destination that can be cut back to an earlier length.
trait Truncate: Write {
    fn len(&mut self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for File {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write all of `body` or leave `dest` as long as it was before.
fn append_all<W: Truncate>(dest: &mut W, body: &[u8]) -> io::Result<()> {
    let start = dest.len()?;
    if let Err(e) = dest.write_all(body) {
        if let Err(undo) = dest.truncate(start) {
            warn!("[STORE] Could not undo a partial write: {}", undo);
        }
        return Err(e);
    }
    Ok(())
}

/// Replace `mirror` with the full content of `source`.
fn replace_mirror(source: &Path, mirror: &Path) -> Result<(), StoreError> {
    let content = std::fs::read(source).map_err(|e| StoreError::filesystem(source, e))?;
    let mut tmp = NamedTempFile::new_in(parent_dir(mirror))
        .map_err(|e| StoreError::filesystem(mirror, e))?;
    tmp.write_all(&content)
        .map_err(|e| StoreError::filesystem(mirror, e))?;
    tmp.persist(mirror)
        .map_err(|e| StoreError::filesystem(mirror, e.error))?;
    Ok(())
}

pub struct CacheStore {
    header: String,
    threshold: usize,
    files: Option<FileSet>,
    lines: Vec<String>,
    /// Lines of `lines` already in the monthly and daily files.
    committed: [usize; 2],
}

impl CacheStore {
    pub fn new(header: String, threshold: usize) -> Self {
        Self {
            header,
            threshold: threshold.max(1),
            files: None,
            lines: Vec::new(),
            committed: [0, 0],
        }
    }

    pub fn pending(&self) -> usize {
        self.lines.len()
    }

    pub fn files(&self) -> Option<&FileSet> {
        self.files.as_ref()
    }

    /// Buffer a line; flush once the threshold is reached. Returns whether
    /// a flush happened.
    pub fn append(&mut self, line: String) -> Result<bool, StoreError> {
        self.lines.push(line);
        if self.lines.len() >= self.threshold {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Write the buffer out. Returns the number of lines flushed.
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        if self.lines.is_empty() {
            return Ok(0);
        }
        let files = self.files.clone().ok_or(StoreError::NoDestination)?;

        for (slot, path) in [&files.monthly, &files.daily].into_iter().enumerate() {
            let done = self.committed[slot];
            if done < self.lines.len() {
                append_with_header(path, &self.header, &self.lines[done..])?;
                self.committed[slot] = self.lines.len();
            }
        }
        replace_mirror(&files.daily, &files.current)?;

        let flushed = self.lines.len();
        self.lines.clear();
        self.committed = [0, 0];
        info!("[STORE] Flushed {} readings to {}", flushed, files.daily.display());
        Ok(flushed)
    }

    /// Switch to a new night's files. Lines still pending go to the old
    /// files first; if that fails the old set is kept.
    pub fn rotate(&mut self, files: FileSet) -> Result<(), StoreError> {
        if self.files.as_ref() == Some(&files) {
            return Ok(());
        }
        if self.files.is_some() {
            self.flush()?;
        }
        info!("[STORE] Writing to {}", files.daily.display());
        self.files = Some(files);
        Ok(())
    }
}
