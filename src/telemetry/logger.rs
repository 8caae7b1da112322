//! # JSONL Telemetry Logger
//!
//! Appends one JSON object per line, starting a new file every
//! `max_records_per_file` records and deleting the oldest files beyond
//! `max_files_to_keep`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use super::DataSink;
use crate::error::{HabitatError, Result};
use crate::ukhas::Record;

/// File name prefix of telemetry logs
const FILE_PREFIX: &str = "telemetry_";

/// File name extension of telemetry logs
const FILE_EXTENSION: &str = "jsonl";

/// Rotating JSONL writer
#[derive(Debug)]
pub struct JsonlLogger {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    records_in_file: usize,
    file_index: u64,
}

impl JsonlLogger {
    /// Create a logger writing into `dir`, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns error if either limit is zero or the directory cannot be created
    pub fn new<P: AsRef<Path>>(
        dir: P,
        max_records_per_file: usize,
        max_files_to_keep: usize,
    ) -> Result<Self> {
        if max_records_per_file == 0 || max_files_to_keep == 0 {
            return Err(HabitatError::InvalidArgument(
                "telemetry log limits must be greater than 0".to_string(),
            ));
        }

        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Logging telemetry to {}", dir.display());

        Ok(Self {
            dir,
            max_records_per_file,
            max_files_to_keep,
            writer: None,
            current_path: None,
            records_in_file: 0,
            file_index: 0,
        })
    }

    /// File currently being written, if any
    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    /// Log files in the directory, oldest first
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_log_file(path))
            .collect();
        files.sort();
        Ok(files)
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        self.file_index += 1;
        let name = format!(
            "{}{}_{:06}.{}",
            FILE_PREFIX,
            Local::now().format("%Y%m%d_%H%M%S"),
            self.file_index,
            FILE_EXTENSION
        );
        let path = self.dir.join(name);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Opened telemetry log {}", path.display());

        self.writer = Some(BufWriter::new(file));
        self.current_path = Some(path);
        self.records_in_file = 0;

        self.prune()
    }

    fn prune(&self) -> Result<()> {
        let files = self.log_files()?;
        let excess = files.len().saturating_sub(self.max_files_to_keep);

        for old in files.iter().take(excess) {
            if let Err(e) = fs::remove_file(old) {
                warn!("Failed to remove old telemetry log {}: {}", old.display(), e);
            }
        }

        Ok(())
    }
}

impl DataSink for JsonlLogger {
    fn data(&mut self, record: &Record) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        let line = serde_json::to_string(record)?;

        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", line)?;
            writer.flush()?;
        }

        self.records_in_file += 1;
        Ok(())
    }
}

fn is_log_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(FILE_PREFIX) && path.extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION)
}
