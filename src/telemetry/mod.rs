//! # Telemetry Module
//!
//! Downstream sinks for decoded telemetry records.
//!
//! This module handles:
//! - The [`DataSink`] seam the listener hands every record to
//! - Formatting records as JSONL (JSON Lines)
//! - Writing to rotating log files
//! - Managing file rotation (max N records per file)
//! - Retaining only last M files

pub mod logger;

pub use logger::JsonlLogger;

use crate::error::Result;
use crate::ukhas::Record;

/// Receives every decoded record exactly once
pub trait DataSink: Send {
    /// Record one decoded sentence
    fn data(&mut self, record: &Record) -> Result<()>;
}

/// Sink that keeps records in memory
#[derive(Debug, Default, Clone)]
pub struct VecSink {
    pub records: Vec<Record>,
}

impl DataSink for VecSink {
    fn data(&mut self, record: &Record) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Sink that drops records
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DataSink for NullSink {
    fn data(&mut self, _record: &Record) -> Result<()> {
        Ok(())
    }
}
