//! # Listener Pipeline
//!
//! Glues the radio byte stream to the extractor, the uploader and the
//! downstream data sink.
//!
//! This module handles:
//! - Feeding received bytes to the [`UkhasExtractor`]
//! - Uploading every completed raw sentence
//! - Handing every decoded record to the [`DataSink`]
//! - Turning read inactivity into skipped-byte reports
//!
//! Upload and sink failures are logged and counted; they never stop
//! extraction.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::rfc3339;
use crate::telemetry::DataSink;
use crate::ukhas::{Extraction, PushFlags, UkhasExtractor};
use crate::uploader::Uploader;

/// Read buffer size; radio links deliver far less than this per read
const READ_BUFFER_SIZE: usize = 1024;

/// Counters for one listener run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub bytes_received: u64,
    pub sentences: u64,
    pub uploads: u64,
    pub upload_failures: u64,
    pub sink_failures: u64,
    pub idle_ticks: u64,
}

/// Extraction → upload → sink pipeline
pub struct Listener {
    extractor: UkhasExtractor,
    uploader: Arc<Uploader>,
    sink: Box<dyn DataSink>,
    flags: PushFlags,
    skip_per_tick: usize,
    stats: ListenerStats,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("callsign", &self.uploader.callsign())
            .field("flags", &self.flags)
            .field("skip_per_tick", &self.skip_per_tick)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Create a pipeline with plain ASCII input and no idle reporting
    ///
    /// # Arguments
    ///
    /// * `uploader` - Shared uploader for raw sentences
    /// * `sink` - Receives every decoded record
    pub fn new(uploader: Arc<Uploader>, sink: Box<dyn DataSink>) -> Self {
        Self {
            extractor: UkhasExtractor::new(),
            uploader,
            sink,
            flags: PushFlags::NONE,
            skip_per_tick: 0,
            stats: ListenerStats::default(),
        }
    }

    /// Use `flags` for every pushed byte
    pub fn with_flags(mut self, flags: PushFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Report `n` skipped bytes on every idle tick
    pub fn with_skip_per_tick(mut self, n: usize) -> Self {
        self.skip_per_tick = n;
        self
    }

    /// Replace the payload configuration used for decoding
    pub fn set_payload(&mut self, payload: Option<Value>) {
        match &payload {
            Some(p) => {
                let name = p.get("name").and_then(Value::as_str).unwrap_or("(unnamed)");
                info!("Decoding with payload configuration {}", name);
            }
            None => info!("Decoding without payload configuration"),
        }
        self.extractor.set_payload(payload);
    }

    /// Counters so far
    pub fn stats(&self) -> ListenerStats {
        self.stats
    }

    /// The extractor driven by this pipeline
    pub fn extractor(&self) -> &UkhasExtractor {
        &self.extractor
    }

    /// Feed a chunk of received bytes
    ///
    /// Every sentence completed by the chunk is uploaded and recorded before
    /// this returns.
    pub async fn process(&mut self, bytes: &[u8]) {
        self.stats.bytes_received += bytes.len() as u64;

        for &byte in bytes {
            if let Some(extraction) = self.extractor.push(byte, self.flags) {
                self.handle(extraction).await;
            }
        }
    }

    /// Account for one idle period with no bytes received
    pub fn idle_tick(&mut self) {
        self.stats.idle_ticks += 1;
        if self.skip_per_tick > 0 {
            self.extractor.skipped(self.skip_per_tick);
        }
    }

    /// Read `reader` until end of stream
    ///
    /// A read that delivers nothing within `idle_tick` counts as one idle
    /// tick.
    ///
    /// # Errors
    ///
    /// Returns error if reading fails
    pub async fn run<R>(&mut self, mut reader: R, idle_tick: Duration) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            buf.clear();

            match timeout(idle_tick, reader.read_buf(&mut buf)).await {
                Ok(Ok(0)) => {
                    info!("Input closed after {} bytes", self.stats.bytes_received);
                    return Ok(());
                }
                Ok(Ok(n)) => {
                    debug!("Read {} bytes", n);
                    self.process(&buf).await;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => self.idle_tick(),
            }
        }
    }

    async fn handle(&mut self, extraction: Extraction) {
        self.stats.sentences += 1;
        let time_created = rfc3339::now();

        match self
            .uploader
            .payload_telemetry(&extraction.sentence, None, Some(time_created))
            .await
        {
            Ok(doc_id) => {
                self.stats.uploads += 1;
                debug!("Sentence stored as {}", doc_id);
            }
            Err(e) => {
                self.stats.upload_failures += 1;
                warn!("Failed to upload sentence: {}", e);
            }
        }

        if let Err(e) = self.sink.data(&extraction.record) {
            self.stats.sink_failures += 1;
            warn!("Failed to record telemetry: {}", e);
        }
    }
}
