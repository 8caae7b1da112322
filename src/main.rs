//! # Habitat Listener
//!
//! Listen to a balloon's radio downlink and upload what you hear to habitat.
//!
//! This application reads the demodulated byte stream from a serial port (or
//! stdin), extracts UKHAS telemetry sentences and merges them into the
//! habitat database alongside every other receiver's copy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use habitat_listener::config::{Config, ListenerConfig, LoggingConfig};
use habitat_listener::listener::Listener;
use habitat_listener::serial::RadioSerial;
use habitat_listener::telemetry::{DataSink, JsonlLogger, NullSink};
use habitat_listener::ukhas::PushFlags;
use habitat_listener::uploader::couchdb::CouchDatabase;
use habitat_listener::uploader::memory::MemoryStore;
use habitat_listener::uploader::store::DocumentStore;
use habitat_listener::uploader::Uploader;

/// Diagnostic log file name prefix
const LOG_FILE_NAME: &str = "habitat-listener.log";

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Override the serial port (empty reads stdin)
    #[arg(short, long)]
    port: Option<String>,
}

/// Main entry point for the habitat listener
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Parse arguments and load configuration
///    - Set up logging (console, plus a daily file when configured)
///    - Connect the document store and load the payload configuration
///    - Upload the station's information and position documents
///
/// 2. **Main Loop**
///    - Read bytes from the radio and extract sentences
///    - Upload each sentence and record its decoded telemetry
///    - Report read inactivity to the extractor as skipped bytes
///
/// 3. **Graceful Shutdown**
///    - Stop on Ctrl+C or end of input
///    - Log totals
///
/// # Errors
///
/// Returns error if:
/// - Configuration is missing or invalid
/// - The document store or payload configuration cannot be reached
/// - The serial port cannot be opened or fails while reading
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.serial.port = port;
    }

    let _log_guard = init_logging(&config.logging);

    info!("Habitat Listener v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Listening as {}", config.listener.callsign);

    let store = open_store(&config)?;
    let uploader = Arc::new(Uploader::with_max_merge_attempts(
        config.listener.callsign.clone(),
        store.clone(),
        config.listener.max_merge_attempts,
    )?);
    announce_station(&uploader, &config.listener).await;

    let sink: Box<dyn DataSink> = if config.telemetry.enabled {
        Box::new(JsonlLogger::new(
            &config.telemetry.log_dir,
            config.telemetry.max_records_per_file,
            config.telemetry.max_files_to_keep,
        )?)
    } else {
        Box::new(NullSink)
    };

    let flags = if config.serial.baudot {
        PushFlags::BAUDOT_HACK
    } else {
        PushFlags::NONE
    };

    let mut listener = Listener::new(uploader, sink)
        .with_flags(flags)
        .with_skip_per_tick(config.serial.bytes_in(config.serial.idle_tick_ms));
    listener.set_payload(load_payload(&config, store.as_ref()).await?);

    let idle_tick = Duration::from_millis(config.serial.idle_tick_ms);

    info!("Press Ctrl+C to exit");

    let result = if config.serial.port.is_empty() {
        info!("Reading from stdin");
        run_until_ctrl_c(&mut listener, tokio::io::stdin(), idle_tick).await
    } else {
        let serial = RadioSerial::open(&config.serial)?;
        run_until_ctrl_c(&mut listener, serial, idle_tick).await
    };

    let stats = listener.stats();
    info!(
        "Received {} bytes, {} sentences, {} uploaded, {} upload failures",
        stats.bytes_received, stats.sentences, stats.uploads, stats.upload_failures
    );

    result
}

/// Install the tracing subscriber
///
/// The returned guard flushes the file log when dropped.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let (file_layer, guard) = match &logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

/// Select the document store named by the configuration
fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    if !config.couch.enabled {
        warn!("CouchDB disabled, telemetry is kept in memory only");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let db = CouchDatabase::new(
        &config.couch.uri,
        &config.couch.database,
        Duration::from_millis(config.couch.timeout_ms),
    )?;
    info!("Uploading to {}", db.url());

    Ok(Arc::new(db))
}

/// Upload the configured station documents
///
/// Telemetry uploaded afterwards references them. Failures are logged only.
async fn announce_station(uploader: &Uploader, listener: &ListenerConfig) {
    if let Some(information) = &listener.information {
        let data = Value::Object(information.clone());
        match uploader.listener_information(&data, None).await {
            Ok(id) => info!("Uploaded station information {}", id),
            Err(e) => warn!("Failed to upload station information: {}", e),
        }
    }

    if let Some(telemetry) = &listener.telemetry {
        let data = Value::Object(telemetry.clone());
        match uploader.listener_telemetry(&data, None).await {
            Ok(id) => info!("Uploaded station position {}", id),
            Err(e) => warn!("Failed to upload station position: {}", e),
        }
    }
}

/// Load the payload configuration from a file or the store
async fn load_payload(config: &Config, store: &dyn DocumentStore) -> Result<Option<Value>> {
    if let Some(path) = &config.payload.config_file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading payload configuration {}", path))?;
        let payload: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parsing payload configuration {}", path))?;
        return Ok(Some(payload));
    }

    if let Some(doc_id) = &config.payload.document_id {
        let payload = store
            .get_doc(doc_id)
            .await
            .with_context(|| format!("fetching payload configuration {}", doc_id))?;
        return Ok(Some(payload));
    }

    Ok(None)
}

/// Drive the listener until the input ends or Ctrl+C
async fn run_until_ctrl_c<R>(listener: &mut Listener, reader: R, idle_tick: Duration) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    tokio::select! {
        result = listener.run(reader, idle_tick) => {
            result?;
        }

        // Handle Ctrl+C for graceful shutdown
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
