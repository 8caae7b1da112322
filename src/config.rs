//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Baud rates accepted for the radio serial link
pub const VALID_BAUD_RATES: [u32; 10] = [50, 75, 100, 150, 300, 600, 1200, 2400, 4800, 9600];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub listener: ListenerConfig,

    #[serde(default)]
    pub couch: CouchConfig,

    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub payload: PayloadConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener identity
#[derive(Debug, Deserialize, Clone)]
pub struct ListenerConfig {
    pub callsign: String,

    #[serde(default = "default_max_merge_attempts")]
    pub max_merge_attempts: usize,

    /// Station details (radio, antenna...) uploaded at start-up
    #[serde(default)]
    pub information: Option<Map<String, Value>>,

    /// Station position uploaded at start-up
    #[serde(default)]
    pub telemetry: Option<Map<String, Value>>,
}

/// Document store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CouchConfig {
    #[serde(default = "default_couch_enabled")]
    pub enabled: bool,

    #[serde(default = "default_couch_uri")]
    pub uri: String,

    #[serde(default = "default_couch_database")]
    pub database: String,

    #[serde(default = "default_couch_timeout_ms")]
    pub timeout_ms: u64,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Empty reads from stdin
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Treat `#` as `*` for Baudot links
    #[serde(default)]
    pub baudot: bool,

    #[serde(default = "default_idle_tick_ms")]
    pub idle_tick_ms: u64,
}

/// Payload configuration source
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PayloadConfig {
    /// Local JSON payload configuration document
    #[serde(default)]
    pub config_file: Option<String>,

    /// Payload configuration document fetched from the store
    #[serde(default)]
    pub document_id: Option<String>,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Diagnostic log configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Daily rolling log directory, console only when unset
    #[serde(default)]
    pub log_dir: Option<String>,
}

// Default value functions
fn default_max_merge_attempts() -> usize { 20 }

fn default_couch_enabled() -> bool { true }
fn default_couch_uri() -> String { "http://habitat.habhub.org".to_string() }
fn default_couch_database() -> String { "habitat".to_string() }
fn default_couch_timeout_ms() -> u64 { 10000 }

fn default_baud_rate() -> u32 { 300 }
fn default_idle_tick_ms() -> u64 { 1000 }

fn default_telemetry_enabled() -> bool { true }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            enabled: default_couch_enabled(),
            uri: default_couch_uri(),
            database: default_couch_database(),
            timeout_ms: default_couch_timeout_ms(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            baudot: false,
            idle_tick_ms: default_idle_tick_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl SerialConfig {
    /// Bytes a link at this baud rate would have delivered in `millis`
    ///
    /// One byte is ten bits on the wire (start, eight data, stop).
    pub fn bytes_in(&self, millis: u64) -> usize {
        (u64::from(self.baud_rate) * millis / 10_000) as usize
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use habitat_listener::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Returns
    ///
    /// * `Result<()>` - Ok if valid, Err if invalid
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        // Validate listener identity
        if self.listener.callsign.trim().is_empty() {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("listener callsign cannot be empty")
            ));
        }

        if self.listener.max_merge_attempts == 0 || self.listener.max_merge_attempts > 1000 {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("max_merge_attempts must be between 1 and 1000")
            ));
        }

        let station_docs = [self.listener.information.as_ref(), self.listener.telemetry.as_ref()];
        if station_docs.into_iter().flatten().any(|doc| doc.contains_key("callsign")) {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("listener information and telemetry cannot set callsign")
            ));
        }

        // Validate document store
        if self.couch.enabled {
            if self.couch.uri.is_empty() {
                return Err(crate::error::HabitatError::Config(
                    toml::de::Error::custom("couch uri cannot be empty when enabled")
                ));
            }

            if self.couch.database.is_empty() {
                return Err(crate::error::HabitatError::Config(
                    toml::de::Error::custom("couch database cannot be empty when enabled")
                ));
            }
        }

        if self.couch.timeout_ms == 0 || self.couch.timeout_ms > 120000 {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("couch timeout_ms must be between 1 and 120000")
            ));
        }

        // Validate serial link
        if !VALID_BAUD_RATES.contains(&self.serial.baud_rate) {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom(
                    "baud_rate must be one of: 50, 75, 100, 150, 300, 600, 1200, 2400, 4800, 9600"
                )
            ));
        }

        if self.serial.idle_tick_ms == 0 || self.serial.idle_tick_ms > 60000 {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("idle_tick_ms must be between 1 and 60000")
            ));
        }

        // Validate payload source
        if self.payload.config_file.is_some() && self.payload.document_id.is_some() {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("payload config_file and document_id are mutually exclusive")
            ));
        }

        if self.payload.document_id.is_some() && !self.couch.enabled {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("payload document_id requires couch to be enabled")
            ));
        }

        // Validate telemetry configuration
        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("telemetry log_dir cannot be empty when enabled")
            ));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("max_records_per_file must be greater than 0")
            ));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("max_files_to_keep must be greater than 0")
            ));
        }

        if matches!(self.logging.log_dir.as_deref(), Some("")) {
            return Err(crate::error::HabitatError::Config(
                toml::de::Error::custom("logging log_dir cannot be empty when set")
            ));
        }

        Ok(())
    }
}
