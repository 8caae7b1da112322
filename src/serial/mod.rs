//! # Serial Communication Module
//!
//! Handles the serial link to the radio receiver or modem.
//!
//! This module handles:
//! - Opening the port at the configured (low) baud rate, 8N1
//! - Exposing the port as an async byte source for the listener

use crate::config::SerialConfig;
use crate::error::{HabitatError, Result};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

use std::pin::Pin;
use std::task::{Context, Poll};

/// Radio serial port
///
/// Reads bytes exactly as the demodulator emits them.
pub struct RadioSerial {
    /// Serial port handle
    port: tokio_serial::SerialStream,
    /// Device path (e.g., /dev/ttyUSB0)
    device_path: String,
    /// Line speed
    baud_rate: u32,
}

impl std::fmt::Debug for RadioSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioSerial")
            .field("device_path", &self.device_path)
            .field("baud_rate", &self.baud_rate)
            .finish_non_exhaustive()
    }
}

impl RadioSerial {
    /// Open the port named in `config`
    ///
    /// # Arguments
    ///
    /// * `config` - Serial configuration; `port` must not be empty
    ///
    /// # Returns
    ///
    /// * `Result<RadioSerial>` - Opened serial port or error
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use habitat_listener::config::SerialConfig;
    /// use habitat_listener::serial::RadioSerial;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let config = SerialConfig { port: "/dev/ttyUSB0".to_string(), ..Default::default() };
    ///     let serial = RadioSerial::open(&config)?;
    ///     println!("Listening on {}", serial.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(config: &SerialConfig) -> Result<Self> {
        if config.port.is_empty() {
            return Err(HabitatError::Serial("no serial port configured".to_string()));
        }

        let port = Self::open_port(&config.port, config.baud_rate)?;
        info!("Opened radio serial port {} at {} baud", config.port, config.baud_rate);

        Ok(Self {
            port,
            device_path: config.port.clone(),
            baud_rate: config.baud_rate,
        })
    }

    /// Open a specific serial port, 8 data bits, no parity, 1 stop bit
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| HabitatError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Device path of the opened port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Configured line speed
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl AsyncRead for RadioSerial {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.port).poll_read(cx, buf)
    }
}
