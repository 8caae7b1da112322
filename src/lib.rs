//! # Habitat Listener Library
//!
//! Extract UKHAS balloon telemetry from a radio byte stream and upload it to
//! the habitat database.
//!
//! This library provides the core functionality for finding and decoding
//! `$$`-delimited telemetry sentences, and for merging every receiver's copy
//! of a transmission into one content-addressed document.

pub mod config;
pub mod error;
pub mod listener;
pub mod rfc3339;
pub mod serial;
pub mod telemetry;
pub mod ukhas;
pub mod uploader;
