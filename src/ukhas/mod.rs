//! # UKHAS Protocol Module
//!
//! Extraction and decoding of UKHAS telemetry sentences.
//!
//! This module handles:
//! - Finding `$$`-delimited sentences in a noisy byte stream
//! - XOR and CRC16-CCITT checksums
//! - Splitting and verifying sentences
//! - Decoding fields against a payload configuration
//! - Post filters (numeric scale)

pub mod checksum;
pub mod extractor;
pub mod fields;
pub mod filters;
pub mod sentence;

pub use extractor::{Extraction, ExtractorState, PushFlags, UkhasExtractor};
pub use sentence::{crude_parse, Record};
