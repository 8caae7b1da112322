//! # UKHAS Sentence Extractor
//!
//! Byte-at-a-time state machine that finds `$$ ... \n` sentences inside a
//! noisy radio stream.
//!
//! ## States
//!
//! | State | Byte | Action |
//! |-------|------|--------|
//! | any | `$` after `$` | start a new buffer with `$$` |
//! | Extracting | `\n` | complete: parse and emit one [`Extraction`] |
//! | Extracting | other | append, count garbage, maybe give up |
//! | Idle | other | dropped |
//!
//! `\r` is always treated as `\n`. A buffer is abandoned, with nothing
//! emitted, once it exceeds [`MAX_SENTENCE_LENGTH`] bytes,
//! [`MAX_GARBAGE_BYTES`] non-printable bytes or [`MAX_SKIPPED_BYTES`] bytes of
//! reported silence.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::sentence::{crude_parse, Record};

/// Longest sentence buffered before giving up
pub const MAX_SENTENCE_LENGTH: usize = 1000;

/// Non-printable bytes tolerated inside one sentence
pub const MAX_GARBAGE_BYTES: usize = 32;

/// Silence tolerated inside one sentence (~10s at 50 baud, ~1.5s at 300 baud)
pub const MAX_SKIPPED_BYTES: usize = 50;

/// Initial buffer capacity
const BUFFER_CAPACITY: usize = 256;

/// Options attached to a pushed byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushFlags {
    /// The byte came from a Baudot (5-bit) decoder, which has no `*`;
    /// payloads send `#` instead.
    pub baudot_hack: bool,
}

impl PushFlags {
    /// Plain ASCII input
    pub const NONE: PushFlags = PushFlags { baudot_hack: false };

    /// Input from a Baudot decoder
    pub const BAUDOT_HACK: PushFlags = PushFlags { baudot_hack: true };
}

/// Extractor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorState {
    Idle,
    Extracting,
}

/// A completed sentence
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Raw sentence bytes including `$$` and the trailing `\n`
    pub sentence: Vec<u8>,
    /// Decoded record; `{_sentence}` only if parsing failed
    pub record: Record,
}

/// Streaming UKHAS sentence extractor
///
/// Not thread-safe by design of its caller: one producer pushes bytes.
///
/// # Examples
///
/// ```
/// use habitat_listener::ukhas::extractor::{PushFlags, UkhasExtractor};
///
/// let mut extractor = UkhasExtractor::new();
/// let mut out = Vec::new();
///
/// for &b in b"noise$$CALL,1*1F\n" {
///     out.extend(extractor.push(b, PushFlags::NONE));
/// }
///
/// assert_eq!(out.len(), 1);
/// assert_eq!(out[0].sentence, b"$$CALL,1*1F\n");
/// assert_eq!(out[0].record["payload"], "CALL");
/// ```
#[derive(Debug)]
pub struct UkhasExtractor {
    state: ExtractorState,
    last: u8,
    buffer: Vec<u8>,
    garbage_count: usize,
    skipped_count: usize,
    payload: Option<Value>,
}

impl Default for UkhasExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl UkhasExtractor {
    /// Create an idle extractor without payload configuration
    pub fn new() -> Self {
        Self {
            state: ExtractorState::Idle,
            last: 0,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            garbage_count: 0,
            skipped_count: 0,
            payload: None,
        }
    }

    /// Create an extractor decoding with `payload` configuration
    pub fn with_payload(payload: Value) -> Self {
        let mut extractor = Self::new();
        extractor.set_payload(Some(payload));
        extractor
    }

    /// Replace the payload configuration used for decoding
    pub fn set_payload(&mut self, payload: Option<Value>) {
        self.payload = payload;
    }

    /// Current payload configuration
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Current state
    pub fn state(&self) -> ExtractorState {
        self.state
    }

    /// Bytes buffered for the sentence in progress
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Feed one byte
    ///
    /// # Returns
    ///
    /// * `Option<Extraction>` - The completed sentence, if this byte ended one
    pub fn push(&mut self, byte: u8, flags: PushFlags) -> Option<Extraction> {
        let mut b = if byte == b'\r' { b'\n' } else { byte };
        let mut extraction = None;

        if self.last == b'$' && b == b'$' {
            self.start();
        } else if self.state == ExtractorState::Extracting && b == b'\n' {
            self.buffer.push(b);
            extraction = Some(self.finish());
        } else if self.state == ExtractorState::Extracting {
            if flags.baudot_hack && b == b'#' {
                b = b'*';
            }

            self.buffer.push(b);

            if !(0x20..=0x7E).contains(&b) {
                self.garbage_count += 1;
            }

            if self.buffer.len() > MAX_SENTENCE_LENGTH || self.garbage_count > MAX_GARBAGE_BYTES {
                warn!("UKHAS Extractor: giving up");
                self.abandon();
            }
        }

        self.last = b;
        extraction
    }

    /// Report `n` bytes lost to silence or a gap in the stream
    pub fn skipped(&mut self, n: usize) {
        if self.state != ExtractorState::Extracting {
            return;
        }

        self.skipped_count += n;

        if self.skipped_count > MAX_SKIPPED_BYTES {
            warn!("UKHAS Extractor: giving up (silence)");
            self.abandon();
        }
    }

    fn start(&mut self) {
        self.reset_buffer();
        self.buffer.extend_from_slice(b"$$");
        self.garbage_count = 0;
        self.skipped_count = 0;
        self.state = ExtractorState::Extracting;

        debug!("UKHAS Extractor: found start delimiter");
    }

    fn finish(&mut self) -> Extraction {
        info!("UKHAS Extractor: extracted string");

        let sentence = std::mem::replace(&mut self.buffer, Vec::with_capacity(BUFFER_CAPACITY));
        self.state = ExtractorState::Idle;

        let record = match crude_parse(&sentence, self.payload.as_ref()) {
            Ok(record) => record,
            Err(e) => {
                warn!("UKHAS Extractor: crude parse failed: {}", e);

                let mut bare = Record::new();
                bare.insert(
                    "_sentence".into(),
                    Value::String(String::from_utf8_lossy(&sentence).into_owned()),
                );
                bare
            }
        };

        Extraction { sentence, record }
    }

    fn abandon(&mut self) {
        self.reset_buffer();
        self.state = ExtractorState::Idle;
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
    }
}
