//! # UKHAS Sentence Codec
//!
//! Splits a `$$...*CHECKSUM\n` sentence, verifies its checksum and decodes its
//! comma-separated parts against the payload configuration.
//!
//! A payload configuration may list several candidate sentence configurations
//! under `sentences`. Each is tried in order; the first one that fully
//! validates wins. When none does, the result is a `_basic` record holding
//! only the raw sentence and callsign.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::checksum::ChecksumKind;
use super::fields::FieldConfig;
use super::filters::apply_post_filters;
use crate::error::{HabitatError, Result};

/// Start delimiter of every UKHAS sentence
pub const SENTENCE_START: &str = "$$";

/// Protocol marker stored in `_protocol`
pub const PROTOCOL_NAME: &str = "UKHAS";

/// A decoded telemetry record
pub type Record = Map<String, Value>;

/// One candidate entry of a payload configuration's `sentences` list
#[derive(Debug, Clone, Deserialize)]
pub struct SentenceConfig {
    pub callsign: String,

    #[serde(default)]
    pub checksum: Option<String>,

    pub fields: Vec<FieldConfig>,

    #[serde(default)]
    pub filters: Option<Value>,
}

impl SentenceConfig {
    /// Read and sanity check one candidate
    pub fn from_value(value: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|_| {
            HabitatError::Configuration("missing callsign or fields".to_string())
        })?;

        if config.fields.is_empty() {
            return Err(HabitatError::Configuration(
                "missing callsign or fields".to_string(),
            ));
        }

        if config.fields.iter().any(|f| f.name.is_empty()) {
            return Err(HabitatError::Configuration("empty field name".to_string()));
        }

        Ok(config)
    }
}

/// Split a raw sentence into its data and checksum digits
///
/// Works on bytes: radio noise inside the data does not stop the checksum
/// from being checked.
///
/// # Errors
///
/// Returns `MalformedSentence` if the sentence does not start with `$$`,
/// does not end with `'\n'`, has no `*`, or the checksum is neither 2 nor 4
/// characters long.
///
/// # Examples
///
/// ```
/// use habitat_listener::ukhas::sentence::split_sentence;
///
/// let (data, checksum) = split_sentence(b"$$CALL,1,2*01\n").unwrap();
/// assert_eq!(data, b"CALL,1,2");
/// assert_eq!(checksum, b"01");
/// ```
pub fn split_sentence(raw: &[u8]) -> Result<(&[u8], &[u8])> {
    if !raw.starts_with(SENTENCE_START.as_bytes()) {
        return Err(malformed("String does not begin with $$"));
    }

    if !raw.ends_with(b"\n") {
        return Err(malformed("String does not end with '\\n'"));
    }

    let star = raw
        .iter()
        .rposition(|&b| b == b'*')
        .ok_or_else(|| malformed("No checksum"))?;

    let checksum = &raw[star + 1..raw.len() - 1];
    if ChecksumKind::from_digits(checksum.len()).is_none() {
        return Err(malformed("Invalid checksum length"));
    }

    Ok((&raw[SENTENCE_START.len()..star], checksum))
}

/// Identify the checksum variant and verify it against `data`
pub fn identify_and_verify(data: &[u8], checksum: &[u8]) -> Result<ChecksumKind> {
    let kind = ChecksumKind::from_digits(checksum.len())
        .ok_or_else(|| malformed("Invalid checksum length"))?;

    let expected = kind.compute(data);
    let found = String::from_utf8_lossy(checksum).to_ascii_uppercase();

    if expected != found {
        return Err(HabitatError::ChecksumMismatch { expected, found });
    }

    Ok(kind)
}

/// The minimal record every successful parse starts from
pub fn cook_basic(sentence: &str, callsign: &str) -> Record {
    let mut basic = Record::new();
    basic.insert("_sentence".into(), Value::String(sentence.to_string()));
    basic.insert("_protocol".into(), Value::String(PROTOCOL_NAME.to_string()));
    basic.insert("_parsed".into(), Value::Bool(true));
    basic.insert("payload".into(), Value::String(callsign.to_string()));
    basic
}

/// Decode `parts` with one candidate sentence configuration
pub fn attempt_sentence(
    basic: &Record,
    candidate: &Value,
    kind: ChecksumKind,
    parts: &[&str],
) -> Result<Record> {
    let config = SentenceConfig::from_value(candidate)?;

    if config.callsign != parts[0] {
        return Err(HabitatError::Configuration("Incorrect callsign".to_string()));
    }

    if config.checksum.as_deref() != Some(kind.name()) {
        return Err(HabitatError::Configuration("Wrong checksum type".to_string()));
    }

    if config.fields.len() != parts.len() - 1 {
        return Err(HabitatError::Configuration(
            "Incorrect number of fields".to_string(),
        ));
    }

    let mut data = basic.clone();

    for (field, value) in config.fields.iter().zip(&parts[1..]) {
        if value.is_empty() {
            continue;
        }
        data.insert(field.name.clone(), field.decode(value)?);
    }

    apply_post_filters(&mut data, config.filters.as_ref())?;
    Ok(data)
}

/// Try every candidate in order and return the first that succeeds
///
/// # Errors
///
/// `NoMatchingSchema` carrying each candidate's failure reason.
pub fn try_candidates(
    basic: &Record,
    candidates: &[Value],
    kind: ChecksumKind,
    parts: &[&str],
) -> Result<Record> {
    let mut errors = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        match attempt_sentence(basic, candidate, kind, parts) {
            Ok(record) => return Ok(record),
            Err(e) => errors.push(e.to_string()),
        }
    }

    Err(HabitatError::NoMatchingSchema(errors))
}

/// Decode `parts` against the payload configuration's `sentences` value
///
/// Falls back to `basic` tagged `_basic: true` when no candidate matches or
/// none are configured.
pub fn decode(
    sentences: Option<&Value>,
    mut basic: Record,
    parts: &[&str],
    kind: ChecksumKind,
) -> Result<Record> {
    match sentences {
        None | Some(Value::Null) => {}
        Some(Value::Array(candidates)) => match try_candidates(&basic, candidates, kind, parts) {
            Ok(record) => return Ok(record),
            Err(HabitatError::NoMatchingSchema(errors)) => {
                warn!("UKHAS Extractor: full parse failed:");
                for error in &errors {
                    warn!("UKHAS Extractor: {}", error);
                }
            }
            Err(e) => return Err(e),
        },
        Some(_) => {
            return Err(HabitatError::Configuration(
                "sentences is not an array".to_string(),
            ))
        }
    }

    basic.insert("_basic".into(), Value::Bool(true));
    Ok(basic)
}

/// Parse a complete buffered sentence using the payload configuration
///
/// # Errors
///
/// Returns error if the sentence is malformed, its checksum is wrong, its
/// callsign is empty, or the payload configuration itself is not an object.
/// A configuration that simply does not match is not an error.
pub fn crude_parse(buffer: &[u8], payload: Option<&Value>) -> Result<Record> {
    let settings = match payload {
        None | Some(Value::Null) => None,
        Some(v @ Value::Object(_)) => Some(v),
        Some(_) => {
            return Err(HabitatError::Configuration(
                "settings is not an object".to_string(),
            ))
        }
    };

    let (data, checksum) = split_sentence(buffer)?;
    let kind = identify_and_verify(data, checksum)?;

    let sentence = String::from_utf8_lossy(buffer);
    let data = String::from_utf8_lossy(data);
    let parts: Vec<&str> = data.split(',').collect();
    if parts[0].is_empty() {
        return Err(HabitatError::InvalidArgument("Empty callsign".to_string()));
    }

    let basic = cook_basic(&sentence, parts[0]);
    decode(settings.and_then(|s| s.get("sentences")), basic, &parts, kind)
}

fn malformed(msg: &str) -> HabitatError {
    HabitatError::MalformedSentence(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ukhas::checksum::{crc16_ccitt, xor8};
    use serde_json::json;

    fn xor_sentence(data: &str) -> String {
        format!("$${}*{}\n", data, xor8(data.as_bytes()))
    }

    fn crc_sentence(data: &str) -> String {
        format!("$${}*{}\n", data, crc16_ccitt(data.as_bytes()))
    }

    fn example_payload() -> Value {
        json!({
            "sentences": [{
                "callsign": "CALL",
                "checksum": "xor",
                "fields": [
                    {"name": "seq", "sensor": "base.ascii_int"},
                    {"name": "val", "sensor": "base.ascii_float"},
                    {"name": "extra"}
                ]
            }]
        })
    }

    #[test]
    fn test_split_sentence() {
        let (data, checksum) = split_sentence(b"$$A,B*1234\n").unwrap();
        assert_eq!(data, b"A,B");
        assert_eq!(checksum, b"1234");
    }

    #[test]
    fn test_split_sentence_uses_last_star() {
        let (data, checksum) = split_sentence(b"$$A*B*12\n").unwrap();
        assert_eq!(data, b"A*B");
        assert_eq!(checksum, b"12");
    }

    #[test]
    fn test_split_sentence_errors() {
        for bad in ["$A,B*12\n", "$$A,B*12", "$$A,B\n", "$$A,B*123\n", "$$A,B*\n"] {
            match split_sentence(bad.as_bytes()) {
                Err(HabitatError::MalformedSentence(_)) => {}
                other => panic!("Expected MalformedSentence for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_identify_and_verify() {
        let data = b"CALL,1,2.5,3";
        let xor = xor8(data);
        let crc = crc16_ccitt(data);

        assert_eq!(identify_and_verify(data, xor.as_bytes()).unwrap(), ChecksumKind::Xor);
        assert_eq!(
            identify_and_verify(data, crc.as_bytes()).unwrap(),
            ChecksumKind::Crc16Ccitt
        );
        assert_eq!(
            identify_and_verify(data, crc.to_lowercase().as_bytes()).unwrap(),
            ChecksumKind::Crc16Ccitt
        );
    }

    #[test]
    fn test_identify_and_verify_mismatch() {
        match identify_and_verify(b"CALL,1", b"ZZ") {
            Err(HabitatError::ChecksumMismatch { expected, found }) => {
                assert_eq!(expected, xor8(b"CALL,1"));
                assert_eq!(found, "ZZ");
            }
            other => panic!("Expected ChecksumMismatch, got {:?}", other),
        }

        assert!(matches!(
            identify_and_verify(b"CALL,1", b"123"),
            Err(HabitatError::MalformedSentence(_))
        ));
    }

    #[test]
    fn test_crude_parse_example_sentence() {
        let sentence = xor_sentence("CALL,1,2.5,3");
        let payload = example_payload();

        let record = crude_parse(sentence.as_bytes(), Some(&payload)).unwrap();

        assert_eq!(record["payload"], json!("CALL"));
        assert_eq!(record["seq"], json!(1.0));
        assert_eq!(record["val"], json!(2.5));
        assert_eq!(record["extra"], json!("3"));
        assert_eq!(record["_protocol"], json!("UKHAS"));
        assert_eq!(record["_parsed"], json!(true));
        assert_eq!(record["_sentence"], json!(sentence));
        assert!(!record.contains_key("_basic"));
    }

    #[test]
    fn test_crude_parse_empty_values_are_omitted() {
        let sentence = xor_sentence("CALL,,2.5,");
        let record = crude_parse(sentence.as_bytes(), Some(&example_payload())).unwrap();

        assert!(!record.contains_key("seq"));
        assert!(!record.contains_key("extra"));
        assert_eq!(record["val"], json!(2.5));
    }

    #[test]
    fn test_crude_parse_falls_back_to_basic() {
        // Wrong field count: the trailing comma adds a fifth part
        let sentence = xor_sentence("CALL,1,2.5,3,");
        let record = crude_parse(sentence.as_bytes(), Some(&example_payload())).unwrap();

        assert_eq!(record["_basic"], json!(true));
        assert_eq!(record["payload"], json!("CALL"));
        assert_eq!(record["_sentence"], json!(sentence));
        assert!(!record.contains_key("seq"));
    }

    #[test]
    fn test_crude_parse_without_configuration() {
        let sentence = xor_sentence("OTHER,1");
        let record = crude_parse(sentence.as_bytes(), None).unwrap();
        assert_eq!(record["_basic"], json!(true));
        assert_eq!(record["payload"], json!("OTHER"));
    }

    #[test]
    fn test_crude_parse_wrong_checksum_kind_falls_back() {
        let sentence = crc_sentence("CALL,1,2.5,3");
        let record = crude_parse(sentence.as_bytes(), Some(&example_payload())).unwrap();
        assert_eq!(record["_basic"], json!(true));
    }

    #[test]
    fn test_crude_parse_tries_each_candidate() {
        let payload = json!({
            "sentences": [
                {"callsign": "CALL", "checksum": "crc16-ccitt", "fields": [{"name": "a"}]},
                {"callsign": "CALL", "checksum": "crc16-ccitt", "fields": [
                    {"name": "a"}, {"name": "b", "sensor": "base.ascii_int"}
                ]}
            ]
        });
        let sentence = crc_sentence("CALL,x,7");
        let record = crude_parse(sentence.as_bytes(), Some(&payload)).unwrap();

        assert_eq!(record["a"], json!("x"));
        assert_eq!(record["b"], json!(7.0));
    }

    #[test]
    fn test_crude_parse_coordinates_and_filters() {
        let payload = json!({
            "sentences": [{
                "callsign": "BALLOON",
                "checksum": "crc16-ccitt",
                "fields": [
                    {"name": "latitude", "sensor": "stdtelem.coordinate", "format": "ddmm.mmmm"},
                    {"name": "longitude", "sensor": "stdtelem.coordinate", "format": "dddmm.mmmm"},
                    {"name": "altitude", "sensor": "base.ascii_int"}
                ],
                "filters": {"post": [{
                    "type": "normal",
                    "filter": "common.numeric_scale",
                    "source": "altitude",
                    "destination": "altitude_km",
                    "factor": 0.001
                }]}
            }]
        });
        let sentence = crc_sentence("BALLOON,5130.0000,-00007.5000,12000");
        let record = crude_parse(sentence.as_bytes(), Some(&payload)).unwrap();

        assert!((record["latitude"].as_f64().unwrap() - 51.5).abs() < 1e-6);
        assert!((record["longitude"].as_f64().unwrap() + 0.125).abs() < 1e-6);
        assert_eq!(record["altitude"], json!(12000.0));
        assert!((record["altitude_km"].as_f64().unwrap() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_crude_parse_bad_numeric_falls_back() {
        let sentence = xor_sentence("CALL,one,2.5,3");
        let record = crude_parse(sentence.as_bytes(), Some(&example_payload())).unwrap();
        assert_eq!(record["_basic"], json!(true));
    }

    #[test]
    fn test_crude_parse_non_utf8_byte() {
        // 0xB0 is a degree sign in Latin-1, not valid UTF-8 on its own
        let sentence = b"$$CALL,7,21\xB0C*C5\n";
        let payload = json!({
            "sentences": [{
                "callsign": "CALL",
                "checksum": "xor",
                "fields": [
                    {"name": "seq", "sensor": "base.ascii_int"},
                    {"name": "temperature"}
                ]
            }]
        });

        let record = crude_parse(sentence, Some(&payload)).unwrap();
        assert_eq!(record["_parsed"], json!(true));
        assert!(record.get("_basic").is_none());
        assert_eq!(record["seq"], json!(7.0));
        assert_eq!(record["temperature"], json!("21\u{FFFD}C"));
        assert_eq!(record["_sentence"], json!("$$CALL,7,21\u{FFFD}C*C5\n"));
    }

    #[test]
    fn test_crude_parse_errors() {
        let payload = example_payload();

        // Bad checksum
        assert!(crude_parse(b"$$CALL,1,2.5,3*00\n", Some(&payload)).is_err());

        // Empty callsign
        let sentence = xor_sentence(",1,2");
        assert!(matches!(
            crude_parse(sentence.as_bytes(), Some(&payload)),
            Err(HabitatError::InvalidArgument(_))
        ));

        // Settings that are not an object
        let sentence = xor_sentence("CALL,1,2.5,3");
        assert!(crude_parse(sentence.as_bytes(), Some(&json!([1]))).is_err());

        // Sentences that are not an array
        assert!(crude_parse(sentence.as_bytes(), Some(&json!({"sentences": 4}))).is_err());
    }

    #[test]
    fn test_try_candidates_collects_errors() {
        let basic = cook_basic("$$CALL,1*00\n", "CALL");
        let candidates = vec![
            json!({"callsign": "OTHER", "checksum": "xor", "fields": [{"name": "a"}]}),
            json!({"callsign": "CALL"}),
            json!("not an object"),
        ];

        match try_candidates(&basic, &candidates, ChecksumKind::Xor, &["CALL", "1"]) {
            Err(HabitatError::NoMatchingSchema(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(errors[0].contains("Incorrect callsign"));
                assert!(errors[1].contains("missing callsign or fields"));
            }
            other => panic!("Expected NoMatchingSchema, got {:?}", other),
        }
    }
}
