//! # Field Decode Rules
//!
//! Converts one comma-separated sentence part into a JSON value according to
//! the field's `sensor`:
//!
//! | Sensor | Result |
//! |--------|--------|
//! | `base.ascii_int`, `base.ascii_float` | number |
//! | `stdtelem.coordinate` with a `d+m+.m+` format | decimal degrees |
//! | anything else | string, copied verbatim |

use serde::Deserialize;
use serde_json::{Number, Value};

use crate::error::{HabitatError, Result};

/// Sensor name of integer fields
pub const SENSOR_ASCII_INT: &str = "base.ascii_int";

/// Sensor name of float fields
pub const SENSOR_ASCII_FLOAT: &str = "base.ascii_float";

/// Sensor name of coordinate fields
pub const SENSOR_COORDINATE: &str = "stdtelem.coordinate";

/// One entry of a sentence configuration's `fields` list
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldConfig {
    pub name: String,

    #[serde(default)]
    pub sensor: Option<String>,

    #[serde(default)]
    pub format: Option<String>,
}

/// How a field's text is turned into a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    Numeric,
    Coordinate,
    Text,
}

impl FieldConfig {
    /// Select the decode rule for this field
    pub fn rule(&self) -> FieldRule {
        match self.sensor.as_deref() {
            Some(SENSOR_ASCII_INT) | Some(SENSOR_ASCII_FLOAT) => FieldRule::Numeric,
            Some(SENSOR_COORDINATE)
                if self.format.as_deref().is_some_and(is_ddmm_format) =>
            {
                FieldRule::Coordinate
            }
            _ => FieldRule::Text,
        }
    }

    /// Decode `value` with this field's rule
    ///
    /// Callers skip empty values; they never reach here.
    pub fn decode(&self, value: &str) -> Result<Value> {
        match self.rule() {
            FieldRule::Numeric => convert_numeric(value).and_then(number),
            FieldRule::Coordinate => convert_ddmm(value).and_then(number),
            FieldRule::Text => Ok(Value::String(value.to_string())),
        }
    }
}

/// Does `format` match `d+m+\.m+`?
pub fn is_ddmm_format(format: &str) -> bool {
    let degrees = format.chars().take_while(|&c| c == 'd').count();
    let rest = &format[degrees..];

    let minutes = rest.chars().take_while(|&c| c == 'm').count();
    let rest = &rest[minutes..];

    let Some(fraction) = rest.strip_prefix('.') else {
        return false;
    };

    degrees > 0 && minutes > 0 && !fraction.is_empty() && fraction.chars().all(|c| c == 'm')
}

/// Convert `dddmm.mmmm` to decimal degrees
///
/// The result keeps as many significant digits as the input carried.
///
/// # Examples
///
/// ```
/// use habitat_listener::ukhas::fields::convert_ddmm;
///
/// assert_eq!(convert_ddmm("5130.0000").unwrap(), 51.5);
/// assert_eq!(convert_ddmm("-00130.0000").unwrap(), -1.5);
/// ```
pub fn convert_ddmm(value: &str) -> Result<f64> {
    let split = match value.find('.') {
        Some(pos) if pos > 2 => pos,
        _ => return Err(config_err("invalid '.' pos when converting ddmm")),
    };

    let (left, right) = value.split_at(split - 2);

    let degrees: f64 = left
        .parse()
        .map_err(|_| config_err("couldn't parse left or right parts (ddmm)"))?;
    let minutes: f64 = right
        .parse()
        .map_err(|_| config_err("couldn't parse left or right parts (ddmm)"))?;

    if !(0.0..60.0).contains(&minutes) {
        return Err(config_err("invalid right part (ddmm)"));
    }

    let magnitude = degrees.abs() + minutes / 60.0;
    let decimal = if left.starts_with('-') { -magnitude } else { magnitude };

    let lead = value
        .find(|c: char| !matches!(c, '0' | '+' | '-'))
        .unwrap_or(value.len());
    let digits = value.len().saturating_sub(lead + 2).max(1);

    Ok(round_significant(decimal, digits))
}

/// Parse a numeric field
pub fn convert_numeric(value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| config_err(format!("couldn't parse numeric value '{}'", value)))
}

fn round_significant(value: f64, digits: usize) -> f64 {
    format!("{:.*e}", digits - 1, value).parse().unwrap_or(value)
}

fn number(value: f64) -> Result<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| config_err("non-finite numeric value"))
}

fn config_err(msg: impl Into<String>) -> HabitatError {
    HabitatError::Configuration(msg.into())
}
