//! # Post Filters
//!
//! Derived values applied after all fields of a sentence were decoded.
//! Only `common.numeric_scale` filters of type `normal` are understood;
//! any other filter entry is skipped.

use serde_json::{Map, Number, Value};

use crate::error::{HabitatError, Result};

/// Filter name of the numeric scale filter
pub const NUMERIC_SCALE: &str = "common.numeric_scale";

/// `value = data[source] * factor + offset`, optionally rounded
#[derive(Debug, Clone, PartialEq)]
pub struct NumericScale {
    pub source: String,
    pub destination: String,
    pub factor: f64,
    pub offset: Option<f64>,
    /// Significant figures to keep
    pub round: Option<i32>,
}

impl NumericScale {
    /// Read a numeric scale filter from its JSON configuration
    pub fn from_config(config: &Value) -> Result<Self> {
        let source = config
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("non string source"))?
            .to_string();

        let destination = match config.get("destination") {
            None | Some(Value::Null) => source.clone(),
            Some(Value::String(dest)) => dest.clone(),
            Some(_) => return Err(invalid("non string destination")),
        };

        if destination == "payload" || destination.starts_with('_') {
            return Err(invalid("forbidden destination"));
        }

        let factor = config
            .get("factor")
            .and_then(Value::as_f64)
            .ok_or_else(|| invalid("non numeric factor"))?;

        let offset = match config.get("offset") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_f64().ok_or_else(|| invalid("non numeric offset"))?),
        };

        let round = match config.get("round") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let round_d = v.as_f64().ok_or_else(|| invalid("non numeric round"))?;
                let round_i = round_d as i32;
                if (round_i as f64 - round_d).abs() > 0.001 {
                    return Err(invalid("non integral round"));
                }
                Some(round_i)
            }
        };

        Ok(Self {
            source,
            destination,
            factor,
            offset,
            round,
        })
    }

    /// Scale `data[source]` and store it under `destination`
    pub fn apply(&self, data: &mut Map<String, Value>) -> Result<()> {
        let mut value = data
            .get(&self.source)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                HabitatError::Configuration(
                    "Attempted to apply numeric scale to (non numeric source value)".into(),
                )
            })?;

        value *= self.factor;

        if let Some(offset) = self.offset {
            value += offset;
        }

        if let Some(round) = self.round {
            value = round_significant(value, round);
        }

        let number = Number::from_f64(value).ok_or_else(|| {
            HabitatError::Configuration("numeric scale produced a non-finite value".into())
        })?;
        data.insert(self.destination.clone(), Value::Number(number));
        Ok(())
    }
}

/// Round to `figures` significant figures
///
/// Exact powers of ten keep one figure fewer than asked, since
/// `ceil(log10(100))` is 2, not 3.
pub fn round_significant(value: f64, figures: i32) -> f64 {
    if value == 0.0 {
        return value;
    }

    let position = figures - value.abs().log10().ceil() as i32;
    let m = 10f64.powi(position);
    (value * m).round() / m
}

/// Run every post filter of a sentence configuration over `data`
///
/// `filters` is the configuration's `filters` value; a missing or
/// malformed `filters.post` list means there is nothing to do.
pub fn apply_post_filters(data: &mut Map<String, Value>, filters: Option<&Value>) -> Result<()> {
    let Some(post) = filters
        .filter(|f| f.is_object())
        .and_then(|f| f.get("post"))
        .and_then(Value::as_array)
    else {
        return Ok(());
    };

    for filter in post {
        let is_numeric_scale = filter.get("type").and_then(Value::as_str) == Some("normal")
            && filter.get("filter").and_then(Value::as_str) == Some(NUMERIC_SCALE);

        if is_numeric_scale {
            NumericScale::from_config(filter)?.apply(data)?;
        }
    }

    Ok(())
}

fn invalid(reason: &str) -> HabitatError {
    HabitatError::Configuration(format!("Invalid (numeric scale) configuration ({})", reason))
}
