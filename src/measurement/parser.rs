//! Decoding of reassembled messages into samples and control signals.

use crate::measurement::reassembler::Frame;
use crate::measurement::types::{
    CompanionStatus, ControlSignal, DeviceMessage, ParseError, Sample, SensorSource,
};
use crate::sensors::protocol::{END_TOKEN, SLAVE_ERROR_TOKEN, SLAVE_OK_TOKEN};
use serde_json::{Map, Value};

const SOURCE_KEYS: [&str; 2] = ["id", "source"];
const INDEX_KEYS: [&str; 2] = ["idx", "sequenceIndex"];
const ANGLE_KEYS: [&str; 2] = ["angle", "angleDegrees"];
const TIME_KEYS: [&str; 2] = ["time", "timestampMs"];

/// Decode one reassembled message.
pub fn parse_frame(frame: &Frame) -> Result<DeviceMessage, ParseError> {
    match frame {
        Frame::Record(text) => parse_record(text).map(DeviceMessage::Sample),
        Frame::Token(text) => parse_token(text).map(DeviceMessage::Control),
    }
}

/// Decode raw message text, classifying it as a record or a token by shape.
pub fn parse_message(text: &str) -> Result<DeviceMessage, ParseError> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        parse_record(trimmed).map(DeviceMessage::Sample)
    } else {
        parse_token(trimmed).map(DeviceMessage::Control)
    }
}

/// Decode a bare control token.
pub fn parse_token(text: &str) -> Result<ControlSignal, ParseError> {
    match text.trim() {
        "" => Err(ParseError::Empty),
        END_TOKEN => Ok(ControlSignal::EndOfStream),
        SLAVE_OK_TOKEN => Ok(ControlSignal::Companion(CompanionStatus::Ok)),
        SLAVE_ERROR_TOKEN => Ok(ControlSignal::Companion(CompanionStatus::Error)),
        other => Err(ParseError::UnknownToken(other.to_string())),
    }
}

/// Decode a JSON sample record.
///
/// Missing keys take defaults; only malformed JSON or out-of-range values
/// are errors.
pub fn parse_record(text: &str) -> Result<Sample, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(ParseError::NotAnObject)?;

    let source = match lookup(object, &SOURCE_KEYS) {
        None | Some(Value::Null) => SensorSource::Unknown(String::new()),
        Some(Value::String(id)) => SensorSource::from_device_id(id),
        Some(other) => SensorSource::from_device_id(&other.to_string()),
    };

    let index = read_unsigned(object, &INDEX_KEYS, "idx")?;
    let sequence_index = u32::try_from(index).map_err(|_| ParseError::InvalidField {
        field: "idx",
        value: index.to_string(),
    })?;

    Ok(Sample {
        source,
        sequence_index,
        angle_degrees: read_float(object, &ANGLE_KEYS, "angle")?,
        timestamp_ms: read_unsigned(object, &TIME_KEYS, "time")?,
    })
}

fn lookup<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

fn read_float(
    object: &Map<String, Value>,
    keys: &[&str],
    field: &'static str,
) -> Result<f64, ParseError> {
    let invalid = |value: &Value| ParseError::InvalidField {
        field,
        value: value.to_string(),
    };

    match lookup(object, keys) {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| invalid(&Value::Number(n.clone()))),
        Some(v @ Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .ok_or_else(|| invalid(v)),
        Some(other) => Err(invalid(other)),
    }
}

fn read_unsigned(
    object: &Map<String, Value>,
    keys: &[&str],
    field: &'static str,
) -> Result<u64, ParseError> {
    let invalid = |value: &Value| ParseError::InvalidField {
        field,
        value: value.to_string(),
    };

    let value = match lookup(object, keys) {
        None | Some(Value::Null) => return Ok(0),
        Some(v) => v,
    };

    let number = match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    };

    number.ok_or_else(|| invalid(value))
}

/// Whole, non-negative floats such as `3.0` are accepted as integers.
fn integral(value: f64) -> Option<u64> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 {
        Some(value as u64)
    } else {
        None
    }
}
