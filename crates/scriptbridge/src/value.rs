//! Scalar values exchanged with the peer and their text encoding.
//!
//! The peer has a single text-based value model: numbers are strings that look
//! like numbers. Encoding renders host values into that form, decoding infers a
//! type back from the text unless the caller asked for the raw string.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::SEPARATOR;

/// A scalar value crossing the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

/// The peer has no boolean type; true and false are 1 and 0.
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Int(i64::from(b))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// A value that cannot be represented on the wire at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnsupportedValueError {
    #[error("NaN cannot be represented by the peer")]
    NaN,
    #[error("{0} cannot be represented by the peer")]
    Infinite(f64),
    #[error("strings sent to the peer cannot contain a NUL character")]
    NulCharacter,
    #[error("strings sent to the peer cannot contain the reserved delimiter \\x03")]
    Delimiter,
}

/// Emitted when a float does not survive the six-decimal text form.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("loss of precision from {value} to {encoded}")]
pub struct PrecisionLossWarning {
    pub value: f64,
    pub encoded: String,
}

/// Result of encoding a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub text: String,
    pub warning: Option<PrecisionLossWarning>,
}

impl Encoded {
    fn exact(text: String) -> Self {
        Self {
            text,
            warning: None,
        }
    }
}

/// Render a value in the peer's text form.
pub fn encode(value: &Value) -> Result<Encoded, UnsupportedValueError> {
    match value {
        Value::Int(n) => Ok(Encoded::exact(n.to_string())),
        Value::Float(v) => encode_float(*v),
        Value::Str(s) => {
            check_text(s)?;
            Ok(Encoded::exact(s.clone()))
        }
    }
}

/// Reject text the frame layer cannot carry.
pub fn check_text(text: &str) -> Result<(), UnsupportedValueError> {
    if text.contains('\0') {
        return Err(UnsupportedValueError::NulCharacter);
    }
    if text.contains(SEPARATOR) {
        return Err(UnsupportedValueError::Delimiter);
    }
    Ok(())
}

fn encode_float(v: f64) -> Result<Encoded, UnsupportedValueError> {
    if v.is_nan() {
        return Err(UnsupportedValueError::NaN);
    }
    if v.is_infinite() {
        return Err(UnsupportedValueError::Infinite(v));
    }

    let fixed = format!("{v:.6}");
    let lossy = fixed.parse::<f64>().map_or(true, |back| back != v);

    // Keep one fractional digit so the peer still sees a float.
    let mut text = fixed.trim_end_matches('0').to_string();
    if text.ends_with('.') {
        text.push('0');
    }

    let warning = lossy.then(|| PrecisionLossWarning {
        value: v,
        encoded: text.clone(),
    });
    Ok(Encoded { text, warning })
}

/// Infer a value from peer text. With `raw` the text is returned unchanged.
pub fn decode(text: &str, raw: bool) -> Value {
    if raw {
        return Value::Str(text.to_owned());
    }

    if let Some(hex) = text.strip_prefix("0x")
        && (1..=16).contains(&hex.len())
        && hex.bytes().all(|b| b.is_ascii_hexdigit())
        && let Ok(n) = u64::from_str_radix(hex, 16)
    {
        // 64-bit two's complement, like the peer's own integers.
        return Value::Int(n as i64);
    }

    let unsigned = text.strip_prefix('-').unwrap_or(text);

    if !unsigned.is_empty()
        && unsigned.bytes().all(|b| b.is_ascii_digit())
        && let Ok(n) = text.parse::<i64>()
    {
        return Value::Int(n);
    }

    if is_decimal(unsigned)
        && let Ok(v) = text.parse::<f64>()
    {
        return Value::Float(v);
    }

    Value::Str(text.to_owned())
}

/// ASCII digits with at most one `.` and at least one digit.
fn is_decimal(s: &str) -> bool {
    let mut dots = 0;
    let mut digits = 0;
    for b in s.bytes() {
        match b {
            b'.' => dots += 1,
            b'0'..=b'9' => digits += 1,
            _ => return false,
        }
    }
    dots <= 1 && digits > 0
}
