//! Dynamic key value type.

use crate::error::{CodecError, CodecResult};
use crate::key::encode_key;
use serde_json::Value as Json;
use std::cmp::Ordering;

/// A value that can appear in an index key.
///
/// Key values are the indexable subset of a JSON document: scalars and
/// arrays of scalars or arrays. Objects are not indexable. Numbers are
/// stored as `f64`; NaN is rejected when a key is built.
///
/// Cross-type ordering is `Null < false < true < Number < Text < Array`.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Finite or infinite number (never NaN).
    Number(f64),
    /// Text string.
    Text(String),
    /// Ordered tuple. Compound index keys are arrays.
    Array(Vec<KeyValue>),
}

impl KeyValue {
    /// Creates a number key, rejecting NaN.
    pub fn number(n: f64) -> CodecResult<Self> {
        if n.is_nan() {
            return Err(CodecError::NaNForbidden);
        }
        Ok(Self::Number(n))
    }

    /// Converts a JSON value into a key value.
    ///
    /// # Errors
    ///
    /// Objects (at any depth) have no key representation and are rejected.
    pub fn from_json(value: &Json) -> CodecResult<Self> {
        match value {
            Json::Null => Ok(Self::Null),
            Json::Bool(b) => Ok(Self::Bool(*b)),
            Json::Number(n) => n
                .as_f64()
                .ok_or_else(|| CodecError::unsupported_type(format!("number {n}")))
                .and_then(Self::number),
            Json::String(s) => Ok(Self::Text(s.clone())),
            Json::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<CodecResult<Vec<_>>>()
                .map(Self::Array),
            Json::Object(_) => Err(CodecError::unsupported_type("object")),
        }
    }

    /// Converts this key back into JSON.
    ///
    /// Integral numbers inside the `i64` range come back as JSON integers.
    #[must_use]
    pub fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Number(n) => number_to_json(*n),
            Self::Text(s) => Json::String(s.clone()),
            Self::Array(items) => Json::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Returns the text if this is a text key.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns a copy with every text component lowercased.
    ///
    /// Used for case-insensitive comparison against stored index keys.
    #[must_use]
    pub fn fold_case(&self) -> Self {
        match self {
            Self::Text(s) => Self::Text(s.to_lowercase()),
            Self::Array(items) => Self::Array(items.iter().map(Self::fold_case).collect()),
            other => other.clone(),
        }
    }

    /// Compares two keys by their encoded byte order.
    ///
    /// # Errors
    ///
    /// Returns the encoding error if either side has no key form (NaN).
    pub fn cmp_encoded(&self, other: &Self) -> CodecResult<Ordering> {
        Ok(encode_key(self)?.cmp(&encode_key(other)?))
    }

    /// Short type name for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Array(_) => "array",
        }
    }
}

fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        #[allow(clippy::cast_possible_truncation)]
        return Json::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for KeyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for KeyValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for KeyValue {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<Vec<KeyValue>> for KeyValue {
    fn from(items: Vec<KeyValue>) -> Self {
        Self::Array(items)
    }
}
