//! Metric Records
//!
//! A metric record is a flat mapping of field name to scalar value, always
//! carrying the metric `name` and a UTC `timestamp`. Records are built by
//! producers, handed to the queue, and never modified afterwards.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Field holding the event creation time
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Field holding the metric name in flattened output
pub const NAME_FIELD: &str = "name";

/// A single field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Str(s) => f.write_str(s),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

// Timestamps serialize as ISO-8601 strings, everything else as the plain JSON scalar.
impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Int(i) => serializer.serialize_i64(*i),
            FieldValue::Float(v) => serializer.serialize_f64(*v),
            FieldValue::Str(s) => serializer.serialize_str(s),
            FieldValue::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

/// Field name to value mapping, ordered by key
pub type Fields = BTreeMap<String, FieldValue>;

/// Build a [`Fields`] map from `key => value` pairs
#[macro_export]
macro_rules! fields {
    () => {
        $crate::record::Fields::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::record::Fields::new();
        $(
            fields.insert(($key).to_string(), $crate::record::FieldValue::from($value));
        )+
        fields
    }};
}

/// An immutable metric event
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    name: String,
    fields: Fields,
}

impl MetricRecord {
    /// Create a record, stamping the current UTC time unless the caller supplied one
    pub fn new(name: impl Into<String>, mut fields: Fields) -> Self {
        fields
            .entry(TIMESTAMP_FIELD.to_string())
            .or_insert_with(|| FieldValue::Timestamp(Utc::now()));
        MetricRecord {
            name: name.into(),
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        if key == NAME_FIELD {
            return None;
        }
        self.fields.get(key)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.fields
            .get(TIMESTAMP_FIELD)
            .and_then(FieldValue::as_timestamp)
    }

    pub fn into_parts(self) -> (String, Fields) {
        (self.name, self.fields)
    }

    /// Flatten into a JSON object with `name` merged into the fields
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::with_capacity(self.fields.len() + 1);
        for (key, value) in &self.fields {
            // FieldValue serialization is infallible, NaN floats become null
            let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
            object.insert(key.clone(), value);
        }
        object.insert(
            NAME_FIELD.to_string(),
            serde_json::Value::String(self.name.clone()),
        );
        serde_json::Value::Object(object)
    }
}

impl Serialize for MetricRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
