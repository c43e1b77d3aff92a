//! Output composition for the service variant
//!
//! A service pipes `(original, result)` pairs downstream. How the two are
//! combined is fixed per instance by its output scheme.

use serde_json::{Map, Value};
use std::fmt;

use crate::error::{PluginError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputScheme {
    /// Result keys laid over the original record.
    Merge,
    /// Result keys laid over `original[key]`; only that sub-record is emitted.
    Namespace { key: String },
    /// The result alone.
    Result,
}

impl fmt::Display for OutputScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputScheme::Merge => f.write_str("MERGE"),
            OutputScheme::Namespace { key } => write!(f, "NAMESPACE({key})"),
            OutputScheme::Result => f.write_str("RESULT"),
        }
    }
}

/// Emptiness as the pipeline understands it: null, blank strings and empty
/// collections carry nothing worth forwarding.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

pub struct OutputMerger {
    scheme: OutputScheme,
}

impl OutputMerger {
    pub fn new(scheme: OutputScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> &OutputScheme {
        &self.scheme
    }

    /// Compose the outbound envelope. Neither input is modified.
    pub fn merge(&self, original: &Value, result: &Value) -> Result<Value> {
        if is_empty_value(original) || is_empty_value(result) {
            return Err(PluginError::Validation(
                "Please specify the original data and the result.".into(),
            ));
        }

        match &self.scheme {
            OutputScheme::Merge => {
                let base = as_record(original, "original data")?;
                let overlay = as_record(result, "result")?;
                Ok(Value::Object(overlay_onto(base, overlay)))
            }
            OutputScheme::Namespace { key } => {
                let base = as_record(original, "original data")?;
                let overlay = as_record(result, "result")?;
                let scoped = match base.get(key) {
                    Some(Value::Object(scoped)) => scoped,
                    Some(_) => {
                        return Err(PluginError::Validation(format!(
                            "Namespace '{key}' in the original data is not a record"
                        )))
                    }
                    None => {
                        return Err(PluginError::Validation(format!(
                            "Namespace '{key}' not found in the original data"
                        )))
                    }
                };
                // Sibling keys of the namespace are not carried over.
                Ok(Value::Object(overlay_onto(scoped, overlay)))
            }
            OutputScheme::Result => Ok(result.clone()),
        }
    }
}

fn as_record<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| PluginError::Validation(format!("The {what} must be a record")))
}

fn overlay_onto(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
