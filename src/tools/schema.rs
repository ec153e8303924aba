//! Declarative parameter schemas for tools.
//!
//! Each tool declares required parameter names and per-parameter types; the
//! executor validates every call against the schema before the tool runs.
//! Bounds are deliberately coarse — they exist to stop pathological values
//! (giant strings, absurd numbers) at the boundary, not to replace the
//! tool's own argument handling.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::CoreError;

/// Numeric parameters must satisfy `|x| <= 1e15`.
pub const MAX_NUMERIC_MAGNITUDE: f64 = 1e15;
/// String parameters are capped at 10 MiB.
pub const MAX_STRING_BYTES: usize = 10 * 1024 * 1024;

/// Wire type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Parameter schema of one tool.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    properties: HashMap<String, ParamType>,
    required: Vec<String>,
}

/// Tool-call parameters as decoded from model output.
pub type ToolParams = serde_json::Map<String, Value>;

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an optional parameter.
    pub fn optional(mut self, name: &str, ty: ParamType) -> Self {
        self.properties.insert(name.to_string(), ty);
        self
    }

    /// Declare a required parameter.
    pub fn required(mut self, name: &str, ty: ParamType) -> Self {
        self.properties.insert(name.to_string(), ty);
        self.required.push(name.to_string());
        self
    }

    /// Validate a parameter map: required presence, declared types, numeric
    /// and string bounds. Undeclared parameters are tolerated (models add
    /// stray keys); only declared ones are type-checked.
    pub fn validate(&self, params: &ToolParams) -> Result<(), CoreError> {
        for name in &self.required {
            if !params.contains_key(name.as_str()) {
                return Err(CoreError::ParameterInvalid {
                    name: name.clone(),
                    reason: "required parameter missing".into(),
                });
            }
        }

        for (name, value) in params {
            if let Some(expected) = self.properties.get(name.as_str()) {
                if !expected.matches(value) {
                    return Err(CoreError::ParameterInvalid {
                        name: name.clone(),
                        reason: format!("expected {}", expected.name()),
                    });
                }
            }
            check_bounds(name, value)?;
        }
        Ok(())
    }
}

/// Bounds apply to every value, declared or not, including nested ones.
fn check_bounds(name: &str, value: &Value) -> Result<(), CoreError> {
    match value {
        Value::Number(n) => {
            let magnitude = n.as_f64().map(f64::abs).unwrap_or(f64::INFINITY);
            if magnitude > MAX_NUMERIC_MAGNITUDE {
                return Err(CoreError::ParameterInvalid {
                    name: name.to_string(),
                    reason: format!("numeric magnitude exceeds {MAX_NUMERIC_MAGNITUDE:e}"),
                });
            }
        }
        Value::String(s) => {
            if s.len() > MAX_STRING_BYTES {
                return Err(CoreError::ParameterInvalid {
                    name: name.to_string(),
                    reason: format!("string exceeds {MAX_STRING_BYTES} bytes"),
                });
            }
        }
        Value::Array(items) => {
            for item in items {
                check_bounds(name, item)?;
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                check_bounds(k, v)?;
            }
        }
        _ => {}
    }
    Ok(())
}
