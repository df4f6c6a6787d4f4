//! Structured-data validation seam.
//!
//! Save calls the repo's [`Validator`] on every new body before any block is
//! written. Schema languages live outside this crate; the default validator
//! only checks that a body parses in its declared format and that a JSON
//! schema's top-level `type`, when present, matches.

use crate::dataset::{DataFormat, Structure};
use crate::error::{Error, Result};
use serde_json::Value;

/// Validates a body against its structure.
pub trait Validator: Send + Sync {
    fn validate(&self, body: &[u8], structure: Option<&Structure>) -> Result<()>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate(&self, _body: &[u8], _structure: Option<&Structure>) -> Result<()> {
        Ok(())
    }
}

/// Format-level checks for JSON and CSV bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatValidator;

impl Validator for FormatValidator {
    fn validate(&self, body: &[u8], structure: Option<&Structure>) -> Result<()> {
        let format = structure.map(|s| s.format).unwrap_or_default();
        match format {
            DataFormat::Json => {
                let value: Value = serde_json::from_slice(body)
                    .map_err(|e| Error::validation(format!("body is not valid JSON: {}", e)))?;
                if let Some(expected) = structure
                    .and_then(|s| s.schema.as_ref())
                    .and_then(|schema| schema.get("type"))
                    .and_then(Value::as_str)
                {
                    check_json_type(&value, expected)?;
                }
                Ok(())
            }
            DataFormat::Csv => check_csv(body),
        }
    }
}

fn check_json_type(value: &Value, expected: &str) -> Result<()> {
    let actual = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    if actual != expected {
        return Err(Error::validation(format!(
            "body top-level type is {}, schema requires {}",
            actual, expected
        )));
    }
    Ok(())
}

fn check_csv(body: &[u8]) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_reader(body);
    for record in reader.records() {
        record.map_err(|e| Error::validation(format!("invalid CSV body: {}", e)))?;
    }
    Ok(())
}
