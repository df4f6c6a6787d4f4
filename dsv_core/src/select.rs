//! Reading parts of a dataset version: body rows and single components.

use crate::dataset::{DataFormat, Dataset, Structure};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

/// Rows returned by a body read when no limit is given.
pub const DEFAULT_BODY_LIMIT: usize = 100;

/// Window into a body's rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyParams {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Every row. Only honoured when `offset` and `limit` are left at their
    /// defaults; an explicit window always wins.
    #[serde(default)]
    pub all: bool,
}

fn default_limit() -> usize {
    DEFAULT_BODY_LIMIT
}

impl Default for BodyParams {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_BODY_LIMIT,
            all: false,
        }
    }
}

impl BodyParams {
    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            all: false,
        }
    }

    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    fn window(&self) -> (usize, usize) {
        if self.all && self.offset == 0 && self.limit == DEFAULT_BODY_LIMIT {
            (0, usize::MAX)
        } else {
            (self.offset, self.limit)
        }
    }
}

/// One window of body rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyPage {
    pub offset: usize,
    /// Rows in the whole body.
    pub total: usize,
    pub rows: Vec<Value>,
}

/// Decode a body into rows.
///
/// A JSON array yields its elements and a JSON object yields `[key, value]`
/// pairs. A CSV body yields one array of strings per record, header
/// included.
pub fn decode_rows(body: &[u8], structure: Option<&Structure>) -> Result<Vec<Value>> {
    match structure.map(|s| s.format).unwrap_or_default() {
        DataFormat::Json => match serde_json::from_slice(body)? {
            Value::Array(rows) => Ok(rows),
            Value::Object(entries) => Ok(entries
                .into_iter()
                .map(|(key, value)| json!([key, value]))
                .collect()),
            other => Err(Error::bad_request(format!(
                "body is a JSON {}, not rows",
                json_type(&other)
            ))),
        },
        DataFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(body);
            let mut rows = Vec::new();
            for record in reader.records() {
                let record =
                    record.map_err(|e| Error::validation(format!("invalid CSV body: {}", e)))?;
                rows.push(Value::Array(
                    record.iter().map(|f| Value::String(f.to_string())).collect(),
                ));
            }
            Ok(rows)
        }
    }
}

/// Cut the requested window out of `rows`.
pub fn page_rows(rows: Vec<Value>, params: &BodyParams) -> BodyPage {
    let total = rows.len();
    let (offset, limit) = params.window();
    BodyPage {
        offset,
        total,
        rows: rows.into_iter().skip(offset).take(limit).collect(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A top-level part of a dataset version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Commit,
    Structure,
    Body,
    Meta,
    Viz,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Commit => "commit",
            Component::Structure => "structure",
            Component::Body => "body",
            Component::Meta => "meta",
            Component::Viz => "viz",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "commit" => Ok(Component::Commit),
            "structure" => Ok(Component::Structure),
            "body" => Ok(Component::Body),
            "meta" => Ok(Component::Meta),
            "viz" => Ok(Component::Viz),
            _ => Err(Error::bad_request(format!("'{}' is not a dataset component", s))),
        }
    }
}

/// A component plus an optional dotted path inside it, e.g. `meta.title`
/// or `body.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub component: Option<Component>,
    pub fields: Vec<String>,
}

impl Selector {
    /// Parse a selector; the empty string selects the whole version.
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() {
            return Ok(Self {
                component: None,
                fields: Vec::new(),
            });
        }
        let mut parts = path.split('.');
        let component = parts.next().unwrap_or_default().parse()?;
        let fields: Vec<String> = parts.map(str::to_string).collect();
        if fields.iter().any(String::is_empty) {
            return Err(Error::bad_request(format!("empty field in selector '{}'", path)));
        }
        Ok(Self {
            component: Some(component),
            fields,
        })
    }

    /// Apply to a loaded version. Missing components and fields are `NotFound`.
    pub fn select(&self, dataset: &Dataset) -> Result<Value> {
        let Some(component) = self.component else {
            return whole(dataset);
        };
        let mut value = component_value(dataset, component)?
            .ok_or_else(|| Error::not_found(format!("{} component", component)))?;

        for field in &self.fields {
            value = match value {
                Value::Object(mut map) => map.remove(field),
                Value::Array(mut items) => field
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i < items.len())
                    .map(|i| items.swap_remove(i)),
                _ => None,
            }
            .ok_or_else(|| Error::not_found(format!("field '{}' in {}", field, component)))?;
        }
        Ok(value)
    }
}

fn component_value(dataset: &Dataset, component: Component) -> Result<Option<Value>> {
    Ok(match component {
        Component::Commit => Some(serde_json::to_value(&dataset.commit)?),
        Component::Structure => dataset
            .structure
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?,
        Component::Meta => dataset.meta.clone(),
        Component::Viz => dataset.viz.clone(),
        Component::Body => dataset
            .body
            .as_deref()
            .map(|b| decode_rows(b, dataset.structure.as_ref()).map(Value::Array))
            .transpose()?,
    })
}

fn whole(dataset: &Dataset) -> Result<Value> {
    let mut out = Map::new();
    for component in [
        Component::Commit,
        Component::Structure,
        Component::Meta,
        Component::Viz,
        Component::Body,
    ] {
        if let Some(value) = component_value(dataset, component)? {
            out.insert(component.to_string(), value);
        }
    }
    Ok(Value::Object(out))
}
