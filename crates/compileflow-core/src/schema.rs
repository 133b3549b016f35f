//! Run-time field schemas built from user- or AI-confirmed field lists.
//!
//! [`FieldSchema::build`] turns a [`FieldSet`] into a typed schema with one
//! leaf per descriptor (string, number, or ISO date string) and the
//! descriptor's `required` flag mirrored exactly. The same schema is used
//! two ways:
//!
//! - [`FieldSchema::to_json_schema`] renders a JSON Schema document that
//!   constrains the model's structured output, with each descriptor's
//!   `description` attached as guidance.
//! - [`FieldSchema::validate`] checks a model response against it.
//!
//! For more than one source document the per-document `{header, lineItems}`
//! shape is wrapped in `{documents: [...]}` whose length must equal the
//! number of inputs exactly.
//!
//! Values may be `null` (unclear or missing data); a required key must
//! still be present.

use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::models::{FieldDescriptor, FieldSet, FieldType};

/// A validation failure, with a JSON-pointer-like path to the offending node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// One typed leaf of the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub name: String,
    pub kind: FieldType,
    pub required: bool,
    pub description: String,
}

impl From<&FieldDescriptor> for Leaf {
    fn from(f: &FieldDescriptor) -> Self {
        let mut description = f.description.trim().to_string();
        if let Some(example) = f.example.as_deref().filter(|e| !e.trim().is_empty()) {
            if !description.is_empty() {
                description.push(' ');
            }
            description.push_str(&format!("Example: {}", example.trim()));
        }
        Self {
            name: f.name.trim().to_string(),
            kind: f.field_type,
            required: f.required,
            description,
        }
    }
}

/// Validation schema for one extraction request.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub header: Vec<Leaf>,
    pub line_items: Vec<Leaf>,
    /// Number of source documents; `> 1` selects the `documents` wrapper.
    pub document_count: usize,
}

impl FieldSchema {
    /// Build a schema from two descriptor lists. Pure and side-effect-free.
    pub fn build(fields: &FieldSet, document_count: usize) -> Self {
        Self {
            header: fields.header_fields.iter().map(Leaf::from).collect(),
            line_items: fields.line_item_fields.iter().map(Leaf::from).collect(),
            document_count: document_count.max(1),
        }
    }

    pub fn is_batch(&self) -> bool {
        self.document_count > 1
    }

    /// Same field lists, single-document shape. Used per chunk window.
    pub fn single(&self) -> Self {
        Self {
            document_count: 1,
            ..self.clone()
        }
    }

    /// Render as a JSON Schema document for model structured output.
    pub fn to_json_schema(&self) -> Value {
        let document = json!({
            "type": "object",
            "properties": {
                "header": object_schema(&self.header),
                "lineItems": {
                    "type": "array",
                    "description": "Every line-item row visible in the document, in order. One entry per row; never summarize or omit rows.",
                    "items": object_schema(&self.line_items),
                },
            },
            "required": ["header", "lineItems"],
            "additionalProperties": false,
        });

        if !self.is_batch() {
            return document;
        }

        json!({
            "type": "object",
            "properties": {
                "documents": {
                    "type": "array",
                    "description": "One entry per input document, in input order.",
                    "minItems": self.document_count,
                    "maxItems": self.document_count,
                    "items": document,
                },
            },
            "required": ["documents"],
            "additionalProperties": false,
        })
    }

    /// Validate a model response against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        if !self.is_batch() {
            return self.validate_document(value, "");
        }

        let obj = value
            .as_object()
            .ok_or_else(|| SchemaViolation::new("", "expected an object"))?;
        let docs = obj
            .get("documents")
            .and_then(Value::as_array)
            .ok_or_else(|| SchemaViolation::new("/documents", "expected an array"))?;
        if docs.len() != self.document_count {
            return Err(SchemaViolation::new(
                "/documents",
                format!(
                    "expected exactly {} documents, got {}",
                    self.document_count,
                    docs.len()
                ),
            ));
        }
        if let Some(extra) = obj.keys().find(|k| k.as_str() != "documents") {
            return Err(SchemaViolation::new(
                format!("/{}", extra),
                "unexpected property",
            ));
        }
        for (i, doc) in docs.iter().enumerate() {
            self.validate_document(doc, &format!("/documents/{}", i))?;
        }
        Ok(())
    }

    fn validate_document(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        let obj = value
            .as_object()
            .ok_or_else(|| SchemaViolation::new(path, "expected an object"))?;

        let header = obj
            .get("header")
            .ok_or_else(|| SchemaViolation::new(path, "missing required property 'header'"))?;
        validate_row(&self.header, header, &format!("{}/header", path))?;

        let rows = obj
            .get("lineItems")
            .ok_or_else(|| SchemaViolation::new(path, "missing required property 'lineItems'"))?
            .as_array()
            .ok_or_else(|| SchemaViolation::new(format!("{}/lineItems", path), "expected an array"))?;
        for (i, row) in rows.iter().enumerate() {
            validate_row(&self.line_items, row, &format!("{}/lineItems/{}", path, i))?;
        }

        if let Some(extra) = obj
            .keys()
            .find(|k| k.as_str() != "header" && k.as_str() != "lineItems")
        {
            return Err(SchemaViolation::new(
                format!("{}/{}", path, extra),
                "unexpected property",
            ));
        }
        Ok(())
    }

    /// Drop keys the field lists do not declare and fill absent optional
    /// keys with `null`, so every declared field is represented.
    ///
    /// Missing *required* keys are left missing for [`validate`](Self::validate)
    /// to reject.
    pub fn normalize(&self, value: &mut Value) {
        if self.is_batch() {
            if let Some(docs) = value.get_mut("documents").and_then(Value::as_array_mut) {
                for doc in docs {
                    self.normalize_document(doc);
                }
            }
        } else {
            self.normalize_document(value);
        }
    }

    fn normalize_document(&self, value: &mut Value) {
        let Some(obj) = value.as_object_mut() else {
            return;
        };
        if let Some(header) = obj.get_mut("header").and_then(Value::as_object_mut) {
            normalize_row(&self.header, header);
        }
        if let Some(Value::Null) = obj.get("lineItems") {
            obj.insert("lineItems".to_string(), Value::Array(Vec::new()));
        }
        if let Some(rows) = obj.get_mut("lineItems").and_then(Value::as_array_mut) {
            for row in rows.iter_mut().filter_map(Value::as_object_mut) {
                normalize_row(&self.line_items, row);
            }
        }
    }
}

fn object_schema(leaves: &[Leaf]) -> Value {
    let properties: Map<String, Value> = leaves
        .iter()
        .map(|leaf| (leaf.name.clone(), leaf_schema(leaf)))
        .collect();
    let required: Vec<&str> = leaves
        .iter()
        .filter(|l| l.required)
        .map(|l| l.name.as_str())
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn leaf_schema(leaf: &Leaf) -> Value {
    let mut schema = match leaf.kind {
        FieldType::String => json!({ "type": ["string", "null"] }),
        FieldType::Number => json!({ "type": ["number", "null"] }),
        FieldType::Date => json!({ "type": ["string", "null"], "format": "date" }),
    };
    let mut description = leaf.description.clone();
    if leaf.kind == FieldType::Date {
        if !description.is_empty() {
            description.push(' ');
        }
        description.push_str("Format: YYYY-MM-DD.");
    }
    if !description.is_empty() {
        schema["description"] = Value::String(description);
    }
    schema
}

fn validate_row(leaves: &[Leaf], value: &Value, path: &str) -> Result<(), SchemaViolation> {
    let obj = value
        .as_object()
        .ok_or_else(|| SchemaViolation::new(path, "expected an object"))?;

    for leaf in leaves {
        match obj.get(&leaf.name) {
            None if leaf.required => {
                return Err(SchemaViolation::new(
                    path,
                    format!("missing required property '{}'", leaf.name),
                ))
            }
            None => {}
            Some(v) => validate_leaf(leaf, v, &format!("{}/{}", path, leaf.name))?,
        }
    }

    if let Some(extra) = obj.keys().find(|k| !leaves.iter().any(|l| &l.name == *k)) {
        return Err(SchemaViolation::new(
            format!("{}/{}", path, extra),
            "unexpected property",
        ));
    }
    Ok(())
}

fn validate_leaf(leaf: &Leaf, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    match (leaf.kind, value) {
        (_, Value::Null) => Ok(()),
        (FieldType::String, Value::String(_)) => Ok(()),
        (FieldType::Number, Value::Number(_)) => Ok(()),
        (FieldType::Date, Value::String(s)) => {
            if is_iso_date(s) {
                Ok(())
            } else {
                Err(SchemaViolation::new(
                    path,
                    format!("expected a YYYY-MM-DD date, got '{}'", s),
                ))
            }
        }
        (kind, other) => Err(SchemaViolation::new(
            path,
            format!("expected {}, got {}", kind.as_str(), json_kind(other)),
        )),
    }
}

/// Strict `YYYY-MM-DD` check (four-digit year, zero-padded month and day).
pub fn is_iso_date(s: &str) -> bool {
    s.len() == 10 && NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn normalize_row(leaves: &[Leaf], row: &mut Map<String, Value>) {
    row.retain(|k, _| leaves.iter().any(|l| &l.name == k));
    for leaf in leaves.iter().filter(|l| !l.required) {
        row.entry(leaf.name.clone()).or_insert(Value::Null);
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
