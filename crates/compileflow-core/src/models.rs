//! Core data models that flow through the classification and extraction
//! pipeline.
//!
//! JSON field names follow the wire contract consumed by the dashboard
//! (`documentType`, `pageNumbers`, `lineItems`, ...), so every type here
//! serializes in camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Document types that mark a business-critical attachment.
///
/// The classifier is told to return one of these verbatim when it applies.
pub const CORE_DOCUMENT_TYPES: [&str; 6] = [
    "Invoice",
    "Packing List",
    "Sea Waybill",
    "Packing Declaration",
    "Air Waybill",
    "Waybill",
];

/// Case-insensitive membership test against [`CORE_DOCUMENT_TYPES`].
pub fn is_core_document(document_type: &str) -> bool {
    let needle = document_type.trim();
    CORE_DOCUMENT_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(needle))
}

/// Output of the document classifier for one page or one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub document_type: String,
    pub confidence: f64,
}

/// A page-bounded excerpt of an uploaded file with a single document type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalDocument {
    /// Blob storage key of the rendered excerpt.
    pub storage_id: String,
    /// Name of the uploaded file this excerpt was cut from.
    pub source_file: String,
    /// Display name of the excerpt (e.g. `bundle_p3-4.pdf`).
    pub file_name: String,
    /// 1-based, contiguous, ascending page numbers within the source file.
    pub page_numbers: Vec<u32>,
    pub document_type: String,
    pub confidence: f64,
    pub is_core_document: bool,
    pub file_url: String,
}

/// Primitive type of an extractable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    /// ISO `YYYY-MM-DD` string.
    Date,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Date => "date",
        }
    }
}

/// Describes one extractable attribute (header or line-item).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    /// Programmatic key, unique within its list.
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Free-text guidance passed to the extraction model.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

impl FieldDescriptor {
    /// Label for display and CSV headers; falls back to the raw name.
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.name
        } else {
            &self.label
        }
    }
}

/// The two disjoint field lists of one extraction context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSet {
    #[serde(default)]
    pub header_fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub line_item_fields: Vec<FieldDescriptor>,
}

impl FieldSet {
    pub fn new(header_fields: Vec<FieldDescriptor>, line_item_fields: Vec<FieldDescriptor>) -> Self {
        Self {
            header_fields,
            line_item_fields,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.header_fields.is_empty() && self.line_item_fields.is_empty()
    }

    /// Check that every name is non-empty and unique within its list.
    pub fn validate(&self) -> Result<(), String> {
        for (list, fields) in [
            ("headerFields", &self.header_fields),
            ("lineItemFields", &self.line_item_fields),
        ] {
            let mut seen = std::collections::HashSet::new();
            for f in fields {
                let name = f.name.trim();
                if name.is_empty() {
                    return Err(format!("{}: field name must not be empty", list));
                }
                if !seen.insert(name) {
                    return Err(format!("{}: duplicate field name '{}'", list, name));
                }
            }
        }
        Ok(())
    }

    /// Map of field name → display label across both lists.
    pub fn labels(&self) -> std::collections::HashMap<String, String> {
        self.header_fields
            .iter()
            .chain(self.line_item_fields.iter())
            .map(|f| (f.name.clone(), f.display_label().to_string()))
            .collect()
    }
}

/// A saved, supplier-keyed field set reused across jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub supplier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(flatten)]
    pub fields: FieldSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// A fresh template with a random id and both timestamps set to now.
    pub fn new(supplier: &str, client_name: Option<&str>, fields: FieldSet) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            supplier: supplier.trim().to_string(),
            client_name: client_name
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            fields,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A template candidate with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMatch {
    #[serde(flatten)]
    pub template: Template,
    pub score: f64,
}

/// Extracted values for one document.
///
/// Every key corresponds to a field name from the originating lists;
/// unclear values are `null` rather than omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentExtraction {
    #[serde(default)]
    pub header: Map<String, Value>,
    #[serde(default)]
    pub line_items: Vec<Map<String, Value>>,
}

/// Extraction output: one document, or a batch wrapped in `documents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtractionResult {
    Batch { documents: Vec<DocumentExtraction> },
    Single(DocumentExtraction),
}

impl ExtractionResult {
    /// All documents in order (one for [`ExtractionResult::Single`]).
    pub fn documents(&self) -> Vec<&DocumentExtraction> {
        match self {
            ExtractionResult::Single(doc) => vec![doc],
            ExtractionResult::Batch { documents } => documents.iter().collect(),
        }
    }
}

/// Role of a persisted conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            _ => None,
        }
    }
}

/// One turn of an orchestrator conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}
