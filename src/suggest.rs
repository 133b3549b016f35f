//! Field-list proposals for documents with no confident template.
//!
//! The model looks at the documents and proposes header and line-item
//! fields. The proposal goes to a human for confirmation; it is never used
//! for extraction on its own.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use compileflow_core::models::{FieldDescriptor, FieldSet};

use crate::error::{PipelineError, PipelineResult};
use crate::llm::{parse_json_text, Content, GenerateRequest, MultimodalModel, Part};
use crate::source::SourceFile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSuggestion {
    pub header_fields: Vec<FieldDescriptor>,
    pub line_item_fields: Vec<FieldDescriptor>,
    pub document_type: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub files_analyzed: usize,
}

impl FieldSuggestion {
    pub fn fields(&self) -> FieldSet {
        FieldSet::new(self.header_fields.clone(), self.line_item_fields.clone())
    }
}

const SUGGEST_PROMPT: &str = "Propose the fields a reviewer would want extracted from the attached document(s).\n\
Header fields are values that appear once per document (numbers, dates, parties, totals).\n\
Line-item fields are the columns of the repeating rows of its main table.\n\
Use snake_case names, a short human label, type string, number or date, and mark a field required only if every document of this kind has it.\n\
Report the document type and your confidence between 0 and 1. Use notes for anything the reviewer should check.";

fn descriptor_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "label": { "type": "string" },
            "type": { "type": "string", "enum": ["string", "number", "date"] },
            "description": { "type": "string" },
            "required": { "type": "boolean" },
            "example": { "type": "string" },
        },
        "required": ["name", "label", "type", "description", "required"],
    })
}

fn suggestion_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "headerFields": { "type": "array", "items": descriptor_schema() },
            "lineItemFields": { "type": "array", "items": descriptor_schema() },
            "documentType": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "notes": { "type": "string" },
        },
        "required": ["headerFields", "lineItemFields", "documentType", "confidence"],
    })
}

/// Check a proposal and stamp the number of files it was based on.
pub fn parse_suggestion(value: Value, files_analyzed: usize) -> PipelineResult<FieldSuggestion> {
    let mut suggestion: FieldSuggestion = serde_json::from_value(value)
        .map_err(|e| PipelineError::MalformedResponse(format!("field suggestion: {}", e)))?;
    suggestion
        .fields()
        .validate()
        .map_err(PipelineError::MalformedResponse)?;
    if suggestion.document_type.trim().is_empty() {
        return Err(PipelineError::MalformedResponse(
            "documentType must not be empty".into(),
        ));
    }
    if !(0.0..=1.0).contains(&suggestion.confidence) {
        return Err(PipelineError::MalformedResponse(
            "confidence must be in [0, 1]".into(),
        ));
    }
    suggestion.notes = suggestion.notes.filter(|n| !n.trim().is_empty());
    suggestion.files_analyzed = files_analyzed;
    Ok(suggestion)
}

#[derive(Clone)]
pub struct Suggester {
    model: Arc<dyn MultimodalModel>,
}

impl Suggester {
    pub fn new(model: Arc<dyn MultimodalModel>) -> Self {
        Self { model }
    }

    pub async fn suggest(&self, sources: &[SourceFile]) -> PipelineResult<FieldSuggestion> {
        if sources.is_empty() {
            return Err(PipelineError::invalid("no documents to analyze"));
        }
        let mut parts: Vec<Part> = sources
            .iter()
            .map(|s| Part::InlineData {
                mime_type: s.mime_type.clone(),
                data: s.bytes.clone(),
            })
            .collect();
        parts.push(Part::Text(SUGGEST_PROMPT.to_string()));

        let request =
            GenerateRequest::new(vec![Content::user(parts)]).with_schema(suggestion_schema());
        let response = self.model.generate(request).await?;
        let value = parse_json_text(&response.joined_text()).map_err(PipelineError::MalformedResponse)?;
        let suggestion = parse_suggestion(value, sources.len())?;
        info!(
            document_type = %suggestion.document_type,
            header = suggestion.header_fields.len(),
            line_items = suggestion.line_item_fields.len(),
            "suggested fields"
        );
        Ok(suggestion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedModel;

    fn answer() -> Value {
        json!({
            "headerFields": [
                {"name": "invoice_number", "label": "Invoice No.", "type": "string", "description": "", "required": true}
            ],
            "lineItemFields": [
                {"name": "qty", "label": "Quantity", "type": "number", "description": "", "required": false}
            ],
            "documentType": "Invoice",
            "confidence": 0.7,
            "notes": ""
        })
    }

    #[tokio::test]
    async fn test_suggest_counts_files() {
        let model = Arc::new(ScriptedModel::json_answers(vec![answer()]));
        let sources = vec![
            SourceFile::new("a.png", "image/png", vec![1]),
            SourceFile::new("b.png", "image/png", vec![2]),
        ];
        let s = Suggester::new(model.clone()).suggest(&sources).await.unwrap();
        assert_eq!(s.files_analyzed, 2);
        assert_eq!(s.header_fields[0].name, "invoice_number");
        assert_eq!(s.notes, None);
        assert_eq!(model.requests()[0].contents[0].parts.len(), 3);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut value = answer();
        value["lineItemFields"] = json!([
            {"name": "qty", "label": "Q", "type": "number", "description": "", "required": false},
            {"name": "qty", "label": "Q2", "type": "number", "description": "", "required": false}
        ]);
        assert!(matches!(
            parse_suggestion(value, 1),
            Err(PipelineError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_bad_type_and_confidence_rejected() {
        let mut value = answer();
        value["headerFields"][0]["type"] = json!("money");
        assert!(parse_suggestion(value, 1).is_err());

        let mut value = answer();
        value["confidence"] = json!(2);
        assert!(parse_suggestion(value, 1).is_err());
    }
}
