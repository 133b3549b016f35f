//! Document-type classification of one file or one page.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use compileflow_core::models::{ClassificationResult, CORE_DOCUMENT_TYPES};

use crate::error::{PipelineError, PipelineResult};
use crate::llm::{parse_json_text, Content, GenerateRequest, MultimodalModel, Part};

fn classify_prompt() -> String {
    format!(
        "Classify the attached business document into a single document type.\n\
         Core document types: {}.\n\
         If the document is one of the core types, return that label exactly as written above.\n\
         Otherwise return your best short label for it (for example \"Certificate Of Origin\").\n\
         Return confidence as a number between 0 and 1.",
        CORE_DOCUMENT_TYPES.join(", ")
    )
}

fn classification_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "documentType": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
        },
        "required": ["documentType", "confidence"],
    })
}

/// Check a classifier answer.
pub fn parse_classification(value: &Value) -> PipelineResult<ClassificationResult> {
    let document_type = value
        .get("documentType")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            PipelineError::MalformedResponse("documentType must be a non-empty string".into())
        })?;
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c))
        .ok_or_else(|| {
            PipelineError::MalformedResponse("confidence must be a number in [0, 1]".into())
        })?;
    Ok(ClassificationResult {
        document_type: document_type.to_string(),
        confidence,
    })
}

#[derive(Clone)]
pub struct Classifier {
    model: Arc<dyn MultimodalModel>,
}

impl Classifier {
    pub fn new(model: Arc<dyn MultimodalModel>) -> Self {
        Self { model }
    }

    pub async fn classify(&self, bytes: &[u8], mime_type: &str) -> PipelineResult<ClassificationResult> {
        let request = GenerateRequest::new(vec![Content::user(vec![
            Part::InlineData {
                mime_type: mime_type.to_string(),
                data: bytes.to_vec(),
            },
            Part::Text(classify_prompt()),
        ])])
        .with_schema(classification_schema());

        let response = self.model.generate(request).await?;
        let value = parse_json_text(&response.joined_text()).map_err(PipelineError::MalformedResponse)?;
        let result = parse_classification(&value)?;
        debug!(document_type = %result.document_type, confidence = result.confidence, "classified");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedModel;

    #[test]
    fn test_parse_classification_rules() {
        let ok = parse_classification(&json!({"documentType": " Invoice ", "confidence": 0.9})).unwrap();
        assert_eq!(ok.document_type, "Invoice");

        for bad in [
            json!({"documentType": "", "confidence": 0.5}),
            json!({"documentType": 3, "confidence": 0.5}),
            json!({"documentType": "Invoice", "confidence": 1.5}),
            json!({"documentType": "Invoice", "confidence": "high"}),
            json!({"documentType": "Invoice"}),
        ] {
            assert!(matches!(
                parse_classification(&bad),
                Err(PipelineError::MalformedResponse(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_classify_sends_file_at_zero_temperature() {
        let model = Arc::new(ScriptedModel::json_answers(vec![
            json!({"documentType": "Packing List", "confidence": 0.8}),
        ]));
        let classifier = Classifier::new(model.clone());
        let result = classifier.classify(b"%PDF", "application/pdf").await.unwrap();
        assert_eq!(result.document_type, "Packing List");

        let requests = model.requests();
        assert_eq!(requests[0].temperature, 0.0);
        assert!(requests[0].response_schema.is_some());
        let Part::Text(prompt) = &requests[0].contents[0].parts[1] else {
            panic!("expected prompt text");
        };
        assert!(prompt.contains("Sea Waybill"));
    }

    #[tokio::test]
    async fn test_classify_unparsable_answer() {
        let model = Arc::new(ScriptedModel::queue(vec![crate::llm::GenerateResponse::text(
            "I think it is an invoice",
        )]));
        let err = Classifier::new(model).classify(b"x", "image/png").await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedResponse(_)));
    }
}
