#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use compileflow::blob::{BlobStore, LocalBlobStore};
use compileflow::config::Config;
use compileflow::llm::scripted::ScriptedModel;
use compileflow::llm::{GenerateRequest, GenerateResponse, Part};
use compileflow::pipeline::Pipeline;
use compileflow_core::embedding::Embedder;
use compileflow_core::models::{FieldDescriptor, FieldSet, FieldType};
use compileflow_core::store::memory::{InMemoryJobStore, InMemoryTemplateStore};

pub const BASE_URL: &str = "http://cflow.test";

/// Uncompressed PDF whose page `n` draws `(PAGE:<labels[n-1]>)`.
pub fn pdf(labels: &[&str]) -> Vec<u8> {
    let mut objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            (0..labels.len())
                .map(|i| format!("{} 0 R", 4 + 2 * i))
                .collect::<Vec<_>>()
                .join(" "),
            labels.len()
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];
    for (i, label) in labels.iter().enumerate() {
        let content = format!("BT /F1 12 Tf 72 720 Td (PAGE:{}) Tj ET", label);
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 3 0 R >> >> >>",
            5 + 2 * i
        ));
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            content.len(),
            content
        ));
    }

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
    for off in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref
        )
        .as_bytes(),
    );
    out
}

pub fn field(name: &str, field_type: FieldType) -> FieldDescriptor {
    FieldDescriptor {
        name: name.to_string(),
        label: String::new(),
        field_type,
        description: String::new(),
        required: false,
        example: None,
    }
}

/// `invoice_number`, `total` / `sku`, `qty`.
pub fn invoice_fields() -> FieldSet {
    FieldSet::new(
        vec![
            field("invoice_number", FieldType::String),
            field("total", FieldType::Number),
        ],
        vec![field("sku", FieldType::String), field("qty", FieldType::Number)],
    )
}

/// Bag-of-letters vectors: identical texts score 1.0.
pub struct LetterEmbedder;

#[async_trait]
impl Embedder for LetterEmbedder {
    fn model_name(&self) -> &str {
        "letters"
    }

    fn dims(&self) -> usize {
        26
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 26];
                for c in t.to_ascii_lowercase().bytes().filter(u8::is_ascii_lowercase) {
                    v[(c - b'a') as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

fn inline_text(req: &GenerateRequest) -> String {
    req.contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| match p {
            Part::InlineData { data, .. } => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Marker type of the first page in the request, e.g. `Invoice` for
/// `PAGE:Invoice-2`. Anything without a marker is an invoice.
fn marker_type(text: &str) -> String {
    let Some(at) = text.find("PAGE:") else {
        return "Invoice".to_string();
    };
    let rest = &text[at + 5..];
    let marker = &rest[..rest.find(')').unwrap_or(rest.len())];
    marker
        .rsplit_once('-')
        .map(|(t, _)| t)
        .unwrap_or(marker)
        .to_string()
}

fn fill_object(schema: &Value, tag: &str) -> Value {
    let mut out = Map::new();
    if let Some(props) = schema["properties"].as_object() {
        for (name, prop) in props {
            let is_number = prop["type"]
                .as_array()
                .map(|t| t.iter().any(|t| t == "number"))
                .unwrap_or(false);
            let value = if is_number {
                json!(1)
            } else {
                json!(format!("{}-{}", name, tag))
            };
            out.insert(name.clone(), value);
        }
    }
    Value::Object(out)
}

fn fill_document(schema: &Value, text: &str) -> Value {
    let rows = text.matches("(PAGE:").count().max(1);
    json!({
        "header": fill_object(&schema["properties"]["header"], "h"),
        "lineItems": (0..rows)
            .map(|i| fill_object(&schema["properties"]["lineItems"]["items"], &i.to_string()))
            .collect::<Vec<_>>(),
    })
}

fn last_function_response(req: &GenerateRequest) -> Option<(String, Value)> {
    req.contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| match p {
            Part::FunctionResponse { name, response } => Some((name.clone(), response.clone())),
            _ => None,
        })
        .last()
}

/// Orchestrator script: match the supplier `Acme Corp`, then follow the
/// decision the tool returned, then reply.
fn agent_turn(req: &GenerateRequest) -> GenerateResponse {
    let call = |name: &str, args: Value| GenerateResponse {
        parts: vec![Part::function_call(name, args)],
    };
    match last_function_response(req) {
        None => call("match_template", json!({ "supplier": "Acme Corp" })),
        Some((name, response)) if name == "match_template" => {
            match response["decision"]["action"].as_str() {
                Some("extract_with_template") => call(
                    "extract_with_template",
                    json!({ "templateId": response["decision"]["templateId"] }),
                ),
                _ => call("suggest_fields", json!({})),
            }
        }
        Some((name, _)) if name == "extract_with_template" => {
            GenerateResponse::text("Extracted with the saved Acme Corp template.")
        }
        Some(_) => GenerateResponse::text("Please confirm the proposed fields."),
    }
}

/// One model for every stage, routed by the response schema it is asked for.
pub fn document_model() -> ScriptedModel {
    ScriptedModel::respond_with(|req| {
        if !req.tools.is_empty() {
            return Ok(agent_turn(req));
        }
        let schema = req.response_schema.clone().unwrap_or(Value::Null);
        let text = inline_text(req);
        let props = &schema["properties"];

        let answer = if props.get("headerFields").is_some() {
            json!({
                "headerFields": [{ "name": "invoice_number", "label": "Invoice No.", "type": "string" }],
                "lineItemFields": [{ "name": "sku", "label": "SKU", "type": "string" }],
                "documentType": "Invoice",
                "confidence": 0.8,
            })
        } else if props.get("documentType").is_some() {
            json!({ "documentType": marker_type(&text), "confidence": 0.9 })
        } else if props.get("documents").is_some() {
            let count = props["documents"]["minItems"].as_u64().unwrap_or(1);
            let docs: Vec<Value> = (0..count)
                .map(|_| fill_document(&props["documents"]["items"], ""))
                .collect();
            json!({ "documents": docs })
        } else {
            fill_document(&schema, &text)
        };
        Ok(GenerateResponse::text(answer.to_string()))
    })
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub blobs: Arc<LocalBlobStore>,
    pub jobs: Arc<InMemoryJobStore>,
    _tmp: TempDir,
}

pub fn harness() -> Harness {
    harness_with(Config::default())
}

pub fn harness_with(mut config: Config) -> Harness {
    let tmp = TempDir::new().unwrap();
    config.storage.root = tmp.path().to_path_buf();
    config.storage.public_base_url = BASE_URL.to_string();

    let blobs = Arc::new(LocalBlobStore::new(tmp.path(), BASE_URL));
    let jobs = Arc::new(InMemoryJobStore::new());
    let pipeline = Pipeline::new(
        config,
        Arc::new(document_model()),
        Arc::new(LetterEmbedder),
        Arc::new(InMemoryTemplateStore::new()),
        jobs.clone(),
        blobs.clone(),
        reqwest::Client::new(),
    );
    Harness {
        pipeline,
        blobs,
        jobs,
        _tmp: tmp,
    }
}

impl Harness {
    /// Store a file and return its URL.
    pub async fn upload(&self, name: &str, bytes: Vec<u8>) -> String {
        self.blobs.put(name, &bytes).await.unwrap().url
    }
}
