//! Multimodal model abstraction.
//!
//! The pipeline talks to a provider-hosted model through
//! [`MultimodalModel`]: one request carries a system instruction, a
//! conversation of [`Content`] turns whose parts may inline PDF or image
//! bytes, an optional JSON Schema constraining the answer, and optional
//! tool declarations for the orchestrator.
//!
//! | Provider | Type |
//! |----------|------|
//! | `disabled` | [`DisabledModel`] |
//! | `gemini` | [`gemini::GeminiModel`] |
//!
//! [`scripted::ScriptedModel`] answers from a caller-supplied script and
//! backs the test suites.

pub mod gemini;
pub mod partial_json;
pub mod scripted;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::config::ModelConfig;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse model response: {0}")]
    Parse(String),
    #[error("model not configured: {0}")]
    NotConfigured(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// One piece of a conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    /// Raw file bytes sent inline (PDF page ranges, images).
    InlineData { mime_type: String, data: Vec<u8> },
    /// A tool invocation requested by the model. `thought_signature` is
    /// opaque provider state that must be sent back with the call.
    FunctionCall {
        name: String,
        args: Value,
        thought_signature: Option<String>,
    },
    /// The result of a tool invocation, returned to the model.
    FunctionResponse { name: String, response: Value },
}

impl Part {
    pub fn function_call(name: impl Into<String>, args: Value) -> Self {
        Part::FunctionCall {
            name: name.into(),
            args,
            thought_signature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::Text(text.into())])
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    pub system: Option<String>,
    pub contents: Vec<Content>,
    /// When set, the model must answer with JSON matching this schema.
    pub response_schema: Option<Value>,
    pub tools: Vec<FunctionDeclaration>,
    pub temperature: f32,
}

impl GenerateRequest {
    pub fn new(contents: Vec<Content>) -> Self {
        Self {
            contents,
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_tools(mut self, tools: Vec<FunctionDeclaration>) -> Self {
        self.tools = tools;
        self
    }
}

/// The parts of the model's single candidate answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateResponse {
    pub parts: Vec<Part>,
}

impl GenerateResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::Text(text.into())],
        }
    }

    /// All text parts joined.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn function_calls(&self) -> Vec<(&str, &Value)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { name, args, .. } => Some((name.as_str(), args)),
                _ => None,
            })
            .collect()
    }
}

/// Incremental text deltas of a streamed answer.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

#[async_trait]
pub trait MultimodalModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ModelError>;

    /// Stream the answer as text deltas. Tool declarations are ignored.
    async fn stream_text(&self, request: GenerateRequest) -> Result<TextStream, ModelError>;
}

/// Model used when `model.provider = "disabled"`; every call fails.
pub struct DisabledModel;

#[async_trait]
impl MultimodalModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: GenerateRequest) -> Result<GenerateResponse, ModelError> {
        Err(ModelError::NotConfigured(
            "model.provider is disabled".to_string(),
        ))
    }

    async fn stream_text(&self, _request: GenerateRequest) -> Result<TextStream, ModelError> {
        Err(ModelError::NotConfigured(
            "model.provider is disabled".to_string(),
        ))
    }
}

/// Instantiate the configured model provider.
pub fn create_model(config: &ModelConfig) -> anyhow::Result<Arc<dyn MultimodalModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "gemini" => Ok(Arc::new(gemini::GeminiModel::from_config(config)?)),
        other => anyhow::bail!("Unknown model provider: {}", other),
    }
}

/// Parse a JSON answer, tolerating a surrounding markdown code fence.
pub fn parse_json_text(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| format!("{} (response: {})", e, excerpt(text)))
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 200;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
