//! Gemini `generateContent` / `streamGenerateContent` provider.
//!
//! Files travel as `inline_data` parts (base64). Structured output uses
//! `responseMimeType = "application/json"` with `responseJsonSchema`, and
//! tool calling uses `functionDeclarations`. The API key is read from
//! `GEMINI_API_KEY`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    Content, GenerateRequest, GenerateResponse, ModelError, MultimodalModel, Part, Role,
    TextStream,
};
use crate::config::ModelConfig;

pub struct GeminiModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_output_tokens: u32,
}

impl GeminiModel {
    pub fn new(api_key: String, model: String, base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_output_tokens: 65536,
        })
    }

    pub fn from_config(config: &ModelConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        let mut model = Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?;
        model.max_output_tokens = config.max_output_tokens;
        Ok(model)
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, self.model, method)
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response, ModelError> {
        debug!(model = %self.model, url, "Gemini request");
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Build the JSON body shared by both endpoints.
pub fn build_request_body(request: &GenerateRequest, max_output_tokens: u32) -> Value {
    let contents: Vec<Value> = request.contents.iter().map(content_json).collect();

    let mut generation_config = json!({
        "temperature": request.temperature,
        "maxOutputTokens": max_output_tokens,
    });
    if let Some(schema) = &request.response_schema {
        generation_config["responseMimeType"] = json!("application/json");
        generation_config["responseJsonSchema"] = schema.clone();
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });

    if let Some(system) = &request.system {
        body["system_instruction"] = json!({ "parts": [{ "text": system }] });
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    body
}

fn content_json(content: &Content) -> Value {
    let parts: Vec<Value> = content.parts.iter().map(part_json).collect();
    json!({
        "role": match content.role {
            Role::User => "user",
            Role::Model => "model",
        },
        "parts": parts,
    })
}

fn part_json(part: &Part) -> Value {
    match part {
        Part::Text(text) => json!({ "text": text }),
        Part::InlineData { mime_type, data } => json!({
            "inline_data": {
                "mime_type": mime_type,
                "data": base64::engine::general_purpose::STANDARD.encode(data),
            }
        }),
        Part::FunctionCall {
            name,
            args,
            thought_signature,
        } => {
            let mut part = json!({ "functionCall": { "name": name, "args": args } });
            if let Some(signature) = thought_signature {
                part["thoughtSignature"] = json!(signature);
            }
            part
        }
        Part::FunctionResponse { name, response } => json!({
            "functionResponse": { "name": name, "response": response }
        }),
    }
}

/// Extract the first candidate's parts. Thought parts are skipped; a
/// function call keeps its `thoughtSignature` for the next request.
pub fn parse_response(resp: &Value) -> Result<GenerateResponse, ModelError> {
    let Some(candidate) = resp["candidates"].get(0) else {
        let reason = resp["promptFeedback"]["blockReason"]
            .as_str()
            .unwrap_or("no candidates returned");
        return Err(ModelError::Parse(reason.to_string()));
    };

    let mut parts = Vec::new();
    for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
        if part["thought"].as_bool() == Some(true) {
            continue;
        }
        if let Some(text) = part["text"].as_str() {
            parts.push(Part::Text(text.to_string()));
        } else if let Some(call) = part.get("functionCall") {
            let name = call["name"]
                .as_str()
                .ok_or_else(|| ModelError::Parse("functionCall without name".into()))?;
            parts.push(Part::FunctionCall {
                name: name.to_string(),
                args: call.get("args").cloned().unwrap_or_else(|| json!({})),
                thought_signature: part["thoughtSignature"].as_str().map(str::to_string),
            });
        }
    }
    Ok(GenerateResponse { parts })
}

/// Concatenated text of one streamed response chunk.
fn chunk_text(chunk: &Value) -> String {
    chunk["candidates"][0]["content"]["parts"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|p| p["thought"].as_bool() != Some(true))
        .filter_map(|p| p["text"].as_str())
        .collect()
}

/// Pop every complete `data:` payload out of an SSE buffer, leaving any
/// trailing partial line in place.
pub fn drain_sse_data(buffer: &mut String) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line = buffer[..pos].trim_end_matches('\r').to_string();
        buffer.drain(..=pos);
        if let Some(data) = line.strip_prefix("data:") {
            events.push(data.trim_start().to_string());
        }
    }
    events
}

#[async_trait]
impl MultimodalModel for GeminiModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ModelError> {
        let body = build_request_body(&request, self.max_output_tokens);
        let response = self.post(&self.endpoint("generateContent"), &body).await?;
        let json: Value = response.json().await?;
        parse_response(&json)
    }

    async fn stream_text(&self, mut request: GenerateRequest) -> Result<TextStream, ModelError> {
        request.tools.clear();
        let body = build_request_body(&request, self.max_output_tokens);
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let response = self.post(&url, &body).await?;

        type ByteStream =
            Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

        struct State {
            bytes: ByteStream,
            // Bytes after the last newline; a UTF-8 sequence may straddle chunks.
            raw: Vec<u8>,
            buffer: String,
            pending: VecDeque<String>,
            done: bool,
        }

        let state = State {
            bytes: Box::pin(response.bytes_stream()),
            raw: Vec::new(),
            buffer: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let text_stream = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(text) = state.pending.pop_front() {
                    return Some((Ok(text), state));
                }
                if state.done {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.raw.extend_from_slice(&chunk);
                        if let Some(pos) = state.raw.iter().rposition(|b| *b == b'\n') {
                            let complete: Vec<u8> = state.raw.drain(..=pos).collect();
                            state.buffer.push_str(&String::from_utf8_lossy(&complete));
                        }
                        for data in drain_sse_data(&mut state.buffer) {
                            match serde_json::from_str::<Value>(&data) {
                                Ok(v) => {
                                    let text = chunk_text(&v);
                                    if !text.is_empty() {
                                        state.pending.push_back(text);
                                    }
                                }
                                Err(e) => {
                                    state.done = true;
                                    return Some((
                                        Err(ModelError::Parse(format!("bad stream chunk: {}", e))),
                                        state,
                                    ));
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(ModelError::Http(e)), state));
                    }
                    None => {
                        state.done = true;
                        // A final event may arrive without a trailing newline.
                        let rest = std::mem::take(&mut state.raw);
                        state.buffer.push_str(&String::from_utf8_lossy(&rest));
                        state.buffer.push('\n');
                        for data in drain_sse_data(&mut state.buffer) {
                            if let Ok(v) = serde_json::from_str::<Value>(&data) {
                                let text = chunk_text(&v);
                                if !text.is_empty() {
                                    state.pending.push_back(text);
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(text_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FunctionDeclaration;

    #[test]
    fn test_request_body_structure() {
        let request = GenerateRequest::new(vec![
            Content::user(vec![
                Part::InlineData {
                    mime_type: "application/pdf".into(),
                    data: b"%PDF".to_vec(),
                },
                Part::Text("Classify this".into()),
            ]),
            Content::model(vec![Part::Text("ok".into())]),
        ])
        .with_system("You classify documents.")
        .with_schema(json!({"type": "object"}));

        let body = build_request_body(&request, 1024);

        assert_eq!(
            body["system_instruction"]["parts"][0]["text"],
            "You classify documents."
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[0]["parts"][0]["inline_data"]["mime_type"], "application/pdf");
        assert_eq!(contents[0]["parts"][0]["inline_data"]["data"], "JVBERg==");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["responseJsonSchema"]["type"], "object");
        assert_eq!(body["generationConfig"]["temperature"], 0.0);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_request_body_tools_and_function_parts() {
        let request = GenerateRequest::new(vec![
            Content::model(vec![Part::function_call("match_template", json!({"supplier": "Acme"}))]),
            Content::user(vec![Part::FunctionResponse {
                name: "match_template".into(),
                response: json!({"matches": []}),
            }]),
        ])
        .with_tools(vec![FunctionDeclaration {
            name: "match_template".into(),
            description: "Find templates".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }]);

        let body = build_request_body(&request, 10);
        assert!(body.get("system_instruction").is_none());
        assert!(body["generationConfig"].get("responseMimeType").is_none());
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "match_template"
        );
        assert_eq!(body["contents"][0]["parts"][0]["functionCall"]["args"]["supplier"], "Acme");
        assert!(body["contents"][0]["parts"][0].get("thoughtSignature").is_none());
        assert_eq!(
            body["contents"][1]["parts"][0]["functionResponse"]["name"],
            "match_template"
        );
    }

    #[test]
    fn test_parse_response_text_and_calls() {
        let resp = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "thinking", "thought": true},
                        {"text": "{\"a\":1}"},
                        {"functionCall": {"name": "suggest_fields"}}
                    ]
                }
            }]
        });
        let parsed = parse_response(&resp).unwrap();
        assert_eq!(parsed.joined_text(), "{\"a\":1}");
        let calls = parsed.function_calls();
        assert_eq!(calls[0].0, "suggest_fields");
        assert_eq!(calls[0].1, &json!({}));
    }

    #[test]
    fn test_thought_signature_sent_back_with_call() {
        let resp = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "functionCall": {"name": "match_template", "args": {"supplier": "Acme"}},
                        "thoughtSignature": "c2lnLTE="
                    }]
                }
            }]
        });
        let parsed = parse_response(&resp).unwrap();
        assert!(matches!(
            &parsed.parts[0],
            Part::FunctionCall { thought_signature: Some(s), .. } if s == "c2lnLTE="
        ));

        let request = GenerateRequest::new(vec![
            Content::user_text("Process the attached documents."),
            Content::model(parsed.parts),
        ]);
        let body = build_request_body(&request, 10);
        let echoed = &body["contents"][1]["parts"][0];
        assert_eq!(echoed["thoughtSignature"], "c2lnLTE=");
        assert_eq!(echoed["functionCall"]["name"], "match_template");
        assert_eq!(echoed["functionCall"]["args"]["supplier"], "Acme");
    }

    #[test]
    fn test_parse_response_blocked() {
        let resp = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = parse_response(&resp).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn test_drain_sse_data_keeps_partial_line() {
        let mut buffer = String::from("data: {\"a\":1}\r\n\ndata: {\"b\"");
        let events = drain_sse_data(&mut buffer);
        assert_eq!(events, vec!["{\"a\":1}".to_string()]);
        assert_eq!(buffer, "data: {\"b\"");
        buffer.push_str(":2}\n");
        assert_eq!(drain_sse_data(&mut buffer), vec!["{\"b\":2}".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_chunk_text_concatenates_parts() {
        let chunk = json!({
            "candidates": [{"content": {"parts": [{"text": "{\"hea"}, {"text": "der\""}]}}]
        });
        assert_eq!(chunk_text(&chunk), "{\"header\"");
    }
}
