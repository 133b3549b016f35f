//! A [`MultimodalModel`] that answers from a script instead of a network
//! provider. Used by unit and integration tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use super::{GenerateRequest, GenerateResponse, ModelError, MultimodalModel, Part, TextStream};

type Responder =
    Box<dyn Fn(&GenerateRequest) -> Result<GenerateResponse, ModelError> + Send + Sync>;

/// Answers requests with a responder closure, or pops queued answers.
///
/// Every request is recorded and can be inspected with
/// [`ScriptedModel::requests`]. Streaming splits the text answer into
/// pieces of [`ScriptedModel::with_stream_chunk`] bytes.
pub struct ScriptedModel {
    responder: Option<Responder>,
    queue: Mutex<VecDeque<Result<GenerateResponse, ModelError>>>,
    requests: Mutex<Vec<GenerateRequest>>,
    stream_chunk: usize,
}

impl ScriptedModel {
    /// Queue of answers returned in order; an empty queue is an error.
    pub fn queue(answers: Vec<GenerateResponse>) -> Self {
        Self {
            responder: None,
            queue: Mutex::new(answers.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
            stream_chunk: 16,
        }
    }

    /// Queue of JSON text answers.
    pub fn json_answers(answers: Vec<serde_json::Value>) -> Self {
        Self::queue(
            answers
                .into_iter()
                .map(|v| GenerateResponse::text(v.to_string()))
                .collect(),
        )
    }

    /// Compute each answer from the request.
    pub fn respond_with<F>(responder: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<GenerateResponse, ModelError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            queue: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            stream_chunk: 16,
        }
    }

    pub fn with_stream_chunk(mut self, bytes: usize) -> Self {
        self.stream_chunk = bytes.max(1);
        self
    }

    /// Append one failing answer to the queue.
    pub fn push_error(&self, err: ModelError) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Err(err));
        }
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn answer(&self, request: &GenerateRequest) -> Result<GenerateResponse, ModelError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        self.queue
            .lock()
            .map_err(|_| ModelError::Parse("scripted model lock poisoned".into()))?
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Parse("scripted model has no answer left".into())))
    }
}

/// Split on char boundaries into pieces of roughly `size` bytes.
fn split_text(text: &str, size: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if current.len() >= size {
            pieces.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[async_trait]
impl MultimodalModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ModelError> {
        self.answer(&request)
    }

    async fn stream_text(&self, request: GenerateRequest) -> Result<TextStream, ModelError> {
        let response = self.answer(&request)?;
        let text: String = response
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        let pieces = split_text(&text, self.stream_chunk);
        Ok(Box::pin(stream::iter(pieces.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_queue_in_order_then_exhausted() {
        let model = ScriptedModel::queue(vec![
            GenerateResponse::text("one"),
            GenerateResponse::text("two"),
        ]);
        let req = GenerateRequest::default();
        assert_eq!(model.generate(req.clone()).await.unwrap().joined_text(), "one");
        assert_eq!(model.generate(req.clone()).await.unwrap().joined_text(), "two");
        assert!(model.generate(req).await.is_err());
        assert_eq!(model.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_reassembles() {
        let model = ScriptedModel::json_answers(vec![serde_json::json!({"header": {"a": "é1"}})])
            .with_stream_chunk(3);
        let pieces: Vec<String> = model
            .stream_text(GenerateRequest::default())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert!(pieces.len() > 1);
        assert_eq!(pieces.concat(), r#"{"header":{"a":"é1"}}"#);
    }
}
