//! The extraction orchestrator.
//!
//! A tool-calling loop in which the model identifies the supplier, matches
//! a saved template, and either extracts with it or proposes fields for
//! the user to confirm:
//!
//! ```text
//! Start → Identify → Match ─┬─ score ≥ 0.95 → Extract → Done
//!                           └─ otherwise    → Suggest → AwaitConfirmation
//! ```
//!
//! The latest user turn is persisted before the first model call, and
//! every assistant text turn after it, in order. A run makes at most
//! `max_agent_steps` tool invocations; a run that wants more stops without
//! invoking anything further and reports [`AgentStatus::StepLimitReached`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use compileflow_core::models::{ConversationTurn, ExtractionResult, TurnRole};
use compileflow_core::store::JobStore;

use crate::blob::BlobStore;
use crate::error::{PipelineError, PipelineResult};
use crate::extract::Extractor;
use crate::llm::{Content, GenerateRequest, MultimodalModel, Part, Role};
use crate::source::{fetch_url, SourceFile};
use crate::suggest::{FieldSuggestion, Suggester};
use crate::templates::TemplateService;
use crate::tools::{ToolContext, ToolRegistry};

const SYSTEM_PROMPT: &str = "You orchestrate field extraction for one document-processing job.\n\
1. Identify the supplier (and the client, if one is given) from the attached documents.\n\
2. Call match_template with that supplier.\n\
3. If match_template decides extract_with_template, call extract_with_template with exactly that templateId.\n\
4. Otherwise call suggest_fields and ask the user to confirm the proposed fields.\n\
Never invent template ids, field names, or template structure. Use only what the tools return.\n\
Keep replies to the user short.";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub job_id: String,
    pub document_urls: Vec<String>,
    /// Prior conversation; the last user turn is the new message.
    #[serde(default)]
    pub messages: Vec<ConversationTurn>,
    #[serde(default)]
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// A template was applied and the documents extracted.
    Extracted,
    /// Fields were proposed and wait for the user.
    AwaitingConfirmation,
    /// The model finished without extracting or proposing.
    Completed,
    StepLimitReached,
}

/// One tool invocation of a run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStep {
    pub tool: String,
    pub args: Value,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutcome {
    pub job_id: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    pub steps: Vec<AgentStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<ExtractionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<FieldSuggestion>,
}

pub struct Orchestrator {
    model: Arc<dyn MultimodalModel>,
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    http: reqwest::Client,
    templates: TemplateService,
    extractor: Extractor,
    suggester: Suggester,
    tools: ToolRegistry,
    max_steps: usize,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn MultimodalModel>,
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        http: reqwest::Client,
        templates: TemplateService,
        extractor: Extractor,
        suggester: Suggester,
        max_steps: usize,
    ) -> Self {
        Self {
            model,
            jobs,
            blobs,
            http,
            templates,
            extractor,
            suggester,
            tools: ToolRegistry::with_builtins(),
            max_steps,
        }
    }

    async fn persist_turn(&self, job_id: &str, role: TurnRole, content: &str) {
        let turn = ConversationTurn {
            role,
            content: content.to_string(),
        };
        if let Err(e) = self.jobs.append_turn(job_id, &turn).await {
            warn!(job_id, error = %PipelineError::persistence(e), "failed to persist turn");
        }
    }

    pub async fn run(&self, request: AgentRequest) -> PipelineResult<AgentOutcome> {
        let job_id = request.job_id.trim().to_string();
        if job_id.is_empty() {
            return Err(PipelineError::invalid("jobId is required"));
        }
        if request.document_urls.is_empty() {
            return Err(PipelineError::invalid("documentUrls must not be empty"));
        }

        let mut sources: Vec<SourceFile> = Vec::with_capacity(request.document_urls.len());
        for url in &request.document_urls {
            sources.push(fetch_url(url, self.blobs.as_ref(), &self.http).await?);
        }

        // The default prompt stands in only when the caller sent no user turn.
        let mut messages = request.messages.clone();
        if !messages.iter().any(|t| t.role == TurnRole::User) {
            messages.push(ConversationTurn {
                role: TurnRole::User,
                content: "Process the attached documents.".to_string(),
            });
        }
        if let Some(latest) = messages.iter().rev().find(|t| t.role == TurnRole::User) {
            self.persist_turn(&job_id, TurnRole::User, &latest.content).await;
        }

        let mut contents = vec![context_content(&job_id, &sources, request.client_name.as_deref())];
        contents.extend(messages.iter().map(|t| match t.role {
            TurnRole::User => Content::user_text(t.content.clone()),
            TurnRole::Assistant => Content::model(vec![Part::Text(t.content.clone())]),
        }));

        let ctx = ToolContext::new(
            self.templates.clone(),
            self.extractor.clone(),
            self.suggester.clone(),
            sources,
        );
        let declarations = self.tools.declarations();
        let mut steps: Vec<AgentStep> = Vec::new();
        let mut reply: Option<String> = None;
        let mut limit_reached = false;

        'conversation: loop {
            let generate = GenerateRequest::new(contents.clone())
                .with_system(SYSTEM_PROMPT)
                .with_tools(declarations.clone());
            let response = self.model.generate(generate).await?;

            let text = response.joined_text();
            if !text.trim().is_empty() {
                self.persist_turn(&job_id, TurnRole::Assistant, text.trim()).await;
                reply = Some(text.trim().to_string());
            }

            let calls: Vec<(String, Value)> = response
                .function_calls()
                .into_iter()
                .map(|(name, args)| (name.to_string(), args.clone()))
                .collect();
            if calls.is_empty() {
                break;
            }

            let mut results = Vec::with_capacity(calls.len());
            for (name, args) in calls {
                if steps.len() >= self.max_steps {
                    limit_reached = true;
                    break 'conversation;
                }
                debug!(job_id = %job_id, tool = %name, "tool call");
                let result = self.tools.dispatch(&name, args.clone(), &ctx).await;
                results.push(Part::FunctionResponse {
                    name: name.clone(),
                    response: result.clone(),
                });
                steps.push(AgentStep {
                    tool: name,
                    args,
                    result,
                });
            }

            contents.push(Content {
                role: Role::Model,
                parts: response.parts,
            });
            contents.push(Content::user(results));
        }

        let state = ctx.into_state();
        let (template_id, extracted_data) = match state.extraction {
            Some((id, result)) => (Some(id), Some(result)),
            None => (None, None),
        };

        if let Some(result) = &extracted_data {
            let snapshot = json!({ "final": true, "data": result });
            if let Err(e) = self.jobs.put_snapshot(&job_id, &snapshot).await {
                warn!(job_id = %job_id, error = %PipelineError::persistence(e), "failed to persist extraction");
            }
        }

        let status = if limit_reached {
            AgentStatus::StepLimitReached
        } else if extracted_data.is_some() {
            AgentStatus::Extracted
        } else if state.suggestion.is_some() {
            AgentStatus::AwaitingConfirmation
        } else {
            AgentStatus::Completed
        };
        info!(job_id = %job_id, ?status, steps = steps.len(), "agent run finished");

        Ok(AgentOutcome {
            job_id,
            status,
            reply,
            steps,
            template_id,
            extracted_data,
            suggestion: state.suggestion,
        })
    }
}

/// First user turn: the documents themselves plus the job context.
fn context_content(job_id: &str, sources: &[SourceFile], client_name: Option<&str>) -> Content {
    let mut parts: Vec<Part> = sources
        .iter()
        .map(|s| Part::InlineData {
            mime_type: s.mime_type.clone(),
            data: s.bytes.clone(),
        })
        .collect();
    let names: Vec<&str> = sources.iter().map(|s| s.file_name.as_str()).collect();
    let mut text = format!("Job {}. Attached documents: {}.", job_id, names.join(", "));
    if let Some(client) = client_name.map(str::trim).filter(|c| !c.is_empty()) {
        text.push_str(&format!(" Client: {}.", client));
    }
    parts.push(Part::Text(text));
    Content::user(parts)
}
