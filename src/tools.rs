//! Tools the orchestrator exposes to the model.
//!
//! Each tool is a [`Tool`] registered in a [`ToolRegistry`]; the registry
//! renders them as function declarations and dispatches the model's
//! function calls by name. Tools see one [`ToolContext`] per agent run,
//! which holds the run's documents and what earlier calls found.
//!
//! | Tool | Parameters |
//! |------|------------|
//! | `match_template` | `{supplier, clientName?}` |
//! | `extract_with_template` | `{templateId}` |
//! | `suggest_fields` | `{}` |
//!
//! `extract_with_template` only accepts a template that the last
//! `match_template` call scored at or above the auto-accept threshold.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use compileflow_core::matching::{accepts, decide, MatchDecision, AUTO_ACCEPT_THRESHOLD};
use compileflow_core::models::ExtractionResult;

use crate::extract::Extractor;
use crate::llm::FunctionDeclaration;
use crate::source::SourceFile;
use crate::suggest::{FieldSuggestion, Suggester};
use crate::templates::TemplateService;

#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name the model calls.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. Errors are reported back to the model, not the caller.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// What the tools of one run have produced so far.
#[derive(Debug, Default)]
pub struct RunState {
    /// Template id → score from the most recent `match_template` call.
    pub match_scores: HashMap<String, f64>,
    pub extraction: Option<(String, ExtractionResult)>,
    pub suggestion: Option<FieldSuggestion>,
}

pub struct ToolContext {
    pub templates: TemplateService,
    pub extractor: Extractor,
    pub suggester: Suggester,
    pub sources: Vec<SourceFile>,
    state: Mutex<RunState>,
}

impl ToolContext {
    pub fn new(
        templates: TemplateService,
        extractor: Extractor,
        suggester: Suggester,
        sources: Vec<SourceFile>,
    ) -> Self {
        Self {
            templates,
            extractor,
            suggester,
            sources,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn state(&self) -> Result<MutexGuard<'_, RunState>> {
        self.state.lock().map_err(|_| anyhow!("tool state lock poisoned"))
    }

    pub fn into_state(self) -> RunState {
        self.state.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MatchTemplateTool;

#[async_trait]
impl Tool for MatchTemplateTool {
    fn name(&self) -> &str {
        "match_template"
    }

    fn description(&self) -> &str {
        "Find saved extraction templates for a supplier, ranked by similarity score"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "supplier": { "type": "string", "description": "Supplier name as printed on the documents" },
                "clientName": { "type": "string", "description": "Client the documents are for, if known" }
            },
            "required": ["supplier"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let supplier = params["supplier"].as_str().unwrap_or("");
        let client = params["clientName"].as_str().filter(|c| !c.trim().is_empty());
        let matches = ctx.templates.match_templates(supplier, client).await?;

        {
            let mut state = ctx.state()?;
            state.match_scores = matches
                .iter()
                .map(|m| (m.template.id.clone(), m.score))
                .collect();
        }

        let decision = match decide(&matches) {
            MatchDecision::UseTemplate { template_id } => {
                json!({ "action": "extract_with_template", "templateId": template_id })
            }
            MatchDecision::Suggest => json!({ "action": "suggest_fields" }),
        };
        let candidates: Vec<Value> = matches
            .iter()
            .map(|m| {
                json!({
                    "templateId": m.template.id,
                    "supplier": m.template.supplier,
                    "clientName": m.template.client_name,
                    "score": m.score,
                })
            })
            .collect();
        Ok(json!({
            "threshold": AUTO_ACCEPT_THRESHOLD,
            "matches": candidates,
            "decision": decision,
        }))
    }
}

pub struct ExtractWithTemplateTool;

#[async_trait]
impl Tool for ExtractWithTemplateTool {
    fn name(&self) -> &str {
        "extract_with_template"
    }

    fn description(&self) -> &str {
        "Extract the job's documents with a matched template's field lists"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "templateId": { "type": "string", "description": "Id returned by match_template" }
            },
            "required": ["templateId"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let template_id = params["templateId"].as_str().unwrap_or("").trim();
        if template_id.is_empty() {
            bail!("templateId must not be empty");
        }

        let score = ctx.state()?.match_scores.get(template_id).copied();
        match score {
            Some(score) if accepts(score) => {}
            Some(score) => bail!(
                "template {} scored {:.3}, below the {} threshold; call suggest_fields instead",
                template_id,
                score,
                AUTO_ACCEPT_THRESHOLD
            ),
            None => bail!(
                "template {} was not returned by match_template; call match_template first",
                template_id
            ),
        }

        let template = ctx
            .templates
            .get(template_id)
            .await?
            .ok_or_else(|| anyhow!("template {} not found", template_id))?;
        let result = ctx.extractor.extract(&ctx.sources, &template.fields).await?;

        let documents = result.documents();
        let summary = json!({
            "templateId": template.id,
            "documents": documents.len(),
            "lineItems": documents.iter().map(|d| d.line_items.len()).sum::<usize>(),
        });
        ctx.state()?.extraction = Some((template.id, result));
        Ok(summary)
    }
}

pub struct SuggestFieldsTool;

#[async_trait]
impl Tool for SuggestFieldsTool {
    fn name(&self) -> &str {
        "suggest_fields"
    }

    fn description(&self) -> &str {
        "Propose header and line-item fields for the job's documents, for the user to confirm"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let suggestion = ctx.suggester.suggest(&ctx.sources).await?;
        let value = serde_json::to_value(&suggestion)?;
        ctx.state()?.suggestion = Some(suggestion);
        Ok(value)
    }
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// `match_template`, `extract_with_template`, and `suggest_fields`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(MatchTemplateTool));
        registry.register(Box::new(ExtractWithTemplateTool));
        registry.register(Box::new(SuggestFieldsTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools
            .iter()
            .map(|t| FunctionDeclaration {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Run a call from the model; failures come back as `{"error": ...}`.
    pub async fn dispatch(&self, name: &str, params: Value, ctx: &ToolContext) -> Value {
        let Some(tool) = self.find(name) else {
            return json!({ "error": format!("unknown tool: {}", name) });
        };
        let params = if params.is_object() { params } else { json!({}) };
        match tool.execute(params, ctx).await {
            Ok(value) => value,
            Err(e) => json!({ "error": format!("{:#}", e) }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
