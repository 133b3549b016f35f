//! Storage abstractions for the pipeline.
//!
//! Two traits cover everything the pipeline persists:
//!
//! | Trait | Holds |
//! |-------|-------|
//! | [`TemplateStore`] | saved templates and their embedding vectors |
//! | [`JobStore`] | per-job extraction snapshot, logical documents, conversation turns |
//!
//! Implementations must be `Send + Sync`. The in-memory backends in
//! [`memory`] back the tests; the app crate provides SQLite backends.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{ConversationTurn, LogicalDocument, Template, TemplateMatch};

/// Saved templates plus a fixed-dimension vector per template.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Insert or replace a template and its vector.
    ///
    /// `content_hash` identifies the text the vector was computed from and
    /// is persisted next to the vector.
    async fn upsert_template(
        &self,
        template: &Template,
        vector: &[f32],
        model: &str,
        content_hash: &str,
    ) -> Result<()>;

    async fn get_template(&self, id: &str) -> Result<Option<Template>>;

    /// Look up by the case-insensitive `(supplier, client_name)` key.
    async fn find_by_key(&self, supplier: &str, client_name: Option<&str>)
        -> Result<Option<Template>>;

    /// Nearest-neighbour search, highest score first, at most `limit` results.
    ///
    /// Does not modify stored templates.
    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<TemplateMatch>>;
}

/// Per-job pipeline state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Replace the job's extraction snapshot. Last write wins.
    async fn put_snapshot(&self, job_id: &str, snapshot: &Value) -> Result<()>;

    async fn get_snapshot(&self, job_id: &str) -> Result<Option<Value>>;

    /// Record the logical documents produced for a job.
    async fn record_documents(&self, job_id: &str, documents: &[LogicalDocument]) -> Result<()>;

    async fn list_documents(&self, job_id: &str) -> Result<Vec<LogicalDocument>>;

    /// Append one conversation turn; turns are returned in append order.
    async fn append_turn(&self, job_id: &str, turn: &ConversationTurn) -> Result<()>;

    async fn list_turns(&self, job_id: &str) -> Result<Vec<ConversationTurn>>;
}

/// Key used for case-insensitive template identity.
pub fn template_key(supplier: &str, client_name: Option<&str>) -> (String, String) {
    (
        supplier.trim().to_lowercase(),
        client_name.unwrap_or("").trim().to_lowercase(),
    )
}
