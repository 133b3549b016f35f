//! In-memory [`TemplateStore`] and [`JobStore`] implementations.
//!
//! `HashMap`/`Vec` behind `std::sync::RwLock`. Vector search is a
//! brute-force cosine scan over every stored vector.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::embedding::cosine_similarity;
use crate::matching::rank;
use crate::models::{ConversationTurn, LogicalDocument, Template, TemplateMatch};

use super::{template_key, JobStore, TemplateStore};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

struct StoredTemplate {
    template: Template,
    vector: Vec<f32>,
    _model: String,
    _content_hash: String,
}

/// In-memory template store.
///
/// The first vector stored fixes the dimensionality; later vectors of a
/// different length are rejected.
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<String, StoredTemplate>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn upsert_template(
        &self,
        template: &Template,
        vector: &[f32],
        model: &str,
        content_hash: &str,
    ) -> Result<()> {
        let mut templates = write(&self.templates)?;
        if let Some(dims) = templates
            .values()
            .find(|s| s.template.id != template.id)
            .map(|s| s.vector.len())
        {
            if dims != vector.len() {
                bail!(
                    "embedding dimension mismatch: store holds {}, got {}",
                    dims,
                    vector.len()
                );
            }
        }
        templates.insert(
            template.id.clone(),
            StoredTemplate {
                template: template.clone(),
                vector: vector.to_vec(),
                _model: model.to_string(),
                _content_hash: content_hash.to_string(),
            },
        );
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<Template>> {
        Ok(read(&self.templates)?.get(id).map(|s| s.template.clone()))
    }

    async fn find_by_key(
        &self,
        supplier: &str,
        client_name: Option<&str>,
    ) -> Result<Option<Template>> {
        let key = template_key(supplier, client_name);
        Ok(read(&self.templates)?
            .values()
            .find(|s| template_key(&s.template.supplier, s.template.client_name.as_deref()) == key)
            .map(|s| s.template.clone()))
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<TemplateMatch>> {
        let templates = read(&self.templates)?;
        let candidates = templates
            .values()
            .map(|s| TemplateMatch {
                template: s.template.clone(),
                score: cosine_similarity(query_vec, &s.vector) as f64,
            })
            .collect();
        Ok(rank(candidates, limit))
    }
}

/// In-memory job store.
#[derive(Default)]
pub struct InMemoryJobStore {
    snapshots: RwLock<HashMap<String, Value>>,
    documents: RwLock<HashMap<String, Vec<LogicalDocument>>>,
    turns: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put_snapshot(&self, job_id: &str, snapshot: &Value) -> Result<()> {
        write(&self.snapshots)?.insert(job_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, job_id: &str) -> Result<Option<Value>> {
        Ok(read(&self.snapshots)?.get(job_id).cloned())
    }

    async fn record_documents(&self, job_id: &str, documents: &[LogicalDocument]) -> Result<()> {
        write(&self.documents)?
            .entry(job_id.to_string())
            .or_default()
            .extend(documents.iter().cloned());
        Ok(())
    }

    async fn list_documents(&self, job_id: &str) -> Result<Vec<LogicalDocument>> {
        Ok(read(&self.documents)?
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_turn(&self, job_id: &str, turn: &ConversationTurn) -> Result<()> {
        write(&self.turns)?
            .entry(job_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn list_turns(&self, job_id: &str) -> Result<Vec<ConversationTurn>> {
        Ok(read(&self.turns)?.get(job_id).cloned().unwrap_or_default())
    }
}
