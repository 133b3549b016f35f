//! Saving and matching extraction templates.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use compileflow_core::embedding::Embedder;
use compileflow_core::matching::{match_text, match_text_hash, rank_for_query};
use compileflow_core::models::{FieldSet, Template, TemplateMatch};
use compileflow_core::store::TemplateStore;

use crate::error::{PipelineError, PipelineResult};
use crate::llm::ModelError;

#[derive(Clone)]
pub struct TemplateService {
    store: Arc<dyn TemplateStore>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
}

impl TemplateService {
    pub fn new(store: Arc<dyn TemplateStore>, embedder: Arc<dyn Embedder>, top_k: usize) -> Self {
        Self {
            store,
            embedder,
            top_k: top_k.max(1),
        }
    }

    async fn embed(&self, text: &str) -> PipelineResult<Vec<f32>> {
        // A disabled provider reports zero dimensions.
        if self.embedder.dims() == 0 {
            return Err(PipelineError::Disabled("embeddings"));
        }
        self.embedder
            .embed_one(text)
            .await
            .map_err(|e| PipelineError::Model(ModelError::Embedding(format!("{:#}", e))))
    }

    /// Saved templates closest to the supplier, best first. Read-only.
    ///
    /// Candidates are the vector neighbours plus any template saved under
    /// the exact supplier key, so a string match is never missed because
    /// the vector search cut it off.
    pub async fn match_templates(
        &self,
        supplier: &str,
        client_name: Option<&str>,
    ) -> PipelineResult<Vec<TemplateMatch>> {
        if supplier.trim().is_empty() {
            return Err(PipelineError::invalid("supplier is required"));
        }
        let query = self.embed(&match_text(supplier, client_name)).await?;
        let mut matches = self
            .store
            .vector_search(&query, self.top_k)
            .await
            .map_err(PipelineError::storage)?;

        let mut keys = vec![client_name];
        if client_name.is_some() {
            keys.push(None);
        }
        for client in keys {
            if let Some(template) = self
                .store
                .find_by_key(supplier, client)
                .await
                .map_err(PipelineError::storage)?
            {
                // Vector hits come first, so a duplicate keeps its real score.
                matches.push(TemplateMatch { template, score: 0.0 });
            }
        }

        let ranked = rank_for_query(matches, supplier, client_name, self.top_k);
        debug!(supplier, candidates = ranked.len(), "matched templates");
        Ok(ranked)
    }

    /// Insert or replace the template for `(supplier, client_name)`.
    ///
    /// An existing template keeps its id and creation time; the embedding
    /// is recomputed on every save.
    pub async fn save_template(
        &self,
        supplier: &str,
        client_name: Option<&str>,
        fields: FieldSet,
    ) -> PipelineResult<Template> {
        if supplier.trim().is_empty() {
            return Err(PipelineError::invalid("supplier is required"));
        }
        if fields.is_empty() {
            return Err(PipelineError::invalid("a template needs at least one field"));
        }
        fields.validate().map_err(PipelineError::InvalidInput)?;

        let mut template = Template::new(supplier, client_name, fields);
        if let Some(existing) = self
            .store
            .find_by_key(supplier, client_name)
            .await
            .map_err(PipelineError::storage)?
        {
            template.id = existing.id;
            template.created_at = existing.created_at;
            template.updated_at = Utc::now();
        }

        let text = match_text(&template.supplier, template.client_name.as_deref());
        let vector = self.embed(&text).await?;
        self.store
            .upsert_template(&template, &vector, self.embedder.model_name(), &match_text_hash(&text))
            .await
            .map_err(PipelineError::storage)?;

        info!(id = %template.id, supplier = %template.supplier, "saved template");
        Ok(template)
    }

    pub async fn get(&self, id: &str) -> PipelineResult<Option<Template>> {
        self.store.get_template(id).await.map_err(PipelineError::storage)
    }
}

/// Deterministic embedder for tests: a bag-of-characters vector, so equal
/// texts score 1.0 and unrelated ones score lower.
#[cfg(test)]
pub(crate) struct CharEmbedder;

#[cfg(test)]
#[async_trait::async_trait]
impl Embedder for CharEmbedder {
    fn model_name(&self) -> &str {
        "chars"
    }
    fn dims(&self) -> usize {
        27
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 27];
                for c in t.chars() {
                    match c {
                        'a'..='z' => v[(c as u8 - b'a') as usize] += 1.0,
                        _ => v[26] += 0.1,
                    }
                }
                v
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;
    use compileflow_core::matching::{decide, MatchDecision};
    use compileflow_core::models::{FieldDescriptor, FieldType};
    use compileflow_core::store::memory::InMemoryTemplateStore;

    fn fields(name: &str) -> FieldSet {
        FieldSet::new(
            vec![FieldDescriptor {
                name: name.into(),
                label: String::new(),
                field_type: FieldType::String,
                description: String::new(),
                required: false,
                example: None,
            }],
            vec![],
        )
    }

    fn service() -> TemplateService {
        TemplateService::new(Arc::new(InMemoryTemplateStore::new()), Arc::new(CharEmbedder), 5)
    }

    #[tokio::test]
    async fn test_save_then_match_exact_supplier() {
        let svc = service();
        svc.save_template("Acme Corp", None, fields("invoice_number")).await.unwrap();
        svc.save_template("Zyx Logistics", None, fields("awb")).await.unwrap();

        let matches = svc.match_templates("acme  corp", None).await.unwrap();
        assert_eq!(matches[0].template.supplier, "Acme Corp");
        assert!(matches[0].score >= 0.999);
        assert!(matches.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_supplier_without_client_accepts_any_client() {
        let svc = service();
        let saved = svc.save_template("Acme Corp", None, fields("invoice_number")).await.unwrap();
        svc.save_template("Acme Corporation", Some("Globex Industries"), fields("po")).await.unwrap();

        let matches = svc
            .match_templates("Acme Corp", Some("Globex Industries"))
            .await
            .unwrap();
        assert_eq!(matches[0].template.id, saved.id);
        assert_eq!(
            decide(&matches),
            MatchDecision::UseTemplate {
                template_id: saved.id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_exact_supplier_found_beyond_vector_limit() {
        let svc = TemplateService::new(Arc::new(InMemoryTemplateStore::new()), Arc::new(CharEmbedder), 1);
        let saved = svc.save_template("Acme", None, fields("a")).await.unwrap();
        svc.save_template("Acme", Some("Globex, Inc."), fields("b")).await.unwrap();

        // The client-qualified template is the nearest vector; the plain
        // supplier key still wins on the string match.
        let matches = svc.match_templates("acme", Some("Globex")).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].template.id, saved.id);
        assert_eq!(matches[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_resave_keeps_id_and_created_at() {
        let svc = service();
        let first = svc.save_template("Acme", Some("Client A"), fields("a")).await.unwrap();
        let second = svc.save_template("ACME", Some("client a"), fields("b")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        let stored = svc.get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.fields.header_fields[0].name, "b");
    }

    #[tokio::test]
    async fn test_input_errors_and_disabled() {
        let svc = service();
        assert!(matches!(
            svc.match_templates("   ", None).await,
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            svc.save_template("Acme", None, FieldSet::default()).await,
            Err(PipelineError::InvalidInput(_))
        ));

        let disabled = TemplateService::new(
            Arc::new(InMemoryTemplateStore::new()),
            Arc::new(DisabledEmbedder),
            5,
        );
        assert!(matches!(
            disabled.match_templates("Acme", None).await,
            Err(PipelineError::Disabled("embeddings"))
        ));
    }
}
