//! SQLite-backed [`TemplateStore`] and [`JobStore`] implementations.
//!
//! Template vectors are stored as little-endian `f32` BLOBs and searched
//! by a brute-force cosine scan; the template table is small.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use compileflow_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use compileflow_core::matching::rank;
use compileflow_core::models::{
    ConversationTurn, FieldSet, LogicalDocument, Template, TemplateMatch, TurnRole,
};
use compileflow_core::store::{template_key, JobStore, TemplateStore};

pub struct SqliteTemplateStore {
    pool: SqlitePool,
}

impl SqliteTemplateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_template(row: &sqlx::sqlite::SqliteRow) -> Result<Template> {
    let fields_json: String = row.get("fields_json");
    let fields: FieldSet =
        serde_json::from_str(&fields_json).context("Corrupt template field lists")?;
    Ok(Template {
        id: row.get("id"),
        supplier: row.get("supplier"),
        client_name: row.get("client_name"),
        fields,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

const TEMPLATE_COLUMNS: &str =
    "id, supplier, client_name, fields_json, created_at, updated_at";

#[async_trait]
impl TemplateStore for SqliteTemplateStore {
    async fn upsert_template(
        &self,
        template: &Template,
        vector: &[f32],
        model: &str,
        content_hash: &str,
    ) -> Result<()> {
        let stored_dims: Option<i64> = sqlx::query_scalar(
            "SELECT dims FROM template_vectors WHERE template_id != ? LIMIT 1",
        )
        .bind(&template.id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(dims) = stored_dims {
            if dims as usize != vector.len() {
                bail!(
                    "embedding dimension mismatch: store holds {}, got {}",
                    dims,
                    vector.len()
                );
            }
        }

        let (supplier_key, client_key) =
            template_key(&template.supplier, template.client_name.as_deref());
        let fields_json = serde_json::to_string(&template.fields)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO templates (id, supplier, client_name, supplier_key, client_key,
                                   fields_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                supplier = excluded.supplier,
                client_name = excluded.client_name,
                supplier_key = excluded.supplier_key,
                client_key = excluded.client_key,
                fields_json = excluded.fields_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&template.id)
        .bind(&template.supplier)
        .bind(&template.client_name)
        .bind(&supplier_key)
        .bind(&client_key)
        .bind(&fields_json)
        .bind(millis(&template.created_at))
        .bind(millis(&template.updated_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO template_vectors (template_id, model, dims, content_hash, embedding)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(template_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                content_hash = excluded.content_hash,
                embedding = excluded.embedding
            "#,
        )
        .bind(&template.id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(content_hash)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<Template>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM templates WHERE id = ?",
            TEMPLATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_template).transpose()
    }

    async fn find_by_key(
        &self,
        supplier: &str,
        client_name: Option<&str>,
    ) -> Result<Option<Template>> {
        let (supplier_key, client_key) = template_key(supplier, client_name);
        let row = sqlx::query(&format!(
            "SELECT {} FROM templates WHERE supplier_key = ? AND client_key = ?",
            TEMPLATE_COLUMNS
        ))
        .bind(supplier_key)
        .bind(client_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_template).transpose()
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<TemplateMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.supplier, t.client_name, t.fields_json, t.created_at, t.updated_at,
                   v.embedding
            FROM templates t
            JOIN template_vectors v ON v.template_id = t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
            candidates.push(TemplateMatch {
                template: row_to_template(row)?,
                score,
            });
        }
        Ok(rank(candidates, limit))
    }
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn put_snapshot(&self, job_id: &str, snapshot: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_state (job_id, snapshot_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job_id)
        .bind(serde_json::to_string(snapshot)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_snapshot(&self, job_id: &str) -> Result<Option<Value>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT snapshot_json FROM extraction_state WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        json.map(|s| serde_json::from_str(&s).context("Corrupt extraction snapshot"))
            .transpose()
    }

    async fn record_documents(&self, job_id: &str, documents: &[LogicalDocument]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for doc in documents {
            sqlx::query(
                r#"
                INSERT INTO job_files (job_id, storage_id, source_file, file_name, page_numbers,
                                       document_type, confidence, is_core_document, file_url)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job_id)
            .bind(&doc.storage_id)
            .bind(&doc.source_file)
            .bind(&doc.file_name)
            .bind(serde_json::to_string(&doc.page_numbers)?)
            .bind(&doc.document_type)
            .bind(doc.confidence)
            .bind(doc.is_core_document)
            .bind(&doc.file_url)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_documents(&self, job_id: &str) -> Result<Vec<LogicalDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT storage_id, source_file, file_name, page_numbers, document_type,
                   confidence, is_core_document, file_url
            FROM job_files WHERE job_id = ? ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let pages: String = row.get("page_numbers");
                Ok(LogicalDocument {
                    storage_id: row.get("storage_id"),
                    source_file: row.get("source_file"),
                    file_name: row.get("file_name"),
                    page_numbers: serde_json::from_str(&pages)?,
                    document_type: row.get("document_type"),
                    confidence: row.get("confidence"),
                    is_core_document: row.get("is_core_document"),
                    file_url: row.get("file_url"),
                })
            })
            .collect()
    }

    async fn append_turn(&self, job_id: &str, turn: &ConversationTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_turns (job_id, seq, role, content, created_at)
            VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM conversation_turns WHERE job_id = ?),
                    ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(job_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_turns(&self, job_id: &str) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            "SELECT role, content FROM conversation_turns WHERE job_id = ? ORDER BY seq",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role: String = row.get("role");
                Ok(ConversationTurn {
                    role: TurnRole::parse(&role)
                        .ok_or_else(|| anyhow!("Unknown turn role in database: {}", role))?,
                    content: row.get("content"),
                })
            })
            .collect()
    }
}
