use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Connect and create every table. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Saved templates; field lists are stored as JSON
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS templates (
            id TEXT PRIMARY KEY,
            supplier TEXT NOT NULL,
            client_name TEXT,
            supplier_key TEXT NOT NULL,
            client_key TEXT NOT NULL,
            fields_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(supplier_key, client_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One vector per template (little-endian f32 BLOB)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS template_vectors (
            template_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (template_id) REFERENCES templates(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Logical documents produced by segmentation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            storage_id TEXT NOT NULL,
            source_file TEXT NOT NULL,
            file_name TEXT NOT NULL,
            page_numbers TEXT NOT NULL,
            document_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            is_core_document INTEGER NOT NULL,
            file_url TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Latest extraction snapshot per job, replaced whole on every write
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_state (
            job_id TEXT PRIMARY KEY,
            snapshot_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_turns (
            job_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (job_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_files_job_id ON job_files(job_id)")
        .execute(pool)
        .await?;

    Ok(())
}
