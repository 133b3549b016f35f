//! Blob storage for document excerpts.
//!
//! Segmented excerpts are uploaded here and addressed by a storage id of
//! the form `{uuid}/{file_name}`. [`LocalBlobStore`] keeps them under a
//! directory on disk and serves them from `{public_base_url}/files/{id}`
//! through the HTTP server.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::StorageConfig;

/// Location of an uploaded blob.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub storage_id: String,
    pub url: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under a fresh id derived from `file_name`.
    async fn put(&self, file_name: &str, bytes: &[u8]) -> Result<StoredBlob>;

    /// Read a blob back; `None` if the id is unknown.
    async fn get(&self, storage_id: &str) -> Result<Option<Vec<u8>>>;

    /// Public URL of a storage id.
    fn url_for(&self, storage_id: &str) -> String;

    /// Storage id of a URL this store issued, if it is one.
    fn storage_id_for_url(&self, url: &str) -> Option<String>;
}

pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.root, &config.public_base_url)
    }

    /// Resolve a storage id to a path inside the root, refusing traversal.
    fn path_for(&self, storage_id: &str) -> Result<PathBuf> {
        let rel = Path::new(storage_id);
        if storage_id.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("invalid storage id: {}", storage_id);
        }
        Ok(self.root.join(rel))
    }
}

/// Keep file names to a safe character set.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, file_name: &str, bytes: &[u8]) -> Result<StoredBlob> {
        let storage_id = format!(
            "{}/{}",
            uuid::Uuid::new_v4(),
            sanitize_file_name(file_name)
        );
        let path = self.path_for(&storage_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create blob directory: {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob: {}", path.display()))?;
        Ok(StoredBlob {
            url: self.url_for(&storage_id),
            storage_id,
        })
    }

    async fn get(&self, storage_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(storage_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob: {}", path.display())),
        }
    }

    fn url_for(&self, storage_id: &str) -> String {
        format!("{}/files/{}", self.public_base_url, storage_id)
    }

    fn storage_id_for_url(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.public_base_url)?
            .strip_prefix("/files/")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip_and_url() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path(), "http://localhost:7341/");
        let blob = store.put("bundle_p1-2.pdf", b"%PDF-1.4").await.unwrap();

        assert!(blob.storage_id.ends_with("/bundle_p1-2.pdf"));
        assert_eq!(
            blob.url,
            format!("http://localhost:7341/files/{}", blob.storage_id)
        );
        assert_eq!(
            store.storage_id_for_url(&blob.url).as_deref(),
            Some(blob.storage_id.as_str())
        );
        assert_eq!(
            store.get(&blob.storage_id).await.unwrap().as_deref(),
            Some(&b"%PDF-1.4"[..])
        );
    }

    #[tokio::test]
    async fn test_unknown_and_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path(), "http://localhost:7341");
        assert!(store.get("missing/file.pdf").await.unwrap().is_none());
        assert!(store.get("../secret").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
        assert_eq!(store.storage_id_for_url("https://elsewhere/files/x"), None);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("a b/c?.pdf"), "c_.pdf");
        assert_eq!(sanitize_file_name("..\\..\\x.png"), "x.png");
        assert_eq!(sanitize_file_name("..."), "file");
    }
}
