//! Input documents: inline uploads or URLs.
//!
//! Every pipeline endpoint accepts its documents either as base64 uploads
//! (`files`) or as URLs (`fileUrls`), never both. URLs that point into the
//! local blob store are read from disk; anything else is downloaded.

use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::blob::BlobStore;
use crate::error::{PipelineError, PipelineResult};

/// An input document held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

/// Wire shape of an uploaded file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInput {
    /// Base64-encoded content.
    pub bytes: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
}

impl FileInput {
    pub fn decode(&self) -> PipelineResult<SourceFile> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.bytes.trim())
            .map_err(|e| PipelineError::invalid(format!("file '{}': invalid base64: {}", self.filename, e)))?;
        let file_name = if self.filename.trim().is_empty() {
            "upload".to_string()
        } else {
            self.filename.trim().to_string()
        };
        let mime_type = if self.mime_type.trim().is_empty() {
            guess_mime(&file_name).to_string()
        } else {
            self.mime_type.trim().to_lowercase()
        };
        Ok(SourceFile {
            file_name,
            mime_type,
            bytes,
        })
    }
}

/// `files` or `fileUrls`, as accepted by every document endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesInput {
    #[serde(default)]
    pub files: Vec<FileInput>,
    #[serde(default)]
    pub file_urls: Vec<String>,
}

/// Mime type from a file extension; `application/octet-stream` if unknown.
pub fn guess_mime(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "json" => "application/json",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Last path segment of a URL, without query or fragment.
fn file_name_from_url(url: &str) -> String {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = after_scheme.split_once('/').map(|(_, p)| p).unwrap_or("");
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Exactly one of files or URLs must be given.
pub fn check_exclusive(input: &SourcesInput) -> PipelineResult<()> {
    match (input.files.is_empty(), input.file_urls.is_empty()) {
        (false, false) => Err(PipelineError::invalid(
            "provide either files or fileUrls, not both",
        )),
        (true, true) => Err(PipelineError::invalid("no files or fileUrls provided")),
        _ => Ok(()),
    }
}

/// Load one URL, from the blob store when it owns the URL.
pub async fn fetch_url(
    url: &str,
    blobs: &dyn BlobStore,
    http: &reqwest::Client,
) -> PipelineResult<SourceFile> {
    let fetch_err = |message: String| PipelineError::Fetch {
        url: url.to_string(),
        message,
    };

    let file_name = file_name_from_url(url);

    if let Some(storage_id) = blobs.storage_id_for_url(url) {
        debug!(url, storage_id = %storage_id, "reading source from blob store");
        let bytes = blobs
            .get(&storage_id)
            .await
            .map_err(|e| fetch_err(format!("{:#}", e)))?
            .ok_or_else(|| fetch_err("not found in blob store".to_string()))?;
        return Ok(SourceFile {
            mime_type: guess_mime(&file_name).to_string(),
            file_name,
            bytes,
        });
    }

    debug!(url, "downloading source");
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| fetch_err(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(fetch_err(format!("HTTP {}", status)));
    }
    let header_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
        .filter(|m| !m.is_empty() && m != "application/octet-stream");
    let bytes = response
        .bytes()
        .await
        .map_err(|e| fetch_err(e.to_string()))?;

    Ok(SourceFile {
        mime_type: header_mime.unwrap_or_else(|| guess_mime(&file_name).to_string()),
        file_name,
        bytes: bytes.to_vec(),
    })
}

/// Decode uploads or fetch URLs, in input order. The first failure fails
/// the whole set.
pub async fn resolve_sources(
    input: &SourcesInput,
    blobs: &dyn BlobStore,
    http: &reqwest::Client,
) -> PipelineResult<Vec<SourceFile>> {
    check_exclusive(input)?;
    if !input.files.is_empty() {
        return input.files.iter().map(FileInput::decode).collect();
    }
    let mut sources = Vec::with_capacity(input.file_urls.len());
    for url in &input.file_urls {
        sources.push(fetch_url(url, blobs, http).await?);
    }
    Ok(sources)
}
