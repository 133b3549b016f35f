//! Splits uploads into logical documents.
//!
//! An image or a one-page PDF is one document, classified whole. A longer
//! PDF is classified page by page, the pages are grouped into consecutive
//! same-type runs, and each run is re-rendered as its own PDF and uploaded
//! to blob storage.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use compileflow_core::models::{is_core_document, ClassificationResult, LogicalDocument};
use compileflow_core::segment::{excerpt_file_name, group_consecutive, PageClass};

use crate::blob::BlobStore;
use crate::classify::Classifier;
use crate::error::{PipelineError, PipelineResult};
use crate::pdf;
use crate::source::SourceFile;

/// A file of a batch that failed while its siblings went on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileError {
    pub file_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub documents: Vec<LogicalDocument>,
    pub errors: Vec<FileError>,
}

#[derive(Clone)]
pub struct Segmenter {
    classifier: Classifier,
    blobs: Arc<dyn BlobStore>,
}

impl Segmenter {
    pub fn new(classifier: Classifier, blobs: Arc<dyn BlobStore>) -> Self {
        Self { classifier, blobs }
    }

    /// Logical documents of one upload, in page order.
    ///
    /// Unsupported mime types yield no documents.
    pub async fn segment_file(&self, file: &SourceFile) -> PipelineResult<Vec<LogicalDocument>> {
        let is_pdf = pdf::is_pdf(&file.mime_type);
        if !is_pdf && !pdf::is_image(&file.mime_type) {
            info!(file = %file.file_name, mime = %file.mime_type, "skipping unsupported file");
            return Ok(Vec::new());
        }

        let pages = if is_pdf { pdf::page_count(&file.bytes)? } else { 1 };
        if pages <= 1 {
            let classification = self.classifier.classify(&file.bytes, &file.mime_type).await?;
            let doc = self
                .store_document(file, &file.file_name, file.bytes.clone(), vec![1], classification)
                .await?;
            return Ok(vec![doc]);
        }

        let mut classes = Vec::with_capacity(pages as usize);
        for page in 1..=pages {
            let single = pdf::extract_pages(&file.bytes, &[page])?;
            let classification = self.classifier.classify(&single, pdf::PDF_MIME).await?;
            classes.push(PageClass {
                page,
                classification,
            });
        }

        let groups = group_consecutive(&classes);
        info!(
            file = %file.file_name,
            pages,
            documents = groups.len(),
            "segmented multi-page PDF"
        );

        let mut documents = Vec::with_capacity(groups.len());
        for group in groups {
            let bytes = pdf::extract_pages(&file.bytes, &group.pages)?;
            let name = excerpt_file_name(&file.file_name, &group.pages);
            let classification = ClassificationResult {
                document_type: group.document_type,
                confidence: group.confidence,
            };
            documents.push(
                self.store_document(file, &name, bytes, group.pages, classification)
                    .await?,
            );
        }
        Ok(documents)
    }

    async fn store_document(
        &self,
        source: &SourceFile,
        file_name: &str,
        bytes: Vec<u8>,
        page_numbers: Vec<u32>,
        classification: ClassificationResult,
    ) -> PipelineResult<LogicalDocument> {
        let stored = self
            .blobs
            .put(file_name, &bytes)
            .await
            .map_err(PipelineError::storage)?;
        Ok(LogicalDocument {
            storage_id: stored.storage_id,
            source_file: source.file_name.clone(),
            file_name: file_name.to_string(),
            page_numbers,
            is_core_document: is_core_document(&classification.document_type),
            document_type: classification.document_type,
            confidence: classification.confidence,
            file_url: stored.url,
        })
    }

    /// Segment every file; a failing file is reported and the rest continue.
    pub async fn segment_batch(&self, files: &[SourceFile]) -> PipelineResult<BatchOutcome> {
        if files.is_empty() {
            return Err(PipelineError::invalid("no files to classify"));
        }
        let mut outcome = BatchOutcome::default();
        for file in files {
            match self.segment_file(file).await {
                Ok(docs) => outcome.documents.extend(docs),
                Err(e) => {
                    warn!(file = %file.file_name, error = %e, "segmentation failed");
                    outcome.errors.push(FileError {
                        file_name: file.file_name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }
}

/// Test model that classifies a PDF by the `PAGE:<type>-<n>` markers drawn
/// by [`pdf::test_pdf`]. An image is an invoice.
#[cfg(test)]
pub(crate) fn marker_classifier() -> crate::llm::scripted::ScriptedModel {
    use crate::llm::{GenerateResponse, ModelError};

    crate::llm::scripted::ScriptedModel::respond_with(|req| {
        let data = req
            .contents
            .iter()
            .flat_map(|c| c.parts.iter())
            .find_map(|p| match p {
                crate::llm::Part::InlineData { data, .. } => Some(data.clone()),
                _ => None,
            })
            .ok_or_else(|| ModelError::Parse("no file".into()))?;
        let text = String::from_utf8_lossy(&data);
        let label = match text.find("PAGE:") {
            Some(at) => {
                let rest = &text[at + 5..];
                let marker = &rest[..rest.find(')').unwrap_or(rest.len())];
                marker.rsplit_once('-').map(|(t, _)| t).unwrap_or(marker).to_string()
            }
            None => "Invoice".to_string(),
        };
        Ok(GenerateResponse::text(
            serde_json::json!({"documentType": label, "confidence": 0.9}).to_string(),
        ))
    })
}
