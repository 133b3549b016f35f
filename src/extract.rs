//! Field extraction with the multimodal model.
//!
//! # Paths
//!
//! - **Single-shot**: every source goes into one request constrained by
//!   the JSON Schema built from the field lists. More than one source
//!   selects the `{documents: [...]}` shape with an exact length.
//! - **Chunked**: a PDF longer than `chunk_threshold_pages` is cut into
//!   overlapping page windows, each extracted on its own, and the window
//!   results are merged. A batch containing such a PDF is extracted one
//!   source at a time and assembled in input order.
//! - **Streaming**: the same request streamed; each parsable prefix of the
//!   answer becomes a `partial` frame and is written to the job's snapshot
//!   in the background. The validated answer is written last as
//!   `{"final": true, "data": ...}` and emitted as the `result` frame.
//!
//! Every answer is normalized (undeclared keys dropped, absent optional
//! keys set to `null`) and then validated; anything that fails is a
//! [`PipelineError::MalformedResponse`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use compileflow_core::chunk::{chunk_windows, merge_chunk_results};
use compileflow_core::models::{DocumentExtraction, ExtractionResult, FieldDescriptor, FieldSet};
use compileflow_core::schema::FieldSchema;
use compileflow_core::store::JobStore;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::llm::partial_json::parse_partial;
use crate::llm::{parse_json_text, Content, GenerateRequest, MultimodalModel, Part};
use crate::pdf;
use crate::source::SourceFile;

/// One server-sent frame of a streamed extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExtractionFrame {
    Partial { data: Value },
    Result { data: Value },
    Error { message: String },
}

pub type ExtractionStream = ReceiverStream<ExtractionFrame>;

/// Response body of a single-shot extraction.
///
/// `header_fields` and `line_item_fields` are the number of requested
/// fields in each list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionEnvelope {
    pub extracted_data: ExtractionResult,
    pub header_fields: usize,
    pub line_item_fields: usize,
    pub files_processed: usize,
    pub timestamp: DateTime<Utc>,
}

impl ExtractionEnvelope {
    pub fn new(extracted_data: ExtractionResult, fields: &FieldSet, files_processed: usize) -> Self {
        Self {
            extracted_data,
            header_fields: fields.header_fields.len(),
            line_item_fields: fields.line_item_fields.len(),
            files_processed,
            timestamp: Utc::now(),
        }
    }
}

/// Window settings for long PDFs.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSettings {
    pub threshold_pages: u32,
    pub window: u32,
    pub step: u32,
}

impl From<&PipelineConfig> for ChunkSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            threshold_pages: config.chunk_threshold_pages,
            window: config.chunk_window,
            step: config.chunk_step,
        }
    }
}

fn field_lines(fields: &[FieldDescriptor]) -> String {
    if fields.is_empty() {
        return "- (none)\n".to_string();
    }
    fields
        .iter()
        .map(|f| {
            let mut line = format!(
                "- {} ({}{})",
                f.name,
                f.field_type.as_str(),
                if f.required { ", required" } else { "" }
            );
            if !f.description.trim().is_empty() {
                line.push_str(": ");
                line.push_str(f.description.trim());
            }
            line.push('\n');
            line
        })
        .collect()
}

fn extraction_prompt(fields: &FieldSet, document_count: usize, window: Option<&[u32]>) -> String {
    let mut prompt = String::from(
        "Extract the requested fields from the attached document(s).\n\
         Rules:\n\
         - Copy header values verbatim as printed.\n\
         - Write dates as YYYY-MM-DD.\n\
         - Write numbers without thousands separators, currency symbols or units.\n\
         - Use null for any value that is missing or unclear. Never guess.\n\
         - lineItems must have exactly one entry per visible line-item row, in order.\n",
    );
    if document_count > 1 {
        prompt.push_str(&format!(
            "- There are {} documents. Return one object per document inside \"documents\", in the order they are attached.\n",
            document_count
        ));
    }
    if let Some(pages) = window {
        if let (Some(first), Some(last)) = (pages.first(), pages.last()) {
            prompt.push_str(&format!(
                "- The attachment holds pages {}-{} of a longer document. Fill the header only from values visible on these pages.\n",
                first, last
            ));
        }
    }
    prompt.push_str("\nHeader fields:\n");
    prompt.push_str(&field_lines(&fields.header_fields));
    prompt.push_str("\nLine-item fields:\n");
    prompt.push_str(&field_lines(&fields.line_item_fields));
    prompt
}

fn build_request(
    sources: &[SourceFile],
    fields: &FieldSet,
    schema: &FieldSchema,
    window: Option<&[u32]>,
) -> GenerateRequest {
    let mut parts = Vec::with_capacity(sources.len() * 2 + 1);
    for (i, source) in sources.iter().enumerate() {
        parts.push(Part::Text(format!("Document {}: {}", i + 1, source.file_name)));
        parts.push(Part::InlineData {
            mime_type: source.mime_type.clone(),
            data: source.bytes.clone(),
        });
    }
    parts.push(Part::Text(extraction_prompt(fields, sources.len(), window)));
    GenerateRequest::new(vec![Content::user(parts)]).with_schema(schema.to_json_schema())
}

/// Parse, normalize, and validate a complete answer.
fn finish_answer(text: &str, schema: &FieldSchema) -> PipelineResult<Value> {
    let mut value = parse_json_text(text).map_err(PipelineError::MalformedResponse)?;
    schema.normalize(&mut value);
    schema
        .validate(&value)
        .map_err(|v| PipelineError::MalformedResponse(v.to_string()))?;
    Ok(value)
}

fn to_document(value: Value) -> PipelineResult<DocumentExtraction> {
    serde_json::from_value(value).map_err(|e| PipelineError::MalformedResponse(e.to_string()))
}

fn to_result(value: Value, schema: &FieldSchema) -> PipelineResult<ExtractionResult> {
    if schema.is_batch() {
        let documents = value
            .get("documents")
            .cloned()
            .map(serde_json::from_value::<Vec<DocumentExtraction>>)
            .transpose()
            .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?
            .unwrap_or_default();
        Ok(ExtractionResult::Batch { documents })
    } else {
        Ok(ExtractionResult::Single(to_document(value)?))
    }
}

fn result_value(result: &ExtractionResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

fn check_inputs(sources: &[SourceFile], fields: &FieldSet) -> PipelineResult<()> {
    if sources.is_empty() {
        return Err(PipelineError::invalid("no documents to extract from"));
    }
    if fields.is_empty() {
        return Err(PipelineError::invalid(
            "headerFields and lineItemFields are both empty",
        ));
    }
    fields.validate().map_err(PipelineError::InvalidInput)?;
    if let Some(s) = sources
        .iter()
        .find(|s| !pdf::is_pdf(&s.mime_type) && !pdf::is_image(&s.mime_type))
    {
        return Err(PipelineError::UnsupportedMime(s.mime_type.clone()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Extractor {
    model: Arc<dyn MultimodalModel>,
    jobs: Arc<dyn JobStore>,
    chunking: ChunkSettings,
}

impl Extractor {
    pub fn new(model: Arc<dyn MultimodalModel>, jobs: Arc<dyn JobStore>, chunking: ChunkSettings) -> Self {
        Self {
            model,
            jobs,
            chunking,
        }
    }

    /// Page count of a PDF that needs windowing, `None` for everything else.
    fn long_pdf_pages(&self, source: &SourceFile) -> PipelineResult<Option<u32>> {
        if !pdf::is_pdf(&source.mime_type) {
            return Ok(None);
        }
        let pages = pdf::page_count(&source.bytes)?;
        Ok((pages > self.chunking.threshold_pages).then_some(pages))
    }

    fn any_long(&self, sources: &[SourceFile]) -> PipelineResult<bool> {
        for source in sources {
            if self.long_pdf_pages(source)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Extract `fields` from `sources`.
    pub async fn extract(&self, sources: &[SourceFile], fields: &FieldSet) -> PipelineResult<ExtractionResult> {
        check_inputs(sources, fields)?;
        let schema = FieldSchema::build(fields, sources.len());

        if !self.any_long(sources)? {
            let value = self.extract_once(sources, fields, &schema, None).await?;
            return to_result(value, &schema);
        }

        let mut documents = Vec::with_capacity(sources.len());
        for source in sources {
            documents.push(self.extract_document(source, fields).await?);
        }
        Ok(if documents.len() == 1 {
            ExtractionResult::Single(documents.remove(0))
        } else {
            ExtractionResult::Batch { documents }
        })
    }

    /// One model call, validated against `schema`.
    pub async fn extract_once(
        &self,
        sources: &[SourceFile],
        fields: &FieldSet,
        schema: &FieldSchema,
        window: Option<&[u32]>,
    ) -> PipelineResult<Value> {
        let request = build_request(sources, fields, schema, window);
        let response = self.model.generate(request).await?;
        finish_answer(&response.joined_text(), schema)
    }

    /// One source on its own, windowed if it is a long PDF.
    async fn extract_document(&self, source: &SourceFile, fields: &FieldSet) -> PipelineResult<DocumentExtraction> {
        let schema = FieldSchema::build(fields, 1);
        match self.long_pdf_pages(source)? {
            Some(pages) => self.extract_chunked(source, pages, fields).await,
            None => to_document(self.extract_once(std::slice::from_ref(source), fields, &schema, None).await?),
        }
    }

    /// Extract window by window and merge. Any failing window fails the document.
    pub async fn extract_chunked(
        &self,
        source: &SourceFile,
        page_count: u32,
        fields: &FieldSet,
    ) -> PipelineResult<DocumentExtraction> {
        let mut chunks = Vec::new();
        for pages in self.windows(source, page_count) {
            chunks.push(self.extract_window(source, &pages, fields).await?);
        }
        Ok(merge_chunk_results(chunks))
    }

    fn windows(&self, source: &SourceFile, page_count: u32) -> Vec<Vec<u32>> {
        let windows = chunk_windows(page_count, self.chunking.window, self.chunking.step);
        info!(
            file = %source.file_name,
            pages = page_count,
            windows = windows.len(),
            "extracting long PDF in windows"
        );
        windows
    }

    async fn extract_window(
        &self,
        source: &SourceFile,
        pages: &[u32],
        fields: &FieldSet,
    ) -> PipelineResult<DocumentExtraction> {
        let schema = FieldSchema::build(fields, 1);
        let excerpt = SourceFile::new(
            source.file_name.clone(),
            pdf::PDF_MIME,
            pdf::extract_pages(&source.bytes, pages)?,
        );
        debug!(file = %source.file_name, ?pages, "extracting window");
        let value = self
            .extract_once(std::slice::from_ref(&excerpt), fields, &schema, Some(pages))
            .await?;
        to_document(value)
    }

    /// Stream the extraction as frames.
    ///
    /// Input problems are returned immediately; failures after the stream
    /// starts arrive as an `error` frame. Dropping the stream stops
    /// generation, while snapshot writes already spawned still complete.
    pub async fn extract_streaming(
        &self,
        job_id: &str,
        sources: Vec<SourceFile>,
        fields: FieldSet,
    ) -> PipelineResult<ExtractionStream> {
        if job_id.trim().is_empty() {
            return Err(PipelineError::invalid("jobId is required for streaming"));
        }
        check_inputs(&sources, &fields)?;
        let chunked = self.any_long(&sources)?;

        let (tx, rx) = mpsc::channel(32);
        let run = StreamRun {
            extractor: self.clone(),
            job_id: job_id.to_string(),
            tx,
            writes: Vec::new(),
        };
        tokio::spawn(run.drive(sources, fields, chunked));
        Ok(ReceiverStream::new(rx))
    }
}

/// State of one streamed extraction task.
struct StreamRun {
    extractor: Extractor,
    job_id: String,
    tx: mpsc::Sender<ExtractionFrame>,
    writes: Vec<JoinHandle<()>>,
}

impl StreamRun {
    async fn drive(mut self, sources: Vec<SourceFile>, fields: FieldSet, chunked: bool) {
        let outcome = if chunked {
            self.stream_chunked(&sources, &fields).await
        } else {
            self.stream_single(&sources, &fields).await
        };

        match outcome {
            Ok(Some(data)) => {
                // Background partial writes land first so the final write wins.
                for handle in std::mem::take(&mut self.writes) {
                    let _ = handle.await;
                }
                let snapshot = json!({ "final": true, "data": data });
                if let Err(e) = self.extractor.jobs.put_snapshot(&self.job_id, &snapshot).await {
                    warn!(job_id = %self.job_id, error = %format!("{:#}", e), "failed to persist final extraction");
                }
                info!(job_id = %self.job_id, "streamed extraction complete");
                let _ = self.tx.send(ExtractionFrame::Result { data }).await;
            }
            Ok(None) => debug!(job_id = %self.job_id, "stream consumer went away"),
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "streamed extraction failed");
                let _ = self
                    .tx
                    .send(ExtractionFrame::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Emit a partial frame and persist it without waiting.
    /// Returns false once the consumer is gone.
    async fn partial(&mut self, data: Value) -> bool {
        let jobs = self.extractor.jobs.clone();
        let job_id = self.job_id.clone();
        let snapshot = json!({ "final": false, "data": data.clone() });
        self.writes.push(tokio::spawn(async move {
            if let Err(e) = jobs.put_snapshot(&job_id, &snapshot).await {
                warn!(job_id = %job_id, error = %format!("{:#}", e), "failed to persist partial extraction");
            }
        }));
        self.tx.send(ExtractionFrame::Partial { data }).await.is_ok()
    }

    async fn stream_single(&mut self, sources: &[SourceFile], fields: &FieldSet) -> PipelineResult<Option<Value>> {
        let schema = FieldSchema::build(fields, sources.len());
        let request = build_request(sources, fields, &schema, None);
        let mut deltas = self.extractor.model.stream_text(request).await?;

        let mut text = String::new();
        let mut last: Option<Value> = None;
        while let Some(delta) = deltas.next().await {
            text.push_str(&delta?);
            if let Some(value) = parse_partial(&text) {
                if last.as_ref() != Some(&value) {
                    last = Some(value.clone());
                    if !self.partial(value).await {
                        return Ok(None);
                    }
                }
            }
        }

        let value = finish_answer(&text, &schema)?;
        Ok(Some(result_value(&to_result(value, &schema)?)))
    }

    /// Long documents: one partial per finished window with everything
    /// merged so far.
    async fn stream_chunked(&mut self, sources: &[SourceFile], fields: &FieldSet) -> PipelineResult<Option<Value>> {
        let single_schema = FieldSchema::build(fields, 1);
        let batch = sources.len() > 1;
        let mut done: Vec<DocumentExtraction> = Vec::with_capacity(sources.len());

        for source in sources {
            let current = match self.extractor.long_pdf_pages(source)? {
                Some(pages) => {
                    let mut chunks = Vec::new();
                    for window in self.extractor.windows(source, pages) {
                        chunks.push(self.extractor.extract_window(source, &window, fields).await?);
                        let merged = merge_chunk_results(chunks.clone());
                        if !self.partial(partial_value(&done, merged, batch)).await {
                            return Ok(None);
                        }
                    }
                    merge_chunk_results(chunks)
                }
                None => {
                    let value = self
                        .extractor
                        .extract_once(std::slice::from_ref(source), fields, &single_schema, None)
                        .await?;
                    let doc = to_document(value)?;
                    if !self.partial(partial_value(&done, doc.clone(), batch)).await {
                        return Ok(None);
                    }
                    doc
                }
            };
            done.push(current);
        }

        let result = if batch {
            ExtractionResult::Batch { documents: done }
        } else {
            ExtractionResult::Single(done.into_iter().next().unwrap_or_default())
        };
        Ok(Some(result_value(&result)))
    }
}

fn partial_value(done: &[DocumentExtraction], current: DocumentExtraction, batch: bool) -> Value {
    if !batch {
        return result_value(&ExtractionResult::Single(current));
    }
    let mut documents = done.to_vec();
    documents.push(current);
    result_value(&ExtractionResult::Batch { documents })
}
