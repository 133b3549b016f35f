mod common;

use common::{harness, harness_with, invoice_fields, pdf};
use futures::StreamExt;
use serde_json::json;

use compileflow::agent::{AgentRequest, AgentStatus};
use compileflow::config::Config;
use compileflow::extract::ExtractionFrame;
use compileflow::source::SourceFile;
use compileflow_core::models::ExtractionResult;
use compileflow_core::store::JobStore;

fn pdf_source(name: &str, labels: &[&str]) -> SourceFile {
    SourceFile::new(name, "application/pdf", pdf(labels))
}

#[tokio::test]
async fn test_segment_batch_splits_runs_and_keeps_going_after_bad_files() {
    let h = harness();
    let files = vec![
        pdf_source("bundle.pdf", &["Invoice-1", "Invoice-2", "Packing List-3"]),
        SourceFile::new("broken.pdf", "application/pdf", b"not a pdf at all".to_vec()),
        SourceFile::new("notes.txt", "text/plain", b"hello".to_vec()),
    ];

    let outcome = h.pipeline.segmenter().segment_batch(&files).await.unwrap();

    let types: Vec<_> = outcome.documents.iter().map(|d| d.document_type.as_str()).collect();
    assert_eq!(types, vec!["Invoice", "Packing List"]);
    assert_eq!(outcome.documents[0].page_numbers, vec![1, 2]);
    assert_eq!(outcome.documents[1].page_numbers, vec![3]);
    assert!(outcome.documents.iter().all(|d| d.source_file == "bundle.pdf"));
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].file_name, "broken.pdf");
}

#[tokio::test]
async fn test_extract_single_and_batch_shapes() {
    let h = harness();
    let fields = invoice_fields();

    let one = h
        .pipeline
        .extractor()
        .extract(&[pdf_source("a.pdf", &["Invoice-1"])], &fields)
        .await
        .unwrap();
    let ExtractionResult::Single(doc) = one else {
        panic!("expected a single result");
    };
    assert_eq!(doc.header["invoice_number"], json!("invoice_number-h"));
    assert_eq!(doc.line_items.len(), 1);

    let two = h
        .pipeline
        .extractor()
        .extract(
            &[pdf_source("a.pdf", &["Invoice-1"]), pdf_source("b.pdf", &["Invoice-1"])],
            &fields,
        )
        .await
        .unwrap();
    assert_eq!(two.documents().len(), 2);
}

#[tokio::test]
async fn test_long_pdf_is_chunked_and_deduplicated() {
    let mut config = Config::default();
    config.pipeline.chunk_threshold_pages = 2;
    config.pipeline.chunk_window = 2;
    config.pipeline.chunk_step = 1;
    let h = harness_with(config);

    let labels = ["Invoice-1", "Invoice-2", "Invoice-3", "Invoice-4"];
    let result = h
        .pipeline
        .extractor()
        .extract(&[pdf_source("long.pdf", &labels)], &invoice_fields())
        .await
        .unwrap();

    let docs = result.documents();
    assert_eq!(docs.len(), 1);
    // Overlapping windows produce identical rows; only distinct rows survive.
    let rows = &docs[0].line_items;
    assert!(!rows.is_empty());
    for (i, a) in rows.iter().enumerate() {
        assert!(rows[i + 1..].iter().all(|b| b != a));
    }
}

#[tokio::test]
async fn test_streaming_persists_final_snapshot() {
    let h = harness();
    let mut frames = h
        .pipeline
        .extractor()
        .extract_streaming("job-7", vec![pdf_source("a.pdf", &["Invoice-1"])], invoice_fields())
        .await
        .unwrap();

    let mut last = None;
    while let Some(frame) = frames.next().await {
        last = Some(frame);
    }
    let Some(ExtractionFrame::Result { data }) = last else {
        panic!("stream must end with a result frame, got {:?}", last);
    };

    let snapshot = h.jobs.get_snapshot("job-7").await.unwrap().unwrap();
    assert_eq!(snapshot["final"], json!(true));
    assert_eq!(snapshot["data"], data);
}

#[tokio::test]
async fn test_streaming_requires_job_id() {
    let h = harness();
    let err = h
        .pipeline
        .extractor()
        .extract_streaming("  ", vec![pdf_source("a.pdf", &["Invoice-1"])], invoice_fields())
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_agent_suggests_without_templates_then_extracts_after_save() {
    let h = harness();
    let url = h.upload("scan.pdf", pdf(&["Invoice-1"])).await;

    let request = AgentRequest {
        job_id: "job-1".into(),
        document_urls: vec![url.clone()],
        messages: vec![],
        client_name: None,
    };
    let first = h.pipeline.orchestrator().run(request.clone()).await.unwrap();
    assert_eq!(first.status, AgentStatus::AwaitingConfirmation);
    let suggestion = first.suggestion.unwrap();
    assert_eq!(suggestion.header_fields[0].name, "invoice_number");

    h.pipeline
        .templates()
        .save_template("Acme Corp", None, suggestion.fields())
        .await
        .unwrap();

    let second = h.pipeline.orchestrator().run(request).await.unwrap();
    assert_eq!(second.status, AgentStatus::Extracted);
    assert!(second.template_id.is_some());
    assert!(second.extracted_data.is_some());

    let snapshot = h.jobs.get_snapshot("job-1").await.unwrap().unwrap();
    assert_eq!(snapshot["final"], json!(true));
    let turns = h.jobs.list_turns("job-1").await.unwrap();
    assert!(turns.len() >= 2);
}
