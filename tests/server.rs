mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{harness, pdf, Harness};
use compileflow::server::router;
use compileflow_core::store::JobStore;

async fn send(h: &Harness, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router(h.pipeline.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(h: &Harness, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(h, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn upload(name: &str, bytes: &[u8]) -> Value {
    json!({
        "bytes": base64::engine::general_purpose::STANDARD.encode(bytes),
        "mimeType": "application/pdf",
        "filename": name,
    })
}

fn invoice_fields_json() -> Value {
    json!({
        "headerFields": [
            { "name": "invoice_number", "label": "Invoice No.", "type": "string" },
            { "name": "total", "type": "number" }
        ],
        "lineItemFields": [
            { "name": "sku", "type": "string" },
            { "name": "qty", "type": "number" }
        ]
    })
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let (status, body) = send_json(&h, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_classify_records_documents_and_serves_excerpts() {
    let h = harness();
    let bundle = pdf(&["Invoice-1", "Commercial Invoice-2"]);
    let (status, body) = send_json(
        &h,
        "POST",
        "/classify",
        Some(json!({ "files": [upload("bundle.pdf", &bundle)], "jobId": "job-9" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let docs = body["documents"].as_array().unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["documentType"], "Invoice");
    assert_eq!(docs[1]["documentType"], "Commercial Invoice");
    assert_eq!(docs[1]["pageNumbers"], json!([2]));

    assert_eq!(h.jobs.list_documents("job-9").await.unwrap().len(), 2);

    let storage_id = docs[1]["storageId"].as_str().unwrap();
    let (status, bytes) = send(&h, "GET", &format!("/files/{}", storage_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("PAGE:Commercial Invoice-2"));
    assert!(!text.contains("PAGE:Invoice-1"));
}

#[tokio::test]
async fn test_classify_reports_unreachable_url_per_file() {
    let h = harness();
    let good = h.upload("one.pdf", pdf(&["Invoice-1"])).await;
    let missing = format!("{}/files/nope/missing.pdf", common::BASE_URL);

    let (status, body) = send_json(
        &h,
        "POST",
        "/classify",
        Some(json!({ "fileUrls": [good, missing.clone()] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["documents"].as_array().unwrap().len(), 1);
    assert_eq!(body["errors"][0]["fileName"], missing);
}

#[tokio::test]
async fn test_files_and_urls_together_is_bad_request() {
    let h = harness();
    let (status, body) = send_json(
        &h,
        "POST",
        "/classify",
        Some(json!({
            "files": [upload("a.pdf", &pdf(&["Invoice-1"]))],
            "fileUrls": ["http://cflow.test/files/x/a.pdf"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_extract_returns_envelope_and_persists_job() {
    let h = harness();
    let mut req = invoice_fields_json();
    req["files"] = json!([upload("inv.pdf", &pdf(&["Invoice-1"]))]);
    req["jobId"] = json!("job-3");

    let (status, body) = send_json(&h, "POST", "/extract", Some(req)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filesProcessed"], 1);
    assert_eq!(body["extractedData"]["header"]["invoice_number"], "invoice_number-h");
    assert_eq!(body["headerFields"], 2);
    assert_eq!(body["lineItemFields"], 2);

    let (status, snapshot) = send_json(&h, "GET", "/jobs/job-3/extraction", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["final"], true);

    let (status, body) = send_json(&h, "GET", "/jobs/unknown/extraction", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_extract_rejects_unsupported_mime() {
    let h = harness();
    let mut req = invoice_fields_json();
    req["files"] = json!([{
        "bytes": base64::engine::general_purpose::STANDARD.encode(b"a,b"),
        "mimeType": "text/csv",
        "filename": "rows.csv",
    }]);
    let (status, body) = send_json(&h, "POST", "/extract", Some(req)).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["error"]["code"], "unsupported_media_type");
}

#[tokio::test]
async fn test_extract_stream_emits_sse_frames() {
    let h = harness();
    let mut req = invoice_fields_json();
    req["files"] = json!([upload("inv.pdf", &pdf(&["Invoice-1"]))]);
    req["jobId"] = json!("job-s");

    let (status, bytes) = send(&h, "POST", "/extract/stream", Some(req)).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    let frames: Vec<Value> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert!(!frames.is_empty());
    assert_eq!(frames.last().unwrap()["type"], "result");
    assert!(frames[..frames.len() - 1].iter().all(|f| f["type"] == "partial"));

    let snapshot = h.jobs.get_snapshot("job-s").await.unwrap().unwrap();
    assert_eq!(snapshot["final"], true);
}

#[tokio::test]
async fn test_extract_stream_requires_job_id() {
    let h = harness();
    let mut req = invoice_fields_json();
    req["files"] = json!([upload("inv.pdf", &pdf(&["Invoice-1"]))]);
    let (status, _) = send(&h, "POST", "/extract/stream", Some(req)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_save_then_match_template() {
    let h = harness();
    let mut req = invoice_fields_json();
    req["supplier"] = json!("Acme Corp");
    req["clientName"] = json!("Globex");
    let (status, saved) = send_json(&h, "POST", "/templates", Some(req.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let (_, resaved) = send_json(&h, "POST", "/templates", Some(req)).await;
    assert_eq!(saved["id"], resaved["id"]);

    let (status, matches) = send_json(
        &h,
        "POST",
        "/templates/match",
        Some(json!({ "supplier": "ACME corp", "clientName": "globex" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let matches = matches.as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["id"], saved["id"]);
    assert!(matches[0]["score"].as_f64().unwrap() > 0.99);

    let (status, _) = send_json(&h, "POST", "/templates/match", Some(json!({ "supplier": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_export_csv_uses_field_order_and_labels() {
    let h = harness();
    let mut req = invoice_fields_json();
    req["data"] = json!({
        "header": { "total": 12.5, "invoice_number": "INV-1" },
        "lineItems": [ { "qty": 2, "sku": "A-1" } ],
    });
    req["labels"] = json!({ "sku": "Article" });

    let (status, bytes) = send(&h, "POST", "/export/csv", Some(req)).await;
    assert_eq!(status, StatusCode::OK);
    let csv = String::from_utf8(bytes).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[1], r#""Invoice No.","INV-1""#);
    assert_eq!(lines[2], r#""total","12.5""#);
    assert!(lines.contains(&r#""Article","qty""#));
    assert!(lines.contains(&r#""A-1","2""#));
}

#[tokio::test]
async fn test_agent_endpoint_proposes_fields() {
    let h = harness();
    let url = h.upload("scan.pdf", pdf(&["Invoice-1"])).await;
    let (status, body) = send_json(
        &h,
        "POST",
        "/agent",
        Some(json!({ "jobId": "job-a", "documentUrls": [url] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "awaiting_confirmation");
    assert_eq!(body["steps"][0]["tool"], "match_template");

    let (status, turns) = send_json(&h, "GET", "/jobs/job-a/turns", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(turns["turns"][0]["role"], "user");
}
