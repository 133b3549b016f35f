//! PDF page operations.
//!
//! The segmenter needs two things from a PDF: its page count, and a
//! standalone PDF holding an ordered subset of its pages. Both are done
//! with `lopdf` on in-memory bytes; nothing is rendered.

use lopdf::Document;

use crate::error::{PipelineError, PipelineResult};

pub const PDF_MIME: &str = "application/pdf";

pub fn is_pdf(mime_type: &str) -> bool {
    mime_type.trim().eq_ignore_ascii_case(PDF_MIME)
}

pub fn is_image(mime_type: &str) -> bool {
    mime_type
        .trim()
        .get(..6)
        .is_some_and(|p| p.eq_ignore_ascii_case("image/"))
}

fn load(bytes: &[u8]) -> PipelineResult<Document> {
    Document::load_mem(bytes).map_err(|e| PipelineError::Pdf(format!("failed to parse PDF: {}", e)))
}

/// Number of pages in the document.
pub fn page_count(bytes: &[u8]) -> PipelineResult<u32> {
    let doc = load(bytes)?;
    Ok(doc.get_pages().len() as u32)
}

/// A new PDF containing exactly `pages` (1-based, ascending) of the source.
///
/// Every other page is removed and unreachable objects are pruned, so the
/// excerpt carries no content from pages outside the range.
pub fn extract_pages(bytes: &[u8], pages: &[u32]) -> PipelineResult<Vec<u8>> {
    if pages.is_empty() {
        return Err(PipelineError::Pdf("no pages requested".to_string()));
    }
    let mut doc = load(bytes)?;
    let total = doc.get_pages().len() as u32;
    if let Some(bad) = pages.iter().find(|p| **p == 0 || **p > total) {
        return Err(PipelineError::Pdf(format!(
            "page {} out of range (document has {} pages)",
            bad, total
        )));
    }

    let drop: Vec<u32> = (1..=total).filter(|p| !pages.contains(p)).collect();
    if !drop.is_empty() {
        doc.delete_pages(&drop);
        doc.prune_objects();
    }

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| PipelineError::Pdf(format!("failed to write PDF: {}", e)))?;
    Ok(out)
}

/// Hand-assembled uncompressed PDFs for tests. Page `n` draws the text of
/// `labels[n - 1]`, so the raw bytes of an excerpt show which pages it holds.
#[cfg(test)]
pub(crate) fn test_pdf(labels: &[&str]) -> Vec<u8> {
    let n = labels.len();
    // Objects: 1 catalog, 2 pages, 3 font, then (page, contents) pairs.
    let mut objects: Vec<String> = Vec::new();
    let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", 4 + 2 * i)).collect();
    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids.join(" "),
        n
    ));
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());
    for (i, label) in labels.iter().enumerate() {
        let content = format!("BT /F1 12 Tf 100 700 Td (PAGE:{}) Tj ET", label);
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 3 0 R >> >> >>",
            5 + 2 * i
        ));
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            content.len(),
            content
        ));
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for off in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_start
        )
        .as_bytes(),
    );
    out
}
