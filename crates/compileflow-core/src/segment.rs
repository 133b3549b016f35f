//! Consecutive-run grouping over a classified page sequence.
//!
//! A multi-page upload is classified page by page; pages are then grouped
//! into maximal runs sharing the same document type. A new group starts
//! exactly when a page's type differs from the page immediately before it,
//! so `[A, A, B, B, A]` yields three groups, not two.
//!
//! The grouping is an explicit fold: [`step`] either extends the open
//! group or closes it, and [`group_consecutive`] flushes whatever is left
//! open at the end. Both are exposed so the flush conditions can be
//! exercised on their own.

use crate::models::ClassificationResult;

/// Classification of one page (1-based page number).
#[derive(Debug, Clone, PartialEq)]
pub struct PageClass {
    pub page: u32,
    pub classification: ClassificationResult,
}

/// A maximal run of consecutive pages sharing one document type.
#[derive(Debug, Clone, PartialEq)]
pub struct PageGroup {
    pub document_type: String,
    /// Lowest page confidence in the run.
    pub confidence: f64,
    pub pages: Vec<u32>,
}

/// Fold state: closed groups plus the currently open one.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GroupAcc {
    pub closed: Vec<PageGroup>,
    pub open: Option<PageGroup>,
}

/// Advance the fold by one page.
///
/// Labels are compared exactly as the classifier returned them (after
/// trimming); the classifier is instructed to reuse core labels verbatim.
pub fn step(mut acc: GroupAcc, page: &PageClass) -> GroupAcc {
    let label = page.classification.document_type.trim();
    match acc.open.take() {
        Some(mut group) if group.document_type == label => {
            group.pages.push(page.page);
            group.confidence = group.confidence.min(page.classification.confidence);
            acc.open = Some(group);
        }
        previous => {
            if let Some(group) = previous {
                acc.closed.push(group);
            }
            acc.open = Some(PageGroup {
                document_type: label.to_string(),
                confidence: page.classification.confidence,
                pages: vec![page.page],
            });
        }
    }
    acc
}

/// Close the open group, if any, and return all groups in page order.
pub fn flush(mut acc: GroupAcc) -> Vec<PageGroup> {
    if let Some(group) = acc.open.take() {
        acc.closed.push(group);
    }
    acc.closed
}

/// Group classified pages into maximal consecutive same-type runs.
///
/// Input must be in page order. Empty input yields no groups.
pub fn group_consecutive(pages: &[PageClass]) -> Vec<PageGroup> {
    flush(pages.iter().fold(GroupAcc::default(), step))
}

/// File name for a group excerpt: `invoice.pdf` + pages 3..4 → `invoice_p3-4.pdf`.
pub fn excerpt_file_name(source_file: &str, pages: &[u32]) -> String {
    let stem = source_file
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(source_file);
    match (pages.first(), pages.last()) {
        (Some(first), Some(last)) if first == last => format!("{}_p{}.pdf", stem, first),
        (Some(first), Some(last)) => format!("{}_p{}-{}.pdf", stem, first, last),
        _ => format!("{}.pdf", stem),
    }
}
