//! Overlapping page windows for long documents, and the merge of their
//! per-window extraction results.
//!
//! # Windowing
//!
//! Pages are partitioned into windows of `window` pages advancing by
//! `step` pages. With the defaults (3 and 2) consecutive windows share one
//! page, so a table row straddling a page break is seen whole by at least
//! one window:
//!
//! ```rust
//! use compileflow_core::chunk::chunk_windows;
//!
//! let windows = chunk_windows(7, 3, 2);
//! assert_eq!(windows, vec![vec![1, 2, 3], vec![3, 4, 5], vec![5, 6, 7]]);
//! ```
//!
//! # Merging
//!
//! - `header` comes from the first window whose header has at least one
//!   non-null value.
//! - `lineItems` from all windows are concatenated in window order and
//!   deduplicated by exact structural equality of the whole row.
//!
//! The dedup key is the full field-value tuple. Rows repeated because of
//! the deliberate overlap collapse to one; two genuinely distinct rows
//! that agree on every field collapse as well.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::models::DocumentExtraction;

/// Default pages per window.
pub const DEFAULT_WINDOW: u32 = 3;
/// Default pages advanced between windows.
pub const DEFAULT_STEP: u32 = 2;

/// 1-based page windows covering `page_count` pages.
///
/// The last window is truncated to the remaining pages. A document that
/// fits in one window yields exactly one window. `step` is clamped to
/// `1..=window` so every page is covered.
pub fn chunk_windows(page_count: u32, window: u32, step: u32) -> Vec<Vec<u32>> {
    if page_count == 0 {
        return Vec::new();
    }
    let window = window.max(1);
    let step = step.clamp(1, window);

    let mut windows = Vec::new();
    let mut start = 1u32;
    loop {
        let end = (start + window - 1).min(page_count);
        windows.push((start..=end).collect());
        if end >= page_count {
            break;
        }
        start += step;
    }
    windows
}

/// Canonical dedup key for a row: sorted `(key, value)` pairs.
///
/// Built explicitly rather than relying on map iteration order.
pub fn row_key(row: &Map<String, Value>) -> String {
    let mut pairs: Vec<(&String, String)> = row.iter().map(|(k, v)| (k, v.to_string())).collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}\u{1f}{}", k, v))
        .collect::<Vec<_>>()
        .join("\u{1e}")
}

fn header_has_value(header: &Map<String, Value>) -> bool {
    header.values().any(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

/// Merge per-window results into one document.
///
/// Input order is window order. An empty input yields an empty document.
pub fn merge_chunk_results(chunks: Vec<DocumentExtraction>) -> DocumentExtraction {
    let mut header: Option<Map<String, Value>> = None;
    let mut seen = HashSet::new();
    let mut line_items = Vec::new();

    for chunk in chunks {
        if header.is_none() && header_has_value(&chunk.header) {
            header = Some(chunk.header);
        }
        for row in chunk.line_items {
            if seen.insert(row_key(&row)) {
                line_items.push(row);
            }
        }
    }

    DocumentExtraction {
        header: header.unwrap_or_default(),
        line_items,
    }
}
