//! CSV export of extraction results.
//!
//! Layout for one document:
//!
//! ```text
//! Header Field,Header Value
//! "invoice_number","INV-1"
//!
//! "Description","Qty"
//! "Widget","2"
//! ```
//!
//! Batches repeat the block per document, each preceded by a
//! `Document N Header` line and separated by a blank line. Column titles
//! use the field label when one is mapped, otherwise the raw field name.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::models::{DocumentExtraction, ExtractionResult, FieldSet};

/// Column titles and ordering for an export.
#[derive(Debug, Clone, Default)]
pub struct CsvLayout {
    /// Field name → display label.
    pub labels: HashMap<String, String>,
    /// Preferred header row order; unlisted keys follow in map order.
    pub header_order: Vec<String>,
    /// Preferred line-item column order; unlisted keys follow in first-seen order.
    pub line_item_order: Vec<String>,
}

impl CsvLayout {
    pub fn from_fields(fields: &FieldSet) -> Self {
        Self {
            labels: fields.labels(),
            header_order: fields.header_fields.iter().map(|f| f.name.clone()).collect(),
            line_item_order: fields
                .line_item_fields
                .iter()
                .map(|f| f.name.clone())
                .collect(),
        }
    }

    pub fn with_labels(labels: HashMap<String, String>) -> Self {
        Self {
            labels,
            ..Self::default()
        }
    }

    fn label<'a>(&'a self, name: &'a str) -> &'a str {
        self.labels
            .get(name)
            .map(String::as_str)
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(name)
    }
}

/// Render an extraction result as `text/csv`.
pub fn export_csv(result: &ExtractionResult, layout: &CsvLayout) -> String {
    let mut out = String::new();
    match result {
        ExtractionResult::Single(doc) => write_document(&mut out, doc, layout),
        ExtractionResult::Batch { documents } => {
            for (i, doc) in documents.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                }
                out.push_str(&format!("Document {} Header\n", i + 1));
                write_document(&mut out, doc, layout);
            }
        }
    }
    out
}

fn write_document(out: &mut String, doc: &DocumentExtraction, layout: &CsvLayout) {
    out.push_str("Header Field,Header Value\n");
    for key in ordered_keys(&layout.header_order, std::iter::once(&doc.header)) {
        let value = doc.header.get(&key).unwrap_or(&Value::Null);
        out.push_str(&format!(
            "{},{}\n",
            quote(layout.label(&key)),
            quote(&render(value))
        ));
    }
    out.push('\n');

    let columns = ordered_keys(&layout.line_item_order, doc.line_items.iter());
    if columns.is_empty() {
        return;
    }
    let titles: Vec<String> = columns.iter().map(|c| quote(layout.label(c))).collect();
    out.push_str(&titles.join(","));
    out.push('\n');
    for row in &doc.line_items {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| quote(&render(row.get(c).unwrap_or(&Value::Null))))
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
}

/// Preferred keys that occur in `maps`, then every other key in first-seen order.
fn ordered_keys<'a>(
    preferred: &[String],
    maps: impl Iterator<Item = &'a Map<String, Value>>,
) -> Vec<String> {
    let maps: Vec<&Map<String, Value>> = maps.collect();
    let mut keys: Vec<String> = preferred
        .iter()
        .filter(|k| maps.iter().any(|m| m.contains_key(k.as_str())))
        .cloned()
        .collect();
    for m in &maps {
        for k in m.keys() {
            if !keys.contains(k) {
                keys.push(k.clone());
            }
        }
    }
    keys
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldDescriptor, FieldType};
    use serde_json::json;

    fn result(v: Value) -> ExtractionResult {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_single_document_layout() {
        let csv = export_csv(
            &result(json!({"header": {"a": "1"}, "lineItems": [{"b": "x"}]})),
            &CsvLayout::default(),
        );
        assert_eq!(csv, "Header Field,Header Value\n\"a\",\"1\"\n\n\"b\"\n\"x\"\n");
    }

    #[test]
    fn test_labels_and_fallback() {
        let mut labels = HashMap::new();
        labels.insert("qty".to_string(), "Quantity".to_string());
        let csv = export_csv(
            &result(json!({"header": {}, "lineItems": [{"qty": 2, "sku": "A"}]})),
            &CsvLayout::with_labels(labels),
        );
        assert!(csv.contains("\"Quantity\",\"sku\"\n\"2\",\"A\"\n"));
    }

    #[test]
    fn test_field_order_and_nulls() {
        let f = |n: &str, l: &str| FieldDescriptor {
            name: n.into(),
            label: l.into(),
            field_type: FieldType::String,
            description: String::new(),
            required: false,
            example: None,
        };
        let fields = FieldSet::new(vec![f("z", "Zed"), f("a", "Ay")], vec![f("sku", "SKU"), f("desc", "Desc")]);
        let csv = export_csv(
            &result(json!({
                "header": {"a": null, "z": 3.5},
                "lineItems": [{"desc": "Bolt \"M8\"", "sku": "B1"}, {"sku": "B2"}]
            })),
            &CsvLayout::from_fields(&fields),
        );
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[1], "\"Zed\",\"3.5\"");
        assert_eq!(lines[2], "\"Ay\",\"\"");
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "\"SKU\",\"Desc\"");
        assert_eq!(lines[5], "\"B1\",\"Bolt \"\"M8\"\"\"");
        assert_eq!(lines[6], "\"B2\",\"\"");
    }

    #[test]
    fn test_batch_markers() {
        let csv = export_csv(
            &result(json!({"documents": [
                {"header": {"a": "1"}, "lineItems": []},
                {"header": {"a": "2"}, "lineItems": [{"b": "y"}]}
            ]})),
            &CsvLayout::default(),
        );
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Document 1 Header");
        assert_eq!(lines[1], "Header Field,Header Value");
        assert_eq!(lines[2], "\"a\",\"1\"");
        assert!(lines.contains(&"Document 2 Header"));
        assert!(csv.ends_with("\"b\"\n\"y\"\n"));
    }
}
