//! Template matching rules: query text, ranking, and the auto-accept
//! threshold.
//!
//! The store returns candidates by cosine similarity. [`rank_for_query`]
//! folds in the supplier string match: a candidate whose normalized
//! supplier equals the query's is ranked ahead of every other candidate,
//! and when its client is also compatible its score is raised to 1.0.
//! Callers then apply [`decide`] to the top score. A score of exactly
//! [`AUTO_ACCEPT_THRESHOLD`] is accepted.

use std::cmp::Ordering;
use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::models::TemplateMatch;

/// Minimum top-match score for using a saved template without review.
pub const AUTO_ACCEPT_THRESHOLD: f64 = 0.95;

/// What the orchestrator does after matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDecision {
    /// Extract with the template's field lists.
    UseTemplate { template_id: String },
    /// No confident match: propose fields for human confirmation.
    Suggest,
}

/// Apply the threshold to a candidate list already ordered by score.
pub fn decide(matches: &[TemplateMatch]) -> MatchDecision {
    match matches.first() {
        Some(top) if accepts(top.score) => MatchDecision::UseTemplate {
            template_id: top.template.id.clone(),
        },
        _ => MatchDecision::Suggest,
    }
}

/// Inclusive threshold test.
pub fn accepts(score: f64) -> bool {
    score >= AUTO_ACCEPT_THRESHOLD
}

/// Text embedded for both stored templates and match queries.
///
/// Lowercased and whitespace-collapsed so cosmetic differences in the
/// supplier string do not move the vector.
pub fn match_text(supplier: &str, client_name: Option<&str>) -> String {
    match client_name.map(normalize_name).filter(|c| !c.is_empty()) {
        Some(client) => format!("supplier: {} | client: {}", normalize_name(supplier), client),
        None => format!("supplier: {}", normalize_name(supplier)),
    }
}

/// Lowercased, whitespace-collapsed name.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A missing or blank client on either side matches any client.
fn clients_compatible(template: Option<&str>, query: Option<&str>) -> bool {
    let template = template.map(normalize_name).filter(|c| !c.is_empty());
    let query = query.map(normalize_name).filter(|c| !c.is_empty());
    match (template, query) {
        (Some(t), Some(q)) => t == q,
        _ => true,
    }
}

/// SHA-256 of the match text, persisted next to the vector it produced.
pub fn match_text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Sort candidates by descending score (stable for ties) and keep `limit`.
pub fn rank(mut matches: Vec<TemplateMatch>, limit: usize) -> Vec<TemplateMatch> {
    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    matches.truncate(limit);
    matches
}

/// Rank candidates for a `(supplier, client_name)` query using both the
/// supplier string match and the vector score.
///
/// Duplicate template ids keep their first occurrence. Same-supplier
/// candidates come first; a same-supplier candidate with a compatible
/// client scores 1.0. Within each group the order is by score.
pub fn rank_for_query(
    matches: Vec<TemplateMatch>,
    supplier: &str,
    client_name: Option<&str>,
    limit: usize,
) -> Vec<TemplateMatch> {
    let query_supplier = normalize_name(supplier);
    let mut seen = HashSet::new();
    let mut scored: Vec<(bool, TemplateMatch)> = matches
        .into_iter()
        .filter(|m| seen.insert(m.template.id.clone()))
        .map(|mut m| {
            let same_supplier = normalize_name(&m.template.supplier) == query_supplier;
            if same_supplier && clients_compatible(m.template.client_name.as_deref(), client_name) {
                m.score = 1.0;
            }
            (same_supplier, m)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.score.partial_cmp(&a.1.score).unwrap_or(Ordering::Equal))
    });
    scored.into_iter().take(limit).map(|(_, m)| m).collect()
}
