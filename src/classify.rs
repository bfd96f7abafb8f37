//! Duplicate classification and key suggestions.
//!
//! Every write compares the candidate against every record of the realm.
//! Fields present on both sides contribute their edit distance and the
//! longer of the two lengths; fields present on only one side contribute
//! nothing. A pair is reported when the IDs match but the field sets differ,
//! or when the distance is non-zero and either the IDs match or the distance
//! is small (absolutely, or relative to the compared length).
//!
//! Realms hold hundreds to low thousands of records and classification only
//! runs on writes, so the quadratic per-field edit distance is fine.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Absolute distance below which two records are always considered similar.
pub const MIN_DISTANCE_THRESHOLD: f64 = 5.0;

/// Share of the compared length below which two records are considered similar.
pub const RELATIVE_DISTANCE_THRESHOLD: f64 = 0.1;

/// Maximum number of suggestions returned for an unknown key.
pub const MAX_SUGGESTIONS: usize = 5;

/// Minimum shared prefix for a prefix-based suggestion.
pub const MIN_SUGGESTION_PREFIX: usize = 6;

/// Key distance below which a suggestion is scored by distance.
const SUGGESTION_DISTANCE_LIMIT: usize = 5;

/// Levenshtein distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    if b.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for j in 1..=b.len() {
            let cost = if ca == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// A candidate judged similar to an existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(usize, String, Record)", into = "(usize, String, Record)")]
pub struct Verdict {
    /// Summed edit distance over the shared fields.
    pub distance: usize,
    /// ID of the submitted record.
    pub candidate_id: String,
    /// The stored record it was matched against.
    pub existing: Record,
}

impl Verdict {
    /// Same key, different content.
    pub fn is_exact(&self) -> bool {
        self.candidate_id == self.existing.id()
    }
}

impl From<(usize, String, Record)> for Verdict {
    fn from((distance, candidate_id, existing): (usize, String, Record)) -> Self {
        Self {
            distance,
            candidate_id,
            existing,
        }
    }
}

impl From<Verdict> for (usize, String, Record) {
    fn from(verdict: Verdict) -> Self {
        (verdict.distance, verdict.candidate_id, verdict.existing)
    }
}

/// Distance and compared length between two records.
pub fn compare(candidate: &Record, existing: &Record) -> (usize, usize) {
    let mut distance = 0;
    let mut length = 0;

    for (name, value) in existing.fields() {
        if let Some(other) = candidate.get(name) {
            distance += levenshtein(value, other);
            length += value.chars().count().max(other.chars().count());
        }
    }

    (distance, length)
}

/// Judge one pair; `None` when the pair is not a duplicate.
pub fn classify_pair(candidate: &Record, existing: &Record) -> Option<Verdict> {
    let (distance, length) = compare(candidate, existing);
    let exact = candidate.id() == existing.id();

    let threshold = MIN_DISTANCE_THRESHOLD.max(length as f64 * RELATIVE_DISTANCE_THRESHOLD);
    let close = (distance as f64) < threshold;

    let duplicate = (exact && !candidate.same_field_names(existing))
        || ((close || exact) && distance > 0);

    duplicate.then(|| Verdict {
        distance,
        candidate_id: candidate.id().to_string(),
        existing: existing.clone(),
    })
}

/// All verdicts for a candidate against a record set, in record order.
pub fn classify<'a>(candidate: &Record, existing: impl IntoIterator<Item = &'a Record>) -> Vec<Verdict> {
    existing
        .into_iter()
        .filter_map(|e| classify_pair(candidate, e))
        .collect()
}

/// A record proposed for an unknown citation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, Record)", into = "(f64, Record)")]
pub struct Suggestion {
    /// Similarity in (0, 1].
    pub score: f64,
    pub record: Record,
}

impl From<(f64, Record)> for Suggestion {
    fn from((score, record): (f64, Record)) -> Self {
        Self { score, record }
    }
}

impl From<Suggestion> for (f64, Record) {
    fn from(s: Suggestion) -> Self {
        (s.score, s.record)
    }
}

/// Similarity of a stored ID to a requested key, or `None` if unrelated.
pub fn suggestion_score(existing_id: &str, key: &str) -> Option<f64> {
    let id = existing_id.to_lowercase();
    let key = key.to_lowercase();

    let distance = levenshtein(&id, &key);
    if id.contains(&key) || distance == 0 {
        return Some(1.0);
    }
    if distance < SUGGESTION_DISTANCE_LIMIT {
        return Some(1.0 - distance as f64 / 100.0);
    }

    let prefix = id
        .chars()
        .zip(key.chars())
        .take_while(|(a, b)| a == b)
        .count();
    if prefix >= MIN_SUGGESTION_PREFIX {
        let longest = id.chars().count().max(key.chars().count());
        return Some(prefix as f64 / longest as f64);
    }

    None
}

/// Best suggestions for a key, highest score first.
pub fn suggest<'a>(key: &str, records: impl IntoIterator<Item = &'a Record>) -> Vec<Suggestion> {
    let mut scored: Vec<Suggestion> = records
        .into_iter()
        .filter_map(|r| {
            suggestion_score(r.id(), key).map(|score| Suggestion {
                score,
                record: r.clone(),
            })
        })
        .collect();

    // Stable: equal scores keep store order.
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(MAX_SUGGESTIONS);
    scored
}
