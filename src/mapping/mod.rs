//! Account-label normalization
//!
//! Maps a raw account label as it appears in the CSV to the canonical
//! account code used as a workbook column header. Resolution order, first
//! hit wins: durable per-dataset override, static alias table, fuzzy
//! similarity above a configured threshold. Every outcome carries the
//! method used and a confidence score, so the run report can say exactly
//! why a label mapped (or did not).

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::config::EngineConfig;

/// How a raw label was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapMethod {
    Override,
    Alias,
    Fuzzy,
    Unmapped,
}

/// Resolution result for one distinct raw label.
#[derive(Debug, Clone, Serialize)]
pub struct AccountMapping {
    pub raw_label: String,
    pub canonical_code: Option<String>,
    pub method: MapMethod,
    pub confidence: f64,
}

/// Swappable similarity measure over two normalized labels, in [0, 1].
pub type Similarity = fn(&str, &str) -> f64;

/// Normalize a label for exact matching: trim, lower-case, collapse inner
/// whitespace, unify "401 k" -> "401k".
pub fn normalize_label(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.to_lowercase().replace("401 k", "401k")
}

/// Further strip punctuation for fuzzy comparison, keeping alphanumerics
/// and single spaces.
fn fuzzy_key(raw: &str) -> String {
    let lowered = normalize_label(raw);
    let stripped: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sørensen–Dice coefficient over character bigrams.
///
/// Token-order tolerant ("roth 401k" scores high against "401k roth"),
/// which edit distance is not.
pub fn dice_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let bigrams = |s: &str| -> BTreeMap<(char, char), usize> {
        let chars: Vec<char> = s.chars().collect();
        let mut counts = BTreeMap::new();
        for pair in chars.windows(2) {
            *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
        }
        counts
    };

    let (ga, gb) = (bigrams(a), bigrams(b));
    let total = ga.values().sum::<usize>() + gb.values().sum::<usize>();
    if total == 0 {
        // Both shorter than one bigram; equality was already handled.
        return 0.0;
    }
    let overlap: usize = ga
        .iter()
        .map(|(bg, count)| count.min(gb.get(bg).unwrap_or(&0)))
        .sum();
    (2 * overlap) as f64 / total as f64
}

pub struct AccountNormalizer {
    /// Durable overrides, keyed by normalized label.
    overrides: BTreeMap<String, String>,
    /// Alias table plus identity entries for the canonical codes
    /// themselves, keyed by normalized label.
    exact: BTreeMap<String, String>,
    /// Fuzzy candidates: (fuzzy key, canonical code), deduplicated.
    candidates: Vec<(String, String)>,
    threshold: f64,
    similarity: Similarity,
}

impl AccountNormalizer {
    /// Build a normalizer from the configured alias table and the
    /// override entries loaded for this run's dataset.
    pub fn new(config: &EngineConfig, overrides: BTreeMap<String, String>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(label, code)| (normalize_label(&label), code))
            .collect();

        let mut exact: BTreeMap<String, String> = BTreeMap::new();
        for (alias, code) in &config.aliases {
            exact.insert(normalize_label(alias), code.clone());
            // A label that already equals a canonical code must not
            // depend on the fuzzy threshold.
            exact.insert(normalize_label(code), code.clone());
        }

        let mut candidates: BTreeMap<String, String> = BTreeMap::new();
        for (alias, code) in &config.aliases {
            candidates.insert(fuzzy_key(alias), code.clone());
            candidates.insert(fuzzy_key(code), code.clone());
        }

        Self {
            overrides,
            exact,
            candidates: candidates.into_iter().collect(),
            threshold: config.fuzzy_threshold,
            similarity: dice_similarity,
        }
    }

    /// Replace the similarity measure (tests, experiments).
    pub fn with_similarity(mut self, similarity: Similarity) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn normalize(&self, raw_label: &str) -> AccountMapping {
        let norm = normalize_label(raw_label);

        if let Some(code) = self.overrides.get(&norm) {
            return AccountMapping {
                raw_label: raw_label.to_string(),
                canonical_code: Some(code.clone()),
                method: MapMethod::Override,
                confidence: 1.0,
            };
        }

        if let Some(code) = self.exact.get(&norm) {
            return AccountMapping {
                raw_label: raw_label.to_string(),
                canonical_code: Some(code.clone()),
                method: MapMethod::Alias,
                confidence: 1.0,
            };
        }

        let key = fuzzy_key(raw_label);
        let mut best: Option<(f64, &str)> = None;
        for (candidate_key, code) in &self.candidates {
            let score = (self.similarity)(&key, candidate_key);
            let better = match best {
                Some((best_score, _)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((score, code));
            }
        }

        if let Some((score, code)) = best {
            if score > self.threshold {
                debug!(
                    "Fuzzy-matched account {:?} -> {:?} (score {:.3})",
                    raw_label, code, score
                );
                return AccountMapping {
                    raw_label: raw_label.to_string(),
                    canonical_code: Some(code.to_string()),
                    method: MapMethod::Fuzzy,
                    confidence: score,
                };
            }
            debug!(
                "Best fuzzy candidate for {:?} scored {:.3}, below threshold {:.2}",
                raw_label, score, self.threshold
            );
        }

        AccountMapping {
            raw_label: raw_label.to_string(),
            canonical_code: None,
            method: MapMethod::Unmapped,
            confidence: 0.0,
        }
    }
}
