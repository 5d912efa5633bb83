//! Near-duplicate detection
//!
//! Candidate pairs come from the recent window and must clear two bars at
//! once: token-set Jaccard overlap and embedding cosine similarity. Passing
//! pairs become merge supersessions with the younger engram absorbing the
//! older. Protected predecessors are skipped; consolidation never supersedes
//! a protected engram.

use crate::embeddings::cosine_similarity;
use crate::engram::Engram;
use crate::search::{jaccard, token_set};

/// Thresholds for near-duplicate detection
#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Token-set Jaccard floor
    pub jaccard_threshold: f64,
    /// Embedding cosine floor
    pub cosine_threshold: f32,
}

/// A pair of engrams judged near-duplicates
#[derive(Debug, Clone)]
pub struct ConsolidationCandidate {
    /// Earlier engram, to be superseded
    pub older_id: i64,
    /// Later engram, which absorbs the older one
    pub younger_id: i64,
    /// Token overlap that qualified the pair
    pub jaccard: f64,
    /// Embedding similarity that qualified the pair
    pub cosine: f32,
}

/// Find merge candidates among the given engrams
///
/// Pairs must share a category, both be active, and clear both thresholds.
/// Each engram appears in at most one candidate per pass, so a single cycle
/// never chains an engram through two merges.
pub fn find_candidates(engrams: &[Engram], config: DedupConfig) -> Vec<ConsolidationCandidate> {
    let token_sets: Vec<_> = engrams.iter().map(|e| token_set(&e.content)).collect();
    let mut claimed = vec![false; engrams.len()];
    let mut candidates = Vec::new();

    for i in 0..engrams.len() {
        if claimed[i] {
            continue;
        }
        for j in (i + 1)..engrams.len() {
            if claimed[j] {
                continue;
            }
            let (a, b) = (&engrams[i], &engrams[j]);
            if !a.is_active() || !b.is_active() || a.category != b.category {
                continue;
            }

            // Older member is the one that gets superseded
            let (older, younger) = if a.inserted_at <= b.inserted_at {
                (a, b)
            } else {
                (b, a)
            };
            if older.protected {
                continue;
            }

            let overlap = jaccard(&token_sets[i], &token_sets[j]);
            if overlap < config.jaccard_threshold {
                continue;
            }
            let cosine = match (&a.embedding_f32, &b.embedding_f32) {
                (Some(va), Some(vb)) => cosine_similarity(va, vb),
                // Without both embeddings the similarity bar cannot be met
                _ => continue,
            };
            if cosine < config.cosine_threshold {
                continue;
            }

            candidates.push(ConsolidationCandidate {
                older_id: older.id,
                younger_id: younger.id,
                jaccard: overlap,
                cosine,
            });
            claimed[i] = true;
            claimed[j] = true;
            break;
        }
    }

    candidates
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engram::Category;
    use chrono::{Duration, Utc};

    fn engram(id: i64, content: &str, minutes_ago: i64) -> Engram {
        let mut v: Vec<f32> = vec![0.0; 8];
        // Deterministic embedding keyed off shared leading token
        for (i, token) in crate::search::tokenize(content).into_iter().enumerate() {
            v[(token.len() + i) % 8] += 1.0;
        }
        let quantized = crate::embeddings::quantize_i8(&v);
        Engram {
            id,
            content: content.to_string(),
            category: Category::Observation,
            importance: 0.5,
            protected: false,
            access_count: 0,
            last_accessed_at: None,
            decay_rate: 0.005,
            embedding_f32: Some(v),
            embedding_i8: Some(quantized),
            supersedes_id: None,
            superseded_at: None,
            supersession_type: None,
            valid_from: None,
            valid_until: None,
            validity_source: None,
            inserted_at: Utc::now() - Duration::minutes(minutes_ago),
            metadata: None,
        }
    }

    fn config() -> DedupConfig {
        DedupConfig {
            jaccard_threshold: 0.8,
            cosine_threshold: 0.9,
        }
    }

    #[test]
    fn test_identical_content_pairs() {
        let engrams = vec![
            engram(1, "timeout in connection pool", 10),
            engram(2, "timeout in connection pool", 5),
            engram(3, "unrelated deployment note today", 1),
        ];
        let candidates = find_candidates(&engrams, config());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].older_id, 1);
        assert_eq!(candidates[0].younger_id, 2);
        assert_eq!(candidates[0].jaccard, 1.0);
        assert!(candidates[0].cosine > 0.99);
    }

    #[test]
    fn test_each_engram_claimed_once() {
        let engrams = vec![
            engram(1, "timeout in connection pool", 30),
            engram(2, "timeout in connection pool", 20),
            engram(3, "timeout in connection pool", 10),
        ];
        let candidates = find_candidates(&engrams, config());
        // One pair only; the third copy waits for the next cycle
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_different_categories_never_merge() {
        let mut a = engram(1, "quarterly revenue numbers", 10);
        let mut b = engram(2, "quarterly revenue numbers", 5);
        a.category = Category::Fact;
        b.category = Category::Observation;
        assert!(find_candidates(&[a, b], config()).is_empty());
    }

    #[test]
    fn test_protected_older_is_skipped() {
        let mut older = engram(1, "keep this exact phrasing", 10);
        older.protected = true;
        let younger = engram(2, "keep this exact phrasing", 5);
        assert!(find_candidates(&[older, younger], config()).is_empty());
    }

    #[test]
    fn test_missing_embeddings_disqualify() {
        let mut a = engram(1, "identical text body here", 10);
        let b = engram(2, "identical text body here", 5);
        a.embedding_f32 = None;
        a.embedding_i8 = None;
        assert!(find_candidates(&[a, b], config()).is_empty());
    }

    #[test]
    fn test_low_overlap_disqualifies() {
        let engrams = vec![
            engram(1, "timeout in connection pool", 10),
            engram(2, "latency spike in api gateway", 5),
        ];
        assert!(find_candidates(&engrams, config()).is_empty());
    }
}
