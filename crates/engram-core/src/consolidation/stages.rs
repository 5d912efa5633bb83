//! Sleep cycle stages
//!
//! Stage implementations in execution order. Every stage takes the cycle
//! start time and the running report; errors bubble to the coordinator,
//! which records them and moves on.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::consolidation::dedup::{self, DedupConfig};
use crate::consolidation::sleep::{SleepCycle, SleepCycleReport};
use crate::decay;
use crate::engram::{Category, Engram, EngramDraft, SupersessionType};
use crate::error::{EngineError, Result};
use crate::search::{is_topical, token_set, tokenize};

/// Tokens an action key is built from
const ACTION_KEY_TOKENS: usize = 4;

impl SleepCycle {
    // ========================================================================
    // STAGE 1: INDEX HEALTH
    // ========================================================================

    /// Backfill missing embeddings, then rebuild the index if it lags
    pub(super) fn stage_index_health(
        &self,
        now: DateTime<Utc>,
        report: &mut SleepCycleReport,
    ) -> Result<()> {
        if let Some(embedder) = &self.embedder {
            let missing = self
                .store
                .missing_embeddings(self.config.embed_backfill_cap_per_cycle)?;
            for (id, content) in missing {
                match embedder.embed(&content) {
                    Ok(vector) => {
                        self.store.set_embedding(id, &vector)?;
                        self.index_write()?.insert(id, &vector)?;
                        report.embeddings_backfilled += 1;
                    }
                    Err(e) => {
                        // Embedder down: the rest of the backlog waits
                        tracing::warn!(engram_id = id, error = %e, "embedding backfill failed");
                        break;
                    }
                }
            }
        }

        let newest = self.store.max_inserted_at()?;
        let outcome =
            self.index_write()?
                .rebuild_if_needed(newest, now, || self.store.active_embeddings())?;
        if let crate::search::RebuildOutcome::Rebuilt { count } = outcome {
            report.index_rebuilt = true;
            tracing::info!(count, "vector index rebuilt");
        }

        // Persist best-effort; the index is reconstructable from the store
        let index = self.index_read()?;
        if !index.is_empty() {
            if let Err(e) = index.save(&self.index_path) {
                tracing::warn!(error = %e, "vector index save failed");
            }
        }
        Ok(())
    }

    // ========================================================================
    // STAGE 2: QUALITY MAINTENANCE
    // ========================================================================

    /// Prune stale entity anchors and collapse duplicate syntheses
    pub(super) fn stage_quality(
        &self,
        now: DateTime<Utc>,
        report: &mut SleepCycleReport,
    ) -> Result<()> {
        let stale = self.store.stale_anchors(
            self.config.stale_anchor_days,
            self.config.min_entity_anchor_length,
            now,
        )?;
        for anchor in stale {
            match self.store.delete(anchor.id) {
                Ok(()) => {
                    let _ = self.index_write()?.remove(anchor.id);
                    report.quality_issues_fixed += 1;
                    tracing::debug!(engram_id = anchor.id, "stale entity anchor pruned");
                }
                Err(EngineError::Protected(_)) | Err(EngineError::NoSuchEngram(_)) => {}
                Err(e) => return Err(e),
            }
        }

        // Duplicate syntheses: identical token sets collapse into the newest
        let syntheses = self.store.by_category(&Category::Synthesis)?;
        let mut groups: BTreeMap<String, Vec<&Engram>> = BTreeMap::new();
        for synthesis in &syntheses {
            let mut tokens: Vec<String> = token_set(&synthesis.content).into_iter().collect();
            tokens.sort();
            groups.entry(tokens.join(" ")).or_default().push(synthesis);
        }
        for (_, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            members.sort_by_key(|e| (e.inserted_at, e.id));
            let keeper = members.last().expect("group has members").id;
            for duplicate in &members[..members.len() - 1] {
                match self
                    .chains
                    .supersede(duplicate.id, keeper, SupersessionType::Merge)
                {
                    Ok(()) => {
                        let _ = self.index_write()?.remove(duplicate.id);
                        report.quality_issues_fixed += 1;
                    }
                    Err(EngineError::AlreadySuperseded(_))
                    | Err(EngineError::Cycle { .. })
                    | Err(EngineError::Protected(_))
                    | Err(EngineError::InvalidField { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // STAGE 3: PATTERN EXTRACTION
    // ========================================================================

    /// Group recent observations by topic and emit entity anchors
    pub(super) fn stage_patterns(
        &self,
        now: DateTime<Utc>,
        report: &mut SleepCycleReport,
    ) -> Result<()> {
        let observations = self.store.recent_window(
            Some(&Category::Observation),
            self.config.recent_window_days,
            now,
        )?;
        if observations.len() < self.config.min_memories_for_pattern {
            return Ok(());
        }

        let token_sets: Vec<HashSet<String>> = observations
            .iter()
            .map(|o| {
                token_set(&o.content)
                    .into_iter()
                    .filter(|t| is_topical(t))
                    .collect()
            })
            .collect();

        // Topic keys ordered by reach, then alphabetically for determinism
        let mut by_token: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, tokens) in token_sets.iter().enumerate() {
            for token in tokens {
                by_token.entry(token.clone()).or_default().push(i);
            }
        }
        let mut topics: Vec<(String, usize)> = by_token
            .iter()
            .map(|(token, members)| (token.clone(), members.len()))
            .collect();
        topics.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let existing_anchors = self.store.by_category(&Category::EntityAnchor)?;
        let mut consumed: HashSet<usize> = HashSet::new();

        for (token, _) in topics {
            let members: Vec<usize> = by_token[&token]
                .iter()
                .copied()
                .filter(|i| !consumed.contains(i))
                .collect();
            if members.len() < self.config.min_memories_for_pattern {
                continue;
            }

            // Shared vocabulary across the whole group
            let mut shared = token_sets[members[0]].clone();
            for &i in &members[1..] {
                shared.retain(|t| token_sets[i].contains(t));
            }
            if shared.is_empty() {
                continue;
            }
            // Phrase follows token order of the first member's content
            let phrase: Vec<String> = tokenize(&observations[members[0]].content)
                .into_iter()
                .filter(|t| shared.contains(t))
                .collect::<Vec<_>>()
                .into_iter()
                .fold(Vec::new(), |mut acc, t| {
                    if !acc.contains(&t) {
                        acc.push(t);
                    }
                    acc
                });
            let phrase = phrase.join(" ");

            // Substring existence check against current anchors
            if existing_anchors.iter().any(|a| a.content.contains(&phrase)) {
                consumed.extend(&members);
                continue;
            }

            let member_ids: Vec<i64> = members.iter().map(|&i| observations[i].id).collect();
            let draft = EngramDraft::new(format!(
                "Recurring topic across {} observations: {}",
                members.len(),
                phrase
            ))
            .category(Category::EntityAnchor)
            .importance(0.6)
            .metadata(serde_json::json!({
                "source": "sleep_cycle",
                "topic": phrase,
                "pattern_members": member_ids,
            }));

            let anchor = self.store.insert(&draft, Utc::now())?;
            self.embed_and_index(anchor.id, &anchor.content);
            for entity in &shared {
                self.graph.link_entity(entity, anchor.id);
            }
            consumed.extend(&members);
            report.patterns_extracted += 1;
            tracing::info!(anchor_id = anchor.id, topic = %phrase, "pattern extracted");
        }
        Ok(())
    }

    // ========================================================================
    // STAGE 4: PROCEDURE CODIFICATION
    // ========================================================================

    /// Detect repeated action sequences and emit workflow summaries
    pub(super) fn stage_procedures(
        &self,
        now: DateTime<Utc>,
        report: &mut SleepCycleReport,
    ) -> Result<()> {
        let actions = self.store.recent_window(
            Some(&Category::Action),
            self.config.recent_window_days,
            now,
        )?;
        if actions.len() < 2 {
            return Ok(());
        }

        let keys: Vec<String> = actions.iter().map(|a| action_key(&a.content)).collect();
        let mut pair_counts: BTreeMap<(String, String), usize> = BTreeMap::new();
        for window in keys.windows(2) {
            if window[0] != window[1] {
                *pair_counts
                    .entry((window[0].clone(), window[1].clone()))
                    .or_default() += 1;
            }
        }

        let syntheses = self.store.by_category(&Category::Synthesis)?;
        for ((first, second), count) in pair_counts {
            if count < 2 {
                continue;
            }
            let name = format!("{first}, then {second}");
            // Dedup by name via substring existence
            if syntheses.iter().any(|s| s.content.contains(&name)) {
                continue;
            }

            let draft = EngramDraft::new(format!("Workflow: {name}"))
                .category(Category::Synthesis)
                .importance(0.6)
                .metadata(serde_json::json!({
                    "source": "sleep_cycle",
                    "kind": "procedure",
                    "occurrences": count,
                }));
            let summary = self.store.insert(&draft, Utc::now())?;
            self.embed_and_index(summary.id, &summary.content);
            report.procedures_created += 1;
            tracing::info!(synthesis_id = summary.id, workflow = %name, "procedure codified");
        }
        Ok(())
    }

    // ========================================================================
    // STAGE 5: EDGE PREDICTION
    // ========================================================================

    /// Materialize knowledge-graph edges for highly similar recent pairs
    pub(super) fn stage_edges(
        &self,
        now: DateTime<Utc>,
        report: &mut SleepCycleReport,
    ) -> Result<()> {
        let recent = self
            .store
            .recent_window(None, self.config.recent_window_days, now)?;
        let embedded: Vec<&Engram> = recent
            .iter()
            .filter(|e| e.embedding_f32.is_some())
            .collect();

        let cap = self.config.edge_prediction_cap_per_cycle;
        'outer: for i in 0..embedded.len() {
            for j in (i + 1)..embedded.len() {
                if report.edges_predicted >= cap {
                    break 'outer;
                }
                let (a, b) = (embedded[i], embedded[j]);
                let similarity = crate::embeddings::cosine_similarity(
                    a.embedding_f32.as_ref().expect("filtered for embeddings"),
                    b.embedding_f32.as_ref().expect("filtered for embeddings"),
                );
                if similarity >= self.config.edge_prediction_similarity {
                    self.graph.add_edge(a.id, b.id, f64::from(similarity));
                    report.edges_predicted += 1;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // STAGE 6: PRUNING
    // ========================================================================

    /// Merge near-duplicates, then delete decayed unprotected engrams
    pub(super) fn stage_pruning(
        &self,
        now: DateTime<Utc>,
        report: &mut SleepCycleReport,
    ) -> Result<()> {
        let recent = self
            .store
            .recent_window(None, self.config.recent_window_days, now)?;
        let candidates = dedup::find_candidates(
            &recent,
            DedupConfig {
                jaccard_threshold: self.config.dedup_jaccard_threshold,
                cosine_threshold: self.config.dedup_cosine_threshold,
            },
        );
        for candidate in candidates {
            match self.chains.supersede(
                candidate.older_id,
                candidate.younger_id,
                SupersessionType::Merge,
            ) {
                Ok(()) => {
                    let _ = self.index_write()?.remove(candidate.older_id);
                    report.duplicates_merged += 1;
                    tracing::debug!(
                        older = candidate.older_id,
                        younger = candidate.younger_id,
                        jaccard = candidate.jaccard,
                        cosine = candidate.cosine,
                        "near-duplicates merged"
                    );
                }
                Err(EngineError::AlreadySuperseded(_))
                | Err(EngineError::Cycle { .. })
                | Err(EngineError::InvalidField { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        // Decay pruning: unprotected, below threshold, not part of a chain
        let at_risk = self
            .store
            .at_risk(self.config.prune_decay_threshold, usize::MAX, now)?;
        for risk in at_risk {
            let engram = &risk.engram;
            if engram.supersedes_id.is_some() {
                continue; // chain tails stay; deleting one would orphan its history
            }
            debug_assert!(decay::is_at_risk(engram, self.config.prune_decay_threshold, now));
            match self.store.delete(engram.id) {
                Ok(()) => {
                    let _ = self.index_write()?.remove(engram.id);
                    report.memories_pruned += 1;
                    tracing::info!(
                        engram_id = engram.id,
                        score = risk.score,
                        "decayed engram pruned"
                    );
                }
                Err(EngineError::Protected(_)) | Err(EngineError::NoSuchEngram(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ========================================================================
    // STAGE 7: FEEDBACK CLEANUP
    // ========================================================================

    /// Drop helpfulness factors whose evidence has gone stale
    pub(super) fn stage_feedback_cleanup(
        &self,
        now: DateTime<Utc>,
        report: &mut SleepCycleReport,
    ) -> Result<()> {
        report.helpfulness_pruned = self
            .feedback
            .prune_stale(self.config.helpfulness_ttl_days, now)?;
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn index_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, crate::search::VectorIndex>> {
        self.index
            .read()
            .map_err(|_| EngineError::Corruption("vector index lock poisoned".to_string()))
    }

    fn index_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, crate::search::VectorIndex>> {
        self.index
            .write()
            .map_err(|_| EngineError::Corruption("vector index lock poisoned".to_string()))
    }

    /// Embed and index a consolidation product; best effort
    fn embed_and_index(&self, id: i64, content: &str) {
        let Some(embedder) = &self.embedder else {
            return;
        };
        match embedder.embed(content) {
            Ok(vector) => {
                if let Err(e) = self
                    .store
                    .set_embedding(id, &vector)
                    .and_then(|_| Ok(self.index_write()?.insert(id, &vector)?))
                {
                    tracing::warn!(engram_id = id, error = %e, "indexing consolidation product failed");
                }
            }
            Err(e) => {
                tracing::warn!(engram_id = id, error = %e, "embedding consolidation product failed");
            }
        }
    }
}

/// Normalized key identifying an action for sequence detection
fn action_key(content: &str) -> String {
    tokenize(content)
        .into_iter()
        .filter(|t| is_topical(t))
        .take(ACTION_KEY_TOKENS)
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// TESTS
// ============================================================================
