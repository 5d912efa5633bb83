//! Engram store
//!
//! Durable CRUD over engrams with the invariants enforced at the write path.
//! Uses separate reader/writer connections for interior mutability: all
//! mutations funnel through the single writer (the engine's only
//! mutable-shared critical section), readers see consistent WAL snapshots.
//! All methods take `&self`, making the store `Send + Sync` so the engine can
//! hold it in an `Arc` without an outer lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

use crate::decay;
use crate::embeddings::quantize_i8;
use crate::engram::{Category, Engram, EngramDraft, SupersessionType};
use crate::error::{EngineError, Result};
use crate::search::sanitize_fts5_query;

/// Column list shared by every engram SELECT, in `row_to_engram` order
const ENGRAM_COLUMNS: &str = "id, content, category, importance, protected, access_count, \
     last_accessed_at, decay_rate, embedding_f32, embedding_i8, supersedes_id, \
     superseded_at, supersession_type, valid_from, valid_until, validity_source, \
     inserted_at, metadata";

// ============================================================================
// LISTING TYPES
// ============================================================================

/// Sort orders for `list`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Newest first (descending id)
    Recent,
    /// Highest importance first
    Importance,
    /// Closest to decay first (ascending importance approximation)
    DecayScore,
}

impl SortKey {
    /// Cursor tag for this sort order
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Recent => "recent",
            SortKey::Importance => "importance",
            SortKey::DecayScore => "decay_score",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "recent" => Some(SortKey::Recent),
            "importance" => Some(SortKey::Importance),
            "decay_score" => Some(SortKey::DecayScore),
            _ => None,
        }
    }
}

/// Parameters for `list`
#[derive(Debug, Clone)]
pub struct ListQuery {
    /// Sort order
    pub sort: SortKey,
    /// Page size; zero returns an empty page
    pub limit: usize,
    /// Opaque cursor from a previous page (preferred over offset)
    pub cursor: Option<String>,
    /// Legacy offset pagination
    pub offset: Option<usize>,
    /// Restrict to one category
    pub category: Option<Category>,
    /// Include superseded chain members
    pub include_superseded: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            sort: SortKey::Recent,
            limit: 20,
            cursor: None,
            offset: None,
            category: None,
            include_superseded: false,
        }
    }
}

/// One page of `list` results
#[derive(Debug)]
pub struct ListPage {
    /// Engrams in sort order
    pub engrams: Vec<Engram>,
    /// Total rows matching the filters (ignoring pagination)
    pub total: i64,
    /// Cursor for the next page, when `has_more`
    pub next_cursor: Option<String>,
    /// Whether more rows exist past this page
    pub has_more: bool,
}

/// Aggregate store statistics
#[derive(Debug, serde::Serialize)]
pub struct StoreStats {
    /// Total engrams including superseded
    pub total: i64,
    /// Count per category
    pub by_category: Vec<(String, i64)>,
    /// Mean importance across all engrams
    pub avg_importance: f64,
    /// Earliest insert
    pub oldest: Option<DateTime<Utc>>,
    /// Latest insert
    pub newest: Option<DateTime<Utc>>,
}

/// An engram at risk of decay, with its current score
#[derive(Debug, serde::Serialize)]
pub struct AtRiskEngram {
    /// The engram
    pub engram: Engram,
    /// Decay score at evaluation time
    pub score: f64,
    /// Days until the score crosses the threshold (0 = already below)
    pub predicted_days: Option<u32>,
}

/// Aggregated helpfulness row
#[derive(Debug, Clone)]
pub struct HelpfulnessRow {
    /// Engram the signals apply to
    pub engram_id: i64,
    /// Useful signals observed
    pub positive: i64,
    /// Noise signals observed
    pub negative: i64,
    /// Last time either counter moved
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// STORE
// ============================================================================

/// Durable engram catalog over SQLite
pub struct EngramStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl EngramStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        let writer_conn = Connection::open(path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| EngineError::Corruption("writer lock poisoned".to_string()))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| EngineError::Corruption("reader lock poisoned".to_string()))
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Insert a new engram, assigning id and server-side fields
    pub fn insert(&self, draft: &EngramDraft, now: DateTime<Utc>) -> Result<Engram> {
        validate_draft(draft)?;

        let decay_rate = decay::rate_for_importance(draft.importance);
        let writer = self.writer()?;
        writer
            .execute(
                "INSERT INTO engrams (content, category, importance, protected, decay_rate, \
                 valid_from, valid_until, validity_source, inserted_at, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    draft.content,
                    draft.category.as_str(),
                    draft.importance,
                    draft.protected,
                    decay_rate,
                    draft.valid_from,
                    draft.valid_until,
                    draft.validity_source,
                    now,
                    draft.metadata,
                ],
            )
            .map_err(map_busy)?;
        let id = writer.last_insert_rowid();

        Ok(Engram {
            id,
            content: draft.content.clone(),
            category: draft.category.clone(),
            importance: draft.importance,
            protected: draft.protected,
            access_count: 0,
            last_accessed_at: None,
            decay_rate,
            embedding_f32: None,
            embedding_i8: None,
            supersedes_id: None,
            superseded_at: None,
            supersession_type: None,
            valid_from: draft.valid_from,
            valid_until: draft.valid_until,
            validity_source: draft.validity_source.clone(),
            inserted_at: now,
            metadata: draft.metadata.clone(),
        })
    }

    /// Record retrieval hits: bump `access_count`, stamp `last_accessed_at`
    ///
    /// Missing ids are silently skipped.
    pub fn update_access(&self, ids: &[i64], now: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        let mut stmt = writer
            .prepare_cached(
                "UPDATE engrams SET access_count = access_count + 1, last_accessed_at = ?1 \
                 WHERE id = ?2",
            )
            .map_err(map_busy)?;
        for id in ids {
            stmt.execute(params![now, id]).map_err(map_busy)?;
        }
        Ok(())
    }

    /// Mark an engram superseded, failing if it already is
    pub fn mark_superseded(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        let changed = writer
            .execute(
                "UPDATE engrams SET superseded_at = ?1 WHERE id = ?2 AND superseded_at IS NULL",
                params![at, id],
            )
            .map_err(map_busy)?;
        if changed == 0 {
            let exists: bool = writer.query_row(
                "SELECT COUNT(*) > 0 FROM engrams WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if exists {
                return Err(EngineError::AlreadySuperseded(id));
            }
            return Err(EngineError::NoSuchEngram(id));
        }
        Ok(())
    }

    /// Link an engram to the predecessor it replaces
    ///
    /// The predecessor must already be marked superseded.
    pub fn set_supersedes(
        &self,
        id: i64,
        predecessor_id: i64,
        kind: SupersessionType,
    ) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(map_busy)?;

        let predecessor_superseded: Option<Option<DateTime<Utc>>> = tx
            .query_row(
                "SELECT superseded_at FROM engrams WHERE id = ?1",
                params![predecessor_id],
                |row| row.get(0),
            )
            .optional()?;
        match predecessor_superseded {
            None => return Err(EngineError::NoSuchEngram(predecessor_id)),
            Some(None) => {
                return Err(EngineError::InvalidField {
                    field: "predecessor_id",
                    reason: format!("engram {predecessor_id} is not marked superseded"),
                });
            }
            Some(Some(_)) => {}
        }

        let changed = tx
            .execute(
                "UPDATE engrams SET supersedes_id = ?1, supersession_type = ?2 WHERE id = ?3",
                params![predecessor_id, kind.as_str(), id],
            )
            .map_err(map_busy)?;
        if changed == 0 {
            return Err(EngineError::NoSuchEngram(id));
        }

        tx.execute(
            "INSERT INTO supersession_log (engram_id, successor_id, kind, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![predecessor_id, id, kind.as_str(), Utc::now()],
        )
        .map_err(map_busy)?;

        tx.commit().map_err(map_busy)?;
        Ok(())
    }

    /// Atomic supersession: mark old superseded and link new to it
    ///
    /// Runs in one transaction so readers never observe a half-applied chain.
    /// The cycle walk happens here under the writer so concurrent calls
    /// cannot race a loop into existence. Sets the predecessor's
    /// `superseded_at` to the successor's `inserted_at`, keeping the two
    /// within the invariant's one-second tolerance by construction.
    pub fn apply_supersession(
        &self,
        old_id: i64,
        new_id: i64,
        kind: SupersessionType,
    ) -> Result<()> {
        if old_id == new_id {
            return Err(EngineError::Cycle { old_id, new_id });
        }

        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(map_busy)?;

        let new_row: Option<(DateTime<Utc>, Option<i64>)> = tx
            .query_row(
                "SELECT inserted_at, supersedes_id FROM engrams WHERE id = ?1",
                params![new_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (new_inserted_at, new_predecessor) = match new_row {
            None => return Err(EngineError::NoSuchEngram(new_id)),
            Some(row) => row,
        };
        if new_predecessor.is_some() {
            return Err(EngineError::InvalidField {
                field: "new_id",
                reason: format!("engram {new_id} already supersedes another engram"),
            });
        }

        let old_superseded: Option<Option<DateTime<Utc>>> = tx
            .query_row(
                "SELECT superseded_at FROM engrams WHERE id = ?1",
                params![old_id],
                |row| row.get(0),
            )
            .optional()?;
        match old_superseded {
            None => return Err(EngineError::NoSuchEngram(old_id)),
            Some(Some(_)) => return Err(EngineError::AlreadySuperseded(old_id)),
            Some(None) => {}
        }

        // Cycle walk: if new_id is an ancestor of old_id via supersedes
        // links, adding new -> old would close a loop.
        let mut cursor = old_id;
        let mut hops = 0;
        loop {
            let predecessor: Option<i64> = tx
                .query_row(
                    "SELECT supersedes_id FROM engrams WHERE id = ?1",
                    params![cursor],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            match predecessor {
                Some(p) if p == new_id => {
                    return Err(EngineError::Cycle { old_id, new_id });
                }
                Some(p) => {
                    cursor = p;
                    hops += 1;
                    if hops > 10_000 {
                        return Err(EngineError::Corruption(format!(
                            "supersession chain through {old_id} exceeds 10000 links"
                        )));
                    }
                }
                None => break,
            }
        }

        tx.execute(
            "UPDATE engrams SET superseded_at = ?1 WHERE id = ?2",
            params![new_inserted_at, old_id],
        )
        .map_err(map_busy)?;
        tx.execute(
            "UPDATE engrams SET supersedes_id = ?1, supersession_type = ?2 WHERE id = ?3",
            params![old_id, kind.as_str(), new_id],
        )
        .map_err(map_busy)?;
        tx.execute(
            "INSERT INTO supersession_log (engram_id, successor_id, kind, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![old_id, new_id, kind.as_str(), Utc::now()],
        )
        .map_err(map_busy)?;

        tx.commit().map_err(map_busy)?;
        Ok(())
    }

    /// Delete an engram; protected engrams refuse
    pub fn delete(&self, id: i64) -> Result<()> {
        let writer = self.writer()?;
        let protected: Option<bool> = writer
            .query_row(
                "SELECT protected FROM engrams WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match protected {
            None => Err(EngineError::NoSuchEngram(id)),
            Some(true) => Err(EngineError::Protected(id)),
            Some(false) => {
                writer
                    .execute("DELETE FROM engrams WHERE id = ?1", params![id])
                    .map_err(map_busy)?;
                Ok(())
            }
        }
    }

    /// Store both embedding representations for an engram
    ///
    /// The i8 form is quantized here from the f32 form so the two can never
    /// diverge.
    pub fn set_embedding(&self, id: i64, vector: &[f32]) -> Result<()> {
        let quantized = quantize_i8(vector);
        let writer = self.writer()?;
        let changed = writer
            .execute(
                "UPDATE engrams SET embedding_f32 = ?1, embedding_i8 = ?2 WHERE id = ?3",
                params![f32s_to_bytes(vector), i8s_to_bytes(&quantized), id],
            )
            .map_err(map_busy)?;
        if changed == 0 {
            return Err(EngineError::NoSuchEngram(id));
        }
        Ok(())
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Fetch an engram by id
    pub fn get(&self, id: i64) -> Result<Engram> {
        self.try_get(id)?.ok_or(EngineError::NoSuchEngram(id))
    }

    /// Fetch an engram by id, `None` when missing
    pub fn try_get(&self, id: i64) -> Result<Option<Engram>> {
        let reader = self.reader()?;
        let engram = reader
            .query_row(
                &format!("SELECT {ENGRAM_COLUMNS} FROM engrams WHERE id = ?1"),
                params![id],
                row_to_engram,
            )
            .optional()?;
        Ok(engram)
    }

    /// Batch-fetch engrams by id, keyed for post-filter joins
    pub fn fetch_many(&self, ids: &[i64]) -> Result<HashMap<i64, Engram>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT {ENGRAM_COLUMNS} FROM engrams WHERE id IN ({})",
            placeholders.join(", ")
        );
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_engram)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(|e| (e.id, e)).collect())
    }

    /// Total engram count
    pub fn count(&self) -> Result<i64> {
        let reader = self.reader()?;
        Ok(reader.query_row("SELECT COUNT(*) FROM engrams", [], |row| row.get(0))?)
    }

    /// Active engrams in a category
    pub fn by_category(&self, category: &Category) -> Result<Vec<Engram>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {ENGRAM_COLUMNS} FROM engrams \
             WHERE category = ?1 AND superseded_at IS NULL ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![category.as_str()], row_to_engram)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Paginated listing with cursor or offset
    pub fn list(&self, query: &ListQuery) -> Result<ListPage> {
        let total = self.count_filtered(query)?;
        if query.limit == 0 {
            return Ok(ListPage {
                engrams: Vec::new(),
                total,
                next_cursor: None,
                has_more: false,
            });
        }

        let mut sql = format!("SELECT {ENGRAM_COLUMNS} FROM engrams WHERE 1=1");
        let mut owned: Vec<Box<dyn ToSql>> = Vec::new();

        if !query.include_superseded {
            sql.push_str(" AND superseded_at IS NULL");
        }
        if let Some(category) = &query.category {
            sql.push_str(" AND category = ?");
            owned.push(Box::new(category.as_str().to_string()));
        }

        if let Some(cursor) = &query.cursor {
            let decoded = Cursor::decode(cursor, query.sort)?;
            match query.sort {
                SortKey::Recent => {
                    sql.push_str(" AND id < ?");
                    owned.push(Box::new(decoded.id));
                }
                SortKey::Importance => {
                    sql.push_str(" AND (importance < ? OR (importance = ? AND id < ?))");
                    owned.push(Box::new(decoded.importance));
                    owned.push(Box::new(decoded.importance));
                    owned.push(Box::new(decoded.id));
                }
                SortKey::DecayScore => {
                    sql.push_str(" AND (importance > ? OR (importance = ? AND id > ?))");
                    owned.push(Box::new(decoded.importance));
                    owned.push(Box::new(decoded.importance));
                    owned.push(Box::new(decoded.id));
                }
            }
        }

        match query.sort {
            SortKey::Recent => sql.push_str(" ORDER BY id DESC"),
            SortKey::Importance => sql.push_str(" ORDER BY importance DESC, id DESC"),
            SortKey::DecayScore => sql.push_str(" ORDER BY importance ASC, id ASC"),
        }

        // limit + 1 to detect whether more rows exist
        sql.push_str(" LIMIT ?");
        owned.push(Box::new((query.limit + 1) as i64));
        if query.cursor.is_none() {
            if let Some(offset) = query.offset {
                sql.push_str(" OFFSET ?");
                owned.push(Box::new(offset as i64));
            }
        }

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = owned.iter().map(|b| b.as_ref()).collect();
        let mut engrams = stmt
            .query_map(param_refs.as_slice(), row_to_engram)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let has_more = engrams.len() > query.limit;
        engrams.truncate(query.limit);
        let next_cursor = if has_more {
            engrams.last().map(|last| {
                Cursor {
                    importance: last.importance,
                    id: last.id,
                }
                .encode(query.sort)
            })
        } else {
            None
        };

        Ok(ListPage {
            engrams,
            total,
            next_cursor,
            has_more,
        })
    }

    fn count_filtered(&self, query: &ListQuery) -> Result<i64> {
        let mut sql = "SELECT COUNT(*) FROM engrams WHERE 1=1".to_string();
        let mut owned: Vec<Box<dyn ToSql>> = Vec::new();
        if !query.include_superseded {
            sql.push_str(" AND superseded_at IS NULL");
        }
        if let Some(category) = &query.category {
            sql.push_str(" AND category = ?");
            owned.push(Box::new(category.as_str().to_string()));
        }
        let reader = self.reader()?;
        let param_refs: Vec<&dyn ToSql> = owned.iter().map(|b| b.as_ref()).collect();
        Ok(reader.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?)
    }

    /// Aggregate statistics
    pub fn stats(&self) -> Result<StoreStats> {
        let reader = self.reader()?;
        let total: i64 = reader.query_row("SELECT COUNT(*) FROM engrams", [], |row| row.get(0))?;
        let avg_importance: f64 = reader.query_row(
            "SELECT COALESCE(AVG(importance), 0.0) FROM engrams",
            [],
            |row| row.get(0),
        )?;
        let (oldest, newest): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = reader.query_row(
            "SELECT MIN(inserted_at), MAX(inserted_at) FROM engrams",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = reader.prepare(
            "SELECT category, COUNT(*) FROM engrams GROUP BY category ORDER BY COUNT(*) DESC",
        )?;
        let by_category = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;

        Ok(StoreStats {
            total,
            by_category,
            avg_importance,
            oldest,
            newest,
        })
    }

    /// FTS5 candidate ids for a lexical query, best rank first
    pub fn fts_candidates(&self, query: &str, limit: usize) -> Result<Vec<i64>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT rowid FROM engrams_fts WHERE engrams_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![sanitized, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
    }

    /// The engram that supersedes the given one, if any
    pub fn successor_of(&self, id: i64) -> Result<Option<i64>> {
        let reader = self.reader()?;
        let successor = reader
            .query_row(
                "SELECT id FROM engrams WHERE supersedes_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(successor)
    }

    /// Latest insert timestamp, the staleness watermark for the vector index
    pub fn max_inserted_at(&self) -> Result<Option<DateTime<Utc>>> {
        let reader = self.reader()?;
        Ok(reader.query_row("SELECT MAX(inserted_at) FROM engrams", [], |row| row.get(0))?)
    }

    // ========================================================================
    // EMBEDDING UPKEEP
    // ========================================================================

    /// Active engrams still waiting for an embedding
    ///
    /// Superseded engrams are excluded: re-embedding history is wasted work.
    pub fn missing_embeddings(&self, limit: usize) -> Result<Vec<(i64, String)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, content FROM engrams \
             WHERE superseded_at IS NULL AND embedding_f32 IS NULL \
             ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All active embeddings, for index rebuilds
    pub fn active_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, embedding_f32 FROM engrams \
             WHERE superseded_at IS NULL AND embedding_f32 IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, bytes_to_f32s(&blob)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // CONSOLIDATION QUERIES
    // ========================================================================

    /// Active engrams inserted within the recent window, oldest first
    pub fn recent_window(
        &self,
        category: Option<&Category>,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Engram>> {
        let cutoff = now - Duration::days(window_days);
        let reader = self.reader()?;
        let mut sql = format!(
            "SELECT {ENGRAM_COLUMNS} FROM engrams \
             WHERE superseded_at IS NULL AND inserted_at >= ?1"
        );
        let mut owned: Vec<Box<dyn ToSql>> = vec![Box::new(cutoff)];
        if let Some(category) = category {
            sql.push_str(" AND category = ?2");
            owned.push(Box::new(category.as_str().to_string()));
        }
        sql.push_str(" ORDER BY inserted_at ASC, id ASC");
        let mut stmt = reader.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = owned.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_engram)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Stale, short, unprotected entity anchors eligible for pruning
    pub fn stale_anchors(
        &self,
        stale_days: i64,
        min_length: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Engram>> {
        let cutoff = now - Duration::days(stale_days);
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {ENGRAM_COLUMNS} FROM engrams \
             WHERE category = 'entity_anchor' AND superseded_at IS NULL AND protected = 0 \
             AND COALESCE(last_accessed_at, inserted_at) < ?1 \
             AND LENGTH(content) < ?2"
        ))?;
        let rows = stmt
            .query_map(params![cutoff, min_length as i64], row_to_engram)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Active engrams scored against a decay threshold, most at-risk first
    pub fn at_risk(
        &self,
        threshold: f64,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<AtRiskEngram>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {ENGRAM_COLUMNS} FROM engrams \
             WHERE superseded_at IS NULL AND protected = 0"
        ))?;
        let engrams = stmt
            .query_map([], row_to_engram)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(reader);

        let mut at_risk: Vec<AtRiskEngram> = engrams
            .into_iter()
            .filter_map(|engram| {
                let score = decay::score_for(&engram, now);
                if score < threshold {
                    let predicted_days = decay::predict_forgetting_days(&engram, threshold, now);
                    Some(AtRiskEngram {
                        engram,
                        score,
                        predicted_days,
                    })
                } else {
                    None
                }
            })
            .collect();
        at_risk.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
        at_risk.truncate(limit);
        Ok(at_risk)
    }

    /// (predecessor, successor) pairs linked by a `merge` supersession
    pub fn merge_pairs(&self) -> Result<Vec<(i64, i64)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT supersedes_id, id FROM engrams \
             WHERE supersedes_id IS NOT NULL AND supersession_type = 'merge'",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // HELPFULNESS
    // ========================================================================

    /// Merge signed feedback deltas into the helpfulness table
    pub fn upsert_helpfulness(
        &self,
        deltas: &[(i64, i64, i64)],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        let mut stmt = writer
            .prepare_cached(
                "INSERT INTO helpfulness (engram_id, positive, negative, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(engram_id) DO UPDATE SET \
                 positive = positive + excluded.positive, \
                 negative = negative + excluded.negative, \
                 updated_at = excluded.updated_at",
            )
            .map_err(map_busy)?;
        for (engram_id, positive, negative) in deltas {
            stmt.execute(params![engram_id, positive, negative, now])
                .map_err(map_busy)?;
        }
        Ok(())
    }

    /// All aggregated helpfulness rows
    pub fn load_helpfulness(&self) -> Result<Vec<HelpfulnessRow>> {
        let reader = self.reader()?;
        let mut stmt = reader
            .prepare("SELECT engram_id, positive, negative, updated_at FROM helpfulness")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(HelpfulnessRow {
                    engram_id: row.get(0)?,
                    positive: row.get(1)?,
                    negative: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drop helpfulness rows with no evidence since the cutoff
    pub fn prune_helpfulness_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let writer = self.writer()?;
        let removed = writer
            .execute(
                "DELETE FROM helpfulness WHERE updated_at < ?1",
                params![cutoff],
            )
            .map_err(map_busy)?;
        Ok(removed)
    }
}

// ============================================================================
// CURSORS
// ============================================================================

/// Decoded pagination cursor: the sort value and id of the last row returned
struct Cursor {
    importance: f64,
    id: i64,
}

impl Cursor {
    fn encode(&self, sort: SortKey) -> String {
        match sort {
            SortKey::Recent => format!("recent:{}", self.id),
            SortKey::Importance => {
                format!("importance:{:016x}:{}", self.importance.to_bits(), self.id)
            }
            SortKey::DecayScore => {
                format!("decay_score:{:016x}:{}", self.importance.to_bits(), self.id)
            }
        }
    }

    fn decode(raw: &str, expected_sort: SortKey) -> Result<Self> {
        let invalid = || EngineError::InvalidField {
            field: "cursor",
            reason: format!("unrecognized cursor: {raw}"),
        };
        let mut parts = raw.split(':');
        let tag = parts.next().ok_or_else(invalid)?;
        if SortKey::parse_name(tag) != Some(expected_sort) {
            return Err(EngineError::InvalidField {
                field: "cursor",
                reason: format!("cursor was issued for sort `{tag}`"),
            });
        }
        match expected_sort {
            SortKey::Recent => {
                let id = parts
                    .next()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(invalid)?;
                Ok(Cursor {
                    importance: 0.0,
                    id,
                })
            }
            SortKey::Importance | SortKey::DecayScore => {
                let bits = parts
                    .next()
                    .and_then(|s| u64::from_str_radix(s, 16).ok())
                    .ok_or_else(invalid)?;
                let id = parts
                    .next()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(invalid)?;
                Ok(Cursor {
                    importance: f64::from_bits(bits),
                    id,
                })
            }
        }
    }
}

// ============================================================================
// ROW MAPPING & VALIDATION
// ============================================================================

fn validate_draft(draft: &EngramDraft) -> Result<()> {
    if draft.content.is_empty() {
        return Err(EngineError::InvalidField {
            field: "content",
            reason: "content must be non-empty".to_string(),
        });
    }
    if !draft.importance.is_finite() || !(0.0..=1.0).contains(&draft.importance) {
        return Err(EngineError::InvalidField {
            field: "importance",
            reason: format!("importance must be in [0, 1], got {}", draft.importance),
        });
    }
    if let (Some(from), Some(until)) = (draft.valid_from, draft.valid_until) {
        if from > until {
            return Err(EngineError::InvalidField {
                field: "valid_from",
                reason: "valid_from must not be after valid_until".to_string(),
            });
        }
    }
    Ok(())
}

fn row_to_engram(row: &Row<'_>) -> rusqlite::Result<Engram> {
    let category: String = row.get(2)?;
    let embedding_f32: Option<Vec<u8>> = row.get(8)?;
    let embedding_i8: Option<Vec<u8>> = row.get(9)?;
    let supersession_type: Option<String> = row.get(12)?;

    Ok(Engram {
        id: row.get(0)?,
        content: row.get(1)?,
        category: Category::parse_name(&category),
        importance: row.get(3)?,
        protected: row.get(4)?,
        access_count: row.get(5)?,
        last_accessed_at: row.get(6)?,
        decay_rate: row.get(7)?,
        embedding_f32: embedding_f32.as_deref().map(bytes_to_f32s),
        embedding_i8: embedding_i8.as_deref().map(bytes_to_i8s),
        supersedes_id: row.get(10)?,
        superseded_at: row.get(11)?,
        supersession_type: supersession_type
            .as_deref()
            .and_then(SupersessionType::parse_name),
        valid_from: row.get(13)?,
        valid_until: row.get(14)?,
        validity_source: row.get(15)?,
        inserted_at: row.get(16)?,
        metadata: row.get(17)?,
    })
}

fn map_busy(e: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if matches!(
            err.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return EngineError::WriteTimeout;
        }
    }
    EngineError::StorageIo(e)
}

/// Encode an f32 slice as little-endian bytes for BLOB storage
pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian BLOB back to f32s
pub fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn i8s_to_bytes(values: &[i8]) -> Vec<u8> {
    values.iter().map(|v| *v as u8).collect()
}

fn bytes_to_i8s(bytes: &[u8]) -> Vec<i8> {
    bytes.iter().map(|b| *b as i8).collect()
}

// ============================================================================
// TESTS
// ============================================================================
