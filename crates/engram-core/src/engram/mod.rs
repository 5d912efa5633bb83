//! Engram - The fundamental unit of memory
//!
//! Each engram carries:
//! - Content and opaque metadata
//! - Importance-derived decay parameters
//! - Temporal validity (valid-time window)
//! - Supersession links forming replacement chains
//! - Dual embedding representations (f32 + i8)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CATEGORIES
// ============================================================================

/// Categories of engrams
///
/// The six built-in categories drive consolidation behavior; anything else is
/// carried through as a user-defined string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Category {
    /// A discrete fact
    Fact,
    /// An observed event or signal
    Observation,
    /// A performed action
    Action,
    /// A plan or intention
    Plan,
    /// A consolidated anchor for a recurring entity or topic
    EntityAnchor,
    /// A synthesized summary produced from other engrams
    Synthesis,
    /// User-defined category
    Custom(String),
}

impl Category {
    /// String representation, matching the persisted form
    pub fn as_str(&self) -> &str {
        match self {
            Category::Fact => "fact",
            Category::Observation => "observation",
            Category::Action => "action",
            Category::Plan => "plan",
            Category::EntityAnchor => "entity_anchor",
            Category::Synthesis => "synthesis",
            Category::Custom(s) => s.as_str(),
        }
    }

    /// Parse from string name; unknown names become [`Category::Custom`]
    pub fn parse_name(s: &str) -> Self {
        match s {
            "fact" => Category::Fact,
            "observation" => Category::Observation,
            "action" => Category::Action,
            "plan" => Category::Plan,
            "entity_anchor" => Category::EntityAnchor,
            "synthesis" => Category::Synthesis,
            other => Category::Custom(other.to_string()),
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Fact
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Category {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Category::parse_name(&s))
    }
}

// ============================================================================
// SUPERSESSION
// ============================================================================

/// Why a successor replaced its predecessor
///
/// Labels are advisory; `Merge` signals that the successor is expected to
/// subsume the predecessor, which audits may verify but writes do not enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupersessionType {
    /// The fact changed
    Update,
    /// The predecessor was wrong
    Correction,
    /// Same fact, better wording
    Refinement,
    /// Successor absorbs the predecessor (consolidation)
    Merge,
}

impl SupersessionType {
    /// SQL-compatible string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SupersessionType::Update => "update",
            SupersessionType::Correction => "correction",
            SupersessionType::Refinement => "refinement",
            SupersessionType::Merge => "merge",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "update" => Some(SupersessionType::Update),
            "correction" => Some(SupersessionType::Correction),
            "refinement" => Some(SupersessionType::Refinement),
            "merge" => Some(SupersessionType::Merge),
            _ => None,
        }
    }
}

impl std::fmt::Display for SupersessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENGRAM
// ============================================================================

/// A memory unit in the store
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engram {
    /// Stable monotonic integer key, assigned by the store
    pub id: i64,
    /// UTF-8 text content
    pub content: String,
    /// Category driving retrieval filters and consolidation
    pub category: Category,
    /// Importance in [0, 1]; higher is more protected from decay
    pub importance: f64,
    /// Protected engrams are never decayed or pruned
    pub protected: bool,
    /// Number of retrieval hits
    pub access_count: i64,
    /// Last retrieval hit, if any
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Decay rate derived from importance
    pub decay_rate: f64,
    /// Dense embedding (ranking source of truth)
    #[serde(skip)]
    pub embedding_f32: Option<Vec<f32>>,
    /// Int8-quantized form of the same vector
    #[serde(skip)]
    pub embedding_i8: Option<Vec<i8>>,
    /// Predecessor this engram replaces
    pub supersedes_id: Option<i64>,
    /// When this engram was itself superseded; null while current
    pub superseded_at: Option<DateTime<Utc>>,
    /// Present iff `supersedes_id` is set
    pub supersession_type: Option<SupersessionType>,
    /// Fact not true before this instant
    pub valid_from: Option<DateTime<Utc>>,
    /// Fact not true from this instant onward
    pub valid_until: Option<DateTime<Utc>>,
    /// Where the validity window was inferred from
    pub validity_source: Option<String>,
    /// Creation timestamp
    pub inserted_at: DateTime<Utc>,
    /// Opaque JSON metadata; the engine round-trips but never interprets it
    pub metadata: Option<serde_json::Value>,
}

impl Engram {
    /// Whether this engram is the current member of its chain
    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// Whether the valid-time window admits the given instant
    ///
    /// The window is half-open: `valid_from <= t < valid_until`.
    pub fn is_valid_at(&self, t: DateTime<Utc>) -> bool {
        let after_start = self.valid_from.map(|from| t >= from).unwrap_or(true);
        let before_end = self.valid_until.map(|until| t < until).unwrap_or(true);
        after_start && before_end
    }

    /// Age in fractional days at the given instant
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.inserted_at).num_seconds().max(0) as f64;
        secs / 86_400.0
    }

    /// Whether both embedding representations are present
    pub fn has_embedding(&self) -> bool {
        self.embedding_f32.is_some() && self.embedding_i8.is_some()
    }
}

// ============================================================================
// DRAFTS
// ============================================================================

/// Input for creating a new engram
///
/// Server-assigned fields (`id`, `inserted_at`, `decay_rate`, access stats,
/// supersession links) are absent; the store fills them in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngramDraft {
    /// Text content, must be non-empty
    pub content: String,
    /// Category, defaults to `fact`
    #[serde(default)]
    pub category: Category,
    /// Importance in [0, 1]
    pub importance: f64,
    /// Exempt from decay and pruning
    #[serde(default)]
    pub protected: bool,
    /// Start of the valid-time window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the valid-time window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    /// Provenance of the validity window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validity_source: Option<String>,
    /// Opaque metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl EngramDraft {
    /// Create a draft with default importance
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: Category::Fact,
            importance: 0.5,
            protected: false,
            valid_from: None,
            valid_until: None,
            validity_source: None,
            metadata: None,
        }
    }

    /// Set the category
    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Set the importance
    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    /// Mark as protected
    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Set the valid-time window
    pub fn valid_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }

    /// Attach metadata
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_category_roundtrip() {
        for category in [
            Category::Fact,
            Category::Observation,
            Category::Action,
            Category::Plan,
            Category::EntityAnchor,
            Category::Synthesis,
        ] {
            assert_eq!(Category::parse_name(category.as_str()), category);
        }
        assert_eq!(
            Category::parse_name("incident_note"),
            Category::Custom("incident_note".to_string())
        );
    }

    #[test]
    fn test_supersession_type_roundtrip() {
        for kind in [
            SupersessionType::Update,
            SupersessionType::Correction,
            SupersessionType::Refinement,
            SupersessionType::Merge,
        ] {
            assert_eq!(SupersessionType::parse_name(kind.as_str()), Some(kind));
        }
        assert_eq!(SupersessionType::parse_name("replace"), None);
    }

    #[test]
    fn test_validity_window_half_open() {
        let now = Utc::now();
        let mut engram = sample_engram(now);

        // No bounds = always valid
        assert!(engram.is_valid_at(now));

        engram.valid_from = Some(now);
        engram.valid_until = Some(now + Duration::days(1));
        assert!(engram.is_valid_at(now));
        assert!(engram.is_valid_at(now + Duration::hours(23)));
        // Exclusive upper bound
        assert!(!engram.is_valid_at(now + Duration::days(1)));
        assert!(!engram.is_valid_at(now - Duration::seconds(1)));
    }

    #[test]
    fn test_age_days_never_negative() {
        let now = Utc::now();
        let engram = sample_engram(now + Duration::hours(1));
        assert_eq!(engram.age_days(now), 0.0);
    }

    fn sample_engram(inserted_at: DateTime<Utc>) -> Engram {
        Engram {
            id: 1,
            content: "sample".to_string(),
            category: Category::Fact,
            importance: 0.5,
            protected: false,
            access_count: 0,
            last_accessed_at: None,
            decay_rate: 0.005,
            embedding_f32: None,
            embedding_i8: None,
            supersedes_id: None,
            superseded_at: None,
            supersession_type: None,
            valid_from: None,
            valid_until: None,
            validity_source: None,
            inserted_at,
            metadata: None,
        }
    }
}
