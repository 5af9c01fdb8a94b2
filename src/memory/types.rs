//! Core memory types: MemoryEntry, Stage, MetadataValue.

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metadata key carrying emotional valence for episodic queries.
pub const EMOTIONAL_VALENCE_KEY: &str = "emotional_valence";
/// Metadata key carrying emotional arousal for episodic queries.
pub const EMOTIONAL_AROUSAL_KEY: &str = "emotional_arousal";

/// Open, insertion-ordered metadata map.
pub type Metadata = IndexMap<String, MetadataValue>;

/// Unique identifier for a memory entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The tier that owns an entry.
///
/// Variants are declared lowest to highest so that `Ord` follows tier rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Bounded in-process cache
    Working,
    /// Time and affect indexed events
    Episodic,
    /// Concept and similarity indexed knowledge
    Semantic,
    /// Durable, versioned facts
    Persistent,
}

impl Stage {
    /// All stages, lowest tier first.
    pub const ALL: [Stage; 4] = [
        Stage::Working,
        Stage::Episodic,
        Stage::Semantic,
        Stage::Persistent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Working => "working",
            Stage::Episodic => "episodic",
            Stage::Semantic => "semantic",
            Stage::Persistent => "persistent",
        }
    }

    /// Numeric rank, 0 for working up to 3 for persistent.
    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "working" => Ok(Stage::Working),
            "episodic" => Ok(Stage::Episodic),
            "semantic" => Ok(Stage::Semantic),
            "persistent" => Ok(Stage::Persistent),
            other => Err(crate::error::Error::Config(format!(
                "unknown memory stage '{}'",
                other
            ))),
        }
    }
}

/// A metadata value: a small tagged union kept dynamically extensible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<MetadataValue>),
    Map(IndexMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MetadataValue]> {
        match self {
            MetadataValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Case-insensitive substring match against every string or number
    /// nested inside this value. `needle` must already be lowercase.
    pub fn contains_text(&self, needle: &str) -> bool {
        match self {
            MetadataValue::Null => false,
            MetadataValue::Bool(b) => b.to_string() == needle,
            MetadataValue::Number(n) => n.to_string().contains(needle),
            MetadataValue::String(s) => s.to_lowercase().contains(needle),
            MetadataValue::List(items) => items.iter().any(|v| v.contains_text(needle)),
            MetadataValue::Map(map) => map
                .iter()
                .any(|(k, v)| k.to_lowercase().contains(needle) || v.contains_text(needle)),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        MetadataValue::Number(n)
    }
}

impl From<i64> for MetadataValue {
    fn from(n: i64) -> Self {
        MetadataValue::Number(n as f64)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl<T: Into<MetadataValue>> From<Vec<T>> for MetadataValue {
    fn from(items: Vec<T>) -> Self {
        MetadataValue::List(items.into_iter().map(Into::into).collect())
    }
}

/// The unit of storage across all tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Stable identifier
    pub id: EntryId,
    /// Arbitrary payload
    pub content: Value,
    /// Tags, source, affect, domain, ...
    #[serde(default)]
    pub metadata: Metadata,
    /// Importance in [0.0, 1.0]
    pub importance: f64,
    /// Creation time (tier-local)
    pub timestamp: DateTime<Utc>,
    /// When the entry was last read
    pub last_accessed: DateTime<Utc>,
    /// Number of successful reads
    pub access_count: u64,
    /// Tier that returned this entry; informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl MemoryEntry {
    /// Create a new entry stamped with the current wall-clock time.
    pub fn new(content: impl Into<Value>) -> Self {
        Self::new_at(content, Utc::now())
    }

    /// Create a new entry stamped with the given time.
    pub fn new_at(content: impl Into<Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            content: content.into(),
            metadata: Metadata::new(),
            importance: 0.0,
            timestamp: now,
            last_accessed: now,
            access_count: 0,
            stage: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<EntryId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set importance, clamped to [0.0, 1.0]; NaN becomes 0.0.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = clamp_importance(importance);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override both creation and last-access time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self.last_accessed = timestamp;
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Record a successful read.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
    }

    /// Age of the entry relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Approximate in-memory footprint: id plus serialized content and metadata.
    pub fn approx_size_bytes(&self) -> usize {
        let content = serde_json::to_vec(&self.content)
            .map(|v| v.len())
            .unwrap_or(0);
        let metadata = if self.metadata.is_empty() {
            0
        } else {
            serde_json::to_vec(&self.metadata)
                .map(|v| v.len())
                .unwrap_or(0)
        };
        self.id.as_str().len() + content + metadata
    }

    /// Content rendered as plain text for matching and embedding.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Case-insensitive substring match on content. `needle` must be lowercase.
    pub fn content_matches(&self, needle: &str) -> bool {
        self.content_text().to_lowercase().contains(needle)
    }

    /// Case-insensitive substring match on metadata keys and values.
    pub fn metadata_matches(&self, needle: &str) -> bool {
        self.metadata
            .iter()
            .any(|(k, v)| k.to_lowercase().contains(needle) || v.contains_text(needle))
    }

    pub fn get_metadata(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    /// Emotional valence, if recorded as a number.
    pub fn emotional_valence(&self) -> Option<f64> {
        self.metadata.get(EMOTIONAL_VALENCE_KEY)?.as_f64()
    }

    /// Emotional arousal, if recorded as a number.
    pub fn emotional_arousal(&self) -> Option<f64> {
        self.metadata.get(EMOTIONAL_AROUSAL_KEY)?.as_f64()
    }
}

/// A search hit with a relevance score in [0.0, 1.0].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f64,
}

impl ScoredEntry {
    pub fn new(entry: MemoryEntry, score: f64) -> Self {
        Self { entry, score }
    }
}

/// Score for a hit on entry content.
pub const CONTENT_MATCH_SCORE: f64 = 1.0;
/// Score for a hit on metadata only.
pub const METADATA_MATCH_SCORE: f64 = 0.5;

pub(crate) fn clamp_importance(importance: f64) -> f64 {
    if importance.is_nan() {
        0.0
    } else {
        importance.clamp(0.0, 1.0)
    }
}
