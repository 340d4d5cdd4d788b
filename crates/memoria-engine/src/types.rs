//! Core types for the memory engine.
//!
//! - [`Fact`]: one stored memory with its lifecycle metadata
//! - [`Scope`]: who a fact belongs to
//! - [`DecayClass`]: how long a fact lives
//! - [`MemoryLink`]: a typed, weighted edge between two facts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::validation::ValidationError;

// ─────────────────────────────────────────────────────────────────────────────
// ID Types
// ─────────────────────────────────────────────────────────────────────────────

/// Unique identifier for a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactId(Uuid);

impl FactId {
    /// Create a new random fact ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from the hyphenated string form.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FactId {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Unique identifier for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(Uuid);

impl LinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Category
// ─────────────────────────────────────────────────────────────────────────────

/// What kind of statement a fact is.
///
/// Custom labels are allowed; they must be short lowercase identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Preference,
    Fact,
    Decision,
    Entity,
    Pattern,
    Rule,
    Other,
    Custom(String),
}

impl Category {
    pub const BUILTIN: [Category; 7] = [
        Category::Preference,
        Category::Fact,
        Category::Decision,
        Category::Entity,
        Category::Pattern,
        Category::Rule,
        Category::Other,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Preference => "preference",
            Self::Fact => "fact",
            Self::Decision => "decision",
            Self::Entity => "entity",
            Self::Pattern => "pattern",
            Self::Rule => "rule",
            Self::Other => "other",
            Self::Custom(s) => s,
        }
    }

    /// Importance assigned when the caller supplies none.
    pub fn default_importance(&self) -> f32 {
        match self {
            Self::Rule => 0.8,
            Self::Decision => 0.7,
            Self::Preference | Self::Entity => 0.6,
            Self::Fact | Self::Pattern => 0.5,
            Self::Other | Self::Custom(_) => 0.4,
        }
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "preference" => Self::Preference,
            "fact" => Self::Fact,
            "decision" => Self::Decision,
            "entity" => Self::Entity,
            "pattern" => Self::Pattern,
            "rule" => Self::Rule,
            "other" => Self::Other,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        let category = Category::from(s.to_string());
        crate::validation::validate_category(&category)?;
        Ok(category)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decay Class
// ─────────────────────────────────────────────────────────────────────────────

/// Lifetime class of a fact.
///
/// | Class      | TTL        | Refreshed on access |
/// |------------|------------|---------------------|
/// | Permanent  | never      | n/a                 |
/// | Stable     | 90 days    | yes                 |
/// | Active     | 14 days    | yes                 |
/// | Session    | 24 hours   | no                  |
/// | Checkpoint | 4 hours    | no                  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayClass {
    Permanent,
    Stable,
    Active,
    Session,
    Checkpoint,
}

impl DecayClass {
    pub const ALL: [DecayClass; 5] = [
        DecayClass::Permanent,
        DecayClass::Stable,
        DecayClass::Active,
        DecayClass::Session,
        DecayClass::Checkpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Stable => "stable",
            Self::Active => "active",
            Self::Session => "session",
            Self::Checkpoint => "checkpoint",
        }
    }

    /// Whether reading the fact pushes its expiry forward.
    pub fn refreshes_on_access(&self) -> bool {
        matches!(self, Self::Stable | Self::Active)
    }

    /// Higher is longer-lived. Used to pick the class of a merged fact.
    pub fn durability(&self) -> u8 {
        match self {
            Self::Permanent => 4,
            Self::Stable => 3,
            Self::Active => 2,
            Self::Session => 1,
            Self::Checkpoint => 0,
        }
    }
}

impl fmt::Display for DecayClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecayClass {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permanent" => Ok(Self::Permanent),
            "stable" => Ok(Self::Stable),
            "active" => Ok(Self::Active),
            "session" => Ok(Self::Session),
            "checkpoint" => Ok(Self::Checkpoint),
            other => Err(ValidationError::UnknownValue {
                field: "decay_class",
                value: other.to_string(),
            }
            .into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scope
// ─────────────────────────────────────────────────────────────────────────────

/// Ownership of a fact. Every variant except `Global` names its target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Global,
    User(String),
    Agent(String),
    Session(String),
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User(_) => "user",
            Self::Agent(_) => "agent",
            Self::Session(_) => "session",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::User(t) | Self::Agent(t) | Self::Session(t) => Some(t),
        }
    }

    /// Rebuild from the persisted `(kind, target)` columns.
    pub fn from_parts(kind: &str, target: Option<String>) -> Result<Self> {
        match (kind, target) {
            ("global", _) => Ok(Self::Global),
            ("user", Some(t)) => Ok(Self::User(t)),
            ("agent", Some(t)) => Ok(Self::Agent(t)),
            ("session", Some(t)) => Ok(Self::Session(t)),
            (kind, None) => Err(ValidationError::EmptyScopeTarget(kind.to_string()).into()),
            (kind, Some(_)) => Err(ValidationError::UnknownValue {
                field: "scope",
                value: kind.to_string(),
            }
            .into()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(t) => write!(f, "{}:{}", self.kind(), t),
            None => f.write_str(self.kind()),
        }
    }
}

impl FromStr for Scope {
    type Err = MemoryError;

    /// Parses `global`, `user:<id>`, `agent:<id>` or `session:<id>`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (kind, target) = match s.split_once(':') {
            Some((k, t)) => (k.to_ascii_lowercase(), Some(t.trim().to_string())),
            None => (s.to_ascii_lowercase(), None),
        };
        let scope = Self::from_parts(&kind, target)?;
        crate::validation::validate_scope(&scope)?;
        Ok(scope)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fact
// ─────────────────────────────────────────────────────────────────────────────

/// Structured `(entity, key, value)` view of a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub entity: String,
    pub key: String,
    pub value: String,
}

/// A stored memory.
///
/// A fact is *current* while `superseded_by` is unset. Superseded facts are
/// hidden from default reads but stay queryable for point-in-time lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    pub id: FactId,
    pub text: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Caller-assigned weight in `0.0..=1.0`.
    pub importance: f32,
    /// Falls from 1.0 toward the configured floor as expiry approaches.
    pub confidence: f32,
    pub decay_class: DecayClass,
    pub created_at: DateTime<Utc>,
    /// When the fact became true, if different from when it was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// `None` for permanent facts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recall_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes_id: Option<FactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<FactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub has_embedding: bool,
}

impl Fact {
    /// Create a new current fact with default metadata.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: FactId::new(),
            text: text.into(),
            category: Category::Other,
            entity: None,
            key: None,
            value: None,
            importance: Category::Other.default_importance(),
            confidence: 1.0,
            decay_class: DecayClass::Stable,
            created_at: Utc::now(),
            source_date: None,
            last_confirmed_at: None,
            last_accessed_at: None,
            expires_at: None,
            recall_count: 0,
            supersedes_id: None,
            superseded_by: None,
            superseded_at: None,
            scope: Scope::Global,
            tags: Vec::new(),
            summary: None,
            has_embedding: false,
        }
    }

    pub fn with_id(mut self, id: FactId) -> Self {
        self.id = id;
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_triple(mut self, triple: Triple) -> Self {
        self.entity = Some(triple.entity);
        self.key = Some(triple.key);
        self.value = Some(triple.value);
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_decay_class(mut self, class: DecayClass) -> Self {
        self.decay_class = class;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_source_date(mut self, date: DateTime<Utc>) -> Self {
        self.source_date = Some(date);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn with_expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = at;
        self
    }

    /// The date the fact is considered true from.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.source_date.unwrap_or(self.created_at)
    }

    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// Whether the fact was current at `as_of`.
    pub fn was_current_at(&self, as_of: DateTime<Utc>) -> bool {
        self.effective_date() <= as_of && self.superseded_at.is_none_or(|at| at > as_of)
    }

    pub fn triple(&self) -> Option<Triple> {
        match (&self.entity, &self.key, &self.value) {
            (Some(entity), Some(key), Some(value)) => Some(Triple {
                entity: entity.clone(),
                key: key.clone(),
                value: value.clone(),
            }),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Links
// ─────────────────────────────────────────────────────────────────────────────

/// Relationship carried by a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Supersedes,
    CausedBy,
    PartOf,
    RelatedTo,
    DependsOn,
}

impl LinkType {
    pub const ALL: [LinkType; 5] = [
        LinkType::Supersedes,
        LinkType::CausedBy,
        LinkType::PartOf,
        LinkType::RelatedTo,
        LinkType::DependsOn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supersedes => "supersedes",
            Self::CausedBy => "caused_by",
            Self::PartOf => "part_of",
            Self::RelatedTo => "related_to",
            Self::DependsOn => "depends_on",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = MemoryError;

    /// Accepts snake_case, kebab-case, and the CamelCase variant names.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "supersedes" => Ok(Self::Supersedes),
            "causedby" => Ok(Self::CausedBy),
            "partof" => Ok(Self::PartOf),
            "relatedto" => Ok(Self::RelatedTo),
            "dependson" => Ok(Self::DependsOn),
            _ => Err(ValidationError::UnknownValue {
                field: "link_type",
                value: s.to_string(),
            }
            .into()),
        }
    }
}

/// A directed, weighted edge between two facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryLink {
    pub id: LinkId,
    pub source_id: FactId,
    pub target_id: FactId,
    pub link_type: LinkType,
    /// Edge weight in `0.0..=1.0`.
    pub strength: f32,
    pub created_at: DateTime<Utc>,
}

impl MemoryLink {
    pub fn new(source_id: FactId, target_id: FactId, link_type: LinkType, strength: f32) -> Self {
        Self {
            id: LinkId::new(),
            source_id,
            target_id,
            link_type,
            strength,
            created_at: Utc::now(),
        }
    }

    /// The endpoint opposite `id`, if `id` is an endpoint.
    pub fn other_end(&self, id: FactId) -> Option<FactId> {
        if self.source_id == id {
            Some(self.target_id)
        } else if self.target_id == id {
            Some(self.source_id)
        } else {
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
