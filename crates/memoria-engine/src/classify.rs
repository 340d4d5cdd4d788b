//! Content heuristics: category, decay class and structured triple.
//!
//! The default [`HeuristicClassifier`] is deterministic keyword and pattern
//! matching. It is a policy, not a correctness property, so it sits behind
//! the [`FactClassifier`] trait and hosts can swap it out. An optional LLM
//! pass ([`ClassifyPrompt`] / [`parse_classification`]) can refine the
//! category and decay class; the heuristic result is always the fallback.

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::prompt::{extract_json_object, strip_code_fences};
use crate::types::{Category, DecayClass, Triple};

/// What a classifier decided about a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub decay_class: DecayClass,
    pub triple: Option<Triple>,
}

/// Pluggable classification strategy.
pub trait FactClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Classification;

    fn name(&self) -> &str {
        "custom"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heuristic classifier
// ─────────────────────────────────────────────────────────────────────────────

const DECISION_CUES: &[&str] = &[
    "decided",
    "we chose",
    "going with",
    "agreed to",
    "settled on",
    "we will use",
    "switched to",
];

const RULE_CUES: &[&str] = &[
    "always ",
    "never ",
    "must ",
    "must not",
    "do not ",
    "don't ",
    "should ",
];

const PREFERENCE_CUES: &[&str] = &[
    "prefer",
    "likes ",
    "like ",
    "loves ",
    "love ",
    "hates ",
    "dislike",
    "favorite",
    "favourite",
    "rather ",
];

const PATTERN_CUES: &[&str] = &["usually", "tends to", "every time", "often ", "typically"];

const CHECKPOINT_CUES: &[&str] = &["checkpoint", "before compaction", "resume from", "step "];

const SESSION_CUES: &[&str] = &[
    "right now",
    "this session",
    "for now",
    "at the moment",
    "temporarily",
    "today",
    "currently",
];

const ACTIVE_CUES: &[&str] = &[
    "working on",
    "in progress",
    "this week",
    "this sprint",
    "deadline",
    "todo",
    "next step",
    "blocked on",
];

const PERMANENT_CUES: &[&str] = &[
    "my name is",
    "name is",
    "born ",
    "architecture",
    "identity",
    "is written in",
    "native language",
];

/// `Alice's editor is Helix`
const POSSESSIVE_PATTERN: &str = r"(?i)^(?P<entity>[\w.-]+(?: [\w.-]+){0,2})'s (?P<key>[\w-]+(?: [\w-]+){0,2}) (?:is|are|was) (?P<value>.+?)[.!]?$";

/// `My editor is Helix`
const FIRST_PERSON_PATTERN: &str =
    r"(?i)^my (?P<key>[\w-]+(?: [\w-]+){0,2}) (?:is|are) (?P<value>.+?)[.!]?$";

/// `User prefers dark mode`
const VERB_PATTERN: &str = r"(?i)^(?P<entity>[\w.-]+(?: [\w.-]+){0,2}) (?P<verb>prefers|prefer|likes|like|loves|love|hates|hate|dislikes|dislike|uses|use|wants|want|needs|need|avoids|avoid) (?P<value>.+?)[.!]?$";

/// Keyword and pattern based classifier.
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    possessive: Option<Regex>,
    first_person: Option<Regex>,
    verb: Option<Regex>,
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self {
            possessive: compile(POSSESSIVE_PATTERN),
            first_person: compile(FIRST_PERSON_PATTERN),
            verb: compile(VERB_PATTERN),
        }
    }

    pub fn category(&self, text: &str) -> Category {
        let lower = text.to_lowercase();
        if contains_any(&lower, DECISION_CUES) {
            Category::Decision
        } else if starts_or_contains_any(&lower, RULE_CUES) {
            Category::Rule
        } else if contains_any(&lower, PREFERENCE_CUES) {
            Category::Preference
        } else if contains_any(&lower, PATTERN_CUES) {
            Category::Pattern
        } else if self.possessive_triple(text).is_some() {
            Category::Entity
        } else {
            Category::Fact
        }
    }

    pub fn decay_class(&self, text: &str) -> DecayClass {
        let lower = text.to_lowercase();
        if contains_any(&lower, CHECKPOINT_CUES) {
            DecayClass::Checkpoint
        } else if contains_any(&lower, SESSION_CUES) {
            DecayClass::Session
        } else if contains_any(&lower, ACTIVE_CUES) {
            DecayClass::Active
        } else if contains_any(&lower, PERMANENT_CUES) {
            DecayClass::Permanent
        } else {
            DecayClass::Stable
        }
    }

    /// Extract `(entity, key, value)` from a simple statement.
    ///
    /// Entity and key are lowercased; the value keeps its case.
    pub fn extract_triple(&self, text: &str) -> Option<Triple> {
        let text = text.trim();
        self.possessive_triple(text)
            .or_else(|| self.first_person_triple(text))
            .or_else(|| self.verb_triple(text))
    }

    fn possessive_triple(&self, text: &str) -> Option<Triple> {
        let caps = self.possessive.as_ref()?.captures(text.trim())?;
        triple(&caps["entity"], &caps["key"], &caps["value"])
    }

    fn first_person_triple(&self, text: &str) -> Option<Triple> {
        let caps = self.first_person.as_ref()?.captures(text)?;
        triple("user", &caps["key"], &caps["value"])
    }

    fn verb_triple(&self, text: &str) -> Option<Triple> {
        let caps = self.verb.as_ref()?.captures(text)?;
        let verb = caps["verb"].to_lowercase();
        let key = verb_stem(&verb);
        triple(&caps["entity"], key, &caps["value"])
    }
}

impl FactClassifier for HeuristicClassifier {
    fn classify(&self, text: &str) -> Classification {
        Classification {
            category: self.category(text),
            decay_class: self.decay_class(text),
            triple: self.extract_triple(text),
        }
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(error = %e, "Classifier pattern failed to compile, disabling it");
            None
        }
    }
}

fn contains_any(haystack: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| haystack.contains(cue))
}

/// Like [`contains_any`] but also matches cues with a trailing space at the
/// very end of the text.
fn starts_or_contains_any(haystack: &str, cues: &[&str]) -> bool {
    let padded = format!("{haystack} ");
    cues.iter().any(|cue| padded.contains(cue))
}

/// `prefers` -> `prefer`, `uses` -> `use`.
fn verb_stem(verb: &str) -> &str {
    match verb.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem,
        _ => verb,
    }
}

fn triple(entity: &str, key: &str, value: &str) -> Option<Triple> {
    let entity = entity.trim().to_lowercase();
    let key = key.trim().to_lowercase();
    let value = value.trim().to_string();
    if entity.is_empty() || key.is_empty() || value.is_empty() {
        return None;
    }
    Some(Triple { entity, key, value })
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM-assisted classification
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the classification prompt.
pub struct ClassifyPrompt;

impl ClassifyPrompt {
    pub fn build(text: &str) -> String {
        let mut prompt = String::with_capacity(CLASSIFY_INSTRUCTION.len() + text.len() + 64);
        prompt.push_str(CLASSIFY_INSTRUCTION);
        prompt.push_str("\n\nMemory: ");
        prompt.push_str(text.trim());
        prompt.push_str("\n\nRespond with ONLY the JSON object. No markdown, no explanation.\n");
        prompt
    }
}

const CLASSIFY_INSTRUCTION: &str = r#"You classify memories stored by an AI assistant. Return a JSON object:

{"category": "...", "decay_class": "..."}

- `category`: one of preference, fact, decision, entity, pattern, rule, other
- `decay_class`:
  - "permanent" for identity and architecture facts that never change
  - "stable" for long-lived preferences and facts
  - "active" for ongoing work that matters for days or weeks
  - "session" for state that only matters in the current conversation
  - "checkpoint" for short-lived task progress markers"#;

/// Category and decay class proposed by a completion provider.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmClassification {
    pub category: Option<Category>,
    pub decay_class: Option<DecayClass>,
}

#[derive(Deserialize)]
struct RawClassification {
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "decayClass")]
    decay_class: Option<String>,
}

/// Parse completion output. Unknown or malformed fields are dropped so the
/// caller can fall back field by field; `None` if nothing was usable.
pub fn parse_classification(raw: &str) -> Option<LlmClassification> {
    let cleaned = strip_code_fences(raw);
    let parsed = serde_json::from_str::<RawClassification>(cleaned)
        .ok()
        .or_else(|| {
            extract_json_object(cleaned)
                .and_then(|json| serde_json::from_str::<RawClassification>(json).ok())
        });

    let Some(parsed) = parsed else {
        warn!("Failed to parse classification output");
        return None;
    };

    let category = parsed
        .category
        .and_then(|c| c.parse::<Category>().ok())
        .filter(|c| Category::BUILTIN.contains(c));
    let decay_class = parsed
        .decay_class
        .and_then(|d| d.parse::<DecayClass>().ok());

    if category.is_none() && decay_class.is_none() {
        return None;
    }
    Some(LlmClassification {
        category,
        decay_class,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
