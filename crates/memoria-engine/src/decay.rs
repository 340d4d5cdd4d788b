//! TTL policy and decay computations.
//!
//! Expiry is derived, never stored as truth: it is the fact's [`DecayClass`]
//! TTL counted from an anchor timestamp. Stable and active facts anchor on
//! their latest access or confirmation (else creation), so reading them
//! pushes expiry forward. Session and checkpoint facts anchor on creation.
//! The `expires_at` column the store keeps is a cache of this value and is
//! re-derived whenever the configured TTLs change.
//!
//! The sweep itself lives on the engine because a hard prune has to go
//! through the WAL and the vector index. This module only decides *what*
//! expires and *how much* confidence a fact still has.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use memoria_config::DecayConfig;

use crate::types::{DecayClass, Fact, FactId};

// ─────────────────────────────────────────────────────────────────────────────
// TTL Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Per-class time-to-live plus soft-decay parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    stable: Duration,
    active: Duration,
    session: Duration,
    checkpoint: Duration,
    soft_threshold: f64,
    min_confidence: f32,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&DecayConfig::default())
    }
}

impl TtlPolicy {
    pub fn from_config(config: &DecayConfig) -> Self {
        Self {
            stable: Duration::days(config.stable_ttl_days as i64),
            active: Duration::days(config.active_ttl_days as i64),
            session: Duration::hours(config.session_ttl_hours as i64),
            checkpoint: Duration::hours(config.checkpoint_ttl_hours as i64),
            soft_threshold: config.soft_decay_threshold as f64,
            min_confidence: config.min_confidence,
        }
    }

    /// TTL for a class; `None` means the class never expires.
    pub fn ttl(&self, class: DecayClass) -> Option<Duration> {
        match class {
            DecayClass::Permanent => None,
            DecayClass::Stable => Some(self.stable),
            DecayClass::Active => Some(self.active),
            DecayClass::Session => Some(self.session),
            DecayClass::Checkpoint => Some(self.checkpoint),
        }
    }

    /// Expiry of a fact of `class` whose clock starts at `anchor`.
    pub fn expires_at(&self, class: DecayClass, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ttl(class)
            .and_then(|ttl| anchor.checked_add_signed(ttl))
    }

    /// Facts of `class` whose anchor is at or before this instant have
    /// expired by `now`. `None` for classes that never expire.
    pub fn cutoff(&self, class: DecayClass, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ttl(class).and_then(|ttl| now.checked_sub_signed(ttl))
    }

    /// The instant a fact's TTL clock started.
    ///
    /// Classes that refresh on access use the latest of last access, last
    /// confirmation and creation. The others always use creation.
    pub fn anchor(fact: &Fact) -> DateTime<Utc> {
        if !fact.decay_class.refreshes_on_access() {
            return fact.created_at;
        }
        [fact.last_accessed_at, fact.last_confirmed_at]
            .into_iter()
            .flatten()
            .fold(fact.created_at, |latest, at| latest.max(at))
    }

    /// Expiry derived from the fact's class and timestamps.
    pub fn expiry_for(&self, fact: &Fact) -> Option<DateTime<Utc>> {
        self.expires_at(fact.decay_class, Self::anchor(fact))
    }

    /// Expiry after the fact is read at `now`.
    pub fn refreshed_expiry(&self, fact: &Fact, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if fact.decay_class.refreshes_on_access() {
            self.expires_at(fact.decay_class, now)
        } else {
            self.expiry_for(fact)
        }
    }

    /// Whether the fact's derived expiry has passed.
    pub fn is_expired(&self, fact: &Fact, now: DateTime<Utc>) -> bool {
        self.expiry_for(fact).is_some_and(|at| at <= now)
    }

    /// Identifies the TTL settings; stored so a change can be detected.
    pub fn fingerprint(&self) -> String {
        format!(
            "stable={}s,active={}s,session={}s,checkpoint={}s",
            self.stable.num_seconds(),
            self.active.num_seconds(),
            self.session.num_seconds(),
            self.checkpoint.num_seconds()
        )
    }

    /// Fraction of the TTL used up at `now`, in `0.0..=1.0`.
    ///
    /// `None` for facts that never expire.
    pub fn elapsed_fraction(&self, fact: &Fact, now: DateTime<Utc>) -> Option<f64> {
        let ttl = self.ttl(fact.decay_class)?;
        let expires_at = self.expiry_for(fact)?;
        let ttl_ms = ttl.num_milliseconds();
        if ttl_ms <= 0 {
            return Some(1.0);
        }
        let remaining_ms = (expires_at - now).num_milliseconds();
        let fraction = 1.0 - remaining_ms as f64 / ttl_ms as f64;
        Some(fraction.clamp(0.0, 1.0))
    }

    /// Confidence a fact should have at `now`.
    ///
    /// Full confidence until the soft threshold, then a linear fall to the
    /// configured floor at expiry.
    pub fn soft_confidence(&self, fact: &Fact, now: DateTime<Utc>) -> f32 {
        let Some(fraction) = self.elapsed_fraction(fact, now) else {
            return 1.0;
        };
        if fraction <= self.soft_threshold {
            return 1.0;
        }
        let span = (1.0 - self.soft_threshold).max(f64::EPSILON);
        let progress = ((fraction - self.soft_threshold) / span).clamp(0.0, 1.0);
        let floor = self.min_confidence as f64;
        (1.0 - progress * (1.0 - floor)) as f32
    }

    /// Confidence changes for `facts` at `now`. Only facts whose confidence
    /// would move by more than a rounding error are returned.
    pub fn soft_decay_updates(&self, facts: &[Fact], now: DateTime<Utc>) -> Vec<(FactId, f32)> {
        facts
            .iter()
            .filter(|f| !self.is_expired(f, now))
            .filter_map(|f| {
                let confidence = self.soft_confidence(f, now);
                ((confidence - f.confidence).abs() > 1e-4).then_some((f.id, confidence))
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sweep types
// ─────────────────────────────────────────────────────────────────────────────

/// Which parts of a sweep to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruneMode {
    /// Delete expired facts.
    Hard,
    /// Lower the confidence of facts nearing expiry.
    Soft,
    #[default]
    Both,
}

impl PruneMode {
    pub fn hard(&self) -> bool {
        matches!(self, Self::Hard | Self::Both)
    }

    pub fn soft(&self) -> bool {
        matches!(self, Self::Soft | Self::Both)
    }
}

impl std::str::FromStr for PruneMode {
    type Err = crate::error::MemoryError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hard" => Ok(Self::Hard),
            "soft" => Ok(Self::Soft),
            "both" | "all" => Ok(Self::Both),
            other => Err(crate::validation::ValidationError::UnknownValue {
                field: "prune mode",
                value: other.to_string(),
            }
            .into()),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Facts deleted because their TTL ran out.
    pub expired: usize,
    /// Facts whose confidence was lowered.
    pub decayed: usize,
    pub at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
