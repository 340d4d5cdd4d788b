//! Startup recovery: WAL replay and vector/fact reconciliation.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::FactId;
use crate::wal::{WalEntry, WalOperation};

use super::request::{ReconcileReport, RecoveryReport};
use super::{EngineInner, now};

/// What replaying one entry did.
enum Replay {
    Applied,
    AlreadyApplied,
    /// The store write succeeded but the vector half did not.
    Incomplete,
}

impl EngineInner {
    /// Replay every pending WAL entry.
    ///
    /// Replay is idempotent: a store whose fact already exists (by id, or a
    /// current fact with the same text in the same scope) is skipped, an
    /// update of a missing fact is skipped, and deleting a missing fact is a
    /// no-op. Entries older than `wal.max_age_secs` are discarded.
    ///
    /// Only the last pending entry for a fact writes its vector; earlier
    /// entries replay their fact store half and are then settled by it.
    pub(crate) async fn recover(&self) -> Result<RecoveryReport> {
        let _guard = self.write_lock.lock().await;
        let pending = self.wal.read_pending()?;
        let mut report = RecoveryReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let max_age = chrono::Duration::from_std(self.config.wal.max_age())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now() - max_age;
        let mut done = Vec::new();
        // A restated store must not be skipped in favour of a fact that a
        // later entry deletes (an interrupted consolidation)
        let pending_deletes: HashSet<FactId> = pending
            .iter()
            .filter(|e| e.operation == WalOperation::Delete)
            .map(|e| e.payload.fact_id)
            .collect();
        let last_for_fact: HashMap<FactId, uuid::Uuid> = pending
            .iter()
            .map(|e| (e.payload.fact_id, e.id))
            .collect();

        for entry in &pending {
            if entry.ready_at < cutoff {
                warn!(
                    entry = %entry.id,
                    fact = %entry.payload.fact_id,
                    ready_at = %entry.ready_at,
                    "Discarding stale WAL entry"
                );
                report.discarded += 1;
                done.push(entry.id);
                continue;
            }

            let owns_vector = last_for_fact.get(&entry.payload.fact_id) == Some(&entry.id);
            match self.replay(entry, &pending_deletes, owns_vector) {
                Ok(Replay::Applied) => {
                    report.replayed += 1;
                    done.push(entry.id);
                }
                Ok(Replay::AlreadyApplied) => {
                    report.skipped += 1;
                    done.push(entry.id);
                }
                Ok(Replay::Incomplete) => report.failed += 1,
                Err(e) => {
                    warn!(
                        entry = %entry.id,
                        operation = ?entry.operation,
                        error = %e,
                        "WAL replay failed"
                    );
                    report.failed += 1;
                }
            }
        }

        self.wal.remove_batch(&done)?;
        info!(
            replayed = report.replayed,
            skipped = report.skipped,
            discarded = report.discarded,
            failed = report.failed,
            "WAL recovery complete"
        );
        Ok(report)
    }

    fn replay(
        &self,
        entry: &WalEntry,
        pending_deletes: &HashSet<FactId>,
        owns_vector: bool,
    ) -> Result<Replay> {
        let payload = &entry.payload;
        let embedding = payload.embedding.as_deref().filter(|_| owns_vector);

        match entry.operation {
            WalOperation::Store => {
                let Some(fact) = &payload.fact else {
                    return Ok(Replay::AlreadyApplied);
                };
                if self.store.exists(fact.id)? {
                    return self.replay_vector(fact.id, embedding, Replay::AlreadyApplied);
                }
                if let Some(existing) = self.store.find_by_text(&fact.text, &fact.scope)?
                    && !pending_deletes.contains(&existing.id)
                {
                    debug!(entry = %entry.id, existing = %existing.id, "Store already applied under another id");
                    return Ok(Replay::AlreadyApplied);
                }

                let mut fact = fact.clone();
                fact.has_embedding = false;
                let previous = match fact.supersedes_id {
                    Some(old) => self.store.get(old)?.filter(|f| f.is_current()),
                    None => None,
                };
                match previous {
                    Some(old) => self.store.supersede(&[old.id], &fact, entry.ready_at)?,
                    None => {
                        fact.supersedes_id = None;
                        self.store.insert(&fact)?;
                    }
                }
                self.replay_vector(fact.id, embedding, Replay::Applied)
            }
            WalOperation::Update => {
                let Some(fact) = &payload.fact else {
                    return Ok(Replay::AlreadyApplied);
                };
                let Some(current) = self.store.get(fact.id)? else {
                    return Ok(Replay::AlreadyApplied);
                };
                let mut fact = fact.clone();
                // Supersession state is owned by later writes, never by the entry
                fact.superseded_by = current.superseded_by;
                fact.superseded_at = current.superseded_at;
                let dropped_vector = !fact.has_embedding;
                fact.has_embedding = current.has_embedding;

                let displaced = match (fact.entity.as_deref(), fact.key.as_deref()) {
                    (Some(entity), Some(key)) if fact.is_current() => self
                        .store
                        .find_current(entity, key, &fact.scope)?
                        .filter(|other| other.id != fact.id),
                    _ => None,
                };
                match displaced {
                    Some(other) => {
                        fact.supersedes_id.get_or_insert(other.id);
                        self.store.update_superseding(&fact, &[other.id], entry.ready_at)?;
                    }
                    None => self.store.update(&fact)?,
                }

                match embedding {
                    // The entry's text is the newest, so its vector replaces any present
                    Some(vector) => match self.store_vector(fact.id, Some(vector))? {
                        (true, _) => Ok(Replay::Applied),
                        (false, _) => Ok(Replay::Incomplete),
                    },
                    None if owns_vector && dropped_vector && self.vector_available() => {
                        if !self.delete_vector(fact.id) {
                            return Ok(Replay::Incomplete);
                        }
                        self.store.set_has_embedding(&[fact.id], false)?;
                        Ok(Replay::Applied)
                    }
                    None => Ok(Replay::Applied),
                }
            }
            WalOperation::Delete => {
                self.store.delete(payload.fact_id)?;
                if !owns_vector || self.delete_vector(payload.fact_id) {
                    Ok(Replay::Applied)
                } else {
                    Ok(Replay::Incomplete)
                }
            }
        }
    }

    /// Store the entry's vector if the index lacks it.
    fn replay_vector(&self, id: FactId, embedding: Option<&[f32]>, done: Replay) -> Result<Replay> {
        let Some(vector) = embedding else {
            return Ok(done);
        };
        let Some(index) = self.vector_index() else {
            return Ok(Replay::Incomplete);
        };
        match index.get(id) {
            Ok(Some(_)) => {
                self.store.set_has_embedding(&[id], true)?;
                Ok(done)
            }
            _ => match self.store_vector(id, Some(vector))? {
                (true, _) => Ok(Replay::Applied),
                (false, _) => Ok(Replay::Incomplete),
            },
        }
    }

    /// Make the vector index and the fact store agree: drop vectors without a
    /// fact and fix `has_embedding` flags in both directions.
    pub(crate) async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let Some(index) = self.vector_index() else {
            return Ok(report);
        };
        let _guard = self.write_lock.lock().await;

        let vector_ids: HashSet<FactId> = match index.ids() {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped, vector index unreadable");
                return Ok(report);
            }
        };
        let fact_ids: HashSet<FactId> = self.store.list_ids(false)?.into_iter().collect();
        let flagged: HashSet<FactId> = self.store.list_ids(true)?.into_iter().collect();

        for id in vector_ids.difference(&fact_ids) {
            match index.delete(*id) {
                Ok(_) => report.orphan_vectors += 1,
                Err(e) => warn!(%id, error = %e, "Failed to remove orphan vector"),
            }
        }

        let missing: Vec<FactId> = flagged.difference(&vector_ids).copied().collect();
        report.flags_cleared = self.store.set_has_embedding(&missing, false)?;

        let unflagged: Vec<FactId> = vector_ids
            .intersection(&fact_ids)
            .filter(|id| !flagged.contains(id))
            .copied()
            .collect();
        report.flags_set = self.store.set_has_embedding(&unflagged, true)?;

        if report != ReconcileReport::default() {
            info!(
                orphan_vectors = report.orphan_vectors,
                flags_cleared = report.flags_cleared,
                flags_set = report.flags_set,
                "Reconciled vector index"
            );
        }
        Ok(report)
    }
}
