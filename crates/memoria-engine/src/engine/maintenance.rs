//! Maintenance: decay sweeps, duplicate detection, consolidation, embedding
//! backfill, WAL upkeep, statistics and the periodic background tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use memoria_config::ConfigError;

use crate::consolidation::{
    ConsolidationReport, DuplicatePair, MergePrompt, MergedCluster, build_clusters, fallback_text,
    merged_fact, merged_text_from_completion, mergeable,
};
use crate::decay::{PruneMode, SweepReport};
use crate::error::{MemoryError, Result};
use crate::types::{Fact, FactId};
use crate::validation::validate_unit;
use crate::vector::{SqliteVecIndex, VectorIndex};
use crate::wal::{CompactReport, WalEntry};

use super::request::{BackfillReport, EngineStats};
use super::{EngineInner, MemoryEngine, VECTOR_DIR, now};

/// Facts embedded per provider call during a backfill.
const BACKFILL_BATCH: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Public operations
// ─────────────────────────────────────────────────────────────────────────────

impl MemoryEngine {
    /// Run a decay sweep now.
    pub async fn prune(&self, mode: PruneMode) -> Result<SweepReport> {
        self.inner.sweep(mode).await
    }

    /// Pairs of current facts whose vectors are at least `threshold`
    /// similar (default `consolidation.threshold`), most similar first.
    ///
    /// Read-only. Needs the vector index.
    pub fn find_duplicates(&self, threshold: Option<f32>) -> Result<Vec<DuplicatePair>> {
        let threshold = threshold.unwrap_or(self.inner.config.consolidation.threshold);
        Ok(self.inner.duplicate_scan(threshold)?.pairs)
    }

    /// Merge clusters of near-duplicate facts into one fact each.
    ///
    /// The merged text comes from the completion provider when one is
    /// configured, else from the most important member. Links of the
    /// members move to the merged fact and the members are deleted.
    pub async fn consolidate(&self, threshold: Option<f32>) -> Result<ConsolidationReport> {
        let inner = &self.inner;
        let threshold = threshold.unwrap_or(inner.config.consolidation.threshold);
        let scan = inner.duplicate_scan(threshold)?;
        let clusters = build_clusters(&scan.pairs);

        let mut report = ConsolidationReport {
            scanned: scan.scanned,
            skipped_identifiers: scan.skipped_identifiers,
            ..Default::default()
        };
        for members in clusters {
            if let Some(merged) = inner.merge_cluster(&members).await? {
                report.deleted += merged.members.len();
                report.clusters.push(merged);
            }
        }

        info!(
            scanned = report.scanned,
            clusters = report.clusters.len(),
            deleted = report.deleted,
            skipped_identifiers = report.skipped_identifiers,
            "Consolidation complete"
        );
        Ok(report)
    }

    /// Embed every fact that has no vector. With `rebuild`, the vector index
    /// is emptied first so every fact is re-embedded.
    pub async fn backfill(&self, rebuild: bool) -> Result<BackfillReport> {
        let inner = &self.inner;
        if inner.embedder.is_none() {
            return Err(ConfigError::Invalid {
                field: "embedding.providers".to_string(),
                reason: "backfill needs an embedding provider".to_string(),
            }
            .into());
        }
        if rebuild {
            inner.rebuild_index().await?;
        }
        let index = inner.require_index()?;

        let mut report = BackfillReport {
            rebuilt: rebuild,
            ..Default::default()
        };
        let mut attempted: HashSet<FactId> = HashSet::new();
        loop {
            let batch: Vec<Fact> = inner
                .store
                .list_without_embedding(BACKFILL_BATCH + attempted.len())?
                .into_iter()
                .filter(|f| !attempted.contains(&f.id))
                .take(BACKFILL_BATCH)
                .collect();
            if batch.is_empty() {
                break;
            }
            report.scanned += batch.len();
            attempted.extend(batch.iter().map(|f| f.id));

            let texts: Vec<&str> = batch.iter().map(|f| f.text.as_str()).collect();
            let vectors = match inner.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(count = batch.len(), error = %e, "Backfill batch failed to embed");
                    report.failed += batch.len();
                    continue;
                }
            };

            let _guard = inner.write_lock.lock().await;
            let mut stored = Vec::with_capacity(batch.len());
            for (fact, vector) in batch.iter().zip(&vectors) {
                // Deleted or reworded while the batch was embedding
                if inner.store.get(fact.id)?.is_none_or(|current| current.text != fact.text) {
                    continue;
                }
                match index.store(fact.id, vector) {
                    Ok(()) => stored.push(fact.id),
                    Err(e) => {
                        warn!(id = %fact.id, error = %e, "Backfill vector store failed");
                        report.failed += 1;
                    }
                }
            }
            report.embedded += inner.store.set_has_embedding(&stored, true)?;
            inner.retire(&stored)?;
            debug!(embedded = report.embedded, scanned = report.scanned, "Backfill batch done");
        }

        info!(
            scanned = report.scanned,
            embedded = report.embedded,
            failed = report.failed,
            rebuilt = report.rebuilt,
            "Backfill complete"
        );
        Ok(report)
    }

    /// Rewrite the WAL without completed entries.
    pub fn compact_wal(&self) -> Result<CompactReport> {
        self.inner.wal.compact()
    }

    /// Entries in the WAL that have not been marked removed.
    pub fn wal_pending(&self) -> Result<usize> {
        self.inner.wal.pending_count()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let inner = &self.inner;
        let index = inner.vector_index();
        let vector_count = match &index {
            Some(index) => match index.count() {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(error = %e, "Vector count unavailable");
                    None
                }
            },
            None => None,
        };

        Ok(EngineStats {
            store: inner.store.stats()?,
            data_dir: inner.data_dir.clone(),
            vector_available: index.is_some(),
            vector_error: self.vector_error(),
            vector_count,
            dimensions: inner.dimensions(),
            embedder: inner.embedder.as_ref().map(|e| e.name().to_string()),
            completer: inner.completer.as_ref().map(|c| c.name().to_string()),
            classifier: inner.classifier.name().to_string(),
            wal_pending: inner.wal.pending_count()?,
            wal_format: inner.store.get_meta("wal.format")?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internals
// ─────────────────────────────────────────────────────────────────────────────

/// Result of comparing every current fact against its nearest neighbours.
struct DuplicateScan {
    pairs: Vec<DuplicatePair>,
    scanned: usize,
    skipped_identifiers: usize,
}

impl EngineInner {
    /// Delete expired facts (hard) and lower the confidence of facts near
    /// expiry (soft).
    pub(crate) async fn sweep(&self, mode: PruneMode) -> Result<SweepReport> {
        let _guard = self.write_lock.lock().await;
        let now = now();
        let mut report = SweepReport {
            at: Some(now),
            ..Default::default()
        };

        if mode.hard() {
            let expired = self.store.expired_ids(now)?;
            if !expired.is_empty() {
                let entries: Vec<WalEntry> = expired.iter().map(|id| WalEntry::delete(*id)).collect();
                self.wal.append_batch(&entries)?;
                report.expired = self.store.delete_many(&expired)?.len();

                let cleared: Vec<FactId> = expired
                    .iter()
                    .copied()
                    .filter(|id| self.delete_vector(*id))
                    .collect();
                self.retire(&cleared)?;
            }
        }

        if mode.soft() {
            let expiring = self.store.list_expiring(now)?;
            let updates = self.policy.soft_decay_updates(&expiring, now);
            report.decayed = self.store.set_confidences(&updates)?;
        }

        if report.expired > 0 || report.decayed > 0 {
            info!(expired = report.expired, decayed = report.decayed, "Decay sweep");
        } else {
            debug!("Decay sweep found nothing to do");
        }
        Ok(report)
    }

    fn require_index(&self) -> Result<Arc<dyn VectorIndex>> {
        self.vector_index().ok_or_else(|| {
            let reason = self
                .vectors
                .read()
                .error
                .clone()
                .unwrap_or_else(|| "vector index unavailable".to_string());
            MemoryError::VectorBackend(reason)
        })
    }

    fn duplicate_scan(&self, threshold: f32) -> Result<DuplicateScan> {
        validate_unit("threshold", threshold)?;
        let index = self.require_index()?;
        let settings = &self.config.consolidation;

        let facts: HashMap<FactId, Fact> = self
            .store
            .list_current()?
            .into_iter()
            .filter(|f| f.has_embedding)
            .map(|f| (f.id, f))
            .collect();
        let mut ids: Vec<FactId> = facts.keys().copied().collect();
        ids.sort();

        let skipped: HashSet<FactId> = if settings.include_identifiers {
            HashSet::new()
        } else {
            ids.iter()
                .filter(|id| self.identifiers.contains_identifier(&facts[*id].text))
                .copied()
                .collect()
        };

        let mut seen: HashSet<(FactId, FactId)> = HashSet::new();
        let mut pairs = Vec::new();
        for id in ids.iter().filter(|id| !skipped.contains(*id)) {
            let Some(vector) = index.get(*id)? else {
                continue;
            };
            let fact = &facts[id];
            for hit in index.search(&vector, settings.neighbor_limit + 1, Some(threshold))? {
                if hit.fact_id == *id || skipped.contains(&hit.fact_id) {
                    continue;
                }
                let Some(other) = facts.get(&hit.fact_id) else {
                    continue;
                };
                if !mergeable(fact, other) {
                    continue;
                }
                let (first, second) = if id < &other.id {
                    (*id, other.id)
                } else {
                    (other.id, *id)
                };
                if seen.insert((first, second)) {
                    pairs.push(DuplicatePair {
                        first,
                        second,
                        similarity: hit.similarity,
                    });
                }
            }
        }

        pairs.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.first.cmp(&b.first))
                .then_with(|| a.second.cmp(&b.second))
        });
        debug!(scanned = ids.len(), pairs = pairs.len(), threshold, "Duplicate scan");
        Ok(DuplicateScan {
            pairs,
            scanned: ids.len(),
            skipped_identifiers: skipped.len(),
        })
    }

    /// Merge one cluster. `None` if the cluster changed while its summary
    /// was being computed.
    async fn merge_cluster(&self, ids: &[FactId]) -> Result<Option<MergedCluster>> {
        let mut members = self.store.get_many(ids)?;
        if members.len() < 2 {
            return Ok(None);
        }
        // Oldest first, so the summarizer sees later statements last
        members.sort_by(|a, b| {
            a.effective_date()
                .cmp(&b.effective_date())
                .then_with(|| a.id.cmp(&b.id))
        });

        let max_len = self.config.storage.max_text_length;
        let summary = match MergePrompt::build(&members) {
            Some(prompt) => self
                .complete("consolidate", &prompt)
                .await
                .and_then(|raw| merged_text_from_completion(&raw, max_len)),
            None => None,
        };
        let summarized = summary.is_some();
        let Some(text) = summary.or_else(|| fallback_text(&members)) else {
            return Ok(None);
        };

        let mut merged = merged_fact(&members, text, now());
        merged.expires_at = self.policy.expiry_for(&merged);

        let embedding = match self.embed(&merged.text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                debug!(error = %e, "Merged text not embedded, reusing a member vector");
                self.member_vector(&members, &merged.text)
            }
        };

        let _guard = self.write_lock.lock().await;
        let fresh = self.store.get_many(ids)?;
        if fresh.len() != members.len() || fresh.iter().any(|f| !f.is_current()) {
            debug!(members = ids.len(), "Cluster changed during consolidation, skipping");
            return Ok(None);
        }

        let member_ids: Vec<FactId> = members.iter().map(|f| f.id).collect();
        let mut entries = vec![WalEntry::store(merged.clone(), embedding.clone())];
        entries.extend(member_ids.iter().map(|id| WalEntry::delete(*id)));
        self.wal.append_batch(&entries)?;

        let links_moved = match self.store.merge_into(&member_ids, &merged) {
            Ok(n) => n,
            Err(e) => {
                for entry in &entries {
                    self.discard_entry(entry);
                }
                return Err(e);
            }
        };
        let (embedded, vector_error) = self.store_vector(merged.id, embedding.as_deref())?;

        let mut cleared: Vec<FactId> = member_ids
            .iter()
            .copied()
            .filter(|id| self.delete_vector(*id))
            .collect();
        if vector_error.is_none() {
            cleared.push(merged.id);
        }
        self.retire(&cleared)?;

        info!(
            merged = %merged.id,
            members = member_ids.len(),
            summarized,
            embedded,
            links_moved,
            "Merged cluster"
        );
        Ok(Some(MergedCluster {
            merged_id: merged.id,
            members: member_ids,
            summarized,
            links_moved,
        }))
    }

    /// Vector of the member whose text was kept, else of any member.
    fn member_vector(&self, members: &[Fact], text: &str) -> Option<Vec<f32>> {
        let index = self.vector_index()?;
        let kept = members.iter().filter(|f| f.text == text);
        kept.chain(members.iter())
            .find_map(|f| index.get(f.id).ok().flatten())
    }

    /// Empty the vector index and clear every `has_embedding` flag.
    async fn rebuild_index(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.vector_index_injected() {
            let index = self.require_index()?;
            for id in index.ids()? {
                index.delete(id)?;
            }
        } else {
            // Release the old connection before its files go away
            self.vectors.write().index = None;
            match SqliteVecIndex::recreate(self.data_dir.join(VECTOR_DIR), self.dimensions()) {
                Ok(index) => self.replace_vector_index(Arc::new(index)),
                Err(e) => {
                    self.vectors.write().error = Some(e.to_string());
                    return Err(e);
                }
            }
        }

        let flagged = self.store.list_ids(true)?;
        let cleared = self.store.set_has_embedding(&flagged, false)?;
        info!(cleared, "Vector index rebuilt");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic decay sweep and WAL compaction.
pub(crate) struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub(crate) fn spawn(inner: Arc<EngineInner>) -> Self {
        let cancel = CancellationToken::new();
        let sweep_every = inner.config.decay.sweep_interval();
        let compact_every = inner.config.wal.compact_interval();

        let handles = vec![
            tokio::spawn(sweep_loop(
                Arc::clone(&inner),
                sweep_every,
                cancel.child_token(),
            )),
            tokio::spawn(compact_loop(inner, compact_every, cancel.child_token())),
        ];
        debug!(
            sweep_secs = sweep_every.as_secs(),
            compact_secs = compact_every.as_secs(),
            "Background tasks started"
        );
        Self { cancel, handles }
    }

    /// Signal the tasks to stop without waiting for them.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the tasks and wait for any run in progress to finish.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        debug!("Background tasks stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sweep_loop(inner: Arc<EngineInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = inner.sweep(PruneMode::Both).await {
                    warn!(error = %e, "Scheduled decay sweep failed");
                }
            }
        }
    }
}

async fn compact_loop(inner: Arc<EngineInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let _guard = inner.write_lock.lock().await;
                match inner.wal.compact() {
                    Ok(report) => debug!(kept = report.kept, dropped = report.dropped, "WAL compacted"),
                    Err(e) => warn!(error = %e, "Scheduled WAL compaction failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use memoria_config::MemoriaConfig;
    use memoria_llm::{MockCompleter, MockEmbedder};
    use tempfile::TempDir;

    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::engine::request::StoreRequest;
    use crate::types::{DecayClass, LinkType};
    use crate::vector::SimilarityHit;

    const DIMS: usize = 256;

    async fn engine(dir: &TempDir) -> MemoryEngine {
        let mut config = MemoriaConfig::default();
        config.embedding.dimensions = DIMS;
        MemoryEngine::builder(config)
            .with_data_dir(dir.path())
            .with_embedder(Arc::new(MockEmbedder::new(DIMS)))
            .background_tasks(false)
            .open()
            .await
            .unwrap()
    }

    fn aged(text: &str, class: DecayClass, age: ChronoDuration) -> Fact {
        let created = now() - age;
        Fact::new(text)
            .with_decay_class(class)
            .with_created_at(created)
    }

    #[tokio::test]
    async fn test_hard_sweep_deletes_expired_only() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let old_session = aged("Debugging the login flow", DecayClass::Session, ChronoDuration::hours(30));
        let old_permanent = aged("User is allergic to peanuts", DecayClass::Permanent, ChronoDuration::days(400));
        engine.fact_store().insert(&old_session).unwrap();
        engine.fact_store().insert(&old_permanent).unwrap();

        let report = engine.prune(PruneMode::Hard).await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(engine.get(old_session.id).unwrap().is_none());
        assert!(engine.get(old_permanent.id).unwrap().is_some());
        assert_eq!(engine.wal_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_soft_sweep_lowers_confidence() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let fact = aged("Working on the billing refactor", DecayClass::Active, ChronoDuration::days(13));
        engine.fact_store().insert(&fact).unwrap();

        let report = engine.prune(PruneMode::Soft).await.unwrap();
        assert_eq!(report.decayed, 1);
        assert_eq!(report.expired, 0);
        let stored = engine.get(fact.id).unwrap().unwrap();
        assert!(stored.confidence < 1.0);
    }

    #[tokio::test]
    async fn test_consolidate_merges_cluster_and_moves_links() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let a = engine
            .store(StoreRequest::new("The deploy pipeline runs nightly on the build cluster"))
            .await
            .unwrap();
        let b = engine
            .store(StoreRequest::new("The deploy pipeline runs nightly on the build cluster daily"))
            .await
            .unwrap();
        let other = engine
            .store(StoreRequest::new("Rust release notes mention async closures"))
            .await
            .unwrap();
        engine
            .link(a.fact.id, other.fact.id, LinkType::RelatedTo, 0.7)
            .await
            .unwrap();

        let pairs = engine.find_duplicates(Some(0.9)).unwrap();
        assert_eq!(pairs.len(), 1);

        let report = engine.consolidate(Some(0.9)).await.unwrap();
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.deleted, 2);
        let cluster = &report.clusters[0];
        assert!(!cluster.summarized);

        assert!(engine.get(a.fact.id).unwrap().is_none());
        assert!(engine.get(b.fact.id).unwrap().is_none());
        let merged = engine.get(cluster.merged_id).unwrap().unwrap();
        assert!(merged.has_embedding);
        let links = engine.links(cluster.merged_id).unwrap();
        assert!(links.iter().any(|l| l.other_end(cluster.merged_id) == Some(other.fact.id)));
        assert_eq!(engine.wal_pending().unwrap(), 0);
    }

    /// A working in-memory index that can be switched to refuse writes.
    struct RefusingIndex {
        inner: SqliteVecIndex,
        refuse: AtomicBool,
    }

    impl VectorIndex for RefusingIndex {
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn store(&self, id: FactId, vector: &[f32]) -> Result<()> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(MemoryError::VectorBackend("read-only".into()));
            }
            self.inner.store(id, vector)
        }

        fn search(
            &self,
            vector: &[f32],
            limit: usize,
            min_similarity: Option<f32>,
        ) -> Result<Vec<SimilarityHit>> {
            self.inner.search(vector, limit, min_similarity)
        }

        fn get(&self, id: FactId) -> Result<Option<Vec<f32>>> {
            self.inner.get(id)
        }

        fn delete(&self, id: FactId) -> Result<bool> {
            self.inner.delete(id)
        }

        fn ids(&self) -> Result<Vec<FactId>> {
            self.inner.ids()
        }

        fn count(&self) -> Result<usize> {
            self.inner.count()
        }
    }

    #[tokio::test]
    async fn test_merge_keeps_log_entry_when_vector_write_fails() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(RefusingIndex {
            inner: SqliteVecIndex::open_in_memory(DIMS).unwrap(),
            refuse: AtomicBool::new(false),
        });
        let mut config = MemoriaConfig::default();
        config.embedding.dimensions = DIMS;
        let engine = MemoryEngine::builder(config)
            .with_data_dir(dir.path())
            .with_embedder(Arc::new(MockEmbedder::new(DIMS)))
            .with_vector_index(Arc::clone(&index) as Arc<dyn VectorIndex>)
            .background_tasks(false)
            .open()
            .await
            .unwrap();
        engine
            .store(StoreRequest::new("The deploy pipeline runs nightly on the build cluster"))
            .await
            .unwrap();
        engine
            .store(StoreRequest::new("The deploy pipeline runs nightly on the build cluster daily"))
            .await
            .unwrap();
        assert_eq!(engine.wal_pending().unwrap(), 0);

        index.refuse.store(true, Ordering::SeqCst);
        let report = engine.consolidate(Some(0.9)).await.unwrap();
        assert_eq!(report.clusters.len(), 1);

        let merged = engine.get(report.clusters[0].merged_id).unwrap().unwrap();
        assert!(!merged.has_embedding);
        // The merged fact's store entry waits for its vector; member deletes are settled
        assert_eq!(engine.wal_pending().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consolidate_uses_summary_from_completer() {
        let dir = TempDir::new().unwrap();
        let mut config = MemoriaConfig::default();
        config.embedding.dimensions = DIMS;
        let engine = MemoryEngine::builder(config)
            .with_data_dir(dir.path())
            .with_embedder(Arc::new(MockEmbedder::new(DIMS)))
            .with_completer(Arc::new(MockCompleter::new(
                "The deploy pipeline runs nightly on the build cluster.",
            )))
            .background_tasks(false)
            .open()
            .await
            .unwrap();
        engine
            .store(StoreRequest::new("The deploy pipeline runs nightly on the build cluster"))
            .await
            .unwrap();
        engine
            .store(StoreRequest::new("The deploy pipeline runs nightly on the build cluster daily"))
            .await
            .unwrap();

        let report = engine.consolidate(Some(0.9)).await.unwrap();
        assert_eq!(report.clusters.len(), 1);
        assert!(report.clusters[0].summarized);
        let merged = engine.get(report.clusters[0].merged_id).unwrap().unwrap();
        assert_eq!(merged.text, "The deploy pipeline runs nightly on the build cluster.");
    }

    #[tokio::test]
    async fn test_identifier_facts_are_not_clustered() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine
            .store(StoreRequest::new("Primary database host is 10.0.3.17"))
            .await
            .unwrap();
        engine
            .store(StoreRequest::new("Primary database host is 10.0.3.18"))
            .await
            .unwrap();

        let report = engine.consolidate(Some(0.5)).await.unwrap();
        assert!(report.clusters.is_empty());
        assert_eq!(report.skipped_identifiers, 2);
    }

    #[tokio::test]
    async fn test_backfill_embeds_missing_and_rebuilds() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let plain = Fact::new("Team standup moved to 10am");
        engine.fact_store().insert(&plain).unwrap();
        engine
            .store(StoreRequest::new("User prefers dark mode"))
            .await
            .unwrap();

        let report = engine.backfill(false).await.unwrap();
        assert_eq!(report.embedded, 1);
        assert!(engine.get(plain.id).unwrap().unwrap().has_embedding);

        let report = engine.backfill(true).await.unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.embedded, 2);
        assert_eq!(engine.vector_index().unwrap().count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_backfill_without_embedder_is_config_error() {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::builder(MemoriaConfig::default())
            .with_data_dir(dir.path())
            .background_tasks(false)
            .open()
            .await
            .unwrap();
        let err = engine.backfill(false).await.unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[tokio::test]
    async fn test_stats_report_counts() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine
            .store(StoreRequest::new("User prefers dark mode"))
            .await
            .unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.store.facts, 1);
        assert_eq!(stats.vector_count, Some(1));
        assert_eq!(stats.dimensions, DIMS);
        assert_eq!(stats.embedder.as_deref(), Some("mock"));
        assert_eq!(stats.wal_pending, 0);
        assert_eq!(stats.wal_format.as_deref(), Some(crate::wal::WAL_FORMAT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_stop_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = MemoriaConfig::default();
        config.embedding.dimensions = DIMS;
        let engine = MemoryEngine::builder(config)
            .with_data_dir(dir.path())
            .open()
            .await
            .unwrap();
        tokio::time::advance(std::time::Duration::from_secs(7200)).await;
        engine.close().await;
    }
}
