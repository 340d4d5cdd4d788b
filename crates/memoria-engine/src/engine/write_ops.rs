//! Mutations: store, store_batch, update, delete, link, unlink.
//!
//! Every fact mutation follows the same order: WAL append, fact store
//! commit, vector index write, WAL removal marker. Recovery relies on it.
//! When the vector write fails the entry stays pending, and the next
//! successful vector write for that fact retires it.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::classify::{ClassifyPrompt, LlmClassification, parse_classification};
use crate::error::{MemoryError, Result};
use crate::fusion::normalize_text;
use crate::types::{Fact, FactId, LinkType, MemoryLink};
use crate::validation::{
    ValidationError, validate_category, validate_scope, validate_tags, validate_text,
    validate_unit,
};
use crate::wal::WalEntry;

use super::request::{FactPatch, StoreAction, StoreOutcome, StoreRequest};
use super::{EngineInner, MemoryEngine, now};

/// Vector similarity at which a new fact counts as a restatement of an
/// existing one.
pub const DUPLICATE_SIMILARITY: f32 = 0.995;

/// A validated, classified fact waiting for its commit.
struct PreparedFact {
    fact: Fact,
    supersedes: Vec<FactId>,
    embedding: Option<Vec<f32>>,
    embedding_error: Option<String>,
}

impl MemoryEngine {
    /// Store a fact.
    ///
    /// A current fact with the same `(entity, key)` in the same scope is
    /// superseded when the value differs and reinforced when it does not. A
    /// current fact with the same text is reinforced. An embedding failure
    /// does not fail the store; the fact is kept without a vector.
    pub async fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        let mut prepared = self.inner.prepare(request).await?;

        if self.inner.embedder.is_some() {
            match self.inner.embed(&prepared.fact.text).await {
                Ok(vector) => prepared.embedding = Some(vector),
                Err(e) => {
                    warn!(id = %prepared.fact.id, error = %e, "Embedding failed, storing without a vector");
                    prepared.embedding_error = Some(e.to_string());
                }
            }
        }

        let _guard = self.inner.write_lock.lock().await;
        self.inner.commit(prepared)
    }

    /// Store many facts with one embedding call.
    ///
    /// Every request is validated before anything is written. If the batch
    /// embedding fails, the facts are stored without vectors.
    pub async fn store_batch(&self, requests: Vec<StoreRequest>) -> Result<Vec<StoreOutcome>> {
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            prepared.push(self.inner.prepare(request).await?);
        }

        if self.inner.embedder.is_some() && !prepared.is_empty() {
            let texts: Vec<&str> = prepared.iter().map(|p| p.fact.text.as_str()).collect();
            match self.inner.embed_batch(&texts).await {
                Ok(vectors) => {
                    for (p, vector) in prepared.iter_mut().zip(vectors) {
                        p.embedding = Some(vector);
                    }
                }
                Err(e) => {
                    warn!(count = prepared.len(), error = %e, "Batch embedding failed, storing without vectors");
                    let reason = e.to_string();
                    for p in &mut prepared {
                        p.embedding_error = Some(reason.clone());
                    }
                }
            }
        }

        let _guard = self.inner.write_lock.lock().await;
        let outcomes = prepared
            .into_iter()
            .map(|p| self.inner.commit(p))
            .collect::<Result<Vec<_>>>()?;

        info!(count = outcomes.len(), "Stored fact batch");
        Ok(outcomes)
    }

    /// Change an existing fact in place. A text change re-embeds it.
    pub async fn update(&self, id: FactId, patch: FactPatch) -> Result<Fact> {
        let inner = &self.inner;
        validate_patch(&patch, inner.config.storage.max_text_length)?;

        let existing = inner
            .store
            .get(id)?
            .ok_or_else(|| MemoryError::NotFound(format!("fact {}", id)))?;
        let new_text = patch
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| *t != existing.text)
            .map(str::to_string);

        let mut embedding = None;
        if let Some(text) = &new_text
            && inner.embedder.is_some()
        {
            match inner.embed(text).await {
                Ok(vector) => embedding = Some(vector),
                Err(e) => warn!(%id, error = %e, "Re-embedding failed, dropping the stale vector"),
            }
        }

        let _guard = inner.write_lock.lock().await;
        let mut fact = inner
            .store
            .get(id)?
            .ok_or_else(|| MemoryError::NotFound(format!("fact {}", id)))?;

        if let Some(text) = &new_text {
            fact.text = text.clone();
        }
        if let Some(category) = patch.category {
            fact.category = category;
        }
        if let Some(importance) = patch.importance {
            fact.importance = importance;
        }
        if let Some(class) = patch.decay_class
            && class != fact.decay_class
        {
            fact.decay_class = class;
            fact.expires_at = inner.policy.expiry_for(&fact);
        }
        if let Some(tags) = patch.tags {
            fact.tags = tags;
        }
        if let Some(summary) = patch.summary {
            fact.summary = Some(summary);
        }
        if let Some(triple) = patch.triple {
            fact = fact.with_triple(triple);
        }

        let text_changed = new_text.is_some();
        if text_changed && embedding.is_none() && fact.has_embedding {
            fact.has_embedding = false;
        }

        // A new (entity, key) can collide with another current fact
        let mut displaced = Vec::new();
        if fact.is_current()
            && let (Some(entity), Some(key)) = (fact.entity.as_deref(), fact.key.as_deref())
            && let Some(current) = inner.store.find_current(entity, key, &fact.scope)?
            && current.id != fact.id
        {
            displaced.push(current.id);
            fact.supersedes_id.get_or_insert(current.id);
        }

        let entry = WalEntry::update(fact.clone(), embedding.clone());
        inner.wal.append(&entry)?;
        let written = if displaced.is_empty() {
            inner.store.update(&fact)
        } else {
            inner.store.update_superseding(&fact, &displaced, now())
        };
        if let Err(e) = written {
            inner.discard_entry(&entry);
            return Err(e);
        }

        if !text_changed {
            inner.wal.remove(entry.id)?;
        } else if inner.replace_vector(&mut fact, embedding.as_deref())? {
            inner.retire(&[fact.id])?;
        } else {
            debug!(%id, entry = %entry.id, "Vector half of update left pending");
        }

        if !displaced.is_empty() {
            info!(%id, superseded = ?displaced, "Update superseded the current fact for its key");
        }
        debug!(%id, text_changed, "Updated fact");
        Ok(fact)
    }

    /// Delete a fact, its vector and every link touching it.
    pub async fn delete(&self, id: FactId) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.write_lock.lock().await;

        if !inner.store.exists(id)? {
            return Err(MemoryError::NotFound(format!("fact {}", id)));
        }

        let entry = WalEntry::delete(id);
        inner.wal.append(&entry)?;
        if let Err(e) = inner.store.delete(id) {
            inner.discard_entry(&entry);
            return Err(e);
        }

        // A failed vector delete keeps the entry so recovery retries it
        if inner.delete_vector(id) {
            inner.retire(&[id])?;
        }

        info!(%id, "Deleted fact");
        Ok(())
    }

    /// Create or update a typed link. Both facts must exist.
    pub async fn link(
        &self,
        source: FactId,
        target: FactId,
        link_type: LinkType,
        strength: f32,
    ) -> Result<MemoryLink> {
        validate_unit("strength", strength)?;
        if source == target {
            return Err(ValidationError::SelfLink.into());
        }
        let _guard = self.inner.write_lock.lock().await;
        self.inner
            .store
            .insert_link(&MemoryLink::new(source, target, link_type, strength))
    }

    /// Remove links from `source` to `target`, optionally of one type only.
    pub async fn unlink(
        &self,
        source: FactId,
        target: FactId,
        link_type: Option<LinkType>,
    ) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        self.inner.store.delete_links(source, target, link_type)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prepare and commit
// ─────────────────────────────────────────────────────────────────────────────

impl EngineInner {
    /// Validate a request and fill in everything the caller left unset.
    async fn prepare(&self, request: StoreRequest) -> Result<PreparedFact> {
        let max_len = self.config.storage.max_text_length;
        let text = request.text.trim().to_string();
        validate_text(&text, max_len)?;
        validate_scope(&request.scope)?;
        validate_tags(&request.tags)?;
        if let Some(category) = &request.category {
            validate_category(category)?;
        }
        if let Some(importance) = request.importance {
            validate_unit("importance", importance)?;
        }
        if let Some(summary) = &request.summary {
            validate_text(summary, max_len)?;
        }

        let heuristic = self.classifier.classify(&text);
        let llm = if request.category.is_none() || request.decay_class.is_none() {
            self.classify_with_llm(&text).await
        } else {
            None
        };
        let (llm_category, llm_decay) = match llm {
            Some(LlmClassification {
                category,
                decay_class,
            }) => (category, decay_class),
            None => (None, None),
        };

        let category = request
            .category
            .clone()
            .or(llm_category)
            .unwrap_or(heuristic.category);
        let decay_class = request
            .decay_class
            .or(llm_decay)
            .unwrap_or(heuristic.decay_class);
        let triple = request.explicit_triple().or(heuristic.triple);

        let mut fact = Fact::new(text)
            .with_id(request.id.unwrap_or_default())
            .with_importance(request.importance.unwrap_or(category.default_importance()))
            .with_category(category)
            .with_decay_class(decay_class)
            .with_scope(request.scope)
            .with_created_at(now());
        if let Some(triple) = triple {
            fact = fact.with_triple(triple);
        }
        if let Some(date) = request.source_date {
            fact = fact.with_source_date(date);
        }
        fact.tags = request.tags;
        fact.summary = request.summary;
        fact.expires_at = self.policy.expiry_for(&fact);

        Ok(PreparedFact {
            fact,
            supersedes: request.supersedes,
            embedding: None,
            embedding_error: None,
        })
    }

    /// Ask the completion provider for a category and decay class, when
    /// LLM classification is enabled.
    async fn classify_with_llm(&self, text: &str) -> Option<LlmClassification> {
        if !self.config.completion.classify {
            return None;
        }
        let raw = self.complete("classify", &ClassifyPrompt::build(text)).await?;
        parse_classification(&raw)
    }

    /// Decide between create, supersede and reinforce, then write.
    ///
    /// Must be called with the write lock held.
    fn commit(&self, prepared: PreparedFact) -> Result<StoreOutcome> {
        let PreparedFact {
            mut fact,
            supersedes,
            embedding,
            embedding_error,
        } = prepared;
        let now = now();

        let mut old_ids: Vec<FactId> = Vec::new();
        for id in &supersedes {
            let old = self
                .store
                .get(*id)?
                .ok_or_else(|| MemoryError::NotFound(format!("fact {}", id)))?;
            if let Some(by) = old.superseded_by {
                return Err(ValidationError::AlreadySuperseded {
                    id: id.to_string(),
                    by: by.to_string(),
                }
                .into());
            }
            if !old_ids.contains(id) {
                old_ids.push(*id);
            }
        }

        if let (Some(entity), Some(key)) = (fact.entity.as_deref(), fact.key.as_deref())
            && let Some(current) = self.store.find_current(entity, key, &fact.scope)?
            && !old_ids.contains(&current.id)
        {
            if supersedes.is_empty() && restates(&current, &fact) {
                return self.reinforce(current, now);
            }
            old_ids.push(current.id);
        }

        if old_ids.is_empty() {
            if let Some(existing) = self.store.find_by_text(&fact.text, &fact.scope)? {
                return self.reinforce(existing, now);
            }
            if let Some(existing) = self.near_duplicate(&fact, embedding.as_deref())? {
                return self.reinforce(existing, now);
            }
        }

        if self.store.exists(fact.id)? {
            return Err(MemoryError::DuplicateId(fact.id.to_string()));
        }

        if let Some(first) = old_ids.first() {
            fact.supersedes_id = Some(*first);
        }

        let entry = WalEntry::store(fact.clone(), embedding.clone());
        self.wal.append(&entry)?;
        let written = if old_ids.is_empty() {
            self.store.insert(&fact)
        } else {
            self.store.supersede(&old_ids, &fact, now)
        };
        if let Err(e) = written {
            self.discard_entry(&entry);
            return Err(e);
        }

        let (embedded, vector_error) = self.store_vector(fact.id, embedding.as_deref())?;
        fact.has_embedding = embedded;
        match &vector_error {
            None => self.retire(&[fact.id])?,
            Some(_) => debug!(id = %fact.id, entry = %entry.id, "Vector half of store left pending"),
        }

        let links_created = if embedded {
            self.auto_link(&fact, embedding.as_deref())
        } else {
            0
        };

        let action = if old_ids.is_empty() {
            StoreAction::Created
        } else {
            StoreAction::Superseded { previous: old_ids }
        };
        info!(
            id = %fact.id,
            category = %fact.category,
            decay = %fact.decay_class,
            embedded,
            superseded = matches!(action, StoreAction::Superseded { .. }),
            "Stored fact"
        );

        Ok(StoreOutcome {
            fact,
            action,
            embedded,
            embedding_error,
            vector_error,
            links_created,
        })
    }

    /// Confirm an existing fact instead of storing a restatement of it.
    fn reinforce(&self, existing: Fact, now: DateTime<Utc>) -> Result<StoreOutcome> {
        let expires_at = existing
            .decay_class
            .refreshes_on_access()
            .then(|| self.policy.expires_at(existing.decay_class, now))
            .flatten();

        let mut fact = existing;
        fact.last_confirmed_at = Some(now);
        fact.confidence = 1.0;
        if expires_at.is_some() {
            fact.expires_at = expires_at;
        }

        let entry = WalEntry::update(fact.clone(), None);
        self.wal.append(&entry)?;
        if let Err(e) = self.store.reinforce(fact.id, now, expires_at) {
            self.discard_entry(&entry);
            return Err(e);
        }
        self.wal.remove(entry.id)?;

        debug!(id = %fact.id, "Reinforced existing fact");
        Ok(StoreOutcome {
            embedded: fact.has_embedding,
            fact,
            action: StoreAction::Reinforced,
            embedding_error: None,
            vector_error: None,
            links_created: 0,
        })
    }

    /// A current fact in the same scope whose vector is all but identical.
    fn near_duplicate(&self, fact: &Fact, embedding: Option<&[f32]>) -> Result<Option<Fact>> {
        let (Some(vector), Some(index)) = (embedding, self.vector_index()) else {
            return Ok(None);
        };
        let hits = match index.search(vector, 3, Some(DUPLICATE_SIMILARITY)) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Duplicate check skipped, vector search failed");
                return Ok(None);
            }
        };
        for hit in hits {
            if let Some(existing) = self.store.get(hit.fact_id)?
                && existing.is_current()
                && existing.scope == fact.scope
                && triples_compatible(&existing, fact)
            {
                return Ok(Some(existing));
            }
        }
        Ok(None)
    }

    /// Store a vector and flag the fact. Returns whether it was stored and,
    /// if the index refused it, why.
    pub(crate) fn store_vector(
        &self,
        id: FactId,
        embedding: Option<&[f32]>,
    ) -> Result<(bool, Option<String>)> {
        let Some(vector) = embedding else {
            return Ok((false, None));
        };
        let Some(index) = self.vector_index() else {
            let reason = self
                .vectors
                .read()
                .error
                .clone()
                .unwrap_or_else(|| "vector index unavailable".to_string());
            return Ok((false, Some(reason)));
        };
        match index.store(id, vector) {
            Ok(()) => {
                self.store.set_has_embedding(&[id], true)?;
                Ok((true, None))
            }
            Err(e) => {
                warn!(%id, error = %e, "Vector store failed; fact kept without a vector");
                Ok((false, Some(e.to_string())))
            }
        }
    }

    /// Point a re-worded fact's vector at its new text.
    ///
    /// With no new embedding, or when the index refuses it, the old vector is
    /// dropped and the fact flagged unembedded. Returns whether the index now
    /// agrees with the fact.
    fn replace_vector(&self, fact: &mut Fact, embedding: Option<&[f32]>) -> Result<bool> {
        if embedding.is_some() {
            let (embedded, vector_error) = self.store_vector(fact.id, embedding)?;
            if vector_error.is_none() {
                fact.has_embedding = embedded;
                return Ok(true);
            }
        }
        let deleted = self.delete_vector(fact.id);
        if fact.has_embedding || embedding.is_some() {
            self.store.set_has_embedding(&[fact.id], false)?;
        }
        fact.has_embedding = false;
        Ok(deleted && embedding.is_none())
    }

    /// Remove a vector. Returns `false` only if the index reported an error.
    pub(crate) fn delete_vector(&self, id: FactId) -> bool {
        let Some(index) = self.vector_index() else {
            return true;
        };
        match index.delete(id) {
            Ok(_) => true,
            Err(e) => {
                warn!(%id, error = %e, "Vector delete failed");
                false
            }
        }
    }

    /// Create `RelatedTo` links to the nearest current facts.
    fn auto_link(&self, fact: &Fact, embedding: Option<&[f32]>) -> usize {
        let graph = &self.config.graph;
        if !graph.auto_link {
            return 0;
        }
        let (Some(vector), Some(index)) = (embedding, self.vector_index()) else {
            return 0;
        };
        let hits = match index.search(
            vector,
            graph.auto_link_top_n + 1,
            Some(graph.auto_link_min_similarity),
        ) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(id = %fact.id, error = %e, "Auto-link skipped, vector search failed");
                return 0;
            }
        };

        let mut created = 0;
        for hit in hits
            .into_iter()
            .filter(|h| h.fact_id != fact.id)
            .take(graph.auto_link_top_n)
        {
            let Ok(Some(other)) = self.store.get(hit.fact_id) else {
                continue;
            };
            if !other.is_current() || other.scope != fact.scope {
                continue;
            }
            let link = MemoryLink::new(
                fact.id,
                other.id,
                LinkType::RelatedTo,
                hit.similarity.clamp(0.0, 1.0),
            );
            match self.store.insert_link(&link) {
                Ok(_) => created += 1,
                Err(e) => debug!(error = %e, "Auto-link insert failed"),
            }
        }
        if created > 0 {
            debug!(id = %fact.id, created, "Auto-linked fact");
        }
        created
    }

    /// Mark every pending entry for `facts` committed.
    ///
    /// Callers hold the write lock and have just brought both the fact store
    /// and the vector index up to date for these facts, so nothing older in
    /// the log is left to replay for them.
    pub(crate) fn retire(&self, facts: &[FactId]) -> Result<()> {
        self.wal.remove_batch(&self.wal.pending_for(facts))
    }

    /// Drop a WAL entry whose store write failed, so recovery does not apply
    /// a mutation the caller was told failed.
    pub(crate) fn discard_entry(&self, entry: &WalEntry) {
        if let Err(e) = self.wal.remove(entry.id) {
            warn!(entry = %entry.id, error = %e, "Failed to mark WAL entry removed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `new` says the same thing as `current`: same value or same text.
fn restates(current: &Fact, new: &Fact) -> bool {
    let same_value = match (&current.value, &new.value) {
        (Some(a), Some(b)) => normalize_text(a) == normalize_text(b),
        _ => false,
    };
    same_value || normalize_text(&current.text) == normalize_text(&new.text)
}

/// Facts with different keys for the same entity are never duplicates.
fn triples_compatible(a: &Fact, b: &Fact) -> bool {
    match (a.triple(), b.triple()) {
        (Some(x), Some(y)) => {
            x.entity.eq_ignore_ascii_case(&y.entity)
                && x.key.eq_ignore_ascii_case(&y.key)
                && normalize_text(&x.value) == normalize_text(&y.value)
        }
        _ => true,
    }
}

fn validate_patch(patch: &FactPatch, max_len: usize) -> Result<()> {
    if let Some(text) = &patch.text {
        validate_text(text.trim(), max_len)?;
    }
    if let Some(category) = &patch.category {
        validate_category(category)?;
    }
    if let Some(importance) = patch.importance {
        validate_unit("importance", importance)?;
    }
    if let Some(tags) = &patch.tags {
        validate_tags(tags)?;
    }
    if let Some(summary) = &patch.summary {
        validate_text(summary, max_len)?;
    }
    if let Some(triple) = &patch.triple
        && (triple.entity.trim().is_empty() || triple.key.trim().is_empty())
    {
        return Err(ValidationError::UnknownValue {
            field: "triple",
            value: format!("{}/{}", triple.entity, triple.key),
        }
        .into());
    }
    Ok(())
}
