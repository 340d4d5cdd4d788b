//! The memory engine: one handle over the fact store, vector index, WAL,
//! providers and background maintenance.
//!
//! # Lifecycle
//!
//! ```no_run
//! use memoria_config::MemoriaConfig;
//! use memoria_engine::{MemoryEngine, SearchQuery, StoreRequest};
//!
//! # async fn demo() -> memoria_engine::Result<()> {
//! let engine = MemoryEngine::builder(MemoriaConfig::default())
//!     .with_data_dir("/tmp/memoria")
//!     .open()
//!     .await?;
//!
//! engine.store(StoreRequest::new("User prefers dark mode")).await?;
//! let results = engine.search(&SearchQuery::new("dark mode")).await?;
//! # let _ = results;
//! engine.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! `open` replays the WAL, reconciles the vector index against the fact
//! store, runs one decay sweep and (unless disabled) starts the periodic
//! sweep and WAL compaction tasks. `close` stops them; dropping the engine
//! cancels them without waiting.
//!
//! # Concurrency
//!
//! Mutations take a single async write lock for the commit phase only.
//! Embedding and completion calls happen before the lock is taken, and reads
//! never take it.
//!
//! # Operations
//!
//! - `write_ops`: store, store_batch, update, delete, link, unlink
//! - `read_ops`: get, lookup, search, traverse, links
//! - `maintenance`: sweep, duplicates, consolidate, backfill, WAL, stats
//! - `recovery`: WAL replay and startup reconciliation

mod maintenance;
pub mod providers;
mod read_ops;
mod recovery;
pub mod request;
mod write_ops;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use memoria_config::{ConfigError, MemoriaConfig, resolve_data_dir};
use memoria_llm::{LlmError, SharedCompleter, SharedEmbedder, with_timeout};

use crate::classify::{FactClassifier, HeuristicClassifier};
use crate::consolidation::IdentifierDetector;
use crate::decay::{PruneMode, SweepReport, TtlPolicy};
use crate::error::{MemoryError, Result};
use crate::fusion::RrfMerger;
use crate::store::FactStore;
use crate::validation::validate_embedding;
use crate::vector::{SqliteVecIndex, VectorIndex};
use crate::wal::{WAL_FILE, WAL_FORMAT, WriteAheadLog};

use maintenance::BackgroundTasks;
pub use request::{
    BackfillReport, EngineStats, FactPatch, ReconcileReport, RecoveryReport, SearchHit,
    SearchQuery, SearchResults, StoreAction, StoreOutcome, StoreRequest,
};

/// Fact store file inside the data directory.
pub const FACTS_FILE: &str = "facts.sqlite";

/// Vector index directory inside the data directory.
pub const VECTOR_DIR: &str = "vectors";

/// Current time at the precision facts are persisted with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// What `open` did before handing the engine out.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenReport {
    pub recovery: RecoveryReport,
    pub reconcile: ReconcileReport,
    pub sweep: SweepReport,
}

/// Handle to an open memory store.
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
    tasks: Mutex<Option<BackgroundTasks>>,
    opened: OpenReport,
}

/// The vector index, or why it is unavailable.
struct VectorSlot {
    index: Option<Arc<dyn VectorIndex>>,
    error: Option<String>,
    /// Supplied by the host rather than opened from the data directory.
    injected: bool,
}

/// Shared state behind the engine handle and its background tasks.
pub(crate) struct EngineInner {
    pub(crate) config: MemoriaConfig,
    pub(crate) data_dir: PathBuf,
    pub(crate) store: FactStore,
    vectors: RwLock<VectorSlot>,
    pub(crate) wal: WriteAheadLog,
    pub(crate) embedder: Option<SharedEmbedder>,
    pub(crate) completer: Option<SharedCompleter>,
    pub(crate) classifier: Arc<dyn FactClassifier>,
    pub(crate) policy: TtlPolicy,
    pub(crate) merger: RrfMerger,
    pub(crate) identifiers: IdentifierDetector,
    /// Serializes every mutation's commit phase.
    pub(crate) write_lock: tokio::sync::Mutex<()>,
}

impl MemoryEngine {
    /// Start configuring an engine.
    pub fn builder(config: MemoriaConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Open an engine with providers built from `config`.
    pub async fn open(config: MemoriaConfig) -> Result<Self> {
        Self::builder(config).open().await
    }

    pub fn config(&self) -> &MemoriaConfig {
        &self.inner.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Direct access to the fact store.
    pub fn fact_store(&self) -> &FactStore {
        &self.inner.store
    }

    /// The vector index, if it opened.
    pub fn vector_index(&self) -> Option<Arc<dyn VectorIndex>> {
        self.inner.vector_index()
    }

    /// Why the vector index is unavailable, if it is.
    pub fn vector_error(&self) -> Option<String> {
        self.inner.vectors.read().error.clone()
    }

    /// What happened during `open`.
    pub fn open_report(&self) -> &OpenReport {
        &self.opened
    }

    /// Stop background tasks and compact the WAL.
    pub async fn close(self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }
        if let Err(e) = self.inner.wal.compact() {
            warn!(error = %e, "WAL compaction at close failed");
        }
        info!(path = %self.inner.data_dir.display(), "Memory engine closed");
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().as_ref() {
            tasks.cancel();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

impl EngineInner {
    pub(crate) fn vector_index(&self) -> Option<Arc<dyn VectorIndex>> {
        self.vectors.read().index.clone()
    }

    pub(crate) fn vector_available(&self) -> bool {
        self.vectors.read().index.is_some()
    }

    pub(crate) fn dimensions(&self) -> usize {
        self.config.embedding.dimensions
    }

    /// Swap in a freshly built index (after a rebuild).
    pub(crate) fn replace_vector_index(&self, index: Arc<dyn VectorIndex>) {
        let mut slot = self.vectors.write();
        slot.index = Some(index);
        slot.error = None;
    }

    pub(crate) fn vector_index_injected(&self) -> bool {
        self.vectors.read().injected
    }

    /// Embed one text with the configured deadline.
    pub(crate) async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self.embedder.as_ref().ok_or_else(no_embedder)?;
        let vector = with_timeout(self.config.embedding.timeout(), embedder.embed(text)).await?;
        validate_embedding(&vector, self.dimensions())?;
        Ok(vector)
    }

    /// Embed many texts in one provider call with the configured deadline.
    pub(crate) async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let embedder = self.embedder.as_ref().ok_or_else(no_embedder)?;
        let vectors =
            with_timeout(self.config.embedding.timeout(), embedder.embed_batch(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(LlmError::InvalidRequest(format!(
                "provider returned {} embeddings for {} texts",
                vectors.len(),
                texts.len()
            ))
            .into());
        }
        for vector in &vectors {
            validate_embedding(vector, self.dimensions())?;
        }
        Ok(vectors)
    }

    /// Run a completion with the configured deadline. Any failure is logged
    /// and reported as `None` so the caller takes its fallback.
    pub(crate) async fn complete(&self, purpose: &str, prompt: &str) -> Option<String> {
        let completer = self.completer.as_ref()?;
        match with_timeout(self.config.completion.timeout(), completer.complete(prompt)).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(purpose, provider = completer.name(), error = %e, "Completion failed, using fallback");
                None
            }
        }
    }
}

fn no_embedder() -> MemoryError {
    LlmError::Config("no embedding provider configured".to_string()).into()
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`MemoryEngine`].
///
/// Providers not set explicitly are built from the configuration.
pub struct EngineBuilder {
    config: MemoriaConfig,
    data_dir: Option<PathBuf>,
    embedder: Option<SharedEmbedder>,
    completer: Option<SharedCompleter>,
    classifier: Option<Arc<dyn FactClassifier>>,
    vector_index: Option<Arc<dyn VectorIndex>>,
    background_tasks: bool,
}

impl EngineBuilder {
    pub fn new(config: MemoriaConfig) -> Self {
        Self {
            config,
            data_dir: None,
            embedder: None,
            completer: None,
            classifier: None,
            vector_index: None,
            background_tasks: true,
        }
    }

    pub fn with_embedder(mut self, embedder: SharedEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_completer(mut self, completer: SharedCompleter) -> Self {
        self.completer = Some(completer);
        self
    }

    /// Replace the default heuristic classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn FactClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Use this index instead of opening one in the data directory.
    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector_index = Some(index);
        self
    }

    /// Override `storage.data_dir` and `MEMORIA_DATA_DIR`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Whether to start the periodic sweep and compaction tasks (default on).
    pub fn background_tasks(mut self, enabled: bool) -> Self {
        self.background_tasks = enabled;
        self
    }

    /// Validate the configuration, open the stores, recover and start.
    pub async fn open(self) -> Result<MemoryEngine> {
        let config = self.config;
        config.validate()?;

        let data_dir = resolve_data_dir(&config, self.data_dir.as_deref());
        std::fs::create_dir_all(&data_dir)?;

        let policy = TtlPolicy::from_config(&config.decay);
        let store = FactStore::open(data_dir.join(FACTS_FILE), config.storage.read_connections)?
            .with_ttl_policy(policy.clone())?;

        let embedder = match self.embedder {
            Some(e) => Some(e),
            None => providers::embedder_from_config(&config)?,
        };
        if let Some(embedder) = &embedder {
            providers::check_dimensions(embedder, config.embedding.dimensions)?;
        }
        let completer = match self.completer {
            Some(c) => Some(c),
            None => providers::completer_from_config(&config)?,
        };

        let vectors = match self.vector_index {
            Some(index) => {
                if index.dimensions() != config.embedding.dimensions {
                    return Err(ConfigError::Invalid {
                        field: "embedding.dimensions".to_string(),
                        reason: format!(
                            "vector index holds {} dimensions but {} are configured",
                            index.dimensions(),
                            config.embedding.dimensions
                        ),
                    }
                    .into());
                }
                VectorSlot {
                    index: Some(index),
                    error: None,
                    injected: true,
                }
            }
            None => match SqliteVecIndex::open(data_dir.join(VECTOR_DIR), config.embedding.dimensions)
            {
                Ok(index) => VectorSlot {
                    index: Some(Arc::new(index)),
                    error: None,
                    injected: false,
                },
                Err(e) => {
                    warn!(error = %e, "Vector index unavailable, continuing with full-text search only");
                    VectorSlot {
                        index: None,
                        error: Some(e.to_string()),
                        injected: false,
                    }
                }
            },
        };

        let wal = WriteAheadLog::open(data_dir.join(WAL_FILE))?;
        if store.get_meta("wal.format")?.as_deref() != Some(WAL_FORMAT) {
            store.set_meta("wal.format", WAL_FORMAT)?;
        }

        let inner = Arc::new(EngineInner {
            policy,
            merger: RrfMerger::new(config.search.rrf_k),
            identifiers: IdentifierDetector::new(),
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(HeuristicClassifier::new())),
            config,
            data_dir,
            store,
            vectors: RwLock::new(vectors),
            wal,
            embedder,
            completer,
            write_lock: tokio::sync::Mutex::new(()),
        });

        let recovery = inner.recover().await?;
        let reconcile = inner.reconcile().await?;
        let sweep = inner.sweep(PruneMode::Both).await?;
        if let Err(e) = inner.wal.compact() {
            warn!(error = %e, "WAL compaction at open failed");
        }

        let tasks = self
            .background_tasks
            .then(|| BackgroundTasks::spawn(Arc::clone(&inner)));

        info!(
            path = %inner.data_dir.display(),
            vectors = inner.vector_available(),
            embedder = inner.embedder.as_ref().map(|e| e.name()).unwrap_or("none"),
            classifier = inner.classifier.name(),
            "Memory engine opened"
        );

        Ok(MemoryEngine {
            inner,
            tasks: Mutex::new(tasks),
            opened: OpenReport {
                recovery,
                reconcile,
                sweep,
            },
        })
    }
}
