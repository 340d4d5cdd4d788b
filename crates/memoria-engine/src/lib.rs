//! Embedded long-term memory for AI agents.
//!
//! Memoria stores short natural-language facts, finds them again by meaning
//! and by keyword, forgets them on a schedule, and relates them to each other.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  MemoryEngine                                                           │
//! │  - single write lock for mutations, concurrent reads                    │
//! │  - background decay sweep + WAL compaction                              │
//! ├──────────────────┬──────────────────┬───────────────────────────────────┤
//! │  FactStore       │  VectorIndex     │  WriteAheadLog                    │
//! │  facts.sqlite    │  vectors/        │  wal.jsonl                        │
//! │  FTS5 (BM25),    │  sqlite-vec,     │  NDJSON entries + removal         │
//! │  links, schema   │  cosine          │  markers, replayed at open        │
//! └──────────────────┴──────────────────┴───────────────────────────────────┘
//! ```
//!
//! Search runs full-text and vector retrieval separately and merges the two
//! rankings with Reciprocal Rank Fusion ([`fusion`]). Every fact carries a
//! [`DecayClass`] that sets its time-to-live ([`decay`]). Facts can be
//! linked and traversed ([`graph`]), superseded by newer statements of the
//! same `(entity, key)`, and merged when they say the same thing
//! ([`consolidation`]).
//!
//! # Usage
//!
//! ```no_run
//! use memoria_config::MemoriaConfig;
//! use memoria_engine::{LookupQuery, MemoryEngine, SearchQuery, StoreRequest};
//!
//! # async fn demo() -> memoria_engine::Result<()> {
//! let engine = MemoryEngine::open(MemoriaConfig::default()).await?;
//!
//! engine
//!     .store(StoreRequest::new("User prefers dark mode").with_triple("user", "theme", "dark"))
//!     .await?;
//!
//! let found = engine.lookup(&LookupQuery::entity("user").with_key("theme"))?;
//! let ranked = engine.search(&SearchQuery::new("what theme does the user like")).await?;
//! # let _ = (found, ranked);
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod consolidation;
pub mod decay;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod graph;
pub mod prompt;
pub mod store;
pub mod types;
pub mod validation;
pub mod vector;
pub mod wal;

// Re-export the engine
pub use engine::{
    BackfillReport, EngineBuilder, EngineStats, FactPatch, MemoryEngine, OpenReport,
    ReconcileReport, RecoveryReport, SearchHit, SearchQuery, SearchResults, StoreAction,
    StoreOutcome, StoreRequest,
};

// Re-export error types
pub use error::{ErrorKind, MemoryError, Result};

// Re-export types
pub use types::{Category, DecayClass, Fact, FactId, LinkId, LinkType, MemoryLink, Scope, Triple};

// Re-export store
pub use store::{FactStore, LookupOrder, LookupQuery, ScopeFilter, SearchFilter, StoreStats};

// Re-export building blocks hosts plug into or read
pub use classify::{Classification, FactClassifier, HeuristicClassifier};
pub use consolidation::{ConsolidationReport, DuplicatePair, MergedCluster};
pub use decay::{PruneMode, SweepReport, TtlPolicy};
pub use fusion::HitSource;
pub use graph::TraversalHit;
pub use validation::ValidationError;
pub use vector::{SimilarityHit, SqliteVecIndex, VectorIndex};
pub use wal::CompactReport;
