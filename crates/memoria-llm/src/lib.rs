//! Provider abstractions for the Memoria memory engine.
//!
//! The engine depends on two capabilities, never on a concrete vendor:
//!
//! - [`EmbeddingProvider`]: text to fixed-dimension vector
//! - [`CompletionProvider`]: prompt to text
//!
//! Each capability can be backed by an ordered fallback list
//! ([`FallbackEmbedder`], [`FallbackCompleter`]); the first provider to
//! succeed wins. Calls are bounded with [`with_timeout`], and every failure
//! surfaces as a non-fatal [`LlmError`] that the engine degrades around.
//!
//! ```no_run
//! use std::sync::Arc;
//! use memoria_llm::{EmbeddingProvider, FallbackEmbedder, MockEmbedder, SharedEmbedder};
//!
//! # async fn demo() -> memoria_llm::Result<()> {
//! let providers: Vec<SharedEmbedder> = vec![Arc::new(MockEmbedder::new(384))];
//! let embedder = FallbackEmbedder::new(providers)?;
//! let vector = embedder.embed("User prefers dark mode").await?;
//! assert_eq!(vector.len(), 384);
//! # Ok(())
//! # }
//! ```

pub mod completion;
pub mod embeddings;
pub mod error;
pub mod fallback;

pub use completion::{
    CompleterSpec, CompletionProvider, MockCompleter, OpenAiCompleter, OpenAiCompleterConfig,
    SharedCompleter, build_completer,
};
pub use embeddings::{
    EmbedderSpec, EmbeddingProvider, MockEmbedder, OpenAiEmbedder, OpenAiEmbedderConfig,
    SharedEmbedder, build_embedder, cosine_similarity,
};
pub use error::{LlmError, Result};
pub use fallback::{FallbackCompleter, FallbackEmbedder, with_timeout};
