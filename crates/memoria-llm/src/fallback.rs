//! Ordered provider fallback and call deadlines.
//!
//! A fallback list tries each provider in order and returns the first
//! success. Embedding lists additionally require every member to share one
//! dimension, since the vector index is built for exactly one.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::completion::{CompletionProvider, SharedCompleter};
use crate::embeddings::{EmbeddingProvider, SharedEmbedder};
use crate::error::{LlmError, Result};

/// Run `fut` with a deadline, mapping expiry to [`LlmError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding fallback
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered list of embedding providers sharing one dimension.
pub struct FallbackEmbedder {
    providers: Vec<SharedEmbedder>,
    dimensions: usize,
    name: String,
}

impl FallbackEmbedder {
    /// Build a fallback list. Fails if the list is empty or the providers
    /// disagree on dimension.
    pub fn new(providers: Vec<SharedEmbedder>) -> Result<Self> {
        let first = providers
            .first()
            .ok_or_else(|| LlmError::Config("embedding provider list is empty".to_string()))?;
        let dimensions = first.dimensions();

        for p in &providers {
            if p.dimensions() != dimensions {
                return Err(LlmError::Config(format!(
                    "embedding provider '{}' produces {} dimensions but '{}' produces {}",
                    p.name(),
                    p.dimensions(),
                    first.name(),
                    dimensions
                )));
            }
        }

        let name = providers
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join(">");

        Ok(Self {
            providers,
            dimensions,
            name,
        })
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl EmbeddingProvider for FallbackEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut last = None;
        for (i, provider) in self.providers.iter().enumerate() {
            match provider.embed(text).await {
                Ok(v) => {
                    if i > 0 {
                        tracing::info!(provider = provider.name(), "Fallback succeeded");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider.name(),
                        error = %e,
                        "Embedding provider failed, trying next"
                    );
                    last = Some(e);
                }
            }
        }
        Err(exhausted(self.providers.len(), last))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut last = None;
        for (i, provider) in self.providers.iter().enumerate() {
            match provider.embed_batch(texts).await {
                Ok(v) => {
                    if i > 0 {
                        tracing::info!(provider = provider.name(), "Fallback succeeded");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider.name(),
                        error = %e,
                        "Batch embedding failed, trying next"
                    );
                    last = Some(e);
                }
            }
        }
        Err(exhausted(self.providers.len(), last))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion fallback
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered list of completion providers.
pub struct FallbackCompleter {
    providers: Vec<SharedCompleter>,
    name: String,
}

impl FallbackCompleter {
    pub fn new(providers: Vec<SharedCompleter>) -> Result<Self> {
        if providers.is_empty() {
            return Err(LlmError::Config(
                "completion provider list is empty".to_string(),
            ));
        }
        let name = providers
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join(">");
        Ok(Self { providers, name })
    }
}

#[async_trait]
impl CompletionProvider for FallbackCompleter {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut last = None;
        for (i, provider) in self.providers.iter().enumerate() {
            match provider.complete(prompt).await {
                Ok(text) => {
                    if i > 0 {
                        tracing::info!(provider = provider.name(), "Fallback succeeded");
                    }
                    return Ok(text);
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider.name(),
                        error = %e,
                        "Completion provider failed, trying next"
                    );
                    last = Some(e);
                }
            }
        }
        Err(exhausted(self.providers.len(), last))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn exhausted(attempted: usize, last: Option<LlmError>) -> LlmError {
    LlmError::Exhausted {
        attempted,
        last: last.map(|e| e.to_string()).unwrap_or_default(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockCompleter, MockEmbedder};
    use std::sync::Arc;

    struct BrokenEmbedder(usize);

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(LlmError::Network("connection refused".to_string()))
        }

        fn dimensions(&self) -> usize {
            self.0
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[test]
    fn test_empty_list_rejected() {
        assert!(FallbackEmbedder::new(Vec::new()).is_err());
        assert!(FallbackCompleter::new(Vec::new()).is_err());
    }

    #[test]
    fn test_dimension_disagreement_rejected() {
        let providers: Vec<SharedEmbedder> =
            vec![Arc::new(MockEmbedder::new(16)), Arc::new(MockEmbedder::new(32))];
        let err = FallbackEmbedder::new(providers).err().unwrap();
        assert!(matches!(err, LlmError::Config(_)));
    }

    #[tokio::test]
    async fn test_falls_through_to_second_provider() {
        let providers: Vec<SharedEmbedder> =
            vec![Arc::new(BrokenEmbedder(16)), Arc::new(MockEmbedder::new(16))];
        let embedder = FallbackEmbedder::new(providers).unwrap();
        assert_eq!(embedder.name(), "broken>mock");

        let v = embedder.embed("hello").await.unwrap();
        assert_eq!(v.len(), 16);

        let batch = embedder.embed_batch(&["a", "b"]).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_all_providers_fail() {
        let providers: Vec<SharedEmbedder> =
            vec![Arc::new(BrokenEmbedder(8)), Arc::new(BrokenEmbedder(8))];
        let embedder = FallbackEmbedder::new(providers).unwrap();
        match embedder.embed("x").await {
            Err(LlmError::Exhausted { attempted, last }) => {
                assert_eq!(attempted, 2);
                assert!(last.contains("connection refused"));
            }
            other => panic!("unexpected: {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_completer_fallback() {
        let providers: Vec<SharedCompleter> = vec![
            Arc::new(MockCompleter::failing()),
            Arc::new(MockCompleter::new("ok")),
        ];
        let completer = FallbackCompleter::new(providers).unwrap();
        assert_eq!(completer.complete("prompt").await.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let slow = MockCompleter::new("late").with_delay(Duration::from_secs(60));
        let result = with_timeout(Duration::from_secs(30), slow.complete("x")).await;
        assert!(matches!(result, Err(LlmError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let fast = MockCompleter::new("done");
        let result = with_timeout(Duration::from_secs(5), fast.complete("x")).await;
        assert_eq!(result.unwrap(), "done");
    }
}
