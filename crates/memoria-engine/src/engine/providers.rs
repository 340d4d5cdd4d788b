//! Build provider fallback lists from configuration.

use std::sync::Arc;

use tracing::{info, warn};

use memoria_config::{ConfigError, MemoriaConfig, ProviderEntry, ProviderKind};
use memoria_llm::{
    CompleterSpec, EmbedderSpec, FallbackCompleter, FallbackEmbedder, SharedCompleter,
    SharedEmbedder, build_completer, build_embedder,
};

use crate::error::Result;

fn provider_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Openai => "openai",
        ProviderKind::Mock => "mock",
    }
}

/// The configured embedding providers as one fallback list.
///
/// `None` when no provider is configured, which means text-only operation.
pub fn embedder_from_config(config: &MemoriaConfig) -> Result<Option<SharedEmbedder>> {
    let section = &config.embedding;
    if section.providers.is_empty() {
        return Ok(None);
    }

    let providers = section
        .providers
        .iter()
        .map(|entry| {
            build_embedder(&EmbedderSpec {
                provider: provider_name(entry.kind).to_string(),
                api_key: entry.resolve_api_key(),
                model: entry.model.clone(),
                base_url: entry.base_url.clone(),
                dimensions: section.dimensions,
                timeout: section.timeout(),
            })
        })
        .collect::<memoria_llm::Result<Vec<_>>>()?;

    let embedder = FallbackEmbedder::new(providers)?;
    info!(
        providers = section.providers.len(),
        dimensions = section.dimensions,
        "Embedding providers configured"
    );
    Ok(Some(Arc::new(embedder)))
}

/// The configured completion providers as one fallback list.
///
/// Entries that cannot be built (e.g. a missing API key) are skipped with a
/// warning; completion is always optional.
pub fn completer_from_config(config: &MemoriaConfig) -> Result<Option<SharedCompleter>> {
    let section = &config.completion;
    let providers: Vec<SharedCompleter> = section
        .providers
        .iter()
        .filter_map(|entry| match build_completer(&completer_spec(entry, section.timeout())) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(provider = provider_name(entry.kind), error = %e, "Skipping completion provider");
                None
            }
        })
        .collect();

    if providers.is_empty() {
        return Ok(None);
    }
    Ok(Some(Arc::new(FallbackCompleter::new(providers)?)))
}

fn completer_spec(entry: &ProviderEntry, timeout: std::time::Duration) -> CompleterSpec {
    CompleterSpec {
        provider: provider_name(entry.kind).to_string(),
        api_key: entry.resolve_api_key(),
        model: entry.model.clone(),
        base_url: entry.base_url.clone(),
        timeout,
    }
}

/// Reject an embedder whose width differs from `embedding.dimensions`.
pub(crate) fn check_dimensions(embedder: &SharedEmbedder, expected: usize) -> Result<()> {
    if embedder.dimensions() != expected {
        return Err(ConfigError::Invalid {
            field: "embedding.dimensions".to_string(),
            reason: format!(
                "provider '{}' produces {} dimensions but {} are configured",
                embedder.name(),
                embedder.dimensions(),
                expected
            ),
        }
        .into());
    }
    Ok(())
}
