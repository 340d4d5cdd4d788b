//! Text completion providers.
//!
//! Completions are used for optional enrichment only: category
//! classification, cluster summarization, and query rewriting. Every caller
//! has a deterministic fallback when a completion fails.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LlmError, Result};

/// Capability: produce a text continuation for a prompt.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Provider name for logs.
    fn name(&self) -> &str;
}

/// A shared completer that can be used across threads.
pub type SharedCompleter = Arc<dyn CompletionProvider>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Completer
// ─────────────────────────────────────────────────────────────────────────────

/// Scripted completer for tests.
///
/// Returns queued responses in order, then repeats the fallback response.
/// A failing completer always returns a backend error.
#[derive(Debug)]
pub struct MockCompleter {
    queued: Mutex<Vec<String>>,
    fallback: Option<String>,
    delay: Option<Duration>,
}

impl MockCompleter {
    /// Always answer with `response`.
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            queued: Mutex::new(Vec::new()),
            fallback: Some(response.into()),
            delay: None,
        }
    }

    /// Answer with each response once, in order, then fail.
    pub fn with_responses(responses: Vec<String>) -> Self {
        let mut queued = responses;
        queued.reverse();
        Self {
            queued: Mutex::new(queued),
            fallback: None,
            delay: None,
        }
    }

    /// Always fail.
    pub fn failing() -> Self {
        Self {
            queued: Mutex::new(Vec::new()),
            fallback: None,
            delay: None,
        }
    }

    /// Sleep before answering (for timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl CompletionProvider for MockCompleter {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.queued.lock().pop();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| LlmError::Backend("mock completer has no response".to_string()))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI-compatible Completer
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompleterConfig {
    /// API key (optional for local services like Ollama).
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl OpenAiCompleterConfig {
    pub fn new() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for OpenAiCompleterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiCompleter {
    client: Client,
    config: OpenAiCompleterConfig,
}

impl OpenAiCompleter {
    pub fn new(config: OpenAiCompleterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompleter {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
            max_tokens: self.config.max_tokens,
        };

        tracing::debug!(model = %self.config.model, "Sending completion request");

        let mut builder = self.client.post(self.completions_url()).json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Serialization(format!("Failed to parse response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LlmError::Backend("Completion returned no content".to_string()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Debug, serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, serde::Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, serde::Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, serde::Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Provider-agnostic description of one completer.
#[derive(Debug, Clone)]
pub struct CompleterSpec {
    /// Provider name: "openai" or "mock".
    pub provider: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

/// Build a `SharedCompleter` from a spec.
///
/// The "mock" completer always fails, so offline configurations exercise
/// every deterministic fallback.
pub fn build_completer(spec: &CompleterSpec) -> Result<SharedCompleter> {
    match spec.provider.as_str() {
        "openai" => {
            let mut config = OpenAiCompleterConfig::new().with_timeout(spec.timeout);
            if let Some(ref key) = spec.api_key {
                config = config.with_api_key(key);
            } else if spec.base_url.is_none() {
                return Err(LlmError::Config(
                    "OpenAI completion provider requires an API key unless base_url points \
                     at a local server"
                        .to_string(),
                ));
            }
            if let Some(ref model) = spec.model {
                config = config.with_model(model);
            }
            if let Some(ref base_url) = spec.base_url {
                config = config.with_base_url(base_url);
            }
            Ok(Arc::new(OpenAiCompleter::new(config)?))
        }
        "mock" => Ok(Arc::new(MockCompleter::failing())),
        other => Err(LlmError::Config(format!(
            "Unknown completion provider '{}'. Valid: openai, mock",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_completer_fixed() {
        let completer = MockCompleter::new("preference");
        assert_eq!(completer.complete("x").await.unwrap(), "preference");
        assert_eq!(completer.complete("y").await.unwrap(), "preference");
    }

    #[tokio::test]
    async fn test_mock_completer_queue_then_fail() {
        let completer = MockCompleter::with_responses(vec!["one".into(), "two".into()]);
        assert_eq!(completer.complete("").await.unwrap(), "one");
        assert_eq!(completer.complete("").await.unwrap(), "two");
        assert!(completer.complete("").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_completer_failing() {
        let completer = MockCompleter::failing();
        assert!(matches!(
            completer.complete("x").await,
            Err(LlmError::Backend(_))
        ));
    }

    #[test]
    fn test_completions_url() {
        let completer = OpenAiCompleter::new(
            OpenAiCompleterConfig::new().with_base_url("http://localhost:11434/v1/"),
        )
        .unwrap();
        assert_eq!(
            completer.completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_chat_response_parsing() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":" merged "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some(" merged "));
    }

    #[test]
    fn test_build_completer_requires_key_for_hosted() {
        let spec = CompleterSpec {
            provider: "openai".to_string(),
            api_key: None,
            model: None,
            base_url: None,
            timeout: Duration::from_secs(30),
        };
        assert!(build_completer(&spec).is_err());

        let local = CompleterSpec {
            base_url: Some("http://localhost:11434/v1".to_string()),
            ..spec
        };
        assert_eq!(build_completer(&local).unwrap().name(), "openai");
    }
}
